/*
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Configuration snapshot consumed by zone synthesis and signing.
//!
//! The engine never loads files itself; a deserialized [`CdnConfig`] is
//! handed in at construction and swapped wholesale through
//! [`crate::ZoneStore::update_config`].

use std::collections::BTreeMap;
use std::time::Duration;

use hickory_proto::rr::RecordType;
use serde::Deserialize;

/// One full CDN configuration snapshot.
#[derive(Clone, Debug, Deserialize)]
pub struct CdnConfig {
    /// Top-level domain all managed zones live under, e.g. `cdn.example.net`
    pub domain: String,
    /// Per record type TTLs applied when nothing more specific is configured
    #[serde(default)]
    pub ttls: TtlTable,
    /// SOA field defaults for synthesized zones
    #[serde(default)]
    pub soa: SoaConfig,
    /// Traffic routers, keyed by host label within the top-level domain
    #[serde(default)]
    pub routers: BTreeMap<String, Router>,
    /// Delivery services, keyed by their identifier
    #[serde(default)]
    pub delivery_services: BTreeMap<String, DeliveryService>,
    /// Edge caches addressable by FQDN
    #[serde(default)]
    pub edge_caches: Vec<EdgeCache>,
    /// DNSSEC signing controls
    #[serde(default)]
    pub dnssec: DnssecConfig,
    /// Bound on distinct routing outcomes cached as dynamic zones
    #[serde(default = "default_dynamic_zone_capacity")]
    pub dynamic_zone_capacity: usize,
}

/// Default TTLs per record type, in seconds.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct TtlTable {
    /// A records
    pub a: u32,
    /// AAAA records
    pub aaaa: u32,
    /// NS records
    pub ns: u32,
    /// SOA records
    pub soa: u32,
    /// CNAME records
    pub cname: u32,
    /// TXT records
    pub txt: u32,
    /// DS records published in the parent zone
    pub ds: u32,
    /// DNSKEY records
    pub dnskey: u32,
}

impl Default for TtlTable {
    fn default() -> Self {
        Self {
            a: 3600,
            aaaa: 3600,
            ns: 3600,
            soa: 86400,
            cname: 900,
            txt: 3600,
            ds: 30,
            dnskey: 30,
        }
    }
}

impl TtlTable {
    /// The configured TTL for `record_type`, falling back to the A TTL.
    pub fn for_type(&self, record_type: RecordType) -> u32 {
        match record_type {
            RecordType::A => self.a,
            RecordType::AAAA => self.aaaa,
            RecordType::NS => self.ns,
            RecordType::SOA => self.soa,
            RecordType::CNAME => self.cname,
            RecordType::TXT => self.txt,
            RecordType::DS => self.ds,
            RecordType::DNSKEY => self.dnskey,
            _ => self.a,
        }
    }
}

/// SOA field defaults.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SoaConfig {
    /// Label prepended to the zone origin to form the RNAME
    pub admin: String,
    /// SOA refresh, seconds
    pub refresh: i32,
    /// SOA retry, seconds
    pub retry: i32,
    /// SOA expire, seconds
    pub expire: i32,
    /// SOA minimum, also the negative-caching TTL
    pub minimum: u32,
    /// Fixed serial overriding the time-derived one
    pub serial: Option<u32>,
}

impl Default for SoaConfig {
    fn default() -> Self {
        Self {
            admin: "admin".to_string(),
            refresh: 28800,
            retry: 7200,
            expire: 604_800,
            minimum: 30,
            serial: None,
        }
    }
}

/// Operational status of a traffic router.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
pub enum RouterStatus {
    /// Serving queries
    #[serde(rename = "ONLINE")]
    Online,
    /// Removed from rotation by monitoring
    #[serde(rename = "OFFLINE")]
    Offline,
    /// Removed from rotation by an operator
    #[serde(rename = "ADMIN_DOWN")]
    AdminDown,
}

impl RouterStatus {
    /// Whether this router should be published as a name server.
    pub fn is_available(self) -> bool {
        matches!(self, Self::Online)
    }
}

/// One traffic router host.
#[derive(Clone, Debug, Deserialize)]
pub struct Router {
    /// Whether the router is in rotation
    pub status: RouterStatus,
    /// IPv4 glue address
    #[serde(default)]
    pub ip: Option<String>,
    /// IPv6 glue address
    #[serde(default)]
    pub ip6: Option<String>,
    /// Explicit host name; when absent the router's key label is anchored
    /// at the zone origin
    #[serde(default)]
    pub fqdn: Option<String>,
}

/// One delivery service and the zone synthesized for it.
#[derive(Clone, Debug, Deserialize)]
pub struct DeliveryService {
    /// Zone origin for this service, e.g. `video.cdn.example.net`
    pub domain: String,
    /// Host label reserved for dynamic routing answers
    #[serde(default = "default_routing_name")]
    pub routing_name: String,
    /// Whether AAAA answers are published for this service
    #[serde(default = "default_true")]
    pub ip6_routing_enabled: bool,
    /// Per-service TTL overrides
    #[serde(default)]
    pub ttls: Option<TtlTable>,
    /// Per-service SOA overrides
    #[serde(default)]
    pub soa: Option<SoaConfig>,
    /// Operator records appended after the synthesized ones
    #[serde(default)]
    pub static_entries: Vec<StaticEntry>,
}

/// Record types an operator may pin into a zone.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
pub enum StaticEntryKind {
    /// IPv4 address record
    A,
    /// IPv6 address record
    AAAA,
    /// Alias record
    CNAME,
    /// Text record
    TXT,
}

impl StaticEntryKind {
    /// The wire record type for this entry kind.
    pub fn record_type(self) -> RecordType {
        match self {
            Self::A => RecordType::A,
            Self::AAAA => RecordType::AAAA,
            Self::CNAME => RecordType::CNAME,
            Self::TXT => RecordType::TXT,
        }
    }
}

/// An operator-pinned record.
#[derive(Clone, Debug, Deserialize)]
pub struct StaticEntry {
    /// Owner name; relative names are anchored at the zone origin
    pub name: String,
    /// Record type
    #[serde(rename = "type")]
    pub kind: StaticEntryKind,
    /// Address, target name, or text payload depending on `kind`
    pub value: String,
    /// TTL override; the type's table entry applies when absent
    #[serde(default)]
    pub ttl: Option<u32>,
}

/// One edge cache host.
#[derive(Clone, Debug, Deserialize)]
pub struct EdgeCache {
    /// Host FQDN; the first label must not collide with a routing name
    pub fqdn: String,
    /// IPv4 service address
    #[serde(default)]
    pub ip4: Option<String>,
    /// IPv6 service address
    #[serde(default)]
    pub ip6: Option<String>,
    /// Delivery services this cache is assigned to
    #[serde(default)]
    pub delivery_services: Vec<String>,
}

/// DNSSEC signing controls.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct DnssecConfig {
    /// Master switch; when false the signing layer is a pass-through
    pub enabled: bool,
    /// Signature validity = zone max TTL times this factor
    pub expiration_multiplier: u32,
    /// Seconds between key-maintenance ticks
    pub maintenance_interval_secs: u64,
    /// Attempts per key fetch cycle
    pub fetch_retries: u32,
    /// Seconds between attempts within one cycle
    pub fetch_wait_secs: u64,
}

impl Default for DnssecConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            expiration_multiplier: 5,
            maintenance_interval_secs: 300,
            fetch_retries: 5,
            fetch_wait_secs: 5,
        }
    }
}

impl DnssecConfig {
    /// Delay between key-maintenance ticks.
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Delay between fetch attempts within one cycle.
    pub fn fetch_wait(&self) -> Duration {
        Duration::from_secs(self.fetch_wait_secs)
    }
}

fn default_dynamic_zone_capacity() -> usize {
    10_000
}

fn default_routing_name() -> String {
    "edge".to_string()
}

fn default_true() -> bool {
    true
}
