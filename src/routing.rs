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

//! Boundary to the CDN's cache-selection and health logic.
//!
//! The store consults [`RoutingDecision`] once per dynamic query; how the
//! decision is made (geolocation, coverage zones, health) is not this
//! crate's concern.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use hickory_proto::rr::rdata::{A, AAAA, CNAME};
use hickory_proto::rr::{LowerName, Name, RData, Record, RecordType};

/// The payload of one routed answer record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RoutedTarget {
    /// An IPv4 edge address
    A(Ipv4Addr),
    /// An IPv6 edge address
    Aaaa(Ipv6Addr),
    /// An alias, typically to an edge FQDN
    Cname(Name),
}

/// One record of a routing outcome, in the order it should be served.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoutedRecord {
    /// Answer payload
    pub target: RoutedTarget,
    /// TTL chosen by the routing layer; when one answer mixes TTLs within
    /// a record type, the first record's TTL applies to the whole set
    pub ttl: u32,
}

impl RoutedRecord {
    /// Materializes this outcome as a record owned by `name`.
    pub(crate) fn to_record(&self, name: Name) -> Record {
        let rdata = match &self.target {
            RoutedTarget::A(addr) => RData::A(A(*addr)),
            RoutedTarget::Aaaa(addr) => RData::AAAA(AAAA(*addr)),
            RoutedTarget::Cname(target) => RData::CNAME(CNAME(target.clone())),
        };
        Record::from_rdata(name, self.ttl, rdata)
    }

    /// The record type this outcome materializes as.
    pub(crate) fn record_type(&self) -> RecordType {
        match self.target {
            RoutedTarget::A(_) => RecordType::A,
            RoutedTarget::Aaaa(_) => RecordType::AAAA,
            RoutedTarget::Cname(_) => RecordType::CNAME,
        }
    }
}

/// Chooses edge addresses for a client.
///
/// Returns `None` when the name is not routable at all; an empty list means
/// routable but no edge currently usable. Both cases fall back to the
/// static zone.
pub trait RoutingDecision: Send + Sync {
    /// Decides the answer set for `name` as queried by `client`.
    fn route(
        &self,
        name: &LowerName,
        query_type: RecordType,
        client: IpAddr,
    ) -> Option<Vec<RoutedRecord>>;
}

/// An address with its TTL, as returned by the in-process resolve calls.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InetRecord {
    /// Resolved address
    pub addr: IpAddr,
    /// TTL of the source record
    pub ttl: u32,
}

/// Resolves names no configured zone covers.
///
/// Used only by the in-process resolve calls, never on the wire path.
pub trait FallbackResolver: Send + Sync {
    /// Looks up A/AAAA records for `fqdn` outside the managed zones.
    fn resolve(&self, fqdn: &Name) -> Option<Vec<InetRecord>>;
}
