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

//! The two-tier zone cache and dynamic zone synthesis.
//!
//! Static zones are built wholesale from configuration and published as
//! one immutable snapshot behind a single reference swap; the bounded
//! dynamic cache lives inside the snapshot, so a rebuild replaces the
//! static list and empties the dynamic tier in the same swap. The read
//! path takes one lock to clone the snapshot reference and never blocks
//! on a rebuild.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};

use hickory_proto::rr::{LowerName, Name, RData, Record, RecordType};
use lru_cache::LruCache;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::config::CdnConfig;
use crate::dnssec::SignatureManager;
use crate::error::ZoneBuildError;
use crate::routing::{FallbackResolver, InetRecord, RoutingDecision};
use crate::zone::synthesizer::synthesize_static_zones;
use crate::zone::{SignedZoneKey, Zone, ZoneKey, ZoneLookup};

/// One cached zone with its identity and signing metadata.
#[derive(Debug)]
pub struct ZoneEntry {
    key: ZoneKey,
    zone: Zone,
    signing: Option<SignedZoneKey>,
}

impl ZoneEntry {
    /// The zone itself.
    pub fn zone(&self) -> &Zone {
        &self.zone
    }

    /// The content-addressed identity.
    pub fn key(&self) -> &ZoneKey {
        &self.key
    }

    /// Signing metadata, present only for signed zones.
    pub fn signing(&self) -> Option<&SignedZoneKey> {
        self.signing.as_ref()
    }
}

/// One published snapshot: the static zone list, the names reserved for
/// dynamic synthesis, and the dynamic cache scoped to this snapshot.
struct ZoneSnapshot {
    /// Sorted by descending label count for longest-match lookup
    entries: Vec<Arc<ZoneEntry>>,
    reserved: Vec<LowerName>,
    dynamic: Mutex<LruCache<ZoneKey, Arc<ZoneEntry>>>,
}

impl ZoneSnapshot {
    fn empty() -> Self {
        Self {
            entries: Vec::new(),
            reserved: Vec::new(),
            dynamic: Mutex::new(LruCache::new(1)),
        }
    }
}

/// Owns the static zone list, both caches, and dynamic-zone synthesis.
pub struct ZoneStore {
    config: RwLock<Arc<CdnConfig>>,
    signatures: Arc<SignatureManager>,
    router: Arc<dyn RoutingDecision>,
    fallback: Option<Arc<dyn FallbackResolver>>,
    snapshot: RwLock<Arc<ZoneSnapshot>>,
}

impl ZoneStore {
    /// Builds the store and its initial snapshot.
    pub fn new(
        config: Arc<CdnConfig>,
        signatures: Arc<SignatureManager>,
        router: Arc<dyn RoutingDecision>,
        fallback: Option<Arc<dyn FallbackResolver>>,
    ) -> Result<Self, ZoneBuildError> {
        let store = Self {
            config: RwLock::new(config),
            signatures,
            router,
            fallback,
            snapshot: RwLock::new(Arc::new(ZoneSnapshot::empty())),
        };
        store.rebuild_zone_cache()?;
        Ok(store)
    }

    /// The signing layer this store rebuilds through.
    pub fn signatures(&self) -> &SignatureManager {
        &self.signatures
    }

    /// Longest-match lookup over the static zone list.
    ///
    /// A DS query is matched against the delegating parent, since DS
    /// records live above the delegation point.
    pub fn find_zone(&self, name: &LowerName, query_type: RecordType) -> Option<Arc<ZoneEntry>> {
        find_in(&self.current_snapshot(), name, query_type)
    }

    /// Resolves the zone that answers (`name`, `query_type`) for `client`,
    /// synthesizing a dynamic zone when the name is reserved for routing.
    ///
    /// A static zone that already answers is returned unchanged; so is the
    /// static zone when the routing decision yields nothing usable, which
    /// preserves its NXRRSET and referral semantics instead of fabricating
    /// an empty answer.
    pub fn zone_for_query(
        &self,
        name: &LowerName,
        query_type: RecordType,
        client: IpAddr,
        dnssec_requested: bool,
    ) -> Option<Arc<ZoneEntry>> {
        // every decision below is made against the one snapshot observed
        // here, so a concurrent rebuild is never seen half-applied
        let snapshot = self.current_snapshot();
        let static_entry = find_in(&snapshot, name, query_type)?;
        match static_entry.zone.lookup(name, query_type) {
            ZoneLookup::Records(_) | ZoneLookup::Cname(_) => return Some(static_entry),
            ZoneLookup::NxDomain | ZoneLookup::NxRrset => {}
        }

        if !snapshot.reserved.iter().any(|reserved| reserved.zone_of(name)) {
            return Some(static_entry);
        }

        Some(self.dynamic_zone(&snapshot, static_entry, name, query_type, client, dnssec_requested))
    }

    fn dynamic_zone(
        &self,
        snapshot: &ZoneSnapshot,
        static_entry: Arc<ZoneEntry>,
        name: &LowerName,
        query_type: RecordType,
        client: IpAddr,
        dnssec_requested: bool,
    ) -> Arc<ZoneEntry> {
        let Some(routed) = self.router.route(name, query_type, client) else {
            return static_entry;
        };

        let owner = Name::from(name.clone());
        let answer_records: Vec<Record> = routed
            .iter()
            .filter(|record| {
                query_type == RecordType::ANY
                    || record.record_type() == query_type
                    || record.record_type() == RecordType::CNAME
            })
            .map(|record| record.to_record(owner.clone()))
            .collect();
        if answer_records.is_empty() {
            debug!("routing produced nothing usable for {name}, serving the static zone");
            return static_entry;
        }

        // minimal zone: the static SOA and NS plus the routed answer set
        let mut records: Vec<Record> = Vec::new();
        if let Some(soa) = static_entry.zone.soa() {
            records.extend(soa.records_without_rrsigs().cloned());
        }
        if let Some(ns) = static_entry.zone.ns() {
            records.extend(ns.records_without_rrsigs().cloned());
        }
        records.extend(answer_records);

        let origin = static_entry.zone.origin_name().clone();
        let origin_lower = static_entry.zone.origin().clone();
        let sign = dnssec_requested && self.signatures.has_keys(&origin_lower);
        let key = ZoneKey::new(origin_lower, &records, sign);

        if let Ok(mut cache) = snapshot.dynamic.lock() {
            if let Some(entry) = cache.get_mut(&key) {
                return entry.clone();
            }
        }

        let entry = Arc::new(self.build_entry(origin, records, key.clone(), sign));
        if let Ok(mut cache) = snapshot.dynamic.lock() {
            cache.insert(key, entry.clone());
        }
        entry
    }

    /// Recomputes every static zone and publishes one new snapshot.
    ///
    /// Entries whose content key is unchanged and whose signatures are not
    /// due for refresh are carried over as-is, so unchanged zones are
    /// never spuriously re-signed.
    pub fn rebuild_zone_cache(&self) -> Result<(), ZoneBuildError> {
        let config = self.current_config();
        let synthesized = synthesize_static_zones(&config, &self.signatures)?;

        let previous = self.current_snapshot();
        let mut carryover: HashMap<LowerName, Arc<ZoneEntry>> = previous
            .entries
            .iter()
            .map(|entry| (entry.zone.origin().clone(), entry.clone()))
            .collect();
        let interval = Duration::seconds(config.dnssec.maintenance_interval_secs as i64);

        let mut entries = Vec::with_capacity(synthesized.len());
        let mut reused = 0_usize;
        for (origin, records) in synthesized {
            let origin_lower = LowerName::new(&origin);
            let sign = self.signatures.has_keys(&origin_lower);
            let key = ZoneKey::new(origin_lower.clone(), &records, sign);

            if let Some(prev) = carryover.remove(&origin_lower) {
                if *prev.key() == key && !self.signatures.needs_refresh(prev.signing(), interval) {
                    entries.push(prev);
                    reused += 1;
                    continue;
                }
            }
            entries.push(Arc::new(self.build_entry(origin, records, key, sign)));
        }
        entries.sort_by(|a, b| b.zone.origin().num_labels().cmp(&a.zone.origin().num_labels()));

        let snapshot = Arc::new(ZoneSnapshot {
            entries,
            reserved: reserved_names(&config),
            dynamic: Mutex::new(LruCache::new(config.dynamic_zone_capacity.max(1))),
        });
        info!(
            zones = snapshot.entries.len(),
            reused, "published new zone snapshot"
        );

        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
        Ok(())
    }

    /// Swaps in a new configuration and rebuilds.
    pub fn update_config(&self, config: Arc<CdnConfig>) -> Result<(), ZoneBuildError> {
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
        self.rebuild_zone_cache()
    }

    /// Whether any static zone is due for a signature refresh within
    /// `interval`.
    pub fn any_needs_refresh(&self, interval: Duration) -> bool {
        self.current_snapshot()
            .entries
            .iter()
            .any(|entry| self.signatures.needs_refresh(entry.signing(), interval))
    }

    /// In-process A/AAAA lookup against the static zones, falling back to
    /// the injected resolver when no zone covers `fqdn`.
    pub fn resolve(&self, fqdn: &str) -> Vec<InetRecord> {
        let Ok(name) = Name::from_ascii(fqdn) else {
            return Vec::new();
        };
        let lower = LowerName::new(&name);
        match self.find_zone(&lower, RecordType::A) {
            Some(entry) => collect_addresses(&entry.zone, &lower),
            None => self.resolve_fallback(&name),
        }
    }

    /// Like [`Self::resolve`] but through the dynamic path, so routed
    /// names resolve to the outcome `client` would be served.
    pub fn resolve_for_client(&self, fqdn: &str, client: IpAddr) -> Vec<InetRecord> {
        let Ok(name) = Name::from_ascii(fqdn) else {
            return Vec::new();
        };
        let lower = LowerName::new(&name);

        let mut found_zone = false;
        let mut addresses = Vec::new();
        for query_type in [RecordType::A, RecordType::AAAA] {
            if let Some(entry) = self.zone_for_query(&lower, query_type, client, false) {
                found_zone = true;
                addresses.extend(collect_typed(&entry.zone, &lower, query_type));
            }
        }
        if found_zone {
            addresses
        } else {
            self.resolve_fallback(&name)
        }
    }

    fn resolve_fallback(&self, name: &Name) -> Vec<InetRecord> {
        self.fallback
            .as_ref()
            .and_then(|resolver| resolver.resolve(name))
            .unwrap_or_default()
    }

    fn build_entry(&self, origin: Name, records: Vec<Record>, key: ZoneKey, sign: bool) -> ZoneEntry {
        let (records, signing) = if sign {
            self.signatures
                .sign_zone(&origin, records, OffsetDateTime::now_utc())
        } else {
            (records, None)
        };
        ZoneEntry {
            key,
            zone: Zone::new(origin, records),
            signing,
        }
    }

    fn current_config(&self) -> Arc<CdnConfig> {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn current_snapshot(&self) -> Arc<ZoneSnapshot> {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn find_in(
    snapshot: &ZoneSnapshot,
    name: &LowerName,
    query_type: RecordType,
) -> Option<Arc<ZoneEntry>> {
    // DS records live above the delegation point
    let target = if query_type == RecordType::DS {
        name.base_name()
    } else {
        name.clone()
    };
    snapshot
        .entries
        .iter()
        .find(|entry| entry.zone.origin().zone_of(&target))
        .cloned()
}

fn reserved_names(config: &CdnConfig) -> Vec<LowerName> {
    let mut reserved = Vec::new();
    for service in config.delivery_services.values() {
        let name = Name::from_ascii(&service.routing_name)
            .and_then(|label| label.append_domain(&Name::from_ascii(&service.domain)?));
        match name {
            Ok(mut name) => {
                name.set_fqdn(true);
                reserved.push(LowerName::new(&name));
            }
            Err(e) => debug!(
                "unusable routing name {} for {}: {e}",
                service.routing_name, service.domain
            ),
        }
    }
    reserved
}

fn collect_addresses(zone: &Zone, name: &LowerName) -> Vec<InetRecord> {
    let mut addresses = collect_typed(zone, name, RecordType::A);
    addresses.extend(collect_typed(zone, name, RecordType::AAAA));
    addresses
}

fn collect_typed(zone: &Zone, name: &LowerName, query_type: RecordType) -> Vec<InetRecord> {
    let ZoneLookup::Records(sets) = zone.lookup(name, query_type) else {
        return Vec::new();
    };
    sets.iter()
        .flat_map(|set| set.records_without_rrsigs())
        .filter_map(|record| {
            let addr = match record.data() {
                Some(RData::A(a)) => IpAddr::V4(a.0),
                Some(RData::AAAA(aaaa)) => IpAddr::V6(aaaa.0),
                _ => return None,
            };
            Some(InetRecord {
                addr,
                ttl: record.ttl(),
            })
        })
        .collect()
}
