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

//! Immutable zones, content-addressed zone identities, and lookups.
//!
//! A [`Zone`] is never mutated after construction; rebuilds replace it
//! wholesale. Its identity for caching is the [`ZoneKey`], a hash over the
//! record content that deliberately ignores SOA-serial churn and derived
//! DNSSEC records, so semantically equal zones collapse to one cache entry.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use enum_as_inner::EnumAsInner;
use hickory_proto::rr::dnssec::rdata::DNSSECRData;
use hickory_proto::rr::{DNSClass, LowerName, Name, RData, Record, RecordSet, RecordType, RrKey};
use time::{Duration, OffsetDateTime};

mod rrset;
pub mod synthesizer;

pub use rrset::group_records;

/// The outcome of a zone lookup. Misses are outcomes, not errors.
#[derive(Clone, Debug, EnumAsInner)]
pub enum ZoneLookup {
    /// One or more RRsets answer the query directly
    Records(Vec<Arc<RecordSet>>),
    /// The name is an alias; the chase continues at its target
    Cname(Arc<RecordSet>),
    /// The name does not exist in the zone
    NxDomain,
    /// The name exists but holds no records of the queried type
    NxRrset,
}

/// An immutable zone: origin, class, and canonically ordered RRsets.
#[derive(Debug)]
pub struct Zone {
    origin: Name,
    origin_lower: LowerName,
    class: DNSClass,
    rrsets: Vec<Arc<RecordSet>>,
    index: BTreeMap<RrKey, usize>,
}

impl Zone {
    /// Builds a zone from a flat record list.
    ///
    /// Records are grouped into RRsets with the SOA first; RRSIG records
    /// are attached to the set they cover rather than forming sets of
    /// their own.
    pub fn new(origin: Name, records: Vec<Record>) -> Self {
        let (signatures, plain): (Vec<Record>, Vec<Record>) = records
            .into_iter()
            .partition(|record| record.record_type() == RecordType::RRSIG);

        let mut sets = group_records(plain);
        for signature in signatures {
            let covered = match signature.data() {
                Some(RData::DNSSEC(DNSSECRData::RRSIG(sig))) => sig.type_covered(),
                _ => continue,
            };
            let owner = LowerName::new(signature.name());
            if let Some(set) = sets
                .iter_mut()
                .find(|set| set.record_type() == covered && LowerName::new(set.name()) == owner)
            {
                set.insert_rrsig(signature);
            }
        }

        let class = sets.first().map_or(DNSClass::IN, RecordSet::dns_class);
        let rrsets: Vec<Arc<RecordSet>> = sets.into_iter().map(Arc::new).collect();

        let mut index = BTreeMap::new();
        for (position, set) in rrsets.iter().enumerate() {
            let key = RrKey::new(LowerName::new(set.name()), set.record_type());
            // first set wins should a class split collide on the key
            index.entry(key).or_insert(position);
        }

        let origin_lower = LowerName::new(&origin);
        Self {
            origin,
            origin_lower,
            class,
            rrsets,
            index,
        }
    }

    /// The zone origin, lowercased for matching.
    pub fn origin(&self) -> &LowerName {
        &self.origin_lower
    }

    /// The zone origin with its original casing.
    pub fn origin_name(&self) -> &Name {
        &self.origin
    }

    /// The zone class.
    pub fn class(&self) -> DNSClass {
        self.class
    }

    /// All RRsets in canonical order, SOA first.
    pub fn rrsets(&self) -> &[Arc<RecordSet>] {
        &self.rrsets
    }

    /// The SOA RRset at the origin, if present.
    pub fn soa(&self) -> Option<&Arc<RecordSet>> {
        self.rrset(&self.origin_lower, RecordType::SOA)
    }

    /// The NS RRset at the origin, if present.
    pub fn ns(&self) -> Option<&Arc<RecordSet>> {
        self.rrset(&self.origin_lower, RecordType::NS)
    }

    /// The exact RRset at (`name`, `record_type`), if present.
    pub fn rrset(&self, name: &LowerName, record_type: RecordType) -> Option<&Arc<RecordSet>> {
        self.index
            .get(&RrKey::new(name.clone(), record_type))
            .map(|position| &self.rrsets[*position])
    }

    /// All records in the zone, signatures excluded.
    pub fn records(&self) -> Vec<Record> {
        self.rrsets
            .iter()
            .flat_map(|set| set.records_without_rrsigs())
            .cloned()
            .collect()
    }

    /// Whether any RRset in the zone carries signatures.
    pub fn is_signed(&self) -> bool {
        self.rrsets.iter().any(|set| !set.rrsigs().is_empty())
    }

    /// Resolves (`name`, `query_type`) within this zone.
    ///
    /// `ANY` returns every RRset at the name. For other types a CNAME at
    /// the name is surfaced for the caller to chase. A miss distinguishes
    /// a nonexistent name from a name that exists (exactly, or as an empty
    /// non-terminal above existing records) without the queried type.
    pub fn lookup(&self, name: &LowerName, query_type: RecordType) -> ZoneLookup {
        if query_type == RecordType::ANY {
            let sets = self.rrsets_at(name);
            if !sets.is_empty() {
                return ZoneLookup::Records(sets);
            }
        } else {
            if let Some(set) = self.rrset(name, query_type) {
                return ZoneLookup::Records(vec![set.clone()]);
            }
            if query_type != RecordType::CNAME {
                if let Some(set) = self.rrset(name, RecordType::CNAME) {
                    return ZoneLookup::Cname(set.clone());
                }
            }
        }

        if self.index.keys().any(|key| name.zone_of(&key.name)) {
            ZoneLookup::NxRrset
        } else {
            ZoneLookup::NxDomain
        }
    }

    fn rrsets_at(&self, name: &LowerName) -> Vec<Arc<RecordSet>> {
        let start = RrKey::new(name.clone(), RecordType::Unknown(u16::MIN));
        let end = RrKey::new(name.clone(), RecordType::Unknown(u16::MAX));
        self.index
            .range(start..end)
            .map(|(_, position)| self.rrsets[*position].clone())
            .collect()
    }
}

/// Content-addressed zone identity.
///
/// Two zones with the same origin and semantically equal records share a
/// key even when their SOA serials differ or one carries signatures the
/// other lacks; a signed and an unsigned rendition are kept distinct by
/// the `signed` flag.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ZoneKey {
    name: LowerName,
    content_hash: u64,
    signed: bool,
}

impl ZoneKey {
    /// Computes the key for `records` under `name`.
    pub fn new(name: LowerName, records: &[Record], signed: bool) -> Self {
        let mut identities: Vec<String> =
            records.iter().filter_map(record_identity).collect();
        identities.sort_unstable();

        let mut hasher = DefaultHasher::new();
        identities.len().hash(&mut hasher);
        for identity in &identities {
            identity.hash(&mut hasher);
        }

        Self {
            name,
            content_hash: hasher.finish(),
            signed,
        }
    }

    /// The zone name this key identifies.
    pub fn name(&self) -> &LowerName {
        &self.name
    }

    /// Whether this key identifies the signed rendition.
    pub fn is_signed(&self) -> bool {
        self.signed
    }
}

/// Normalized textual identity of one record, or `None` for derived
/// DNSSEC records that must not affect the content hash. The SOA serial
/// is rendered as zero so within-hour serial churn keeps the key stable.
fn record_identity(record: &Record) -> Option<String> {
    match record.record_type() {
        RecordType::RRSIG
        | RecordType::SIG
        | RecordType::NSEC
        | RecordType::NSEC3
        | RecordType::NSEC3PARAM => return None,
        _ => (),
    }

    let rendered = match record.data() {
        Some(RData::SOA(soa)) => format!(
            "{} {} {} SOA {} {} 0 {} {} {} {}",
            record.name(),
            record.ttl(),
            record.dns_class(),
            soa.mname(),
            soa.rname(),
            soa.refresh(),
            soa.retry(),
            soa.expire(),
            soa.minimum(),
        ),
        _ => record.to_string(),
    };
    Some(rendered.to_lowercase())
}

/// Signing metadata carried beside a signed zone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SignedZoneKey {
    /// When the zone was signed
    pub created: OffsetDateTime,
    /// When the signatures expire
    pub signature_expiration: OffsetDateTime,
    /// Administrative expiration of the key-signing key used
    pub ksk_expiration: OffsetDateTime,
    /// Administrative expiration of the zone-signing key used
    pub zsk_expiration: OffsetDateTime,
}

impl SignedZoneKey {
    /// The point halfway through the signature validity window, past
    /// which a proactive resign is due.
    pub fn refresh_horizon(&self) -> OffsetDateTime {
        self.created + (self.signature_expiration - self.created) / 2
    }

    /// The sooner of the two signing keys' administrative expirations.
    pub fn earliest_key_expiration(&self) -> OffsetDateTime {
        self.ksk_expiration.min(self.zsk_expiration)
    }

    /// Whether the next check, `interval` from `now`, would land past the
    /// refresh horizon, or a signing key has already expired.
    pub fn needs_refresh(&self, now: OffsetDateTime, interval: Duration) -> bool {
        now + interval >= self.refresh_horizon() || now >= self.earliest_key_expiration()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    use hickory_proto::rr::rdata::{A, CNAME, NS, SOA};

    fn origin() -> Name {
        Name::from_str("video.cdn.example.net.").unwrap()
    }

    fn soa_record(serial: u32) -> Record {
        let soa = SOA::new(
            Name::from_str("tr01.cdn.example.net.").unwrap(),
            Name::from_str("admin.video.cdn.example.net.").unwrap(),
            serial,
            28800,
            7200,
            604_800,
            30,
        );
        Record::from_rdata(origin(), 86400, RData::SOA(soa))
    }

    fn sample_records(serial: u32) -> Vec<Record> {
        vec![
            soa_record(serial),
            Record::from_rdata(
                origin(),
                3600,
                RData::NS(NS(Name::from_str("tr01.cdn.example.net.").unwrap())),
            ),
            Record::from_rdata(
                Name::from_str("c1.video.cdn.example.net.").unwrap(),
                60,
                RData::A(A(Ipv4Addr::new(192, 0, 2, 5))),
            ),
            Record::from_rdata(
                Name::from_str("www.video.cdn.example.net.").unwrap(),
                900,
                RData::CNAME(CNAME(Name::from_str("c1.video.cdn.example.net.").unwrap())),
            ),
        ]
    }

    #[test]
    fn lookup_outcomes() {
        let zone = Zone::new(origin(), sample_records(2026010100));

        let name = LowerName::from(Name::from_str("c1.video.cdn.example.net.").unwrap());
        assert!(zone.lookup(&name, RecordType::A).is_records());
        assert!(zone.lookup(&name, RecordType::AAAA).is_nx_rrset());

        let alias = LowerName::from(Name::from_str("www.video.cdn.example.net.").unwrap());
        assert!(zone.lookup(&alias, RecordType::A).is_cname());
        assert!(zone.lookup(&alias, RecordType::CNAME).is_records());

        let missing = LowerName::from(Name::from_str("nope.video.cdn.example.net.").unwrap());
        assert!(zone.lookup(&missing, RecordType::A).is_nx_domain());
    }

    #[test]
    fn empty_non_terminal_is_nxrrset() {
        let records = vec![
            soa_record(1),
            Record::from_rdata(
                Name::from_str("a.b.video.cdn.example.net.").unwrap(),
                60,
                RData::A(A(Ipv4Addr::new(192, 0, 2, 9))),
            ),
        ];
        let zone = Zone::new(origin(), records);

        let intermediate = LowerName::from(Name::from_str("b.video.cdn.example.net.").unwrap());
        assert!(zone.lookup(&intermediate, RecordType::A).is_nx_rrset());
    }

    #[test]
    fn any_collects_all_sets_at_name() {
        let zone = Zone::new(origin(), sample_records(1));

        let sets = zone
            .lookup(&LowerName::new(zone.origin_name()), RecordType::ANY)
            .into_records()
            .expect("records at origin");
        let types: Vec<RecordType> = sets.iter().map(|set| set.record_type()).collect();
        assert!(types.contains(&RecordType::SOA));
        assert!(types.contains(&RecordType::NS));
    }

    #[test]
    fn zone_key_ignores_serial_churn() {
        let name = LowerName::new(&origin());
        let key_a = ZoneKey::new(name.clone(), &sample_records(2026010100), false);
        let key_b = ZoneKey::new(name.clone(), &sample_records(2026010109), false);
        assert_eq!(key_a, key_b);

        let mut changed = sample_records(2026010100);
        changed.push(Record::from_rdata(
            Name::from_str("c2.video.cdn.example.net.").unwrap(),
            60,
            RData::A(A(Ipv4Addr::new(192, 0, 2, 6))),
        ));
        assert_ne!(key_a, ZoneKey::new(name, &changed, false));
    }

    #[test]
    fn zone_key_distinguishes_signed_rendition() {
        let name = LowerName::new(&origin());
        let records = sample_records(1);
        assert_ne!(
            ZoneKey::new(name.clone(), &records, false),
            ZoneKey::new(name, &records, true)
        );
    }

    #[test]
    fn refresh_horizon_is_half_validity() {
        let created = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let meta = SignedZoneKey {
            created,
            signature_expiration: created + Duration::seconds(300),
            ksk_expiration: created + Duration::days(30),
            zsk_expiration: created + Duration::days(14),
        };

        assert_eq!(meta.refresh_horizon(), created + Duration::seconds(150));
        assert_eq!(meta.earliest_key_expiration(), created + Duration::days(14));

        assert!(!meta.needs_refresh(created, Duration::seconds(149)));
        assert!(meta.needs_refresh(created, Duration::seconds(150)));
        assert!(meta.needs_refresh(created + Duration::seconds(151), Duration::ZERO));
    }

    #[test]
    fn expired_key_forces_refresh() {
        let created = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let meta = SignedZoneKey {
            created,
            signature_expiration: created + Duration::days(7),
            ksk_expiration: created + Duration::seconds(10),
            zsk_expiration: created + Duration::days(30),
        };

        assert!(!meta.needs_refresh(created, Duration::ZERO));
        assert!(meta.needs_refresh(created + Duration::seconds(10), Duration::ZERO));
    }
}
