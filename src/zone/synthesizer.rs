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

//! Synthesis of static zone record sets from the CDN configuration.
//!
//! One zone is produced per delivery service, plus superdomain zones up to
//! the managed top-level domain so lookups above a service's domain
//! resolve. Superdomain zones carry the parent-side DS records of their
//! signed children. Malformed individual entries are logged and skipped;
//! only an unusable top-level domain fails a rebuild.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use hickory_proto::rr::rdata::{A, AAAA, CNAME, NS, SOA, TXT};
use hickory_proto::rr::{LowerName, Name, RData, Record};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::config::{CdnConfig, DeliveryService, SoaConfig, StaticEntryKind, TtlTable};
use crate::dnssec::SignatureManager;
use crate::error::ZoneBuildError;

/// Name-server glue derived from one available router.
struct RouterGlue {
    ns_name: Name,
    ip4: Option<Ipv4Addr>,
    ip6: Option<Ipv6Addr>,
}

/// Builds the record set of every static zone.
pub fn synthesize_static_zones(
    config: &CdnConfig,
    signatures: &SignatureManager,
) -> Result<Vec<(Name, Vec<Record>)>, ZoneBuildError> {
    let tld = parse_name(&config.domain)
        .map_err(|_| ZoneBuildError::InvalidTopLevelDomain(config.domain.clone()))?;
    let tld_lower = LowerName::new(&tld);
    let glue = router_glue(config, &tld);

    let mut zones: Vec<(Name, Vec<Record>)> = Vec::new();
    let mut ds_origins: BTreeSet<Name> = BTreeSet::new();

    for (service_id, service) in &config.delivery_services {
        let origin = match parse_name(&service.domain) {
            Ok(origin) => origin,
            Err(e) => {
                warn!("skipping delivery service {service_id} with bad domain {}: {e}", service.domain);
                continue;
            }
        };
        let records = delivery_service_records(config, service_id, service, &origin, &glue, signatures);
        ds_origins.insert(origin.clone());
        zones.push((origin, records));
    }

    // second pass: zones above the delivery services, up to the TLD
    let mut superdomains: BTreeSet<Name> = BTreeSet::new();
    for (origin, _) in &zones {
        let mut ancestor = origin.base_name();
        while !ancestor.is_root() && tld_lower.zone_of(&LowerName::new(&ancestor)) {
            if !ds_origins.contains(&ancestor) {
                superdomains.insert(ancestor.clone());
            }
            ancestor = ancestor.base_name();
        }
    }
    if !ds_origins.contains(&tld) {
        superdomains.insert(tld.clone());
    }

    for origin in superdomains {
        let records = base_records(&origin, &config.ttls, &config.soa, &glue, true, signatures);
        zones.push((origin, records));
    }

    attach_delegation_material(&mut zones, config, signatures);

    Ok(zones)
}

/// Places each signed child zone's DS records into its closest enclosing
/// parent zone.
fn attach_delegation_material(
    zones: &mut [(Name, Vec<Record>)],
    config: &CdnConfig,
    signatures: &SignatureManager,
) {
    let origins: Vec<Name> = zones.iter().map(|(origin, _)| origin.clone()).collect();

    for child in &origins {
        if !signatures.has_keys(&LowerName::new(child)) {
            continue;
        }
        let child_lower = LowerName::new(child);
        let parent = origins
            .iter()
            .filter(|origin| *origin != child && LowerName::new(origin).zone_of(&child_lower))
            .max_by_key(|origin| origin.num_labels());
        let Some(parent) = parent else { continue };

        let ds_records = signatures.generate_ds_records(child, config.ttls.ds);
        if let Some((_, records)) = zones.iter_mut().find(|(origin, _)| origin == parent) {
            records.extend(ds_records);
        }
    }
}

fn delivery_service_records(
    config: &CdnConfig,
    service_id: &str,
    service: &DeliveryService,
    origin: &Name,
    glue: &[RouterGlue],
    signatures: &SignatureManager,
) -> Vec<Record> {
    let ttls = service.ttls.as_ref().unwrap_or(&config.ttls);
    let soa = service.soa.as_ref().unwrap_or(&config.soa);
    let mut records = base_records(origin, ttls, soa, glue, service.ip6_routing_enabled, signatures);

    let origin_lower = LowerName::new(origin);

    for cache in &config.edge_caches {
        if !cache.delivery_services.iter().any(|id| id == service_id) {
            continue;
        }
        let host = cache.fqdn.split('.').next().unwrap_or_default();
        if host.eq_ignore_ascii_case(&service.routing_name) {
            // reserved for dynamic synthesis
            debug!("not publishing edge cache {} under its routing name", cache.fqdn);
            continue;
        }
        let owner = match parse_name(&cache.fqdn) {
            Ok(owner) => owner,
            Err(e) => {
                warn!("skipping edge cache with bad fqdn {}: {e}", cache.fqdn);
                continue;
            }
        };
        if !origin_lower.zone_of(&LowerName::new(&owner)) {
            continue;
        }
        if let Some(addr) = cache.ip4.as_deref().and_then(|text| parse_addr(text, &cache.fqdn)) {
            records.push(Record::from_rdata(owner.clone(), ttls.a, RData::A(A(addr))));
        }
        if service.ip6_routing_enabled {
            if let Some(addr) = cache.ip6.as_deref().and_then(|text| parse_addr(text, &cache.fqdn))
            {
                records.push(Record::from_rdata(owner.clone(), ttls.aaaa, RData::AAAA(AAAA(addr))));
            }
        }
    }

    // operator entries last, so they may shadow generated records
    for entry in &service.static_entries {
        let owner = match anchored_name(&entry.name, origin) {
            Ok(owner) => owner,
            Err(e) => {
                warn!("skipping static entry with bad name {}: {e}", entry.name);
                continue;
            }
        };
        let ttl = entry.ttl.unwrap_or_else(|| ttls.for_type(entry.kind.record_type()));
        let rdata = match entry.kind {
            StaticEntryKind::A => match parse_addr::<Ipv4Addr>(&entry.value, &entry.name) {
                Some(addr) => RData::A(A(addr)),
                None => continue,
            },
            StaticEntryKind::AAAA => match parse_addr::<Ipv6Addr>(&entry.value, &entry.name) {
                Some(addr) => RData::AAAA(AAAA(addr)),
                None => continue,
            },
            StaticEntryKind::CNAME => match anchored_name(&entry.value, origin) {
                Ok(target) => RData::CNAME(CNAME(target)),
                Err(e) => {
                    warn!("skipping static entry with bad target {}: {e}", entry.value);
                    continue;
                }
            },
            StaticEntryKind::TXT => RData::TXT(TXT::new(vec![entry.value.clone()])),
        };
        records.push(Record::from_rdata(owner, ttl, rdata));
    }

    records
}

/// SOA, NS + glue, and the zone's DNSKEY set.
fn base_records(
    origin: &Name,
    ttls: &TtlTable,
    soa: &SoaConfig,
    glue: &[RouterGlue],
    ip6_enabled: bool,
    signatures: &SignatureManager,
) -> Vec<Record> {
    let mut records = Vec::new();

    let mname = glue
        .first()
        .map(|router| router.ns_name.clone())
        .unwrap_or_else(|| origin.clone());
    let rname = Name::from_ascii(&soa.admin)
        .and_then(|admin| admin.append_domain(origin))
        .unwrap_or_else(|_| origin.clone());
    let soa_rdata = SOA::new(
        mname,
        rname,
        zone_serial(soa.serial),
        soa.refresh,
        soa.retry,
        soa.expire,
        soa.minimum,
    );
    records.push(Record::from_rdata(origin.clone(), ttls.soa, RData::SOA(soa_rdata)));

    for router in glue {
        records.push(Record::from_rdata(
            origin.clone(),
            ttls.ns,
            RData::NS(NS(router.ns_name.clone())),
        ));
        if let Some(addr) = router.ip4 {
            records.push(Record::from_rdata(router.ns_name.clone(), ttls.a, RData::A(A(addr))));
        }
        if ip6_enabled {
            if let Some(addr) = router.ip6 {
                records.push(Record::from_rdata(
                    router.ns_name.clone(),
                    ttls.aaaa,
                    RData::AAAA(AAAA(addr)),
                ));
            }
        }
    }

    records.extend(signatures.generate_dnskey_records(origin));
    records
}

fn router_glue(config: &CdnConfig, tld: &Name) -> Vec<RouterGlue> {
    let mut glue = Vec::new();
    for (label, router) in &config.routers {
        if !router.status.is_available() {
            debug!("router {label} is {:?}, not publishing", router.status);
            continue;
        }
        let ns_name = match &router.fqdn {
            Some(fqdn) => parse_name(fqdn),
            None => Name::from_ascii(label).and_then(|name| name.append_domain(tld)),
        };
        let ns_name = match ns_name {
            Ok(name) => name,
            Err(e) => {
                warn!("skipping router {label} with unusable name: {e}");
                continue;
            }
        };
        glue.push(RouterGlue {
            ns_name,
            ip4: router.ip.as_deref().and_then(|text| parse_addr(text, label)),
            ip6: router.ip6.as_deref().and_then(|text| parse_addr(text, label)),
        });
    }
    glue
}

/// Serial in `YYYYMMDDHH` form; within-hour collisions are fine since the
/// cache key is content-based, not serial-based.
fn zone_serial(configured: Option<u32>) -> u32 {
    if let Some(serial) = configured {
        return serial;
    }
    let now = OffsetDateTime::now_utc();
    let format = format_description!("[year][month][day][hour]");
    now.format(&format)
        .ok()
        .and_then(|text| text.parse().ok())
        .unwrap_or(now.unix_timestamp() as u32)
}

fn parse_name(text: &str) -> Result<Name, hickory_proto::error::ProtoError> {
    let mut name = Name::from_ascii(text)?;
    name.set_fqdn(true);
    Ok(name)
}

/// Absolute names pass through; relative ones are anchored at the origin.
fn anchored_name(text: &str, origin: &Name) -> Result<Name, hickory_proto::error::ProtoError> {
    if text.ends_with('.') {
        Name::from_ascii(text)
    } else {
        Name::from_ascii(text)?.append_domain(origin)
    }
}

fn parse_addr<T: FromStr>(text: &str, owner: &str) -> Option<T> {
    match text.parse() {
        Ok(addr) => Some(addr),
        Err(_) => {
            warn!("skipping malformed address {text:?} for {owner}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::RecordType;

    fn test_config() -> CdnConfig {
        serde_json::from_str(
            r#"{
              "domain": "cdn.example.net",
              "soa": {"serial": 2026010100},
              "routers": {
                "tr01": {"status": "ONLINE", "ip": "192.0.2.1", "ip6": "2001:db8::1"},
                "tr02": {"status": "OFFLINE", "ip": "192.0.2.2"},
                "tr03": {"status": "ADMIN_DOWN", "ip": "192.0.2.3"}
              },
              "delivery_services": {
                "video": {
                  "domain": "video.cdn.example.net",
                  "routing_name": "edge",
                  "static_entries": [
                    {"name": "origin", "type": "CNAME", "value": "storage.example.org."},
                    {"name": "video.cdn.example.net.", "type": "TXT", "value": "contact=noc"},
                    {"name": "broken", "type": "A", "value": "not-an-ip"}
                  ]
                }
              },
              "edge_caches": [
                {"fqdn": "c1.video.cdn.example.net", "ip4": "192.0.2.10", "ip6": "2001:db8::10", "delivery_services": ["video"]},
                {"fqdn": "edge.video.cdn.example.net", "ip4": "192.0.2.11", "delivery_services": ["video"]},
                {"fqdn": "c2.video.cdn.example.net", "ip4": "999.0.2.12", "delivery_services": ["video"]}
              ]
            }"#,
        )
        .expect("config")
    }

    fn records_for<'a>(zones: &'a [(Name, Vec<Record>)], origin: &str) -> &'a [Record] {
        let origin = parse_name(origin).unwrap();
        &zones
            .iter()
            .find(|(name, _)| *name == origin)
            .unwrap_or_else(|| panic!("zone {origin} missing"))
            .1
    }

    #[test]
    fn builds_service_and_superdomain_zones() {
        let config = test_config();
        let zones = synthesize_static_zones(&config, &SignatureManager::disabled()).unwrap();

        let origins: Vec<String> = zones.iter().map(|(name, _)| name.to_string()).collect();
        assert!(origins.contains(&"video.cdn.example.net.".to_string()));
        assert!(origins.contains(&"cdn.example.net.".to_string()));

        // the superdomain zone is complete enough to answer on its own
        let parent = records_for(&zones, "cdn.example.net.");
        assert!(parent.iter().any(|r| r.record_type() == RecordType::SOA));
        assert!(parent.iter().any(|r| r.record_type() == RecordType::NS));
    }

    #[test]
    fn only_available_routers_are_published() {
        let config = test_config();
        let zones = synthesize_static_zones(&config, &SignatureManager::disabled()).unwrap();
        let records = records_for(&zones, "video.cdn.example.net.");

        let ns_targets: Vec<String> = records
            .iter()
            .filter_map(|r| match r.data() {
                Some(RData::NS(ns)) => Some(ns.0.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(ns_targets, vec!["tr01.cdn.example.net.".to_string()]);

        // glue for the one available router, v4 and v6
        let glue_owner = parse_name("tr01.cdn.example.net.").unwrap();
        assert!(records
            .iter()
            .any(|r| r.name() == &glue_owner && r.record_type() == RecordType::A));
        assert!(records
            .iter()
            .any(|r| r.name() == &glue_owner && r.record_type() == RecordType::AAAA));
    }

    #[test]
    fn routing_name_and_malformed_entries_are_excluded() {
        let config = test_config();
        let zones = synthesize_static_zones(&config, &SignatureManager::disabled()).unwrap();
        let records = records_for(&zones, "video.cdn.example.net.");

        let reserved = parse_name("edge.video.cdn.example.net.").unwrap();
        assert!(!records.iter().any(|r| r.name() == &reserved));

        // malformed edge-cache address and static entry are skipped
        let malformed = parse_name("c2.video.cdn.example.net.").unwrap();
        assert!(!records.iter().any(|r| r.name() == &malformed));
        let broken = parse_name("broken.video.cdn.example.net.").unwrap();
        assert!(!records.iter().any(|r| r.name() == &broken));

        // healthy edge cache and operator entries survive
        let healthy = parse_name("c1.video.cdn.example.net.").unwrap();
        assert!(records.iter().any(|r| r.name() == &healthy));
        assert!(records.iter().any(|r| r.record_type() == RecordType::TXT));
        let alias = parse_name("origin.video.cdn.example.net.").unwrap();
        assert!(records
            .iter()
            .any(|r| r.name() == &alias && r.record_type() == RecordType::CNAME));
    }

    #[test]
    fn serial_override_is_honored() {
        let config = test_config();
        let zones = synthesize_static_zones(&config, &SignatureManager::disabled()).unwrap();
        let records = records_for(&zones, "video.cdn.example.net.");

        let serial = records
            .iter()
            .find_map(|r| match r.data() {
                Some(RData::SOA(soa)) => Some(soa.serial()),
                _ => None,
            })
            .expect("soa");
        assert_eq!(serial, 2026010100);
    }

    #[test]
    fn generated_serial_fits_yyyymmddhh() {
        let serial = zone_serial(None);
        // ten digits, leading with the year
        assert!(serial >= 2_000_000_000);
    }
}
