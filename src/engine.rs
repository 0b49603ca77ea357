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

//! The per-query response state machine.
//!
//! The engine holds no state across queries; all mutable state lives in
//! [`ZoneStore`] and the signing layer. Every query is answered: protocol
//! errors get their specific RCODE and an internal fault gets SERVFAIL.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use hickory_proto::op::{Edns, Message, MessageType, ResponseCode};
use hickory_proto::rr::{DNSClass, LowerName, Name, RData, Record, RecordSet, RecordType};
use rand::seq::SliceRandom;
use tracing::{debug, error};

use crate::error::EngineError;
use crate::store::ZoneStore;
use crate::zone::{Zone, ZoneLookup};

/// Bound on CNAME chases per query, guarding configuration-induced loops.
const MAX_CNAME_CHASES: usize = 6;

/// Advertised EDNS payload size.
const EDNS_MAX_PAYLOAD: u16 = 1232;

/// Answers DNS queries from the zone store.
#[derive(Clone)]
pub struct ProtocolEngine {
    store: Arc<ZoneStore>,
}

impl ProtocolEngine {
    /// Creates an engine over `store`.
    pub fn new(store: Arc<ZoneStore>) -> Self {
        Self { store }
    }

    /// Answers `request` as received from `client`. Never fails: an
    /// internal fault is logged and surfaced as SERVFAIL.
    pub fn query(&self, request: &Message, client: IpAddr) -> Message {
        match self.answer(request, client) {
            Ok(response) => response,
            Err(e) => {
                error!("response construction failed: {e}");
                Message::error_msg(request.id(), request.op_code(), ResponseCode::ServFail)
            }
        }
    }

    fn answer(&self, request: &Message, client: IpAddr) -> Result<Message, EngineError> {
        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_recursion_desired(request.recursion_desired())
            .set_recursion_available(false);
        for query in request.queries() {
            response.add_query(query.clone());
        }

        if let Some(edns) = request.edns() {
            if edns.version() > 0 {
                debug!("unsupported EDNS version {}", edns.version());
                response.set_response_code(ResponseCode::NotImp);
                let mut response_edns = Edns::new();
                response_edns.set_version(0);
                response_edns.set_max_payload(EDNS_MAX_PAYLOAD);
                response_edns.set_rcode_high(ResponseCode::BADVERS.high());
                response.set_edns(response_edns);
                return Ok(response);
            }
        }
        let dnssec_ok = request.edns().map_or(false, Edns::dnssec_ok);

        let Some(query) = request.queries().first() else {
            response.set_response_code(ResponseCode::FormErr);
            return Ok(self.finalize(response, request, dnssec_ok));
        };

        if !matches!(query.query_class(), DNSClass::IN | DNSClass::ANY) {
            response.set_response_code(ResponseCode::Refused);
            return Ok(self.finalize(response, request, dnssec_ok));
        }

        // a signature query is an ANY lookup emitting only the RRSIGs
        let (query_type, sig_only) = match query.query_type() {
            RecordType::SIG | RecordType::RRSIG => (RecordType::ANY, true),
            other => (other, false),
        };

        let mut sections = Sections::default();
        let mut current = LowerName::new(query.name());
        let mut zone_entry = self.store.zone_for_query(&current, query_type, client, dnssec_ok);

        for iteration in 0..=MAX_CNAME_CHASES {
            let Some(entry) = zone_entry.clone() else {
                if iteration == 0 {
                    response.set_response_code(ResponseCode::Refused);
                }
                break;
            };
            let zone = entry.zone();

            match zone.lookup(&current, query_type) {
                ZoneLookup::Records(sets) => {
                    for set in &sets {
                        sections.add_answer(set, dnssec_ok, sig_only);
                    }
                    if let Some(ns) = zone.ns() {
                        sections.add_authority(ns, dnssec_ok);
                        add_glue(zone, ns, &mut sections, dnssec_ok);
                    }
                    response.set_authoritative(true);
                    break;
                }
                ZoneLookup::Cname(set) => {
                    sections.add_answer(&set, dnssec_ok, sig_only);
                    let Some(target) = cname_target(&set) else {
                        break;
                    };
                    current = LowerName::new(&target);
                    if iteration == MAX_CNAME_CHASES {
                        debug!("cname chase stopped at depth {MAX_CNAME_CHASES} for {current}");
                        break;
                    }
                    if !zone.origin().zone_of(&current) {
                        zone_entry =
                            self.store.zone_for_query(&current, query_type, client, dnssec_ok);
                    }
                }
                ZoneLookup::NxDomain => {
                    response.set_response_code(ResponseCode::NXDomain);
                    response.set_authoritative(true);
                    if dnssec_ok {
                        add_denial_of_existence(zone, &current, &mut sections);
                    }
                    add_negative_soa(zone, &mut sections, dnssec_ok);
                    break;
                }
                ZoneLookup::NxRrset => {
                    // RFC 2308 NODATA: NOERROR, empty answer, SOA authority
                    response.set_authoritative(true);
                    if dnssec_ok {
                        if let Some(nsec) = zone.rrset(&current, RecordType::NSEC) {
                            sections.add_authority(nsec, dnssec_ok);
                        }
                    }
                    add_negative_soa(zone, &mut sections, dnssec_ok);
                    break;
                }
            }
        }

        response.add_answers(sections.answers);
        response.add_name_servers(sections.authority);
        response.add_additionals(sections.additionals);
        Ok(self.finalize(response, request, dnssec_ok))
    }

    fn finalize(&self, mut response: Message, request: &Message, dnssec_ok: bool) -> Message {
        if request.edns().is_some() {
            let mut response_edns = Edns::new();
            response_edns.set_version(0);
            response_edns.set_max_payload(EDNS_MAX_PAYLOAD);
            response_edns.set_dnssec_ok(dnssec_ok);
            response.set_edns(response_edns);
        }
        response
    }
}

/// Response sections under construction, deduplicating RRsets by
/// (name, type) across all three sections.
#[derive(Default)]
struct Sections {
    seen: HashSet<(LowerName, RecordType)>,
    answers: Vec<Record>,
    authority: Vec<Record>,
    additionals: Vec<Record>,
}

impl Sections {
    fn add_answer(&mut self, set: &RecordSet, dnssec_ok: bool, sig_only: bool) {
        Self::add(&mut self.answers, &mut self.seen, set, dnssec_ok, sig_only);
    }

    fn add_authority(&mut self, set: &RecordSet, dnssec_ok: bool) {
        Self::add(&mut self.authority, &mut self.seen, set, dnssec_ok, false);
    }

    fn add_additional(&mut self, set: &RecordSet, dnssec_ok: bool) {
        Self::add(&mut self.additionals, &mut self.seen, set, dnssec_ok, false);
    }

    fn add(
        section: &mut Vec<Record>,
        seen: &mut HashSet<(LowerName, RecordType)>,
        set: &RecordSet,
        dnssec_ok: bool,
        sig_only: bool,
    ) {
        if !seen.insert((LowerName::new(set.name()), set.record_type())) {
            return;
        }
        if !sig_only {
            // rotate answers within the set for coarse load distribution
            let mut records: Vec<Record> = set.records_without_rrsigs().cloned().collect();
            records.shuffle(&mut rand::thread_rng());
            section.extend(records);
        }
        if dnssec_ok || sig_only {
            section.extend(set.rrsigs().iter().cloned());
        }
    }
}

fn cname_target(set: &RecordSet) -> Option<Name> {
    set.records_without_rrsigs().find_map(|record| match record.data() {
        Some(RData::CNAME(cname)) => Some(cname.0.clone()),
        _ => None,
    })
}

/// Adds the zone SOA for a negative answer, lowered to the SOA minimum
/// per RFC 2308 unless the set is signed and the client asked for DNSSEC,
/// where the signature covers the original TTL.
fn add_negative_soa(zone: &Zone, sections: &mut Sections, dnssec_ok: bool) {
    let Some(soa_set) = zone.soa() else {
        return;
    };
    if dnssec_ok && !soa_set.rrsigs().is_empty() {
        sections.add_authority(soa_set, dnssec_ok);
        return;
    }

    if !sections
        .seen
        .insert((LowerName::new(soa_set.name()), RecordType::SOA))
    {
        return;
    }
    for record in soa_set.records_without_rrsigs() {
        let ttl = match record.data() {
            Some(RData::SOA(soa)) => record.ttl().min(soa.minimum()),
            _ => record.ttl(),
        };
        let mut record = record.clone();
        record.set_ttl(ttl);
        sections.authority.push(record);
    }
}

/// Adds the NSEC spans proving nonexistence: the closest span preceding
/// the name in canonical order, plus the apex span covering wildcards.
fn add_denial_of_existence(zone: &Zone, name: &LowerName, sections: &mut Sections) {
    let spans: Vec<&Arc<RecordSet>> = zone
        .rrsets()
        .iter()
        .filter(|set| set.record_type() == RecordType::NSEC)
        .collect();
    if spans.is_empty() {
        return;
    }

    let preceding = spans
        .iter()
        .filter(|set| LowerName::new(set.name()) <= *name)
        .last()
        .or_else(|| spans.last());
    if let Some(set) = preceding {
        sections.add_authority(set, true);
    }
    if let Some(apex) = zone.rrset(zone.origin(), RecordType::NSEC) {
        sections.add_authority(apex, true);
    }
}

/// Adds address RRsets for the authority NS targets held in this zone.
fn add_glue(zone: &Zone, ns_set: &RecordSet, sections: &mut Sections, dnssec_ok: bool) {
    for record in ns_set.records_without_rrsigs() {
        let Some(RData::NS(ns)) = record.data() else {
            continue;
        };
        let target = LowerName::new(&ns.0);
        for record_type in [RecordType::A, RecordType::AAAA] {
            if let Some(set) = zone.rrset(&target, record_type) {
                sections.add_additional(set, dnssec_ok);
            }
        }
    }
}
