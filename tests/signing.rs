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

//! End-to-end signing: key fetch, signed rebuild, and DNSSEC answers.

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use cdn_dns::config::CdnConfig;
use cdn_dns::dnssec::{
    KeyAuthorityClient, KeyAuthorityResponse, SignatureManager, SigningKeyPair, ZoneSigner,
};
use cdn_dns::error::{KeyFetchError, SigningError};
use cdn_dns::proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use cdn_dns::proto::rr::dnssec::rdata::{DNSSECRData, DNSKEY, DS, RRSIG};
use cdn_dns::proto::rr::dnssec::DigestType;
use cdn_dns::proto::rr::{LowerName, Name, RData, Record, RecordType};
use cdn_dns::routing::{RoutedRecord, RoutingDecision};
use cdn_dns::{ProtocolEngine, ZoneStore};

const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 50));

struct NoRouting;

impl RoutingDecision for NoRouting {
    fn route(
        &self,
        _name: &LowerName,
        _query_type: RecordType,
        _client: IpAddr,
    ) -> Option<Vec<RoutedRecord>> {
        None
    }
}

/// Serves a fixed key document after a configurable number of failures.
struct StubAuthority {
    failures_left: AtomicUsize,
}

impl StubAuthority {
    fn new(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl KeyAuthorityClient for StubAuthority {
    async fn fetch_keys(&self) -> Result<KeyAuthorityResponse, KeyFetchError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(KeyFetchError::Authority("unavailable".to_string()));
        }
        let document = r#"{
          "response": {
            "video.cdn.example.net.": {
              "ksk": [{
                "name": "video.cdn.example.net.",
                "inceptionDate": 1700000000,
                "effectiveDate": 1700000000,
                "expirationDate": 4100000000,
                "ttl": 60,
                "dnskey": {"flags": 257, "protocol": 3, "algorithm": 8, "publicKey": "a3NrLXB1YmxpYw=="},
                "private": "a3NrLXByaXZhdGU="
              }],
              "zsk": [{
                "name": "video.cdn.example.net.",
                "inceptionDate": 1700000000,
                "effectiveDate": 1700000000,
                "expirationDate": 4100000000,
                "dnskey": {"flags": 256, "protocol": 3, "algorithm": 8, "publicKey": "enNrLXB1YmxpYw=="},
                "private": "enNrLXByaXZhdGU="
              }]
            }
          }
        }"#;
        serde_json::from_str(document)
            .map_err(|e| KeyFetchError::Authority(format!("bad document: {e}")))
    }
}

/// Signs by appending one RRSIG covering the SOA; enough structure for
/// the response path without real cryptography.
struct StubSigner;

impl ZoneSigner for StubSigner {
    fn sign_zone(
        &self,
        records: &[Record],
        ksks: &[SigningKeyPair],
        _zsks: &[SigningKeyPair],
        inception: OffsetDateTime,
        expiration: OffsetDateTime,
    ) -> Result<Vec<Record>, SigningError> {
        let soa = records
            .iter()
            .find(|record| record.record_type() == RecordType::SOA)
            .ok_or_else(|| SigningError::Signer("no SOA to cover".to_string()))?;
        let ksk = ksks
            .first()
            .ok_or_else(|| SigningError::Signer("no KSK".to_string()))?;

        let rrsig = RRSIG::new(
            RecordType::SOA,
            ksk.dnskey().algorithm(),
            soa.name().num_labels(),
            soa.ttl(),
            expiration.unix_timestamp() as u32,
            inception.unix_timestamp() as u32,
            12345,
            soa.name().clone(),
            vec![0xab; 64],
        );

        let mut signed = records.to_vec();
        signed.push(Record::from_rdata(
            soa.name().clone(),
            soa.ttl(),
            RData::DNSSEC(DNSSECRData::RRSIG(rrsig)),
        ));
        Ok(signed)
    }

    fn calculate_ds(
        &self,
        owner: &Name,
        dnskey: &DNSKEY,
        digest_type: DigestType,
        ttl: u32,
    ) -> Result<Record, SigningError> {
        let ds = DS::new(12345, dnskey.algorithm(), digest_type, vec![0xcd; 32]);
        Ok(Record::from_rdata(
            owner.clone(),
            ttl,
            RData::DNSSEC(DNSSECRData::DS(ds)),
        ))
    }
}

fn test_config() -> Arc<CdnConfig> {
    Arc::new(
        serde_json::from_str(
            r#"{
              "domain": "cdn.example.net",
              "soa": {"serial": 2026010100},
              "routers": {
                "tr01": {"status": "ONLINE", "ip": "192.0.2.1"}
              },
              "delivery_services": {
                "video": {
                  "domain": "video.cdn.example.net",
                  "routing_name": "edge"
                }
              },
              "edge_caches": [
                {"fqdn": "c1.video.cdn.example.net", "ip4": "192.0.2.10", "delivery_services": ["video"]}
              ],
              "dnssec": {
                "enabled": true,
                "expiration_multiplier": 5,
                "maintenance_interval_secs": 300,
                "fetch_retries": 5,
                "fetch_wait_secs": 0
              }
            }"#,
        )
        .expect("config"),
    )
}

async fn signed_store(failures: usize) -> Arc<ZoneStore> {
    let config = test_config();
    let manager = SignatureManager::initialize(
        &config,
        Arc::new(StubAuthority::new(failures)),
        Arc::new(StubSigner),
    )
    .await;
    Arc::new(
        ZoneStore::new(config, Arc::new(manager), Arc::new(NoRouting), None).expect("store"),
    )
}

fn request(name: &str, query_type: RecordType, dnssec_ok: bool) -> Message {
    let mut message = Message::new();
    message
        .set_id(7)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query);
    message.add_query(Query::query(Name::from_str(name).unwrap(), query_type));
    if dnssec_ok {
        let mut edns = Edns::new();
        edns.set_version(0);
        edns.set_dnssec_ok(true);
        message.set_edns(edns);
    }
    message
}

fn lower(name: &str) -> LowerName {
    LowerName::from(Name::from_str(name).unwrap())
}

#[tokio::test]
async fn initialization_retries_until_the_first_fetch_succeeds() {
    let store = signed_store(2).await;

    assert!(store.signatures().enabled());
    assert!(store.signatures().has_keys(&lower("video.cdn.example.net.")));
    assert!(!store.signatures().has_keys(&lower("cdn.example.net.")));
}

#[tokio::test]
async fn keyed_zones_are_built_signed() {
    let store = signed_store(0).await;

    let entry = store
        .find_zone(&lower("video.cdn.example.net."), RecordType::A)
        .expect("zone");
    assert!(entry.signing().is_some(), "signing metadata recorded");
    assert!(entry.zone().is_signed(), "RRSIG attached");
    assert!(
        entry.key().is_signed(),
        "cache identity reflects the signed rendition"
    );

    // the DNSKEY set is published in the zone itself
    let lookup = entry
        .zone()
        .lookup(&lower("video.cdn.example.net."), RecordType::DNSKEY);
    let sets = lookup.as_records().expect("DNSKEY set");
    assert_eq!(sets[0].records_without_rrsigs().count(), 2);

    // the unkeyed parent is left unsigned
    let parent = store
        .find_zone(&lower("other.cdn.example.net."), RecordType::A)
        .expect("parent zone");
    assert!(parent.signing().is_none());
}

#[tokio::test]
async fn parent_zone_answers_ds_for_the_signed_child() {
    let store = signed_store(0).await;
    let engine = ProtocolEngine::new(store);

    let response = engine.query(&request("video.cdn.example.net.", RecordType::DS, false), CLIENT);
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert!(response.authoritative());

    let ds = response
        .answers()
        .iter()
        .find(|record| record.record_type() == RecordType::DS)
        .expect("DS answer");
    assert_eq!(ds.ttl(), 30);
    assert_eq!(
        ds.name(),
        &Name::from_str("video.cdn.example.net.").unwrap()
    );
}

#[tokio::test]
async fn signed_negative_answer_keeps_the_covered_soa() {
    let store = signed_store(0).await;
    let engine = ProtocolEngine::new(store);

    let response = engine.query(
        &request("missing.video.cdn.example.net.", RecordType::A, true),
        CLIENT,
    );
    assert_eq!(response.response_code(), ResponseCode::NXDomain);

    let authority = response.name_servers();
    let soa = authority
        .iter()
        .find(|record| record.record_type() == RecordType::SOA)
        .expect("SOA in authority");
    // the signature covers the original TTL, so it is not lowered
    assert_eq!(soa.ttl(), 86400);
    assert!(authority
        .iter()
        .any(|record| record.record_type() == RecordType::RRSIG));
}

#[tokio::test]
async fn signature_query_returns_only_rrsigs() {
    let store = signed_store(0).await;
    let engine = ProtocolEngine::new(store);

    let response = engine.query(&request("video.cdn.example.net.", RecordType::RRSIG, false), CLIENT);
    assert_eq!(response.response_code(), ResponseCode::NoError);
    assert!(!response.answers().is_empty());
    assert!(response
        .answers()
        .iter()
        .all(|record| record.record_type() == RecordType::RRSIG));
}

#[tokio::test]
async fn fresh_signatures_do_not_need_refresh() {
    let store = signed_store(0).await;
    // far inside the validity window of a just-built snapshot
    assert!(!store.any_needs_refresh(time::Duration::seconds(1)));
}
