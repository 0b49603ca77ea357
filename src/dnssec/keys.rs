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

//! Signing key material and the key-authority document it is decoded from.

use std::collections::{BTreeMap, HashMap};

use data_encoding::BASE64;
use hickory_proto::rr::dnssec::rdata::DNSKEY;
use hickory_proto::rr::dnssec::Algorithm;
use hickory_proto::rr::{LowerName, Name};
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::error;

use crate::error::KeyFetchError;

const FLAG_SEP: u16 = 0x0001;
const FLAG_ZONE_KEY: u16 = 0x0100;

/// DNSSEC key roles.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyRole {
    /// Key-signing key; signs the DNSKEY RRset
    Ksk,
    /// Zone-signing key; signs the zone data
    Zsk,
}

/// One signing key with its rotation schedule.
///
/// Equality compares the DNSKEY rdata, the private key material, and the
/// three schedule dates; that is the identity used for change detection
/// between fetches.
#[derive(Clone, Debug)]
pub struct SigningKeyPair {
    role: KeyRole,
    name: LowerName,
    inception: OffsetDateTime,
    effective: OffsetDateTime,
    expiration: OffsetDateTime,
    ttl: u32,
    dnskey: DNSKEY,
    private_key: Vec<u8>,
}

impl SigningKeyPair {
    /// The key's role, derived from the DNSKEY secure-entry-point flag.
    pub fn role(&self) -> KeyRole {
        self.role
    }

    /// The zone this key signs.
    pub fn name(&self) -> &LowerName {
        &self.name
    }

    /// Start of the key's publication window.
    pub fn inception(&self) -> OffsetDateTime {
        self.inception
    }

    /// When the key becomes the active signer.
    pub fn effective(&self) -> OffsetDateTime {
        self.effective
    }

    /// Administrative end of the key's signing window.
    pub fn expiration(&self) -> OffsetDateTime {
        self.expiration
    }

    /// TTL of the published DNSKEY record.
    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// The public DNSKEY rdata.
    pub fn dnskey(&self) -> &DNSKEY {
        &self.dnskey
    }

    /// Opaque private key material, passed through to the signer.
    pub fn private_key(&self) -> &[u8] {
        &self.private_key
    }

    /// Whether the key may sign at `now`.
    pub fn usable(&self, now: OffsetDateTime) -> bool {
        now >= self.effective
    }

    /// Whether the key's signing window has closed at `now`.
    pub fn expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expiration
    }
}

impl PartialEq for SigningKeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.dnskey == other.dnskey
            && self.private_key == other.private_key
            && self.inception == other.inception
            && self.effective == other.effective
            && self.expiration == other.expiration
    }
}

/// Keys per zone; replaced wholesale on each accepted fetch.
pub type KeyMap = HashMap<LowerName, Vec<SigningKeyPair>>;

/// The key authority's document: per-zone KSK and ZSK arrays.
#[derive(Debug, Deserialize)]
pub struct KeyAuthorityResponse {
    /// Key entries keyed by zone name
    pub response: BTreeMap<String, ZoneKeyEntries>,
}

/// Key arrays for one zone.
#[derive(Debug, Deserialize)]
pub struct ZoneKeyEntries {
    /// Key-signing keys, successors included
    #[serde(default)]
    pub ksk: Vec<KeyEntry>,
    /// Zone-signing keys, successors included
    #[serde(default)]
    pub zsk: Vec<KeyEntry>,
}

/// One undecoded key entry.
#[derive(Debug, Deserialize)]
pub struct KeyEntry {
    /// Owning zone name
    pub name: String,
    /// Publication start, unix epoch seconds
    #[serde(rename = "inceptionDate")]
    pub inception_date: i64,
    /// Active-signer start, unix epoch seconds
    #[serde(rename = "effectiveDate")]
    pub effective_date: i64,
    /// Administrative end, unix epoch seconds
    #[serde(rename = "expirationDate")]
    pub expiration_date: i64,
    /// DNSKEY TTL; the configured DNSKEY TTL applies when absent
    #[serde(default)]
    pub ttl: Option<u32>,
    /// Public key fields
    pub dnskey: DnskeyMaterial,
    /// Base64 private key material
    pub private: String,
}

/// The DNSKEY fields of a key entry.
#[derive(Debug, Deserialize)]
pub struct DnskeyMaterial {
    /// RFC 4034 flags field
    pub flags: u16,
    /// Always 3 on the wire; carried but not validated
    pub protocol: u8,
    /// DNSSEC algorithm number
    pub algorithm: u8,
    /// Base64 public key
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

impl KeyEntry {
    /// Decodes this entry into a usable key pair.
    pub fn decode(&self, default_ttl: u32) -> Result<SigningKeyPair, KeyFetchError> {
        let name = LowerName::new(&Name::from_ascii(&self.name)?);
        let inception = epoch(self.inception_date, "inceptionDate")?;
        let effective = epoch(self.effective_date, "effectiveDate")?;
        let expiration = epoch(self.expiration_date, "expirationDate")?;

        let public_key = decode_base64(&self.dnskey.public_key)?;
        let private_key = decode_base64(&self.private)?;

        let sep = self.dnskey.flags & FLAG_SEP != 0;
        let zone_key = self.dnskey.flags & FLAG_ZONE_KEY != 0;
        let dnskey = DNSKEY::new(
            zone_key,
            sep,
            false,
            Algorithm::from_u8(self.dnskey.algorithm),
            public_key,
        );

        Ok(SigningKeyPair {
            role: if sep { KeyRole::Ksk } else { KeyRole::Zsk },
            name,
            inception,
            effective,
            expiration,
            ttl: self.ttl.unwrap_or(default_ttl),
            dnskey,
            private_key,
        })
    }
}

fn epoch(seconds: i64, field: &str) -> Result<OffsetDateTime, KeyFetchError> {
    OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|_| KeyFetchError::KeyField(format!("{field} {seconds} out of range")))
}

fn decode_base64(text: &str) -> Result<Vec<u8>, KeyFetchError> {
    let compact: Vec<u8> = text
        .bytes()
        .filter(|byte| !byte.is_ascii_whitespace())
        .collect();
    Ok(BASE64.decode(&compact)?)
}

/// Decodes a fetched document into a [`KeyMap`]. Entries that fail to
/// decode are logged and skipped; one bad entry never discards the rest.
pub fn decode_key_map(response: &KeyAuthorityResponse, default_ttl: u32) -> KeyMap {
    let mut map = KeyMap::new();
    for (zone, entries) in &response.response {
        for entry in entries.ksk.iter().chain(entries.zsk.iter()) {
            match entry.decode(default_ttl) {
                Ok(pair) => map.entry(pair.name().clone()).or_insert_with(Vec::new).push(pair),
                Err(e) => error!("skipping undecodable key for zone {zone}: {e}"),
            }
        }
    }
    map
}

/// Whether `new` carries any key absent from `old`.
///
/// Deliberately one-directional: a zone disappearing from the authority's
/// response does not force a rebuild, its zones keep serving their last
/// valid signatures until the refresh horizon.
pub fn has_new_keys(old: &KeyMap, new: &KeyMap) -> bool {
    for (zone, pairs) in new {
        match old.get(zone) {
            Some(existing) => {
                if pairs.iter().any(|pair| !existing.contains(pair)) {
                    return true;
                }
            }
            None => {
                if !pairs.is_empty() {
                    return true;
                }
            }
        }
    }
    false
}
