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

//! DNSSEC key lifecycle and signing orchestration.
//!
//! [`SignatureManager`] owns the key set and all signing decisions;
//! [`KeyMaintenance`] drives its periodic refresh. The cryptographic
//! primitive and the key authority transport live behind the
//! [`ZoneSigner`] and [`KeyAuthorityClient`] traits.

use async_trait::async_trait;
use hickory_proto::rr::dnssec::rdata::DNSKEY;
use hickory_proto::rr::dnssec::DigestType;
use hickory_proto::rr::{Name, Record};
use time::OffsetDateTime;

use crate::error::{KeyFetchError, SigningError};

mod keys;
mod manager;

pub use keys::{
    decode_key_map, has_new_keys, DnskeyMaterial, KeyAuthorityResponse, KeyEntry, KeyMap, KeyRole,
    SigningKeyPair, ZoneKeyEntries,
};
pub use manager::{KeyMaintenance, SignatureManager};

/// The cryptographic signing primitive.
///
/// Implementations produce RRSIG and NSEC records over a zone's record
/// set and DS digests over DNSKEYs; key selection and validity windows
/// are decided by the caller.
pub trait ZoneSigner: Send + Sync {
    /// Signs `records`, returning the full record list with RRSIG and
    /// NSEC records added.
    fn sign_zone(
        &self,
        records: &[Record],
        ksks: &[SigningKeyPair],
        zsks: &[SigningKeyPair],
        inception: OffsetDateTime,
        expiration: OffsetDateTime,
    ) -> Result<Vec<Record>, SigningError>;

    /// Builds the parent-side DS record for `dnskey` at `owner`.
    fn calculate_ds(
        &self,
        owner: &Name,
        dnskey: &DNSKEY,
        digest_type: DigestType,
        ttl: u32,
    ) -> Result<Record, SigningError>;
}

/// Transport to the key authority.
///
/// Login and HTTP mechanics live behind this trait; the manager only
/// consumes the decoded document.
#[async_trait]
pub trait KeyAuthorityClient: Send + Sync {
    /// Fetches the current per-zone key document.
    async fn fetch_keys(&self) -> Result<KeyAuthorityResponse, KeyFetchError>;
}
