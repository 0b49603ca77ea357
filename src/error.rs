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

//! Error types for the zone, signing, and query layers.
//!
//! Resolution misses (NXDOMAIN/NXRRSET) are normal lookup outcomes and are
//! *not* errors; see [`crate::zone::ZoneLookup`]. The types here cover the
//! failures that are contained to a single query, fetch cycle, or rebuild.

use hickory_proto::error::ProtoError;
use thiserror::Error;

/// An error while synthesizing or constructing zones from configuration.
///
/// Individual malformed records are logged and skipped during synthesis;
/// this error covers faults that make a whole rebuild impossible, such as
/// an unparseable top-level domain.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ZoneBuildError {
    /// A name or record could not be constructed
    #[error("proto error: {0}")]
    Proto(#[from] ProtoError),

    /// The configured top-level domain is unusable
    #[error("invalid top level domain: {0}")]
    InvalidTopLevelDomain(String),
}

/// An error while fetching or decoding the signing key set.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeyFetchError {
    /// The key authority could not be reached or returned a failure
    #[error("key authority error: {0}")]
    Authority(String),

    /// All fetch attempts for one cycle were used up
    #[error("key fetch failed after {attempts} attempts")]
    Exhausted {
        /// number of attempts made before giving up
        attempts: u32,
    },

    /// Key material could not be base64-decoded
    #[error("bad key material: {0}")]
    KeyMaterial(#[from] data_encoding::DecodeError),

    /// A date or name field in the key document was out of range
    #[error("bad key field: {0}")]
    KeyField(String),

    /// A name could not be parsed
    #[error("proto error: {0}")]
    Proto(#[from] ProtoError),
}

/// An error raised by a [`crate::dnssec::ZoneSigner`] implementation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SigningError {
    /// The signing primitive failed
    #[error("zone signer failure: {0}")]
    Signer(String),

    /// A record could not be constructed for the signature set
    #[error("proto error: {0}")]
    Proto(#[from] ProtoError),
}

/// An error during response construction; surfaced to clients as SERVFAIL.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// A name could not be manipulated
    #[error("proto error: {0}")]
    Proto(#[from] ProtoError),
}
