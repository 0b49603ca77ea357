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

// LIBRARY WARNINGS
#![warn(
    clippy::default_trait_access,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::unimplemented,
    clippy::use_self,
    missing_copy_implementations,
    missing_docs,
    non_snake_case,
    non_upper_case_globals,
    rust_2018_idioms,
    unreachable_pub
)]
#![allow(clippy::single_component_path_imports)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! cdn-dns is the authoritative DNS engine of a CDN traffic-routing control
//! plane.
//!
//! The engine answers queries for CDN-managed domains from two tiers of
//! zones: *static* zones synthesized wholesale from the CDN configuration
//! snapshot, and *dynamic* zones synthesized per routing outcome when a
//! query hits a reserved routing name. Both tiers are cached; the static
//! tier is rebuilt and re-published atomically on configuration or signing
//! key changes, and the dynamic tier is content-addressed so distinct
//! clients with identical routing outcomes share one entry.
//!
//! DNSSEC is optional. When enabled, a [`dnssec::SignatureManager`]
//! maintains the signing key set from a key authority on a background task
//! and re-signs zones before their signatures near expiration, without ever
//! blocking the query path.
//!
//! Routing decisions, key-authority transport, and the cryptographic
//! signing primitive are consumed through the [`routing::RoutingDecision`],
//! [`dnssec::KeyAuthorityClient`], and [`dnssec::ZoneSigner`] traits; wire
//! listeners and configuration loading live outside this crate.

pub use hickory_proto as proto;

pub mod config;
pub mod dnssec;
pub mod engine;
pub mod error;
pub mod routing;
pub mod store;
pub mod zone;

pub use self::engine::ProtocolEngine;
pub use self::store::ZoneStore;

/// Returns the current version of cdn-dns
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
