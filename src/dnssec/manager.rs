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

//! Key lifecycle, signing-key selection, and signing orchestration.

use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use hickory_proto::rr::dnssec::rdata::DNSSECRData;
use hickory_proto::rr::dnssec::DigestType;
use hickory_proto::rr::{LowerName, Name, RData, Record};
use time::{Duration, OffsetDateTime};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::keys::{self, KeyMap, KeyRole, SigningKeyPair};
use super::{KeyAuthorityClient, ZoneSigner};
use crate::config::CdnConfig;
use crate::error::KeyFetchError;
use crate::store::ZoneStore;
use crate::zone::SignedZoneKey;

const CLOCK_SKEW_ALLOWANCE: Duration = Duration::hours(1);

/// Owns the signing key set and every signing decision.
///
/// When signing is disabled every operation is a pass-through, so callers
/// never branch on the DNSSEC flag themselves.
pub struct SignatureManager {
    enabled: bool,
    expiration_multiplier: u32,
    dnskey_ttl: u32,
    fetch_retries: u32,
    fetch_wait: StdDuration,
    keys: RwLock<Arc<KeyMap>>,
    client: Option<Arc<dyn KeyAuthorityClient>>,
    signer: Option<Arc<dyn ZoneSigner>>,
}

impl SignatureManager {
    /// A manager with signing disabled; all operations pass through.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            expiration_multiplier: 1,
            dnskey_ttl: 0,
            fetch_retries: 0,
            fetch_wait: StdDuration::ZERO,
            keys: RwLock::new(Arc::new(KeyMap::new())),
            client: None,
            signer: None,
        }
    }

    /// Builds the manager and blocks until the first key fetch succeeds,
    /// so dependents never observe an empty key map. Returns a disabled
    /// manager immediately when the config has signing off.
    pub async fn initialize(
        config: &CdnConfig,
        client: Arc<dyn KeyAuthorityClient>,
        signer: Arc<dyn ZoneSigner>,
    ) -> Self {
        if !config.dnssec.enabled {
            return Self::disabled();
        }

        let manager = Self {
            enabled: true,
            expiration_multiplier: config.dnssec.expiration_multiplier,
            dnskey_ttl: config.ttls.dnskey,
            fetch_retries: config.dnssec.fetch_retries,
            fetch_wait: config.dnssec.fetch_wait(),
            keys: RwLock::new(Arc::new(KeyMap::new())),
            client: Some(client),
            signer: Some(signer),
        };

        loop {
            match manager.fetch_key_map().await {
                Ok(map) => {
                    info!(zones = map.len(), "initial signing key set fetched");
                    manager.install(map);
                    break;
                }
                Err(e) => {
                    error!("initial key fetch failed, waiting to retry: {e}");
                    tokio::time::sleep(manager.fetch_wait).await;
                }
            }
        }

        manager
    }

    /// A manager over a fixed key map, for tests.
    #[cfg(any(test, feature = "testing"))]
    pub fn with_key_map(
        expiration_multiplier: u32,
        dnskey_ttl: u32,
        key_map: KeyMap,
        signer: Arc<dyn ZoneSigner>,
    ) -> Self {
        Self {
            enabled: true,
            expiration_multiplier,
            dnskey_ttl,
            fetch_retries: 1,
            fetch_wait: StdDuration::ZERO,
            keys: RwLock::new(Arc::new(key_map)),
            client: None,
            signer: Some(signer),
        }
    }

    /// Whether signing is on at all.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the key set holds signing keys for `zone`.
    pub fn has_keys(&self, zone: &LowerName) -> bool {
        self.enabled
            && self
                .current_keys()
                .get(zone)
                .map_or(false, |pairs| !pairs.is_empty())
    }

    /// Fetches and installs a fresh key map.
    ///
    /// Returns whether the new map carries keys the previous one lacked;
    /// callers rebuild zones only on `true`. On failure the previous map
    /// stays authoritative.
    pub async fn refresh_keys(&self) -> Result<bool, KeyFetchError> {
        if !self.enabled {
            return Ok(false);
        }
        let fresh = self.fetch_key_map().await?;
        let changed = keys::has_new_keys(&self.current_keys(), &fresh);
        self.install(fresh);
        Ok(changed)
    }

    async fn fetch_key_map(&self) -> Result<KeyMap, KeyFetchError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| KeyFetchError::Authority("no key authority client".to_string()))?;

        for attempt in 1..=self.fetch_retries {
            match client.fetch_keys().await {
                Ok(response) => return Ok(keys::decode_key_map(&response, self.dnskey_ttl)),
                Err(e) => {
                    warn!(
                        "key fetch attempt {attempt} of {} failed: {e}",
                        self.fetch_retries
                    );
                    if attempt < self.fetch_retries {
                        tokio::time::sleep(self.fetch_wait).await;
                    }
                }
            }
        }
        Err(KeyFetchError::Exhausted {
            attempts: self.fetch_retries,
        })
    }

    fn install(&self, map: KeyMap) {
        let fresh = Arc::new(map);
        match self.keys.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
    }

    fn current_keys(&self) -> Arc<KeyMap> {
        match self.keys.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Selects the signing key for `zone` in `role` by pre-publish
    /// rollover: among keys already effective and not yet expired, the one
    /// with the earliest effective date wins. When every effective key has
    /// expired the most recently expired one is used, so an administrative
    /// expiry gap never silently drops signatures.
    pub fn signing_key_pair(
        &self,
        zone: &LowerName,
        role: KeyRole,
        now: OffsetDateTime,
    ) -> Option<SigningKeyPair> {
        let keys = self.current_keys();
        let candidates: Vec<&SigningKeyPair> = keys
            .get(zone)?
            .iter()
            .filter(|pair| pair.role() == role)
            .collect();

        if let Some(active) = candidates
            .iter()
            .filter(|pair| pair.usable(now) && !pair.expired(now))
            .min_by_key(|pair| pair.effective())
        {
            return Some((*active).clone());
        }

        let fallback = candidates
            .iter()
            .filter(|pair| pair.usable(now))
            .max_by_key(|pair| pair.expiration())?;
        warn!("all {role:?} keys for {zone} are expired, signing with the most recent");
        Some((*fallback).clone())
    }

    /// Signs `records` for the zone at `origin`.
    ///
    /// Signature expiration is `created` plus the set's maximum TTL times
    /// the configured multiplier; inception is backdated for clock skew.
    /// Missing keys or a signer failure are logged and the records
    /// returned unsigned, never failing the caller.
    pub fn sign_zone(
        &self,
        origin: &Name,
        records: Vec<Record>,
        created: OffsetDateTime,
    ) -> (Vec<Record>, Option<SignedZoneKey>) {
        let signer = match (&self.signer, self.enabled) {
            (Some(signer), true) => signer,
            _ => return (records, None),
        };

        let zone = LowerName::new(origin);
        let now = OffsetDateTime::now_utc();
        let ksk = self.signing_key_pair(&zone, KeyRole::Ksk, now);
        let zsk = self.signing_key_pair(&zone, KeyRole::Zsk, now);
        let (Some(ksk), Some(zsk)) = (ksk, zsk) else {
            warn!("no usable signing keys for {origin}, serving unsigned");
            return (records, None);
        };

        let max_ttl = records.iter().map(Record::ttl).max().unwrap_or(0);
        let validity = Duration::seconds(i64::from(max_ttl) * i64::from(self.expiration_multiplier));
        let expiration = created + validity;
        let inception = now - CLOCK_SKEW_ALLOWANCE;

        match signer.sign_zone(
            &records,
            std::slice::from_ref(&ksk),
            std::slice::from_ref(&zsk),
            inception,
            expiration,
        ) {
            Ok(signed) => {
                let meta = SignedZoneKey {
                    created,
                    signature_expiration: expiration,
                    ksk_expiration: ksk.expiration(),
                    zsk_expiration: zsk.expiration(),
                };
                (signed, Some(meta))
            }
            Err(e) => {
                warn!("signing zone {origin} failed, serving unsigned: {e}");
                (records, None)
            }
        }
    }

    /// Whether a zone signed with `meta` is due for a resign before the
    /// next check `interval` away. Unsigned zones never are.
    pub fn needs_refresh(&self, meta: Option<&SignedZoneKey>, interval: Duration) -> bool {
        if !self.enabled {
            return false;
        }
        meta.map_or(false, |meta| {
            meta.needs_refresh(OffsetDateTime::now_utc(), interval)
        })
    }

    /// Parent-side DS records for `child`, one per key-signing key.
    pub fn generate_ds_records(&self, child: &Name, ttl: u32) -> Vec<Record> {
        let signer = match (&self.signer, self.enabled) {
            (Some(signer), true) => signer,
            _ => return Vec::new(),
        };

        let keys = self.current_keys();
        let mut records = Vec::new();
        for pair in keys
            .get(&LowerName::new(child))
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            if pair.role() != KeyRole::Ksk {
                continue;
            }
            match signer.calculate_ds(child, pair.dnskey(), DigestType::SHA256, ttl) {
                Ok(record) => records.push(record),
                Err(e) => warn!("DS generation for {child} failed: {e}"),
            }
        }
        records
    }

    /// The published DNSKEY set for `zone`: every KSK and ZSK, successors
    /// included, since pre-publish rollover requires publishing them early.
    pub fn generate_dnskey_records(&self, zone: &Name) -> Vec<Record> {
        if !self.enabled {
            return Vec::new();
        }

        let keys = self.current_keys();
        keys.get(&LowerName::new(zone))
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|pair| {
                Record::from_rdata(
                    zone.clone(),
                    pair.ttl(),
                    RData::DNSSEC(DNSSECRData::DNSKEY(pair.dnskey().clone())),
                )
            })
            .collect()
    }
}

/// Handle to the periodic key-maintenance task.
///
/// Each tick fetches the key set, rebuilds zones when new keys appear, and
/// sweeps for zones past their signature refresh horizon. Ticks run on one
/// task and never overlap. Dropping the handle stops the task.
pub struct KeyMaintenance {
    manager: Arc<SignatureManager>,
    store: Arc<ZoneStore>,
    interval: StdDuration,
    task: Option<JoinHandle<()>>,
}

impl KeyMaintenance {
    /// Creates a stopped handle; call [`Self::start`] to begin ticking.
    pub fn new(manager: Arc<SignatureManager>, store: Arc<ZoneStore>, interval: StdDuration) -> Self {
        Self {
            manager,
            store,
            interval,
            task: None,
        }
    }

    /// Starts the maintenance task, replacing a running one.
    pub fn start(&mut self) {
        self.stop();
        if !self.manager.enabled() {
            return;
        }

        let manager = self.manager.clone();
        let store = self.store.clone();
        let period = self.interval;
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the interval fires immediately; keys were fetched at init
            ticker.tick().await;
            loop {
                ticker.tick().await;
                run_cycle(&manager, &store, period).await;
            }
        }));
    }

    /// Changes the polling interval, rescheduling the task if running.
    pub fn set_interval(&mut self, interval: StdDuration) {
        self.interval = interval;
        if self.task.is_some() {
            self.start();
        }
    }

    /// Stops the maintenance task.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for KeyMaintenance {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_cycle(manager: &SignatureManager, store: &ZoneStore, period: StdDuration) {
    match manager.refresh_keys().await {
        Ok(true) => {
            info!("signing key set changed, rebuilding zones");
            rebuild(store);
        }
        Ok(false) => {
            let interval = Duration::seconds(period.as_secs() as i64);
            if store.any_needs_refresh(interval) {
                info!("signature refresh horizon reached, rebuilding zones");
                rebuild(store);
            }
        }
        Err(e) => error!("key maintenance cycle failed, keeping previous keys: {e}"),
    }
}

fn rebuild(store: &ZoneStore) {
    if let Err(e) = store.rebuild_zone_cache() {
        error!("zone rebuild after key maintenance failed: {e}");
    }
}
