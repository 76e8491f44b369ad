//! Tessera Keys: cached remote signing keys
//!
//! The evaluation and fetch layers verify event signatures against remote
//! servers' Ed25519 keys. This crate holds the cache they consult: reads
//! never suspend, and the only awaiting call is the batched `fetch` that
//! refills misses over federation. The fetch-unit worker deliberately
//! never calls `fetch` — an unknown key there defers verification rather
//! than risking mutual-fetch deadlock.

use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{unix_now_ms, KeyId, ServerName, VerifyingKey};
use tessera_federation::{FederationClient, FederationRequest};
use tracing::{debug, warn};

/// A cached verifying key and its expiry.
#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    key: VerifyingKey,
    valid_until_ms: u64,
}

/// The published key document of one server.
#[derive(Debug, Deserialize)]
struct ServerKeysResponse {
    server_name: String,
    #[serde(default)]
    valid_until_ts: u64,
    #[serde(default)]
    verify_keys: BTreeMap<String, VerifyKeyObject>,
}

#[derive(Debug, Deserialize)]
struct VerifyKeyObject {
    key: String,
}

/// Cache of `(server, key_id) → verifying key` with TTL.
pub struct KeyCache {
    client: Arc<dyn FederationClient>,
    entries: RwLock<HashMap<(ServerName, KeyId), CacheEntry>>,
    /// Ceiling applied on top of the server-advertised `valid_until_ts`.
    max_ttl: Duration,
}

impl KeyCache {
    /// Default ceiling on how long a fetched key is trusted.
    pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(24 * 3600);

    pub fn new(client: Arc<dyn FederationClient>) -> Self {
        Self::with_max_ttl(client, Self::DEFAULT_MAX_TTL)
    }

    pub fn with_max_ttl(client: Arc<dyn FederationClient>, max_ttl: Duration) -> Self {
        Self {
            client,
            entries: RwLock::new(HashMap::new()),
            max_ttl,
        }
    }

    /// True when a non-expired key is cached.
    pub fn has(&self, server: &ServerName, key_id: &KeyId) -> bool {
        self.get(server, key_id).is_some()
    }

    /// A non-expired cached key, if present.
    pub fn get(&self, server: &ServerName, key_id: &KeyId) -> Option<VerifyingKey> {
        let entries = self.entries.read();
        let entry = entries.get(&(server.clone(), key_id.clone()))?;
        (entry.valid_until_ms > unix_now_ms()).then_some(entry.key)
    }

    /// Install a key directly, e.g. from configuration or a notary.
    pub fn insert(
        &self,
        server: ServerName,
        key_id: KeyId,
        key: VerifyingKey,
        valid_until_ms: u64,
    ) {
        self.entries.write().insert(
            (server, key_id),
            CacheEntry {
                key,
                valid_until_ms,
            },
        );
    }

    /// Number of live (non-expired) entries.
    pub fn count(&self) -> usize {
        let now = unix_now_ms();
        self.entries
            .read()
            .values()
            .filter(|entry| entry.valid_until_ms > now)
            .count()
    }

    /// Batched refill: query each missing `(server, key_id)` from the
    /// server itself and return how many keys arrived. Per-server
    /// failures are logged and swallowed; the caller decides what an
    /// incomplete batch means.
    pub async fn fetch(&self, queries: &[(ServerName, KeyId)]) -> usize {
        let missing: BTreeSet<(ServerName, KeyId)> = queries
            .iter()
            .filter(|(server, key_id)| !self.has(server, key_id))
            .cloned()
            .collect();

        if missing.is_empty() {
            return 0;
        }

        debug!(keys = missing.len(), "fetching server keys");

        let mut fetched = 0;
        for (server, key_id) in missing {
            let request = FederationRequest::ServerKeys {
                server: server.clone(),
                key_id: key_id.clone(),
            };

            let response = match self.client.send(&server, &request).await {
                Ok(bytes) => bytes,
                Err(error) => {
                    warn!(server = %server, key_id = %key_id, error = %error, "key fetch failed");
                    continue;
                }
            };

            match self.absorb(&server, &response) {
                Ok(count) => fetched += count,
                Err(error) => {
                    warn!(server = %server, error = %error, "rejected key response");
                }
            }
        }

        fetched
    }

    /// Parse a key document and install every key it advertises.
    fn absorb(&self, server: &ServerName, response: &[u8]) -> tessera_core::Result<usize> {
        let document: ServerKeysResponse = serde_json::from_slice(response)?;

        if document.server_name != server.as_str() {
            return Err(tessera_core::Error::remote(format!(
                "key document for '{}' served by '{server}'",
                document.server_name
            )));
        }

        let ceiling = unix_now_ms() + self.max_ttl.as_millis() as u64;
        let valid_until_ms = document.valid_until_ts.min(ceiling).max(1);

        let mut installed = 0;
        for (key_id, object) in document.verify_keys {
            let key = VerifyingKey::from_base64(&object.key)?;
            self.insert(server.clone(), KeyId::from(key_id.as_str()), key, valid_until_ms);
            installed += 1;
        }

        Ok(installed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::SigningKey;
    use tessera_federation::MemoryFederationClient;

    fn test_key() -> (SigningKey, VerifyingKey) {
        let signing = SigningKey::from_bytes([5u8; 32]);
        let verifying = signing.verifying_key();
        (signing, verifying)
    }

    #[test]
    fn insert_get_and_expiry() {
        let cache = KeyCache::new(Arc::new(MemoryFederationClient::new()));
        let server = ServerName::from("example.org");
        let key_id = KeyId::from("ed25519:auto");
        let (_, verifying) = test_key();

        cache.insert(
            server.clone(),
            key_id.clone(),
            verifying,
            unix_now_ms() + 60_000,
        );
        assert!(cache.has(&server, &key_id));
        assert_eq!(cache.get(&server, &key_id), Some(verifying));

        // Expired entries read as absent.
        cache.insert(server.clone(), key_id.clone(), verifying, 1);
        assert!(!cache.has(&server, &key_id));
    }

    #[tokio::test]
    async fn batched_fetch_installs_keys() {
        let client = Arc::new(MemoryFederationClient::new());
        let cache = KeyCache::new(client.clone());

        let server = ServerName::from("example.org");
        let key_id = KeyId::from("ed25519:auto");
        let (_, verifying) = test_key();

        let request = FederationRequest::ServerKeys {
            server: server.clone(),
            key_id: key_id.clone(),
        };
        let document = json!({
            "server_name": "example.org",
            "valid_until_ts": unix_now_ms() + 600_000,
            "verify_keys": { "ed25519:auto": { "key": verifying.to_base64() } },
        });
        client.respond(&server, &request, document.to_string().into_bytes());

        let fetched = cache
            .fetch(&[(server.clone(), key_id.clone())])
            .await;
        assert_eq!(fetched, 1);
        assert_eq!(cache.get(&server, &key_id), Some(verifying));

        // A second fetch is satisfied from cache without a round-trip.
        let calls_before = client.call_count();
        assert_eq!(cache.fetch(&[(server, key_id)]).await, 0);
        assert_eq!(client.call_count(), calls_before);
    }

    #[tokio::test]
    async fn mismatched_server_name_rejected() {
        let client = Arc::new(MemoryFederationClient::new());
        let cache = KeyCache::new(client.clone());

        let server = ServerName::from("example.org");
        let key_id = KeyId::from("ed25519:auto");
        let (_, verifying) = test_key();

        let request = FederationRequest::ServerKeys {
            server: server.clone(),
            key_id: key_id.clone(),
        };
        let document = json!({
            "server_name": "imposter.example",
            "valid_until_ts": unix_now_ms() + 600_000,
            "verify_keys": { "ed25519:auto": { "key": verifying.to_base64() } },
        });
        client.respond(&server, &request, document.to_string().into_bytes());

        assert_eq!(cache.fetch(&[(server.clone(), key_id.clone())]).await, 0);
        assert!(!cache.has(&server, &key_id));
    }
}
