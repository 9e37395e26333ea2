//! Kvstore entries with hidden keys, and a tool-rental ledger built on them.
//!
//! Namespaces and entry keys travel in cleartext; only values are
//! encrypted. [`SecretKvStore`] stores `HMAC-SHA256(secret, key)` in place
//! of each entry key, with one random secret per (team, namespace) kept
//! under [`SECRET_KEY`]. The plaintext key rides inside the JSON value
//! under [`KEY_FIELD`] so listings can recover it.
//!
//! [`Rentals`] writes with the revision it last read. A writer that lost a
//! race gets [`Rental::Rejected`] with the entry's current state and can
//! retry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::api::Api;
use crate::error::{BotError, Result};
use crate::models::{KvDeleteEntryResult, KvListEntryKey, KvPutResult};

/// Entry holding the per-namespace HMAC secret.
pub const SECRET_KEY: &str = "_secret";

/// Value field carrying the plaintext entry key.
pub const KEY_FIELD: &str = "_key";

/// Namespace used by [`Rentals`].
pub const RENTAL_NAMESPACE: &str = "rental";

const SECRET_LEN: usize = 64;

/// Fields of a stored JSON object.
pub type Fields = BTreeMap<String, String>;

/// A decoded entry. `fields` is `None` for a missing or deleted entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretEntry {
    pub entry_key: String,
    pub fields: Option<Fields>,
    pub revision: i64,
}

/// Kvstore access that hides entry keys from the server.
///
/// Secrets are never rotated. Creating a secret for a namespace that has
/// never been written is not conditional, so two processes doing that at
/// the same moment can disagree until one of them restarts.
pub struct SecretKvStore {
    api: Arc<Api>,
    secrets: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl SecretKvStore {
    pub fn new(api: Arc<Api>) -> Self {
        Self {
            api,
            secrets: Mutex::new(HashMap::new()),
        }
    }

    /// The secret for `(team, namespace)`, creating and storing one if needed.
    async fn secret(&self, team: Option<&str>, namespace: &str) -> Result<Vec<u8>> {
        let id = (team.unwrap_or_default().to_string(), namespace.to_string());
        let mut secrets = self.secrets.lock().await;
        if let Some(secret) = secrets.get(&id) {
            return Ok(secret.clone());
        }

        let stored = self.api.get_entry(team, namespace, SECRET_KEY).await?;
        let secret = match stored.entry_value {
            Some(hex_secret) => decode_secret(&hex_secret)?,
            None => {
                let fresh = random_secret();
                match self
                    .api
                    .put_entry_with_revision(team, namespace, SECRET_KEY, &hex::encode(&fresh), stored.revision)
                    .await
                {
                    Ok(_) => {
                        debug!("Created key secret for namespace {}", namespace);
                        fresh
                    }
                    // Someone else created it first.
                    Err(e) if e.is_revision_conflict() => {
                        let stored = self.api.get_entry(team, namespace, SECRET_KEY).await?;
                        decode_secret(stored.entry_value.as_deref().unwrap_or_default())?
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        secrets.insert(id, secret.clone());
        Ok(secret)
    }

    async fn hidden_key(&self, team: Option<&str>, namespace: &str, key: &str) -> Result<String> {
        let secret = self.secret(team, namespace).await?;
        Ok(hex::encode(hmac_sha256(&secret, key.as_bytes())))
    }

    pub async fn get_entry(&self, team: Option<&str>, namespace: &str, key: &str) -> Result<SecretEntry> {
        let hidden = self.hidden_key(team, namespace, key).await?;
        let stored = self.api.get_entry(team, namespace, &hidden).await?;
        let fields = match stored.entry_value {
            Some(value) => {
                let mut fields: Fields = serde_json::from_str(&value)?;
                fields.remove(KEY_FIELD);
                Some(fields)
            }
            None => None,
        };
        Ok(SecretEntry {
            entry_key: key.to_string(),
            fields,
            revision: stored.revision,
        })
    }

    /// Store `fields` under `key`, only if `revision` matches.
    pub async fn put_entry(
        &self,
        team: Option<&str>,
        namespace: &str,
        key: &str,
        fields: &Fields,
        revision: i64,
    ) -> Result<KvPutResult> {
        let mut keyed = fields.clone();
        keyed.insert(KEY_FIELD.to_string(), key.to_string());
        let value = serde_json::to_string(&keyed).map_err(BotError::Encode)?;

        let hidden = self.hidden_key(team, namespace, key).await?;
        let mut result = self
            .api
            .put_entry_with_revision(team, namespace, &hidden, &value, revision)
            .await?;
        result.entry_key = key.to_string();
        Ok(result)
    }

    pub async fn delete_entry(
        &self,
        team: Option<&str>,
        namespace: &str,
        key: &str,
        revision: i64,
    ) -> Result<KvDeleteEntryResult> {
        let hidden = self.hidden_key(team, namespace, key).await?;
        let mut result = self
            .api
            .delete_entry_with_revision(team, namespace, &hidden, revision)
            .await?;
        result.entry_key = key.to_string();
        Ok(result)
    }

    /// Live keys in `namespace`, in plaintext.
    pub async fn list_entry_keys(&self, team: Option<&str>, namespace: &str) -> Result<Vec<KvListEntryKey>> {
        let listed = self.api.list_entry_keys(team, namespace).await?;
        let mut keys = Vec::with_capacity(listed.entry_keys.len());
        for entry in listed.entry_keys {
            if entry.entry_key.starts_with('_') {
                continue;
            }
            let stored = self.api.get_entry(team, namespace, &entry.entry_key).await?;
            let Some(value) = stored.entry_value else {
                continue;
            };
            let fields: Fields = serde_json::from_str(&value)?;
            if let Some(key) = fields.get(KEY_FIELD) {
                keys.push(KvListEntryKey {
                    entry_key: key.clone(),
                    revision: entry.revision,
                });
            }
        }
        Ok(keys)
    }
}

fn random_secret() -> Vec<u8> {
    let mut secret = vec![0u8; SECRET_LEN];
    rand::rng().fill(&mut secret[..]);
    secret
}

fn decode_secret(hex_secret: &str) -> Result<Vec<u8>> {
    hex::decode(hex_secret).map_err(|e| BotError::Decode(format!("bad key secret: {}", e)))
}

/// RFC 2104 HMAC over SHA-256.
fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    const BLOCK: usize = 64;
    let mut block = [0u8; BLOCK];
    if key.len() > BLOCK {
        block[..32].copy_from_slice(&Sha256::digest(key));
    } else {
        block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha256::new();
    inner.update(block.map(|b| b ^ 0x36));
    inner.update(message);
    let inner = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(block.map(|b| b ^ 0x5c));
    outer.update(inner);
    outer.finalize().to_vec()
}

/// Result of a rental write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rental {
    /// Written, or nothing needed writing. Holds the state read beforehand.
    Applied(SecretEntry),
    /// Refused by a reservation rule or a lost race. Holds the current state.
    Rejected(SecretEntry),
}

impl Rental {
    pub fn is_applied(&self) -> bool {
        matches!(self, Rental::Applied(_))
    }

    pub fn entry(&self) -> &SecretEntry {
        match self {
            Rental::Applied(entry) | Rental::Rejected(entry) => entry,
        }
    }
}

/// Tool rentals: one entry per tool, mapping reserved days to usernames.
pub struct Rentals {
    store: SecretKvStore,
}

impl Rentals {
    pub fn new(store: SecretKvStore) -> Self {
        Self { store }
    }

    pub async fn lookup(&self, team: &str, tool: &str) -> Result<SecretEntry> {
        self.store.get_entry(Some(team), RENTAL_NAMESPACE, tool).await
    }

    pub async fn list_tools(&self, team: &str) -> Result<Vec<String>> {
        let keys = self.store.list_entry_keys(Some(team), RENTAL_NAMESPACE).await?;
        Ok(keys.into_iter().map(|k| k.entry_key).collect())
    }

    /// Register `tool` with no reservations. Applied if it already exists.
    pub async fn add(&self, team: &str, tool: &str) -> Result<Rental> {
        let current = self.lookup(team, tool).await?;
        if current.fields.is_some() {
            return Ok(Rental::Applied(current));
        }
        self.write(team, tool, &Fields::new(), current).await
    }

    /// Delete `tool`. Applied if it is already gone.
    pub async fn remove(&self, team: &str, tool: &str) -> Result<Rental> {
        let current = self.lookup(team, tool).await?;
        if current.fields.is_none() {
            return Ok(Rental::Applied(current));
        }
        match self
            .store
            .delete_entry(Some(team), RENTAL_NAMESPACE, tool, current.revision)
            .await
        {
            Ok(_) => Ok(Rental::Applied(current)),
            Err(e) if e.is_revision_conflict() || e.is_not_found() => {
                Ok(Rental::Rejected(self.lookup(team, tool).await?))
            }
            Err(e) => Err(e),
        }
    }

    /// Reserve `day` for `user` unless someone holds it. Adds the tool if
    /// it does not exist.
    pub async fn reserve(&self, team: &str, user: &str, tool: &str, day: &str) -> Result<Rental> {
        let current = self.lookup(team, tool).await?;
        self.reserve_from(team, user, tool, day, current).await
    }

    async fn reserve_from(
        &self,
        team: &str,
        user: &str,
        tool: &str,
        day: &str,
        current: SecretEntry,
    ) -> Result<Rental> {
        let mut days = current.fields.clone().unwrap_or_default();
        if days.contains_key(day) {
            return Ok(Rental::Rejected(current));
        }
        days.insert(day.to_string(), user.to_string());
        self.write(team, tool, &days, current).await
    }

    /// Release `day` if `user` holds it. Applied if nobody holds it.
    pub async fn unreserve(&self, team: &str, user: &str, tool: &str, day: &str) -> Result<Rental> {
        let current = self.lookup(team, tool).await?;
        let mut days = current.fields.clone().unwrap_or_default();
        match days.get(day) {
            None => return Ok(Rental::Applied(current)),
            Some(holder) if holder != user => return Ok(Rental::Rejected(current)),
            Some(_) => {}
        }
        days.remove(day);
        self.write(team, tool, &days, current).await
    }

    async fn write(&self, team: &str, tool: &str, days: &Fields, current: SecretEntry) -> Result<Rental> {
        match self
            .store
            .put_entry(Some(team), RENTAL_NAMESPACE, tool, days, current.revision)
            .await
        {
            Ok(_) => Ok(Rental::Applied(current)),
            Err(e) if e.is_revision_conflict() => Ok(Rental::Rejected(self.lookup(team, tool).await?)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunOptions;
    use crate::listener::ProcessEventSource;
    use crate::test_support::FakeKeybase;
    use pretty_assertions::assert_eq;

    const TEAM: &str = "hackerspace";

    fn api() -> (Arc<Api>, Arc<FakeKeybase>) {
        let fake = Arc::new(FakeKeybase::new("bot"));
        let api = Api::from_parts(
            RunOptions::default(),
            fake.clone(),
            Arc::new(ProcessEventSource::new(RunOptions::default())),
            "bot",
        );
        (Arc::new(api), fake)
    }

    fn rentals() -> (Rentals, Arc<Api>) {
        let (api, _fake) = api();
        (Rentals::new(SecretKvStore::new(api.clone())), api)
    }

    #[test]
    fn test_hmac_sha256_known_answer() {
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[tokio::test]
    async fn test_keys_are_hidden_on_the_wire() {
        let (api, fake) = api();
        let store = SecretKvStore::new(api.clone());
        let mut fields = Fields::new();
        fields.insert("color".into(), "red".into());

        let put = store.put_entry(Some(TEAM), "ns", "laz0rs", &fields, 0).await.unwrap();
        assert_eq!(put.entry_key, "laz0rs");

        let sent = fake.last_request();
        let hidden = sent["params"]["options"]["entryKey"].as_str().unwrap().to_string();
        assert_eq!(hidden.len(), 64);
        assert_ne!(hidden, "laz0rs");

        let raw = api.list_entry_keys(Some(TEAM), "ns").await.unwrap();
        let mut raw_keys: Vec<String> = raw.entry_keys.into_iter().map(|k| k.entry_key).collect();
        raw_keys.sort();
        assert_eq!(raw_keys, vec![SECRET_KEY.to_string(), hidden]);

        let entry = store.get_entry(Some(TEAM), "ns", "laz0rs").await.unwrap();
        assert_eq!(entry.fields, Some(fields));

        let listed = store.list_entry_keys(Some(TEAM), "ns").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].entry_key, "laz0rs");
    }

    #[tokio::test]
    async fn test_secret_is_shared_across_clients() {
        let (api, _fake) = api();
        let first = SecretKvStore::new(api.clone());
        let second = SecretKvStore::new(api.clone());

        first.put_entry(Some(TEAM), "ns", "k", &Fields::new(), 0).await.unwrap();
        let entry = second.get_entry(Some(TEAM), "ns", "k").await.unwrap();
        assert_eq!(entry.fields, Some(Fields::new()));
    }

    #[tokio::test]
    async fn test_basic_rental_flow() {
        let (rentals, _api) = rentals();
        let tool = "laz0rs";

        assert!(rentals.remove(TEAM, tool).await.unwrap().is_applied());
        assert!(rentals.add(TEAM, "time machine").await.unwrap().is_applied());
        assert!(rentals.add(TEAM, tool).await.unwrap().is_applied());

        assert!(rentals.reserve(TEAM, "jo", tool, "2044-03-12").await.unwrap().is_applied());
        let again = rentals.reserve(TEAM, "jo", tool, "2044-03-12").await.unwrap();
        assert!(!again.is_applied());
        assert!(rentals.reserve(TEAM, "charlie", tool, "2044-06-12").await.unwrap().is_applied());

        // Not reserved: nothing to do.
        assert!(rentals.unreserve(TEAM, "jo", tool, "2044-06-13").await.unwrap().is_applied());
        // Held by someone else.
        assert!(!rentals.unreserve(TEAM, "jo", tool, "2044-06-12").await.unwrap().is_applied());
        assert!(rentals.unreserve(TEAM, "jo", tool, "2044-03-12").await.unwrap().is_applied());

        let entry = rentals.lookup(TEAM, tool).await.unwrap();
        let mut expected = Fields::new();
        expected.insert("2044-06-12".into(), "charlie".into());
        assert_eq!(entry.fields, Some(expected));

        let mut tools = rentals.list_tools(TEAM).await.unwrap();
        tools.sort();
        assert_eq!(tools, vec!["laz0rs", "time machine"]);

        assert!(rentals.remove(TEAM, tool).await.unwrap().is_applied());
        assert_eq!(rentals.lookup(TEAM, tool).await.unwrap().fields, None);
        assert_eq!(rentals.list_tools(TEAM).await.unwrap(), vec!["time machine"]);
    }

    #[tokio::test]
    async fn test_stale_reservation_loses_the_race() {
        let (rentals, _api) = rentals();
        let tool = "drill";
        rentals.add(TEAM, tool).await.unwrap();

        let stale = rentals.lookup(TEAM, tool).await.unwrap();
        assert!(rentals.reserve(TEAM, "ann", tool, "d1").await.unwrap().is_applied());

        let lost = rentals
            .reserve_from(TEAM, "bob", tool, "d2", stale.clone())
            .await
            .unwrap();
        let Rental::Rejected(current) = lost else {
            panic!("stale write was applied");
        };
        assert!(current.revision > stale.revision);
        assert_eq!(current.fields.as_ref().unwrap().get("d1").map(String::as_str), Some("ann"));
        assert!(current.fields.as_ref().unwrap().get("d2").is_none());

        // Retrying from the fresh state succeeds.
        assert!(rentals.reserve_from(TEAM, "bob", tool, "d2", current).await.unwrap().is_applied());
        assert_eq!(rentals.lookup(TEAM, tool).await.unwrap().fields.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_all_land() {
        let (rentals, _api) = rentals();
        let rentals = Arc::new(rentals);
        let tool = "time machine";
        rentals.add(TEAM, tool).await.unwrap();

        let mut handles = Vec::new();
        for id in 1..=5 {
            let rentals = Arc::clone(&rentals);
            handles.push(tokio::spawn(async move {
                let user = format!("user{}", id);
                let day = format!("2044-10-0{}", id);
                loop {
                    if rentals.reserve(TEAM, &user, tool, &day).await.unwrap().is_applied() {
                        break;
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let days = rentals.lookup(TEAM, tool).await.unwrap().fields.unwrap();
        assert_eq!(days.len(), 5);
        assert_eq!(days.get("2044-10-03").map(String::as_str), Some("user3"));
    }
}
