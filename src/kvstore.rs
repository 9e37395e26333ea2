//! Encrypted key-value store, served by one-shot `kvstore api` calls.
//!
//! Entries are addressed by team, namespace and key. A `None` team means the
//! user's implicit self team. Writes and deletes take an optional revision
//! for optimistic concurrency: `0` (or no revision) lets the store pick the
//! next one, while a revision that does not match fails with
//! [`REVISION_ERROR_CODE`](crate::error::REVISION_ERROR_CODE).

use serde::Serialize;

use crate::api::Api;
use crate::error::Result;
use crate::models::{
    KvDeleteEntryResult, KvGetResult, KvListEntryResult, KvListNamespaceResult, KvPutResult,
};
use crate::protocol::{ApiFamily, Request};

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct KvOptions<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    team: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry_key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry_value: Option<&'a str>,
    #[serde(skip_serializing_if = "is_unset")]
    revision: i64,
}

fn is_unset(revision: &i64) -> bool {
    *revision == 0
}

impl<'a> KvOptions<'a> {
    fn entry(team: Option<&'a str>, namespace: &'a str, key: &'a str) -> Self {
        Self {
            team,
            namespace: Some(namespace),
            entry_key: Some(key),
            ..Default::default()
        }
    }
}

impl Api {
    /// Write `value`, letting the store assign the next revision.
    pub async fn put_entry(
        &self,
        team: Option<&str>,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<KvPutResult> {
        self.put_entry_with_revision(team, namespace, key, value, 0)
            .await
    }

    /// Write `value` only if `revision` matches the stored revision.
    pub async fn put_entry_with_revision(
        &self,
        team: Option<&str>,
        namespace: &str,
        key: &str,
        value: &str,
        revision: i64,
    ) -> Result<KvPutResult> {
        let options = KvOptions {
            entry_value: Some(value),
            revision,
            ..KvOptions::entry(team, namespace, key)
        };
        self.call(ApiFamily::Kvstore, &Request::new("put", options))
            .await
    }

    /// Read an entry. A missing or deleted entry has `entry_value: None`.
    pub async fn get_entry(&self, team: Option<&str>, namespace: &str, key: &str) -> Result<KvGetResult> {
        let options = KvOptions::entry(team, namespace, key);
        self.call(ApiFamily::Kvstore, &Request::new("get", options))
            .await
    }

    pub async fn delete_entry(
        &self,
        team: Option<&str>,
        namespace: &str,
        key: &str,
    ) -> Result<KvDeleteEntryResult> {
        self.delete_entry_with_revision(team, namespace, key, 0).await
    }

    /// Delete only if `revision` matches.
    ///
    /// # Errors
    ///
    /// [`BotError::is_not_found`](crate::BotError::is_not_found) when there is
    /// nothing to delete.
    pub async fn delete_entry_with_revision(
        &self,
        team: Option<&str>,
        namespace: &str,
        key: &str,
        revision: i64,
    ) -> Result<KvDeleteEntryResult> {
        let options = KvOptions {
            revision,
            ..KvOptions::entry(team, namespace, key)
        };
        self.call(ApiFamily::Kvstore, &Request::new("delete", options))
            .await
    }

    pub async fn list_namespaces(&self, team: Option<&str>) -> Result<KvListNamespaceResult> {
        let options = KvOptions {
            team,
            ..Default::default()
        };
        self.call(ApiFamily::Kvstore, &Request::new("list", options))
            .await
    }

    pub async fn list_entry_keys(&self, team: Option<&str>, namespace: &str) -> Result<KvListEntryResult> {
        let options = KvOptions {
            team,
            namespace: Some(namespace),
            ..Default::default()
        };
        self.call(ApiFamily::Kvstore, &Request::new("list", options))
            .await
    }
}
