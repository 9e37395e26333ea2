//! In-memory peers shared by the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{
    duplex, split, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
};

use crate::error::{Result, DELETE_NONEXISTENT_ERROR_CODE, REVISION_ERROR_CODE};
use crate::ipc::{Backend, LineTransport};
use crate::protocol::ApiFamily;

pub(crate) type DuplexTransport =
    LineTransport<BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>>;

/// A transport plus the peer end of its stream.
pub(crate) fn duplex_transport() -> (DuplexTransport, DuplexStream) {
    let (ours, peer) = duplex(64 * 1024);
    let (read, write) = split(ours);
    (LineTransport::new(BufReader::new(read), write), peer)
}

/// Answer every unframed JSON request on `peer` with `handler(request)` plus `\n`.
///
/// Returns when the other side closes its write half.
pub(crate) async fn serve<F>(peer: DuplexStream, handler: F)
where
    F: Fn(Value) -> Value + Send + 'static,
{
    serve_after(peer, Duration::ZERO, handler).await
}

/// Like [`serve`], but every answer is held back for `delay`.
pub(crate) async fn serve_after<F>(mut peer: DuplexStream, delay: Duration, handler: F)
where
    F: Fn(Value) -> Value + Send + 'static,
{
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match peer.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&chunk[..n]);

        loop {
            let next = {
                let mut stream = serde_json::Deserializer::from_slice(&pending).into_iter::<Value>();
                stream
                    .next()
                    .map(|parsed| parsed.map(|value| (value, stream.byte_offset())))
            };
            match next {
                Some(Ok((request, consumed))) => {
                    pending.drain(..consumed);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let mut line = handler(request).to_string().into_bytes();
                    line.push(b'\n');
                    if peer.write_all(&line).await.is_err() {
                        return;
                    }
                }
                // Partial object, wait for more bytes.
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(_)) => return,
                None => break,
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Option<String>,
    revision: i64,
}

/// Backend that records every request and emulates the kvstore.
///
/// Chat, wallet and team methods answer with a canned result registered via
/// [`FakeKeybase::with_result`], or an empty object.
pub(crate) struct FakeKeybase {
    self_team: String,
    requests: Mutex<Vec<(ApiFamily, Value)>>,
    results: Mutex<HashMap<String, Value>>,
    entries: Mutex<BTreeMap<(String, String, String), Entry>>,
}

impl FakeKeybase {
    pub(crate) fn new(username: &str) -> Self {
        Self {
            self_team: format!("{},{}", username, username),
            requests: Mutex::new(Vec::new()),
            results: Mutex::new(HashMap::new()),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn with_result(self, method: &str, result: Value) -> Self {
        self.results
            .lock()
            .unwrap()
            .insert(method.to_string(), result);
        self
    }

    pub(crate) fn requests(&self) -> Vec<(ApiFamily, Value)> {
        self.requests.lock().unwrap().clone()
    }

    /// The most recent request, as sent on the wire.
    pub(crate) fn last_request(&self) -> Value {
        self.requests
            .lock()
            .unwrap()
            .last()
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null)
    }

    fn kvstore(&self, method: &str, options: &Value) -> Value {
        let team = options["team"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| self.self_team.clone());
        let namespace = options["namespace"].as_str().unwrap_or("").to_string();
        let key = options["entryKey"].as_str().unwrap_or("").to_string();
        let requested = options["revision"].as_i64().unwrap_or(0);
        let mut entries = self.entries.lock().unwrap();
        let id = (team.clone(), namespace.clone(), key.clone());

        match method {
            "put" => {
                let current = entries.get(&id).map(|e| e.revision).unwrap_or(0);
                if requested != 0 && requested != current {
                    return conflict(requested, current);
                }
                let revision = current + 1;
                entries.insert(
                    id,
                    Entry {
                        value: options["entryValue"].as_str().map(str::to_string),
                        revision,
                    },
                );
                json!({"result": {"teamName": team, "namespace": namespace, "entryKey": key, "revision": revision}})
            }
            "get" => {
                let entry = entries.get(&id).cloned();
                json!({"result": {
                    "teamName": team,
                    "namespace": namespace,
                    "entryKey": key,
                    "entryValue": entry.as_ref().and_then(|e| e.value.clone()),
                    "revision": entry.map(|e| e.revision).unwrap_or(0),
                }})
            }
            "delete" => {
                let Some(entry) = entries.get_mut(&id).filter(|e| e.value.is_some()) else {
                    return json!({"error": {"code": DELETE_NONEXISTENT_ERROR_CODE, "message": "no such entry"}});
                };
                if requested != 0 && requested != entry.revision {
                    return conflict(requested, entry.revision);
                }
                entry.value = None;
                entry.revision += 1;
                json!({"result": {"teamName": team, "namespace": namespace, "entryKey": key, "revision": entry.revision}})
            }
            "list" if namespace.is_empty() => {
                let mut namespaces: Vec<&str> = entries
                    .iter()
                    .filter(|((t, _, _), e)| *t == team && e.value.is_some())
                    .map(|((_, ns, _), _)| ns.as_str())
                    .collect();
                namespaces.dedup();
                json!({"result": {"teamName": team, "namespaces": namespaces}})
            }
            "list" => {
                let keys: Vec<Value> = entries
                    .iter()
                    .filter(|((t, ns, _), e)| *t == team && *ns == namespace && e.value.is_some())
                    .map(|((_, _, k), e)| json!({"entryKey": k, "revision": e.revision}))
                    .collect();
                json!({"result": {"teamName": team, "namespace": namespace, "entryKeys": keys}})
            }
            other => json!({"error": {"code": 1, "message": format!("unknown method {}", other)}}),
        }
    }
}

fn conflict(requested: i64, current: i64) -> Value {
    json!({"error": {
        "code": REVISION_ERROR_CODE,
        "message": format!("revision {} does not match current revision {}", requested, current),
    }})
}

#[async_trait]
impl Backend for FakeKeybase {
    async fn exchange(&self, family: ApiFamily, payload: Vec<u8>) -> Result<String> {
        let request: Value = serde_json::from_slice(&payload)?;
        self.requests
            .lock()
            .unwrap()
            .push((family, request.clone()));

        let method = request["method"].as_str().unwrap_or("");
        let response = match family {
            ApiFamily::Kvstore => self.kvstore(method, &request["params"]["options"]),
            _ => {
                let result = self
                    .results
                    .lock()
                    .unwrap()
                    .get(method)
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                json!({ "result": result })
            }
        };
        Ok(response.to_string())
    }
}
