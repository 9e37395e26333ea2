//! Fixed-size pool of API pipes with round-robin selection.
//!
//! ## Architecture
//! - Spawn `fanout` pipes up front; startup is all-or-nothing
//! - Select a pipe by advancing an atomic counter modulo the pool size
//! - Hold that pipe's lock for exactly one request/response cycle
//! - Replace a pipe in place when it times out or its stream breaks
//!
//! Exclusivity lives at the pipe, not the pool: two callers that land on
//! different pipes run concurrently, two callers on the same pipe are
//! served strictly in lock order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::RunOptions;
use crate::error::{BotError, Result};
use crate::ipc::process::ProcessTransport;
use crate::ipc::transport::Transport;
use crate::protocol::{decode_response, Request};

/// One pool slot. The mutex is the per-pipe request lock.
type Pipe = Arc<Mutex<Box<dyn Transport>>>;

/// Creates the transport for a pool slot.
#[async_trait]
pub trait PipeFactory: Send + Sync {
    async fn spawn_pipe(&self, index: usize) -> Result<Box<dyn Transport>>;
}

/// Launches `keybase chat api` processes.
pub struct ProcessPipeFactory {
    opts: RunOptions,
}

impl ProcessPipeFactory {
    pub fn new(opts: RunOptions) -> Self {
        Self { opts }
    }
}

#[async_trait]
impl PipeFactory for ProcessPipeFactory {
    async fn spawn_pipe(&self, index: usize) -> Result<Box<dyn Transport>> {
        let transport = ProcessTransport::spawn(&self.opts, &self.opts.chat_api_args())?;
        debug!("Pipe {} backed by pid {:?}", index, transport.pid());
        Ok(Box::new(transport))
    }
}

/// Round-robin pool of request/response pipes.
pub struct PipePool {
    pipes: RwLock<Vec<Pipe>>,
    next: AtomicUsize,
    factory: Option<Arc<dyn PipeFactory>>,
    request_timeout: Option<Duration>,
}

impl PipePool {
    /// Spawn `fanout` pipes through `factory`.
    ///
    /// If any pipe fails to start, the ones already started are closed and
    /// the error is returned.
    pub async fn start(factory: Arc<dyn PipeFactory>, fanout: usize) -> Result<Self> {
        let transports = spawn_all(factory.as_ref(), fanout).await?;
        info!("Pipe pool started with {} pipe(s)", transports.len());
        Ok(Self {
            pipes: RwLock::new(wrap(transports)),
            next: AtomicUsize::new(0),
            factory: Some(factory),
            request_timeout: None,
        })
    }

    /// Build a pool over existing transports. Broken pipes cannot be replaced.
    pub fn from_transports(transports: Vec<Box<dyn Transport>>) -> Self {
        Self {
            pipes: RwLock::new(wrap(transports)),
            next: AtomicUsize::new(0),
            factory: None,
            request_timeout: None,
        }
    }

    /// Fail requests that take longer than `limit` and replace their pipe.
    pub fn with_request_timeout(mut self, limit: Option<Duration>) -> Self {
        self.request_timeout = limit;
        self
    }

    pub fn len(&self) -> usize {
        self.read_pipes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pick the next pipe. Never waits on a pipe lock.
    pub fn acquire(&self) -> Result<(usize, Arc<Mutex<Box<dyn Transport>>>)> {
        let pipes = self.read_pipes();
        if pipes.is_empty() {
            return Err(BotError::Disconnected);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % pipes.len();
        Ok((index, Arc::clone(&pipes[index])))
    }

    /// Write `payload` to the next pipe and read its one-line answer.
    pub async fn round_trip(&self, payload: &[u8]) -> Result<String> {
        let (index, pipe) = self.acquire()?;
        let mut transport = pipe.lock().await;

        let exchange = async {
            transport.send(payload).await?;
            transport.read_line().await
        };
        let result = match self.request_timeout {
            None => exchange.await,
            Some(limit) => match timeout(limit, exchange).await {
                Ok(result) => result,
                Err(_) => Err(BotError::Timeout(limit)),
            },
        };

        if let Err(err) = &result {
            if is_transport_failure(err) {
                warn!("Pipe {} failed ({}), replacing", index, err);
                self.replace_pipe(index, &mut transport).await;
            }
        }
        result
    }

    /// Serialize `request`, run one round trip and decode the answer.
    pub async fn dispatch<O, T>(&self, request: &Request<O>) -> Result<T>
    where
        O: Serialize,
        T: DeserializeOwned + Default,
    {
        let payload = request.to_bytes()?;
        let line = self.round_trip(&payload).await?;
        decode_response(&line)
    }

    /// Swap every pipe for a freshly spawned one.
    ///
    /// The new set is started before the old one is touched, so a failed
    /// restart leaves the pool as it was.
    pub async fn replace_all(&self, fanout: usize) -> Result<()> {
        let factory = self.factory.as_ref().ok_or(BotError::Disconnected)?;
        let fresh = wrap(spawn_all(factory.as_ref(), fanout).await?);
        let old = {
            let mut pipes = self.write_pipes();
            std::mem::replace(&mut *pipes, fresh)
        };
        info!("Pipe pool restarted with {} pipe(s)", self.len());
        close_all(old).await
    }

    /// Remove every pipe and wait for each to exit.
    ///
    /// Later requests fail with [`BotError::Disconnected`]. All pipes are
    /// closed even if some fail; the first error is returned.
    pub async fn shutdown(&self) -> Result<()> {
        let old = std::mem::take(&mut *self.write_pipes());
        if !old.is_empty() {
            info!("Shutting down {} pipe(s)", old.len());
        }
        close_all(old).await
    }

    /// Swap the pipe in slot `index` for a fresh one.
    ///
    /// When no replacement can be spawned the old pipe is closed in place,
    /// so it fails with [`BotError::Disconnected`] instead of answering the
    /// next request with a stale line. That failure retries the replacement.
    async fn replace_pipe(&self, index: usize, transport: &mut Box<dyn Transport>) {
        let fresh = match &self.factory {
            Some(factory) => factory.spawn_pipe(index).await,
            None => Err(BotError::Disconnected),
        };
        match fresh {
            Ok(fresh) => {
                let mut old = std::mem::replace(transport, fresh);
                if let Err(e) = old.close().await {
                    warn!("Failed to close replaced pipe {}: {}", index, e);
                }
                info!("Pipe {} replaced", index);
            }
            Err(e) => {
                warn!("Failed to replace pipe {} ({}), closing it", index, e);
                if let Err(e) = transport.close().await {
                    warn!("Failed to close pipe {}: {}", index, e);
                }
            }
        }
    }

    fn read_pipes(&self) -> std::sync::RwLockReadGuard<'_, Vec<Pipe>> {
        self.pipes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_pipes(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Pipe>> {
        self.pipes.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Errors after which a pipe's stream position can no longer be trusted.
fn is_transport_failure(err: &BotError) -> bool {
    matches!(
        err,
        BotError::Timeout(_) | BotError::Disconnected | BotError::Io(_)
    )
}

async fn spawn_all(factory: &dyn PipeFactory, fanout: usize) -> Result<Vec<Box<dyn Transport>>> {
    let fanout = fanout.max(1);
    let mut transports: Vec<Box<dyn Transport>> = Vec::with_capacity(fanout);
    for index in 0..fanout {
        match factory.spawn_pipe(index).await {
            Ok(transport) => transports.push(transport),
            Err(e) => {
                warn!("Pipe {} failed to start: {}", index, e);
                for mut started in transports {
                    let _ = started.close().await;
                }
                return Err(e);
            }
        }
    }
    Ok(transports)
}

fn wrap(transports: Vec<Box<dyn Transport>>) -> Vec<Pipe> {
    transports
        .into_iter()
        .map(|t| Arc::new(Mutex::new(t)))
        .collect()
}

async fn close_all(pipes: Vec<Pipe>) -> Result<()> {
    let mut first_error = None;
    for (index, pipe) in pipes.into_iter().enumerate() {
        let mut transport = pipe.lock().await;
        if let Err(e) = transport.close().await {
            warn!("Failed to close pipe {}: {}", index, e);
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}
