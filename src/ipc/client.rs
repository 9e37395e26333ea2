//! Request routing to the API peer.
//!
//! [`Backend`] is the seam between typed operations and the processes that
//! answer them. [`ProcessBackend`] serves chat requests from the long-lived
//! pipe pool and the kvstore, wallet and team families from one-shot
//! `keybase <family> api` invocations.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::config::RunOptions;
use crate::error::Result;
use crate::ipc::pool::{PipePool, ProcessPipeFactory};
use crate::ipc::process::run_with_input;
use crate::protocol::{decode_response, ApiFamily, Request};

/// Something that can answer one request payload with one response line.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Deliver `payload` to the endpoint for `family` and return its answer.
    async fn exchange(&self, family: ApiFamily, payload: Vec<u8>) -> Result<String>;

    /// Re-create long-lived connections, e.g. after re-authentication.
    async fn restart(&self) -> Result<()> {
        Ok(())
    }

    /// Close long-lived connections and reap their processes.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Serialize `request`, exchange it and decode the typed result.
pub async fn call<O, T>(backend: &dyn Backend, family: ApiFamily, request: &Request<O>) -> Result<T>
where
    O: Serialize,
    T: DeserializeOwned + Default,
{
    let payload = request.to_bytes()?;
    debug!("{} api -> {}", family.subcommand(), request.method);
    let line = backend.exchange(family, payload).await?;
    decode_response(&line)
}

/// Backend that talks to real `keybase` processes.
pub struct ProcessBackend {
    opts: RunOptions,
    pool: PipePool,
}

impl ProcessBackend {
    /// Start the chat pipe pool with `opts.fanout` pipes.
    pub async fn start(opts: RunOptions) -> Result<Self> {
        let factory = Arc::new(ProcessPipeFactory::new(opts.clone()));
        let pool = PipePool::start(factory, opts.fanout)
            .await?
            .with_request_timeout(opts.request_timeout);
        Ok(Self { opts, pool })
    }

    pub fn pool(&self) -> &PipePool {
        &self.pool
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    async fn exchange(&self, family: ApiFamily, payload: Vec<u8>) -> Result<String> {
        match family {
            ApiFamily::Chat => self.pool.round_trip(&payload).await,
            other => run_with_input(&self.opts, &[other.subcommand(), "api"], &payload).await,
        }
    }

    async fn restart(&self) -> Result<()> {
        self.pool.replace_all(self.opts.fanout).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.pool.shutdown().await
    }
}
