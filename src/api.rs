//! The bot-facing entry point.
//!
//! [`Api`] owns the session, the request backend and every listener it
//! started. Typed operations live in the [`chat`](crate::chat),
//! [`kvstore`](crate::kvstore), [`wallet`](crate::wallet) and
//! [`team`](crate::team) modules as further `impl Api` blocks.
//!
//! # Example
//!
//! ```ignore
//! use keybase_bot::{Api, RunOptions};
//!
//! let api = Api::start(RunOptions::from_env()?).await?;
//! let sub = api.listen_for_new_text_messages().await?;
//! while let Ok(msg) = sub.read().await {
//!     api.send_message_by_conv_id(&msg.conversation.id, msg.message.content.body()).await?;
//! }
//! api.shutdown().await?;
//! ```

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RunOptions;
use crate::error::{BotError, Result};
use crate::ipc::{self, reap, run_checked, Backend, ProcessBackend};
use crate::listener::{spawn_listener, EventSource, ListenOptions, ProcessEventSource, Subscription};
use crate::protocol::{ApiFamily, Request};
use crate::session;

/// How long the background service gets to exit after `ctl stop`.
const SERVICE_GRACE: Duration = Duration::from_secs(5);

/// A running client session.
pub struct Api {
    opts: RunOptions,
    backend: Arc<dyn Backend>,
    source: Arc<dyn EventSource>,
    username: RwLock<String>,
    listeners: Mutex<Vec<(Subscription, JoinHandle<()>)>>,
    service: Mutex<Option<Child>>,
}

impl Api {
    /// Start the service if requested, authenticate and open the pipe pool.
    ///
    /// # Errors
    ///
    /// Fails if authentication fails or any pipe cannot be started. A
    /// service started here is killed again on failure.
    pub async fn start(opts: RunOptions) -> Result<Self> {
        let service = if opts.start_service {
            Some(session::start_service(&opts)?)
        } else {
            None
        };

        let username = session::authenticate(&opts).await?;
        let backend = ProcessBackend::start(opts.clone()).await?;
        info!("Connected as {} with {} pipe(s)", username, opts.fanout);

        let source = Arc::new(ProcessEventSource::new(opts.clone()));
        let api = Self::from_parts(opts, Arc::new(backend), source, username);
        *api.service.lock().await = service;
        Ok(api)
    }

    /// Assemble an `Api` from already running parts.
    pub fn from_parts(
        opts: RunOptions,
        backend: Arc<dyn Backend>,
        source: Arc<dyn EventSource>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            opts,
            backend,
            source,
            username: RwLock::new(username.into()),
            listeners: Mutex::new(Vec::new()),
            service: Mutex::new(None),
        }
    }

    /// The identity resolved at start or at the last restart.
    pub fn username(&self) -> String {
        self.username
            .read()
            .map(|u| u.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn options(&self) -> &RunOptions {
        &self.opts
    }

    /// Re-authenticate and replace every pipe.
    pub async fn restart(&self) -> Result<()> {
        let username = self.source.authenticate().await?;
        self.backend.restart().await?;
        info!("Restarted as {}", username);
        match self.username.write() {
            Ok(mut current) => *current = username,
            Err(e) => *e.into_inner() = username,
        }
        Ok(())
    }

    /// Start a background listener. It stops on [`Subscription::shutdown`]
    /// or when this `Api` shuts down.
    ///
    /// With the default [`GiveUp::Exit`](crate::listener::GiveUp::Exit)
    /// policy, a listener that exhausts its authentication attempts
    /// terminates the host process with exit code 3. Pass
    /// [`GiveUp::Close`](crate::listener::GiveUp::Close) to receive
    /// [`BotError::ListenerGaveUp`] on the subscription instead.
    pub async fn listen(&self, opts: ListenOptions) -> Result<Subscription> {
        let (subscription, handle) = spawn_listener(Arc::clone(&self.source), opts);
        let mut listeners = self.listeners.lock().await;
        listeners.retain(|(_, handle)| !handle.is_finished());
        listeners.push((subscription.clone(), handle));
        Ok(subscription)
    }

    /// Listen for chat messages only, with the default (process-exiting)
    /// give-up policy.
    pub async fn listen_for_new_text_messages(&self) -> Result<Subscription> {
        self.listen(ListenOptions::default()).await
    }

    /// Upload client logs with `feedback` attached.
    ///
    /// Runs standalone when no service answers `--no-auto-fork status`.
    pub async fn log_send(&self, feedback: &str) -> Result<()> {
        let feedback = format!(
            "keybase-bot log send\nusername: {}\n{}",
            self.username(),
            feedback
        );
        let mut args = vec!["log", "send", "--no-confirm", "--feedback", feedback.as_str()];
        if run_checked(&self.opts, &["--no-auto-fork", "status"]).await.is_err() {
            args.insert(0, "--standalone");
        }
        run_checked(&self.opts, &args).await
    }

    /// Stop everything this `Api` started.
    ///
    /// Listeners are cancelled and awaited, the pipes are closed and reaped,
    /// then the oneshot session is logged out and the service stopped, as
    /// configured. Every step runs; the first error is returned.
    pub async fn shutdown(&self) -> Result<()> {
        let mut first_error: Option<BotError> = None;

        let listeners = std::mem::take(&mut *self.listeners.lock().await);
        for (subscription, _) in &listeners {
            subscription.shutdown();
        }
        for (_, handle) in listeners {
            if let Err(e) = handle.await {
                warn!("Listener task failed: {}", e);
            }
        }

        keep_first(&mut first_error, self.backend.shutdown().await);

        if self.opts.oneshot.is_some() {
            keep_first(
                &mut first_error,
                run_checked(&self.opts, &["logout", "--force"]).await,
            );
        }
        if self.opts.start_service {
            keep_first(
                &mut first_error,
                run_checked(&self.opts, &["ctl", "stop", "--shutdown"]).await,
            );
        }
        if let Some(mut child) = self.service.lock().await.take() {
            let label = self.opts.describe(&["service"]);
            keep_first(
                &mut first_error,
                reap(&mut child, &label, SERVICE_GRACE).await.map(|_| ()),
            );
        }

        info!("Shutdown complete");
        first_error.map_or(Ok(()), Err)
    }

    /// Send one request to `family` and decode its result.
    pub(crate) async fn call<O, T>(&self, family: ApiFamily, request: &Request<O>) -> Result<T>
    where
        O: Serialize,
        T: DeserializeOwned + Default,
    {
        ipc::call(self.backend.as_ref(), family, request).await
    }
}

fn keep_first(first: &mut Option<BotError>, result: Result<()>) {
    if let Err(e) = result {
        warn!("Shutdown step failed: {}", e);
        first.get_or_insert(e);
    }
}
