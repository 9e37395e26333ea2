//! The reconnecting listen loop and its process-backed event source.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RunOptions;
use crate::error::{BotError, Result};
use crate::ipc::{read_bounded_line, reap};
use crate::listener::events::Notification;
use crate::listener::subscription::{Publisher, Subscription};
use crate::listener::{GiveUp, ListenOptions, ListenerState, Outcome, GIVE_UP_EXIT_CODE};
use crate::session;

/// How long a listen process may take to exit after its stream ended.
const REAP_GRACE: Duration = Duration::from_secs(2);

/// An open notification stream.
pub struct ListenStream {
    pub reader: Box<dyn AsyncBufRead + Send + Unpin>,
    /// Process behind the stream, reaped when the stream ends
    pub child: Option<Child>,
    pub label: String,
}

impl ListenStream {
    pub fn new(reader: impl AsyncBufRead + Send + Unpin + 'static, label: impl Into<String>) -> Self {
        Self {
            reader: Box::new(reader),
            child: None,
            label: label.into(),
        }
    }

    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }
}

/// Where the listener gets its session and its event stream from.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Re-resolve the session. Returns the active username.
    async fn authenticate(&self) -> Result<String>;

    /// Start a new notification stream.
    async fn open(&self, opts: &ListenOptions) -> Result<ListenStream>;
}

/// Streams from `keybase chat api-listen`.
pub struct ProcessEventSource {
    opts: RunOptions,
}

impl ProcessEventSource {
    pub fn new(opts: RunOptions) -> Self {
        Self { opts }
    }
}

#[async_trait]
impl EventSource for ProcessEventSource {
    async fn authenticate(&self) -> Result<String> {
        session::authenticate(&self.opts).await
    }

    async fn open(&self, opts: &ListenOptions) -> Result<ListenStream> {
        let args = opts.listen_args();
        let label = self.opts.describe(&args);
        let mut child = self
            .opts
            .command(&args)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| {
                BotError::spawn(
                    &self.opts.program().display().to_string(),
                    &self.opts.command_args(&args),
                    e,
                )
            })?;
        let stdout = child.stdout.take().ok_or(BotError::Disconnected)?;
        debug!("Spawned {} (pid {:?})", label, child.id());
        Ok(ListenStream::new(BufReader::new(stdout), label).with_child(child))
    }
}

/// Start a supervised listener and return its subscription and task.
///
/// The task ends after the subscription is shut down, or after giving up
/// under [`GiveUp::Close`].
///
/// # Process Exit
/// Under the default [`GiveUp::Exit`] policy, running out of attempts ends
/// the whole host process with exit code 3
/// ([`GIVE_UP_EXIT_CODE`](crate::listener::GIVE_UP_EXIT_CODE)). Use
/// [`GiveUp::Close`] to get [`BotError::ListenerGaveUp`] from the
/// subscription instead.
pub fn spawn_listener(
    source: Arc<dyn EventSource>,
    opts: ListenOptions,
) -> (Subscription, JoinHandle<()>) {
    let (subscription, publisher) = Subscription::channel(opts.capacity);
    let cancel = subscription.cancellation();
    let handle = tokio::spawn(supervise(source, opts, publisher, cancel));
    (subscription, handle)
}

async fn supervise(
    source: Arc<dyn EventSource>,
    opts: ListenOptions,
    publisher: Publisher,
    cancel: CancellationToken,
) {
    let mut state = ListenerState::INITIAL;
    let mut stream: Option<ListenStream> = None;

    loop {
        let outcome = match state {
            ListenerState::Starting { .. } => Outcome::Ready,
            ListenerState::Authenticating { failures } => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Outcome::Cancelled,
                    opened = connect(source.as_ref(), &opts) => match opened {
                        Ok(s) => {
                            stream = Some(s);
                            Outcome::Opened
                        }
                        Err(e) => {
                            warn!("Listen attempt {} failed: {}", failures + 1, e);
                            Outcome::Failed
                        }
                    },
                }
            }
            ListenerState::Streaming => match stream.take() {
                Some(s) => run_stream(s, &publisher, &cancel).await,
                None => Outcome::StreamEnded,
            },
            ListenerState::Backoff { .. } => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Outcome::Cancelled,
                    _ = tokio::time::sleep(opts.pause) => Outcome::Ready,
                }
            }
            ListenerState::GaveUp { attempts } => {
                error!("Listener failed to authenticate after {} attempts, giving up", attempts);
                match opts.on_give_up {
                    GiveUp::Exit => std::process::exit(GIVE_UP_EXIT_CODE),
                    GiveUp::Close => {
                        publisher.error(BotError::ListenerGaveUp(attempts)).await;
                    }
                }
                break;
            }
            ListenerState::Shutdown => break,
        };

        let next = state.next(outcome, opts.max_attempts);
        if next != state {
            debug!("Listener {:?} -> {:?}", state, next);
        }
        state = next;
    }

    // Dropping the publisher closes every channel.
    drop(publisher);
    info!("Listener stopped");
}

async fn connect(source: &dyn EventSource, opts: &ListenOptions) -> Result<ListenStream> {
    let username = source.authenticate().await?;
    let stream = source.open(opts).await?;
    info!("Listening for events as {} via {}", username, stream.label);
    Ok(stream)
}

/// Scan one stream until it ends or the subscription is cancelled.
async fn run_stream(
    stream: ListenStream,
    publisher: &Publisher,
    cancel: &CancellationToken,
) -> Outcome {
    let ListenStream {
        reader,
        child,
        label,
    } = stream;
    let mut scan = tokio::spawn(scan(reader, publisher.clone(), cancel.clone()));

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            // The scan task observes the same token.
            let _ = (&mut scan).await;
            Outcome::Cancelled
        }
        finished = &mut scan => {
            if let Err(e) = finished {
                warn!("Scan task for {} failed: {}", label, e);
            }
            Outcome::StreamEnded
        }
    };

    if let Some(mut child) = child {
        if outcome == Outcome::Cancelled {
            let _ = child.start_kill();
        }
        match reap(&mut child, &label, REAP_GRACE).await {
            Ok(status) if !status.success() && outcome != Outcome::Cancelled => {
                warn!("{} exited abnormally: {}", label, status);
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to wait for {}: {}", label, e),
        }
    }
    if outcome == Outcome::StreamEnded {
        info!("{} ended, restarting", label);
    }
    outcome
}

/// Read lines in arrival order and publish each one.
///
/// Decode failures are published as errors and scanning continues.
async fn scan(
    mut reader: Box<dyn AsyncBufRead + Send + Unpin>,
    publisher: Publisher,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            line = read_bounded_line(&mut reader) => line,
        };
        let delivered = match line {
            Ok(line) if line.trim().is_empty() => true,
            Ok(line) => publisher.publish(Notification::parse(&line)).await,
            Err(BotError::Disconnected) => return,
            Err(e @ BotError::Decode(_)) => publisher.error(e).await,
            Err(e) => {
                publisher.error(e).await;
                return;
            }
        };
        if !delivered {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Each `open` serves the next scripted stream; afterwards streams stay silent.
    struct ScriptedSource {
        auth_failures: AtomicUsize,
        streams: Mutex<VecDeque<&'static str>>,
        opens: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(auth_failures: usize, streams: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                auth_failures: AtomicUsize::new(auth_failures),
                streams: Mutex::new(streams.iter().copied().collect()),
                opens: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn authenticate(&self) -> Result<String> {
            let left = self.auth_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.auth_failures.store(left - 1, Ordering::SeqCst);
                return Err(BotError::Auth("not logged in".into()));
            }
            Ok("bot".to_string())
        }

        async fn open(&self, _opts: &ListenOptions) -> Result<ListenStream> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let next = self.streams.lock().unwrap().pop_front();
            match next {
                Some(script) => Ok(ListenStream::new(script.as_bytes(), "scripted")),
                None => {
                    let (ours, peer) = tokio::io::duplex(64);
                    // Keep the peer alive so the stream never ends.
                    std::mem::forget(peer);
                    Ok(ListenStream::new(BufReader::new(ours), "silent"))
                }
            }
        }
    }

    fn fast() -> ListenOptions {
        ListenOptions::new()
            .with_pause(Duration::from_millis(10))
            .with_give_up(GiveUp::Close)
    }

    const HELLO: &str = "{\"type\":\"chat\",\"msg\":{\"id\":1,\"conversation_id\":\"c\",\"content\":{\"type\":\"text\",\"text\":{\"body\":\"hello\"}}}}\n";

    #[tokio::test]
    async fn test_delivers_and_skips_unknown() {
        let source = ScriptedSource::new(
            0,
            &["{\"type\":\"team_update\"}\n{\"type\":\"chat\",\"msg\":{\"id\":1,\"content\":{\"type\":\"text\",\"text\":{\"body\":\"hello\"}}}}\n"],
        );
        let (sub, handle) = spawn_listener(source, fast());

        let msg = timeout(TEST_TIMEOUT, sub.read()).await.expect("Test timed out").unwrap();
        assert_eq!(msg.message.content.body(), "hello");

        sub.shutdown();
        timeout(TEST_TIMEOUT, handle).await.expect("Test timed out").unwrap();
    }

    #[tokio::test]
    async fn test_bad_line_is_reported_and_scan_continues() {
        let script: &'static str = Box::leak(format!("not json\n{}", HELLO).into_boxed_str());
        let (sub, handle) = spawn_listener(ScriptedSource::new(0, &[script]), fast());

        let err = timeout(TEST_TIMEOUT, sub.read()).await.expect("Test timed out").unwrap_err();
        assert!(matches!(err, BotError::Decode(_)));
        let msg = timeout(TEST_TIMEOUT, sub.read()).await.expect("Test timed out").unwrap();
        assert_eq!(msg.message.id, 1);

        sub.shutdown();
        timeout(TEST_TIMEOUT, handle).await.expect("Test timed out").unwrap();
    }

    #[tokio::test]
    async fn test_restarts_after_stream_ends() {
        let source = ScriptedSource::new(0, &["", HELLO]);
        let (sub, handle) = spawn_listener(source.clone(), fast());

        let msg = timeout(TEST_TIMEOUT, sub.read()).await.expect("Test timed out").unwrap();
        assert_eq!(msg.message.id, 1);
        assert!(source.opens.load(Ordering::SeqCst) >= 2);

        sub.shutdown();
        timeout(TEST_TIMEOUT, handle).await.expect("Test timed out").unwrap();
    }

    #[tokio::test]
    async fn test_auth_failures_are_retried() {
        let source = ScriptedSource::new(2, &[HELLO]);
        let (sub, handle) = spawn_listener(source.clone(), fast().with_max_attempts(5));

        let msg = timeout(TEST_TIMEOUT, sub.read()).await.expect("Test timed out").unwrap();
        assert_eq!(msg.message.id, 1);
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);

        sub.shutdown();
        timeout(TEST_TIMEOUT, handle).await.expect("Test timed out").unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_and_closes() {
        let source = ScriptedSource::new(usize::MAX, &[]);
        let (sub, handle) = spawn_listener(source, fast().with_max_attempts(3));

        let err = timeout(TEST_TIMEOUT, sub.read()).await.expect("Test timed out").unwrap_err();
        assert!(matches!(err, BotError::ListenerGaveUp(3)));
        timeout(TEST_TIMEOUT, handle).await.expect("Test timed out").unwrap();

        let err = sub.read().await.unwrap_err();
        assert!(matches!(err, BotError::SubscriptionShutdown));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_silent_stream() {
        let source = ScriptedSource::new(0, &[]);
        let (sub, handle) = spawn_listener(source.clone(), fast());

        // Wait until the silent stream is open.
        timeout(TEST_TIMEOUT, async {
            while source.opens.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Test timed out");

        sub.shutdown();
        timeout(TEST_TIMEOUT, handle).await.expect("Test timed out").unwrap();
        assert!(matches!(sub.read().await, Err(BotError::SubscriptionShutdown)));
    }
}
