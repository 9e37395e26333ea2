//! Background event listening with reconnect.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐ spawn  ┌──────────────────────┐ lines ┌──────────────┐
//! │ supervisor │ ─────► │ keybase chat         │ ────► │ scan task    │
//! │ (state     │        │   api-listen         │       │ parse + route│
//! │  machine)  │ ◄───── │                      │       └──────┬───────┘
//! └─────┬──────┘  exit  └──────────────────────┘              │ bounded mpsc
//!       │ cancel                                              ▼
//!       └──────────────────────────────────────────►  Subscription::read*()
//! ```
//!
//! The supervisor walks [`ListenerState`]: it authenticates, opens the
//! stream, waits for the scan task to end, pauses and starts over. A
//! failed authentication or spawn counts as one attempt; reaching
//! [`ListenOptions::max_attempts`] consecutive failures triggers the
//! [`GiveUp`] policy.

mod events;
mod subscription;
mod supervisor;

use std::time::Duration;

pub use events::{
    Notification, SubscriptionConversation, SubscriptionMessage, SubscriptionWalletEvent,
};
pub use subscription::Subscription;
pub use supervisor::{spawn_listener, EventSource, ListenStream, ProcessEventSource};

/// Default per-channel capacity.
pub const DEFAULT_CAPACITY: usize = 100;

/// Default pause between reconnect attempts.
pub const DEFAULT_PAUSE: Duration = Duration::from_secs(2);

/// Default number of consecutive failed attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;

/// Exit code used when the listener gives up under [`GiveUp::Exit`].
pub const GIVE_UP_EXIT_CODE: i32 = 3;

/// What to do once the attempt ceiling is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GiveUp {
    /// Log and terminate the process with [`GIVE_UP_EXIT_CODE`].
    #[default]
    Exit,
    /// Publish [`BotError::ListenerGaveUp`](crate::BotError::ListenerGaveUp)
    /// and close the subscription.
    Close,
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// Include wallet events (`--wallet`)
    pub wallet: bool,
    /// Include conversation events (`--convs`)
    pub convs: bool,
    pub capacity: usize,
    pub pause: Duration,
    pub max_attempts: u32,
    pub on_give_up: GiveUp,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            wallet: false,
            convs: false,
            capacity: DEFAULT_CAPACITY,
            pause: DEFAULT_PAUSE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            on_give_up: GiveUp::Exit,
        }
    }
}

impl ListenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wallet(mut self, wallet: bool) -> Self {
        self.wallet = wallet;
        self
    }

    pub fn with_convs(mut self, convs: bool) -> Self {
        self.convs = convs;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_give_up(mut self, on_give_up: GiveUp) -> Self {
        self.on_give_up = on_give_up;
        self
    }

    /// Subcommand for the streaming process.
    pub fn listen_args(&self) -> Vec<&'static str> {
        let mut args = vec!["chat", "api-listen"];
        if self.wallet {
            args.push("--wallet");
        }
        if self.convs {
            args.push("--convs");
        }
        args
    }
}

/// Supervisor state. `failures` counts consecutive failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Starting { failures: u32 },
    Authenticating { failures: u32 },
    Streaming,
    Backoff { failures: u32 },
    GaveUp { attempts: u32 },
    Shutdown,
}

/// Event driving a [`ListenerState`] transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Loop top or pause elapsed
    Ready,
    /// Authenticated and the stream is open
    Opened,
    /// Authentication or spawn failed
    Failed,
    /// The stream closed or the scan stopped
    StreamEnded,
    Cancelled,
}

impl ListenerState {
    pub const INITIAL: ListenerState = ListenerState::Starting { failures: 0 };

    /// Pure transition function.
    pub fn next(self, outcome: Outcome, max_attempts: u32) -> ListenerState {
        use ListenerState::*;
        match (self, outcome) {
            (GaveUp { attempts }, _) => GaveUp { attempts },
            (Shutdown, _) | (_, Outcome::Cancelled) => Shutdown,
            (Starting { failures }, Outcome::Ready) if failures >= max_attempts => GaveUp {
                attempts: failures,
            },
            (Starting { failures }, Outcome::Ready) => Authenticating { failures },
            (Authenticating { .. }, Outcome::Opened) => Streaming,
            (Authenticating { failures }, Outcome::Failed) => Backoff {
                failures: failures + 1,
            },
            (Streaming, Outcome::StreamEnded) => Backoff { failures: 0 },
            (Backoff { failures }, Outcome::Ready) => Starting { failures },
            (state, _) => state,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ListenerState::GaveUp { .. } | ListenerState::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_happy_path_and_restart() {
        let s = ListenerState::INITIAL;
        let s = s.next(Outcome::Ready, 3);
        assert_eq!(s, ListenerState::Authenticating { failures: 0 });
        let s = s.next(Outcome::Opened, 3);
        assert_eq!(s, ListenerState::Streaming);
        let s = s.next(Outcome::StreamEnded, 3);
        assert_eq!(s, ListenerState::Backoff { failures: 0 });
        let s = s.next(Outcome::Ready, 3);
        assert_eq!(s, ListenerState::Starting { failures: 0 });
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut s = ListenerState::INITIAL;
        for _ in 0..3 {
            s = s.next(Outcome::Ready, 3);
            assert!(matches!(s, ListenerState::Authenticating { .. }));
            s = s.next(Outcome::Failed, 3).next(Outcome::Ready, 3);
        }
        assert_eq!(s, ListenerState::Starting { failures: 3 });
        let s = s.next(Outcome::Ready, 3);
        assert_eq!(s, ListenerState::GaveUp { attempts: 3 });
        assert!(s.is_terminal());
        assert_eq!(s.next(Outcome::Cancelled, 3), s);
    }

    #[test]
    fn test_successful_stream_resets_failures() {
        let s = ListenerState::Authenticating { failures: 2 }
            .next(Outcome::Opened, 3)
            .next(Outcome::StreamEnded, 3);
        assert_eq!(s, ListenerState::Backoff { failures: 0 });
    }

    #[test]
    fn test_cancel_from_any_live_state() {
        for s in [
            ListenerState::INITIAL,
            ListenerState::Authenticating { failures: 1 },
            ListenerState::Streaming,
            ListenerState::Backoff { failures: 2 },
        ] {
            assert_eq!(s.next(Outcome::Cancelled, 30), ListenerState::Shutdown);
        }
        assert_eq!(
            ListenerState::Shutdown.next(Outcome::Ready, 30),
            ListenerState::Shutdown
        );
    }

    #[test]
    fn test_listen_args() {
        assert_eq!(ListenOptions::default().listen_args(), vec!["chat", "api-listen"]);
        assert_eq!(
            ListenOptions::new().with_wallet(true).with_convs(true).listen_args(),
            vec!["chat", "api-listen", "--wallet", "--convs"]
        );
    }

    #[test]
    fn test_defaults() {
        let opts = ListenOptions::default();
        assert_eq!(opts.capacity, 100);
        assert_eq!(opts.pause, Duration::from_secs(2));
        assert_eq!(opts.max_attempts, 30);
        assert_eq!(opts.on_give_up, GiveUp::Exit);
    }
}
