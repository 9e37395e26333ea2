//! Process-launch configuration.
//!
//! [`RunOptions`] describes how to invoke the external `keybase` binary:
//! where it lives, which home directory to use, whether to log in
//! non-interactively, and how many API pipes to keep open.
//!
//! Options can be assembled with the builder methods or read from the
//! environment with [`RunOptions::from_env`]:
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `KEYBASE_LOCATION` | path to the binary (default `keybase`) |
//! | `KEYBASE_HOME` | `--home` override |
//! | `KEYBASE_USERNAME` / `KEYBASE_PAPERKEY` | oneshot login (both required) |
//! | `KEYBASE_FANOUT` | number of `chat api` pipes |
//! | `KEYBASE_START_SERVICE` | launch `keybase service` on start |
//! | `KEYBASE_DISABLE_TYPING` | suppress typing notifications |
//! | `KEYBASE_REQUEST_TIMEOUT_SECS` | per-request deadline on the pipe pool |

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::{BotError, Result};

/// Default executable name, resolved through `PATH`.
pub const DEFAULT_LOCATION: &str = "keybase";

/// Default timeout for identity resolution.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Credentials for a non-interactive (paper key) login.
#[derive(Clone, PartialEq, Eq)]
pub struct OneshotOptions {
    pub username: String,
    pub paperkey: String,
}

impl OneshotOptions {
    pub fn new(username: impl Into<String>, paperkey: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            paperkey: paperkey.into(),
        }
    }
}

// Paper keys must never end up in logs.
impl std::fmt::Debug for OneshotOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneshotOptions")
            .field("username", &self.username)
            .field("paperkey", &"<redacted>")
            .finish()
    }
}

/// How to launch and talk to the external binary.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub location: Option<PathBuf>,
    pub home_dir: Option<PathBuf>,
    pub oneshot: Option<OneshotOptions>,
    pub start_service: bool,
    pub disable_typing: bool,
    pub fanout: usize,
    pub request_timeout: Option<Duration>,
    pub auth_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            location: None,
            home_dir: None,
            oneshot: None,
            start_service: false,
            disable_typing: false,
            fanout: 1,
            request_timeout: None,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_home_dir(mut self, home_dir: impl Into<PathBuf>) -> Self {
        self.home_dir = Some(home_dir.into());
        self
    }

    pub fn with_oneshot(mut self, oneshot: OneshotOptions) -> Self {
        self.oneshot = Some(oneshot);
        self
    }

    pub fn with_start_service(mut self, start_service: bool) -> Self {
        self.start_service = start_service;
        self
    }

    pub fn with_disable_typing(mut self, disable_typing: bool) -> Self {
        self.disable_typing = disable_typing;
        self
    }

    /// Number of parallel `chat api` pipes. Values below 1 are clamped to 1.
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Build options from `KEYBASE_*` environment variables.
    ///
    /// Unset variables keep their defaults. `KEYBASE_USERNAME` and
    /// `KEYBASE_PAPERKEY` only enable oneshot login when both are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut opts = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(location) = non_empty("KEYBASE_LOCATION") {
            opts.location = Some(PathBuf::from(location));
        }
        if let Some(home) = non_empty("KEYBASE_HOME") {
            opts.home_dir = Some(PathBuf::from(home));
        }
        if let (Some(username), Some(paperkey)) =
            (non_empty("KEYBASE_USERNAME"), non_empty("KEYBASE_PAPERKEY"))
        {
            opts.oneshot = Some(OneshotOptions::new(username, paperkey));
        }
        if let Some(fanout) = non_empty("KEYBASE_FANOUT") {
            let fanout: usize = fanout
                .trim()
                .parse()
                .map_err(|_| BotError::Config(format!("KEYBASE_FANOUT={}", fanout)))?;
            opts = opts.with_fanout(fanout);
        }
        if let Some(flag) = non_empty("KEYBASE_START_SERVICE") {
            opts.start_service = parse_flag("KEYBASE_START_SERVICE", &flag)?;
        }
        if let Some(flag) = non_empty("KEYBASE_DISABLE_TYPING") {
            opts.disable_typing = parse_flag("KEYBASE_DISABLE_TYPING", &flag)?;
        }
        if let Some(secs) = non_empty("KEYBASE_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                BotError::Config(format!("KEYBASE_REQUEST_TIMEOUT_SECS={}", secs))
            })?;
            opts.request_timeout = Some(Duration::from_secs(secs));
        }

        Ok(opts)
    }

    /// The executable to run.
    pub fn program(&self) -> PathBuf {
        self.location
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCATION))
    }

    /// Full argument list for a subcommand, global flags first.
    pub fn command_args<S: AsRef<str>>(&self, args: &[S]) -> Vec<String> {
        let mut cmd = Vec::with_capacity(args.len() + 2);
        if let Some(home) = &self.home_dir {
            cmd.push("--home".to_string());
            cmd.push(home.display().to_string());
        }
        cmd.extend(args.iter().map(|a| a.as_ref().to_string()));
        cmd
    }

    /// Build a command for the given subcommand sequence.
    ///
    /// Stdin and stdout default to null; callers that need pipes set them.
    /// Stderr is discarded. The child is killed if its handle is dropped.
    pub fn command<S: AsRef<str>>(&self, args: &[S]) -> Command {
        let mut cmd = Command::new(self.program());
        cmd.args(self.command_args(args))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Human readable command line, for logs and errors.
    pub fn describe<S: AsRef<str>>(&self, args: &[S]) -> String {
        let mut line = self.program().display().to_string();
        for arg in self.command_args(args) {
            line.push(' ');
            line.push_str(&arg);
        }
        line
    }

    /// Arguments for a `chat api` pipe.
    pub fn chat_api_args(&self) -> Vec<&'static str> {
        let mut args = vec!["chat", "api"];
        if self.disable_typing {
            args.push("--disable-typing");
        }
        args
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BotError::Config(format!("{}={}", key, value))),
    }
}
