//! Keybase bot client library
//!
//! Drives the local `keybase` binary through its line-delimited JSON API:
//!
//! - `ipc` - pipe pool and dispatcher for request/response calls
//! - `listener` - reconnecting event stream with typed notifications
//! - `session` - identity resolution and oneshot login
//! - `api` - the [`Api`] handle plus chat, kvstore, wallet and team calls
//! - `models` - wire types shared by every request family
//! - `secret_store` - kvstore with hidden entry keys and a rental ledger
//!
//! # Example
//!
//! ```ignore
//! use keybase_bot::{Api, RunOptions};
//!
//! let api = Api::start(RunOptions::from_env()?).await?;
//! api.send_message_by_tlf_name("alice,bob", "hello").await?;
//! api.shutdown().await?;
//! ```

pub mod api;
pub mod chat;
pub mod config;
pub mod error;
pub mod ipc;
pub mod kvstore;
pub mod listener;
pub mod models;
pub mod protocol;
pub mod secret_store;
pub mod session;
pub mod team;
pub mod wallet;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::Api;
pub use config::{OneshotOptions, RunOptions};
pub use error::{BotError, Result};
pub use listener::{GiveUp, ListenOptions, Subscription};
pub use wallet::WalletSend;
