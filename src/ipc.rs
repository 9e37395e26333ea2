//! Request/response plumbing to the `keybase` JSON API.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  round robin  ┌──────────────────┐  stdin/stdout  ┌──────────────────┐
//! │   callers    │ ─────────────►│ PipePool (N)     │ ◄─────────────►│ keybase chat api │ × N
//! │ (any task)   │               │ per-pipe Mutex   │   JSON lines   │                  │
//! └──────────────┘               └──────────────────┘                └──────────────────┘
//!        │                                                           ┌──────────────────┐
//!        └──────────────── one-shot ────────────────────────────────►│ keybase kv/wallet│
//!                                                                    └──────────────────┘
//! ```
//!
//! # Protocol
//!
//! A request is a single JSON object written without framing; the answer is
//! one `\n`-terminated JSON line:
//!
//! ```text
//! {"method":"send","params":{"options":{"conversation_id":"...","message":{"body":"hi"}}}}
//! {"result":{"message":"message sent","id":42}}
//! ```

mod client;
mod pool;
mod process;
mod transport;

pub use client::{call, Backend, ProcessBackend};
pub use pool::{PipeFactory, PipePool, ProcessPipeFactory};
pub use process::{reap, run_checked, run_with_input, ProcessTransport};
pub use transport::{read_bounded_line, LineTransport, Transport, MAX_LINE_SIZE};
