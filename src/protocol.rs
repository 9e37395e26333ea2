//! Request and response envelopes for the line-delimited JSON API.
//!
//! Every call is one JSON object of the shape
//!
//! ```text
//! {"method": "send", "params": {"options": {...}}}
//! ```
//!
//! and is answered by exactly one line:
//!
//! ```text
//! {"result": {...}, "error": {"code": 2760, "message": "..."}}
//! ```
//!
//! A non-empty `error.message` is a protocol-level failure. Its absence means
//! success even when `result` is missing or empty.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{BotError, Result};

/// Which `keybase <family> api` endpoint serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiFamily {
    Chat,
    Kvstore,
    Wallet,
    Team,
}

impl ApiFamily {
    /// First element of the subcommand sequence.
    pub fn subcommand(&self) -> &'static str {
        match self {
            ApiFamily::Chat => "chat",
            ApiFamily::Kvstore => "kvstore",
            ApiFamily::Wallet => "wallet",
            ApiFamily::Team => "team",
        }
    }
}

/// Outgoing request envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Request<O> {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Params<O>>,
}

/// `params` wrapper; the API nests all arguments under `options`.
#[derive(Debug, Clone, Serialize)]
pub struct Params<O> {
    pub options: O,
}

impl<O: Serialize> Request<O> {
    pub fn new(method: impl Into<String>, options: O) -> Self {
        Self {
            method: method.into(),
            params: Some(Params { options }),
        }
    }

    /// Serialize to the bytes written on the wire (no trailing newline).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(BotError::Encode)
    }
}

impl Request<()> {
    /// A request with no `params` object at all.
    pub fn bare(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
        }
    }
}

/// Protocol-level error object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

impl From<ApiError> for BotError {
    fn from(err: ApiError) -> Self {
        BotError::Api {
            code: err.code,
            message: err.message,
        }
    }
}

/// Generic response envelope. `result` is kept raw until the error
/// field has been checked so a malformed result cannot mask an API error.
#[derive(Debug, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<ApiError>,
}

impl Response {
    /// Parse one response line.
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim_end()).map_err(|e| BotError::Decode(e.to_string()))
    }

    /// Surface the embedded error, or decode `result` into `T`.
    pub fn into_result<T>(self) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        if let Some(err) = self.error {
            if !err.message.is_empty() || err.code != 0 {
                return Err(err.into());
            }
        }
        match self.result {
            None | Some(serde_json::Value::Null) => Ok(T::default()),
            Some(value) => {
                serde_json::from_value(value).map_err(|e| BotError::Decode(e.to_string()))
            }
        }
    }
}

/// Decode a response line straight into the caller's result type.
pub fn decode_response<T>(line: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    Response::parse(line)?.into_result()
}
