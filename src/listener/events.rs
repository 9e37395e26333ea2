//! Typed notifications decoded from the `api-listen` stream.

use serde::Deserialize;
use tracing::debug;

use crate::error::{BotError, Result};
use crate::models::{ConvSummary, MsgSummary, PaymentDetails};

/// A new chat message together with the conversation it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionMessage {
    pub message: MsgSummary,
    pub conversation: ConvSummary,
}

/// A conversation the user was added to or that changed.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionConversation {
    pub conversation: ConvSummary,
}

/// A payment involving the user's wallet.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionWalletEvent {
    pub payment: PaymentDetails,
}

/// One decoded stream line.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    ChatMessage(SubscriptionMessage),
    ChatConversation(SubscriptionConversation),
    Wallet(SubscriptionWalletEvent),
    /// A type tag this client does not handle
    Unknown(String),
}

/// First decoding phase: only the tag.
#[derive(Deserialize)]
struct TypeHolder {
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Deserialize)]
struct MsgNotification {
    #[serde(default)]
    msg: Option<MsgSummary>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ConvNotification {
    #[serde(default)]
    conv: Option<ConvSummary>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct PaymentHolder {
    notification: PaymentDetails,
}

impl Notification {
    /// Decode one line: peek the `type` tag, then decode the matching shape.
    ///
    /// # Errors
    ///
    /// [`BotError::Decode`] for malformed JSON or a body that does not fit its
    /// tag, [`BotError::Api`] when the peer reported an error in place of
    /// a chat payload.
    pub fn parse(line: &str) -> Result<Self> {
        let holder: TypeHolder = serde_json::from_str(line)?;
        match holder.kind.as_str() {
            "chat" => {
                let notification: MsgNotification = serde_json::from_str(line)?;
                match (notification.msg, notification.error) {
                    (_, Some(error)) if !error.is_empty() => Err(peer_error(error)),
                    (Some(message), _) => {
                        let conversation = ConvSummary {
                            id: message.conv_id.clone(),
                            channel: message.channel.clone(),
                            ..Default::default()
                        };
                        Ok(Notification::ChatMessage(SubscriptionMessage {
                            message,
                            conversation,
                        }))
                    }
                    (None, _) => Err(BotError::Decode("chat notification without msg".into())),
                }
            }
            "chat_conv" => {
                let notification: ConvNotification = serde_json::from_str(line)?;
                match (notification.conv, notification.error) {
                    (_, Some(error)) if !error.is_empty() => Err(peer_error(error)),
                    (Some(conversation), _) => Ok(Notification::ChatConversation(
                        SubscriptionConversation { conversation },
                    )),
                    (None, _) => Err(BotError::Decode("chat_conv notification without conv".into())),
                }
            }
            "wallet" => {
                let holder: PaymentHolder = serde_json::from_str(line)?;
                Ok(Notification::Wallet(SubscriptionWalletEvent {
                    payment: holder.notification,
                }))
            }
            other => {
                debug!("Skipping notification type {:?}", other);
                Ok(Notification::Unknown(other.to_string()))
            }
        }
    }
}

fn peer_error(message: String) -> BotError {
    BotError::Api { code: 0, message }
}
