//! Wire types for the chat, kvstore, wallet and team APIs.
//!
//! Field names follow the JSON produced by the `keybase` API. Every result
//! type implements `Default` so an empty or absent `result` decodes cleanly.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Chat
// =============================================================================

/// Conversation membership category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembersType {
    #[default]
    #[serde(rename = "impteamnative")]
    ImpTeamNative,
    Team,
    #[serde(rename = "kbfs")]
    Kbfs,
    /// Forward-compatible fallback for unknown categories
    #[serde(other)]
    Unknown,
}

/// Addresses a conversation by name rather than id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatChannel {
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members_type: Option<MembersType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_name: Option<String>,
}

impl ChatChannel {
    /// A direct conversation addressed by its TLF name (`alice,bob`).
    pub fn tlf(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// A named channel inside a team.
    pub fn team(team: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            name: team.into(),
            members_type: Some(MembersType::Team),
            topic_name: Some(topic.into()),
            ..Default::default()
        }
    }
}

/// Inbox entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvSummary {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub channel: ChatChannel,
    #[serde(default)]
    pub unread: bool,
    #[serde(default)]
    pub active_at: i64,
    #[serde(default)]
    pub active_at_ms: i64,
    #[serde(default)]
    pub member_status: String,
}

/// Author of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSender {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
}

/// A payment embedded in a text message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPayment {
    #[serde(default)]
    pub username: String,
    #[serde(default, rename = "paymentText")]
    pub payment_text: String,
}

/// Body of a text message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageText {
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub payments: Option<Vec<TextPayment>>,
    #[serde(default, rename = "replyTo")]
    pub reply_to: Option<u64>,
}

/// Typed message content. Only the text variant is decoded in full.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgContent {
    #[serde(default, rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub text: Option<MessageText>,
}

impl MsgContent {
    pub fn is_text(&self) -> bool {
        self.type_name == "text"
    }

    /// Text body, or an empty string for non-text content.
    pub fn body(&self) -> &str {
        self.text.as_ref().map(|t| t.body.as_str()).unwrap_or("")
    }
}

/// A chat message as delivered by reads and notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MsgSummary {
    #[serde(default)]
    pub id: u64,
    #[serde(default, rename = "conversation_id")]
    pub conv_id: String,
    #[serde(default)]
    pub channel: ChatChannel,
    #[serde(default)]
    pub sender: MsgSender,
    #[serde(default)]
    pub sent_at: i64,
    #[serde(default)]
    pub sent_at_ms: i64,
    #[serde(default)]
    pub content: MsgContent,
    #[serde(default)]
    pub unread: bool,
}

impl MsgSummary {
    /// Send time, if the peer supplied one.
    pub fn sent_time(&self) -> Option<DateTime<Utc>> {
        if self.sent_at_ms > 0 {
            Utc.timestamp_millis_opt(self.sent_at_ms).single()
        } else if self.sent_at > 0 {
            Utc.timestamp_opt(self.sent_at, 0).single()
        } else {
            None
        }
    }
}

/// One entry of a thread read.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageHolder {
    #[serde(default)]
    pub msg: Option<MsgSummary>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Result of `read`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Thread {
    #[serde(default)]
    pub messages: Vec<MessageHolder>,
}

/// Result of `list` and `listconvsonname`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inbox {
    #[serde(default)]
    pub conversations: Option<Vec<ConvSummary>>,
}

/// Result of `send`, `attach`, `reaction` and similar writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub outbox_id: Option<String>,
}

/// Result of calls that return nothing of interest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyResult {}

/// Long-form help for a bot command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandExtendedDescription {
    pub title: String,
    pub desktop_body: String,
    pub mobile_body: String,
}

/// One advertised bot command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotCommand {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub usage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_description: Option<CommandExtendedDescription>,
}

/// A group of commands advertised to an audience (`public`, `teamconvs`, `teammembers`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandsAdvertisement {
    #[serde(rename = "type")]
    pub typ: String,
    pub commands: Vec<BotCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_name: Option<String>,
}

/// Options for `advertisecommands`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub advertisements: Vec<CommandsAdvertisement>,
}

/// A command as listed for a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBotCommand {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub usage: String,
    #[serde(default)]
    pub username: String,
}

/// Result of `listcommands`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListCommandsResult {
    #[serde(default)]
    pub commands: Option<Vec<UserBotCommand>>,
}

// =============================================================================
// Key-value store
// =============================================================================

/// Result of kvstore `get`. A deleted or missing entry has no value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvGetResult {
    #[serde(default)]
    pub team_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub entry_key: String,
    #[serde(default)]
    pub entry_value: Option<String>,
    #[serde(default)]
    pub revision: i64,
}

/// Result of kvstore `put`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvPutResult {
    #[serde(default)]
    pub team_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub entry_key: String,
    #[serde(default)]
    pub revision: i64,
}

/// Result of kvstore `delete`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvDeleteEntryResult {
    #[serde(default)]
    pub team_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub entry_key: String,
    #[serde(default)]
    pub revision: i64,
}

/// Result of kvstore `list` without a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvListNamespaceResult {
    #[serde(default)]
    pub team_name: String,
    #[serde(default)]
    pub namespaces: Vec<String>,
}

/// One key in a namespace listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvListEntryKey {
    pub entry_key: String,
    pub revision: i64,
}

/// Result of kvstore `list` with a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvListEntryResult {
    #[serde(default)]
    pub team_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub entry_keys: Vec<KvListEntryKey>,
}

// =============================================================================
// Wallet
// =============================================================================

/// Payment notification carried by `wallet` events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDetails {
    #[serde(default, rename = "txID")]
    pub tx_id: String,
    #[serde(default)]
    pub status_description: String,
    #[serde(default, rename = "fromAccountID")]
    pub from_account_id: String,
    #[serde(default)]
    pub from_username: String,
    #[serde(default, rename = "toAccountID")]
    pub to_account_id: String,
    #[serde(default)]
    pub to_username: String,
    #[serde(default)]
    pub amount_description: String,
    #[serde(default)]
    pub worth_at_send_time: String,
    #[serde(default, rename = "externalTxURL")]
    pub external_tx_url: String,
}

/// Result of wallet `details`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSummary {
    #[serde(default, rename = "txID")]
    pub tx_id: String,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_detail: String,
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub asset: serde_json::Value,
    #[serde(default)]
    pub from_stellar: String,
    #[serde(default)]
    pub to_stellar: String,
    #[serde(default)]
    pub from_username: Option<String>,
    #[serde(default)]
    pub to_username: Option<String>,
    #[serde(default)]
    pub note: String,
}

/// Result of wallet `send`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    #[serde(default, rename = "txID")]
    pub tx_id: String,
    #[serde(default)]
    pub relay: bool,
}

/// Result of wallet `cancel`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayClaimResult {
    #[serde(default, rename = "claimStellarID")]
    pub claim_stellar_id: String,
}

// =============================================================================
// Teams
// =============================================================================

/// One member of a team role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub status: i32,
}

/// Members grouped by role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMembersDetails {
    #[serde(default)]
    pub owners: Option<Vec<TeamMember>>,
    #[serde(default)]
    pub admins: Option<Vec<TeamMember>>,
    #[serde(default)]
    pub writers: Option<Vec<TeamMember>>,
    #[serde(default)]
    pub readers: Option<Vec<TeamMember>>,
    #[serde(default)]
    pub bots: Option<Vec<TeamMember>>,
    #[serde(default)]
    pub restricted_bots: Option<Vec<TeamMember>>,
}

impl TeamMembersDetails {
    /// Every member regardless of role.
    pub fn all(&self) -> impl Iterator<Item = &TeamMember> {
        [
            &self.owners,
            &self.admins,
            &self.writers,
            &self.readers,
            &self.bots,
            &self.restricted_bots,
        ]
        .into_iter()
        .flatten()
        .flatten()
    }
}

/// Result of `list-team-memberships`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TeamDetails {
    #[serde(default)]
    pub members: TeamMembersDetails,
}

/// A team the user belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTeamMembership {
    #[serde(default, rename = "fq_name")]
    pub team_name: String,
    #[serde(default)]
    pub is_implicit_team: bool,
    #[serde(default)]
    pub is_open_team: bool,
    #[serde(default)]
    pub role: i32,
    #[serde(default)]
    pub member_count: i32,
}

/// Result of `list-user-memberships`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserMemberships {
    #[serde(default)]
    pub teams: Option<Vec<UserTeamMembership>>,
}
