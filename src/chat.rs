//! Chat operations, served by the `chat api` pipe pool.

use serde::Serialize;

use crate::api::Api;
use crate::error::Result;
use crate::models::{
    Advertisement, ChatChannel, ConvSummary, EmptyResult, Inbox, ListCommandsResult, MembersType,
    MsgSummary, SendResponse, Thread, UserBotCommand,
};
use crate::protocol::{ApiFamily, Request};

/// Channel used when a team message names no channel.
pub const DEFAULT_TEAM_CHANNEL: &str = "general";

#[derive(Debug, Clone, Serialize)]
struct MessageBody<'a> {
    body: &'a str,
}

/// Options shared by `send`, `attach` and `reaction`.
#[derive(Debug, Clone, Default, Serialize)]
struct SendOptions<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<ChatChannel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<MessageBody<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    confirm_lumen_send: bool,
}

/// Where a message goes.
enum Target<'a> {
    Channel(ChatChannel),
    ConvId(&'a str),
}

impl<'a> Target<'a> {
    fn options(self) -> SendOptions<'a> {
        match self {
            Target::Channel(channel) => SendOptions {
                channel: Some(channel),
                ..Default::default()
            },
            Target::ConvId(id) => SendOptions {
                conversation_id: Some(id),
                ..Default::default()
            },
        }
    }
}

fn team_channel(team: &str, channel: Option<&str>) -> ChatChannel {
    ChatChannel::team(team, channel.unwrap_or(DEFAULT_TEAM_CHANNEL))
}

impl Api {
    /// Inbox conversations, optionally only unread ones.
    pub async fn get_conversations(&self, unread_only: bool) -> Result<Vec<ConvSummary>> {
        let request = Request::new("list", serde_json::json!({ "unread_only": unread_only }));
        let inbox: Inbox = self.call(ApiFamily::Chat, &request).await?;
        Ok(inbox.conversations.unwrap_or_default())
    }

    /// Text messages in `channel`, newest first as the peer returns them.
    pub async fn get_text_messages(
        &self,
        channel: &ChatChannel,
        unread_only: bool,
    ) -> Result<Vec<MsgSummary>> {
        let request = Request::new("read", serde_json::json!({ "channel": channel }));
        let thread: Thread = self.call(ApiFamily::Chat, &request).await?;
        Ok(thread
            .messages
            .into_iter()
            .filter_map(|holder| holder.msg)
            .filter(|msg| msg.content.is_text())
            .filter(|msg| !unread_only || msg.unread)
            .collect())
    }

    pub async fn send_message(&self, channel: &ChatChannel, body: &str) -> Result<SendResponse> {
        self.send(Target::Channel(channel.clone()), body, false).await
    }

    pub async fn send_message_by_conv_id(&self, conv_id: &str, body: &str) -> Result<SendResponse> {
        self.send(Target::ConvId(conv_id), body, false).await
    }

    /// Send to a direct conversation such as `alice,bob`.
    pub async fn send_message_by_tlf_name(&self, tlf_name: &str, body: &str) -> Result<SendResponse> {
        self.send(Target::Channel(ChatChannel::tlf(tlf_name)), body, false)
            .await
    }

    /// Send to a team channel, `general` when `channel` is `None`.
    pub async fn send_message_by_team_name(
        &self,
        team: &str,
        channel: Option<&str>,
        body: &str,
    ) -> Result<SendResponse> {
        self.send(Target::Channel(team_channel(team, channel)), body, false)
            .await
    }

    /// Post to the user's public broadcast channel.
    pub async fn broadcast(&self, body: &str) -> Result<SendResponse> {
        let channel = ChatChannel {
            name: self.username(),
            public: true,
            ..Default::default()
        };
        self.send(Target::Channel(channel), body, false).await
    }

    /// Send a message that may carry an in-chat payment, confirming it.
    pub async fn in_chat_send(&self, channel: &ChatChannel, body: &str) -> Result<SendResponse> {
        self.send(Target::Channel(channel.clone()), body, true).await
    }

    pub async fn in_chat_send_by_conv_id(&self, conv_id: &str, body: &str) -> Result<SendResponse> {
        self.send(Target::ConvId(conv_id), body, true).await
    }

    pub async fn in_chat_send_by_tlf_name(&self, tlf_name: &str, body: &str) -> Result<SendResponse> {
        self.send(Target::Channel(ChatChannel::tlf(tlf_name)), body, true)
            .await
    }

    /// Upload `filename` to a team channel.
    pub async fn send_attachment_by_team(
        &self,
        team: &str,
        channel: Option<&str>,
        filename: &str,
        title: &str,
    ) -> Result<SendResponse> {
        let options = SendOptions {
            filename: Some(filename),
            title: Some(title),
            ..Target::Channel(team_channel(team, channel)).options()
        };
        self.call(ApiFamily::Chat, &Request::new("attach", options))
            .await
    }

    pub async fn react_by_channel(
        &self,
        channel: &ChatChannel,
        message_id: u64,
        reaction: &str,
    ) -> Result<SendResponse> {
        self.react(Target::Channel(channel.clone()), message_id, reaction)
            .await
    }

    pub async fn react_by_conv_id(
        &self,
        conv_id: &str,
        message_id: u64,
        reaction: &str,
    ) -> Result<SendResponse> {
        self.react(Target::ConvId(conv_id), message_id, reaction).await
    }

    /// Topic names of every channel in `team`.
    pub async fn list_channels(&self, team: &str) -> Result<Vec<String>> {
        let request = Request::new(
            "listconvsonname",
            serde_json::json!({
                "topic_type": "CHAT",
                "members_type": MembersType::Team,
                "name": team,
            }),
        );
        let inbox: Inbox = self.call(ApiFamily::Chat, &request).await?;
        Ok(inbox
            .conversations
            .unwrap_or_default()
            .into_iter()
            .filter_map(|conv| conv.channel.topic_name)
            .collect())
    }

    pub async fn join_channel(&self, team: &str, channel: &str) -> Result<EmptyResult> {
        let request = Request::new(
            "join",
            serde_json::json!({ "channel": ChatChannel::team(team, channel) }),
        );
        self.call(ApiFamily::Chat, &request).await
    }

    pub async fn leave_channel(&self, team: &str, channel: &str) -> Result<EmptyResult> {
        let request = Request::new(
            "leave",
            serde_json::json!({ "channel": ChatChannel::team(team, channel) }),
        );
        self.call(ApiFamily::Chat, &request).await
    }

    /// Publish the bot's command list.
    pub async fn advertise_commands(&self, ad: &Advertisement) -> Result<SendResponse> {
        self.call(ApiFamily::Chat, &Request::new("advertisecommands", ad))
            .await
    }

    pub async fn clear_commands(&self) -> Result<()> {
        let _: EmptyResult = self
            .call(ApiFamily::Chat, &Request::bare("clearcommands"))
            .await?;
        Ok(())
    }

    /// Commands available in `channel`.
    pub async fn list_commands(&self, channel: &ChatChannel) -> Result<Vec<UserBotCommand>> {
        let request = Request::new("listcommands", serde_json::json!({ "channel": channel }));
        let res: ListCommandsResult = self.call(ApiFamily::Chat, &request).await?;
        Ok(res.commands.unwrap_or_default())
    }

    pub async fn list_commands_by_conv_id(&self, conv_id: &str) -> Result<Vec<UserBotCommand>> {
        let request = Request::new(
            "listcommands",
            serde_json::json!({ "conversation_id": conv_id }),
        );
        let res: ListCommandsResult = self.call(ApiFamily::Chat, &request).await?;
        Ok(res.commands.unwrap_or_default())
    }

    async fn send(&self, target: Target<'_>, body: &str, confirm_lumen_send: bool) -> Result<SendResponse> {
        let options = SendOptions {
            message: Some(MessageBody { body }),
            confirm_lumen_send,
            ..target.options()
        };
        self.call(ApiFamily::Chat, &Request::new("send", options))
            .await
    }

    async fn react(&self, target: Target<'_>, message_id: u64, reaction: &str) -> Result<SendResponse> {
        let options = SendOptions {
            message: Some(MessageBody { body: reaction }),
            message_id: Some(message_id),
            ..target.options()
        };
        self.call(ApiFamily::Chat, &Request::new("reaction", options))
            .await
    }
}
