//! storagebot - chat front end for the encrypted key-value store.
//!
//! Understands, in any conversation it can read:
//!
//! ```text
//! !storage help
//! !storage list [namespace]
//! !storage get <namespace> <key>
//! !storage put <namespace> <key> <value> [revision]
//! !storage delete <namespace> <key> [revision]
//! ```
//!
//! Entries are stored for the team (or implicit team) that owns the
//! conversation.

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keybase_bot::{Api, BotError, RunOptions};

const EXIT_FAILURE: i32 = 3;
const PREFIX: &str = "!storage";

const HELP: &str = "Available commands:\
\n`!storage put <namespace> <key> <value> (<revision>)`\
\n`!storage get <namespace> <key>`\
\n`!storage delete <namespace> <key> (<revision>)`\
\n`!storage list`  // list namespaces\
\n`!storage list <namespace>`  // list entries in namespace";

/// A parsed `!storage` command.
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Help,
    ListNamespaces,
    ListKeys { namespace: &'a str },
    Get { namespace: &'a str, key: &'a str },
    Put { namespace: &'a str, key: &'a str, value: &'a str, revision: i64 },
    Delete { namespace: &'a str, key: &'a str, revision: i64 },
    Invalid(&'a str),
}

impl<'a> Command<'a> {
    /// `None` when the message is not addressed to this bot.
    fn parse(body: &'a str) -> Option<Self> {
        let words: Vec<&str> = body.split_whitespace().collect();
        if words.len() < 2 || words[0] != PREFIX {
            return None;
        }
        let command = match words[1..] {
            ["help", ..] => Command::Help,
            ["list"] => Command::ListNamespaces,
            ["list", namespace] => Command::ListKeys { namespace },
            ["get", namespace, key] => Command::Get { namespace, key },
            ["put", namespace, key, value] => Command::Put { namespace, key, value, revision: 0 },
            ["put", namespace, key, value, revision] => match revision.parse() {
                Ok(revision) => Command::Put { namespace, key, value, revision },
                Err(_) => Command::Invalid("put"),
            },
            ["delete", namespace, key] => Command::Delete { namespace, key, revision: 0 },
            ["delete", namespace, key, revision] => match revision.parse() {
                Ok(revision) => Command::Delete { namespace, key, revision },
                Err(_) => Command::Invalid("delete"),
            },
            [action, ..] => Command::Invalid(action),
            [] => return None,
        };
        Some(command)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "keybase_bot=info,storagebot=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    info!("Starting storagebot v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run().await {
        error!("{:#}", e);
        std::process::exit(EXIT_FAILURE);
    }
}

async fn run() -> Result<()> {
    let opts = RunOptions::from_env().context("invalid KEYBASE_* configuration")?;
    let api = Api::start(opts).await.context("failed to start Keybase client")?;

    let sub = api
        .listen_for_new_text_messages()
        .await
        .context("failed to start listening")?;
    info!("Listening for {} commands as {}", PREFIX, api.username());

    let result = loop {
        let msg = tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            msg = sub.read() => msg,
        };
        let msg = match msg {
            Ok(msg) => msg,
            Err(BotError::SubscriptionShutdown) => break Ok(()),
            Err(e) => {
                warn!("Listener error: {}", e);
                continue;
            }
        };
        if !msg.message.content.is_text() {
            continue;
        }
        let Some(command) = Command::parse(msg.message.content.body()) else {
            continue;
        };

        let channel = msg.message.channel;
        let reply = handle(&api, &channel.name, command).await;
        if let Err(e) = api.send_message(&channel, &reply).await {
            break Err(anyhow::Error::new(e).context("error sending reply"));
        }
    };

    api.shutdown().await.context("shutdown failed")?;
    result
}

/// Run one command against the conversation's team and render the reply.
async fn handle(api: &Api, team: &str, command: Command<'_>) -> String {
    let team = Some(team);
    let outcome = match command {
        Command::Help => return HELP.to_string(),
        Command::Invalid(action) => {
            return format!("Unrecognized `{}` command. Try `{} help`.", action, PREFIX)
        }
        Command::ListNamespaces => api
            .list_namespaces(team)
            .await
            .map(|res| format!("namespaces: {}", res.namespaces.join(", "))),
        Command::ListKeys { namespace } => api.list_entry_keys(team, namespace).await.map(|res| {
            let keys: Vec<String> = res
                .entry_keys
                .iter()
                .map(|k| format!("{} (rev {})", k.entry_key, k.revision))
                .collect();
            format!("keys in {}: {}", namespace, keys.join(", "))
        }),
        Command::Get { namespace, key } => api.get_entry(team, namespace, key).await.map(|res| {
            match res.entry_value {
                Some(value) => format!("{}/{} = {} (rev {})", namespace, key, value, res.revision),
                None => format!("{}/{} is not set (rev {})", namespace, key, res.revision),
            }
        }),
        Command::Put {
            namespace,
            key,
            value,
            revision,
        } => api
            .put_entry_with_revision(team, namespace, key, value, revision)
            .await
            .map(|res| format!("stored {}/{} at rev {}", namespace, key, res.revision)),
        Command::Delete {
            namespace,
            key,
            revision,
        } => api
            .delete_entry_with_revision(team, namespace, key, revision)
            .await
            .map(|res| format!("deleted {}/{} at rev {}", namespace, key, res.revision)),
    };

    match outcome {
        Ok(reply) => reply,
        Err(e) if e.is_revision_conflict() => format!("revision conflict: {}", e),
        Err(e) if e.is_not_found() => "nothing to delete".to_string(),
        Err(e) => format!("error: {}", e),
    }
}
