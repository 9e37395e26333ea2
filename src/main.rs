//! echobot - repeats every text message back into its conversation.
//!
//! Configuration comes from `KEYBASE_*` environment variables (see
//! [`RunOptions::from_env`]). Unrecoverable errors exit with code 3.

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keybase_bot::{Api, BotError, RunOptions};

const EXIT_FAILURE: i32 = 3;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "keybase_bot=info,echobot=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    info!("Starting echobot v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run().await {
        error!("{:#}", e);
        std::process::exit(EXIT_FAILURE);
    }
}

async fn run() -> Result<()> {
    let opts = RunOptions::from_env().context("invalid KEYBASE_* configuration")?;
    let api = Api::start(opts).await.context("failed to start Keybase client")?;
    let me = api.username();

    let sub = api
        .listen_for_new_text_messages()
        .await
        .context("failed to start listening")?;
    info!("Listening for messages as {}", me);

    let result = loop {
        let msg = tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            msg = sub.read() => msg,
        };
        match msg {
            Ok(msg) => {
                if msg.message.sender.username == me || !msg.message.content.is_text() {
                    continue;
                }
                let body = msg.message.content.body();
                if let Err(e) = api.send_message_by_conv_id(&msg.conversation.id, body).await {
                    break Err(anyhow::Error::new(e).context("error echoing message"));
                }
            }
            Err(BotError::SubscriptionShutdown) => break Ok(()),
            Err(e) => warn!("Listener error: {}", e),
        }
    };

    api.shutdown().await.context("shutdown failed")?;
    result
}
