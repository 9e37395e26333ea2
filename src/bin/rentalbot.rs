//! rentalbot - tool rentals in a team's kvstore with hidden entry keys.
//!
//! Runs a scripted session against the team named by `RENTAL_TEAM`: a few
//! single-user reservations, then five users racing to reserve distinct
//! days on the same tool. Every write carries the revision it was based on,
//! so racing users retry instead of overwriting each other.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keybase_bot::secret_store::{Rental, Rentals, SecretKvStore};
use keybase_bot::{Api, RunOptions};

const EXIT_FAILURE: i32 = 3;
const RACERS: usize = 5;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "keybase_bot=info,rentalbot=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    info!("Starting rentalbot v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run().await {
        error!("{:#}", e);
        std::process::exit(EXIT_FAILURE);
    }
}

async fn run() -> Result<()> {
    let team = std::env::var("RENTAL_TEAM").context("RENTAL_TEAM is not set")?;
    let opts = RunOptions::from_env().context("invalid KEYBASE_* configuration")?;
    let api = Arc::new(Api::start(opts).await.context("failed to start Keybase client")?);
    let rentals = Arc::new(Rentals::new(SecretKvStore::new(api.clone())));

    let result = async {
        info!("Basic rental actions");
        basic(&rentals, &team).await?;
        info!("{} users try to reserve at once", RACERS);
        race(&rentals, &team).await
    }
    .await;

    api.shutdown().await.context("shutdown failed")?;
    result
}

fn expect(step: &str, rental: Rental, applied: bool) -> Result<()> {
    info!("{}: {:?}", step, rental);
    if rental.is_applied() != applied {
        bail!("unexpected result for {}: {:?}", step, rental);
    }
    Ok(())
}

async fn basic(rentals: &Rentals, team: &str) -> Result<()> {
    let tool = "laz0rs";
    let (jo, charlie) = ("Jo", "Charlie");

    expect("remove", rentals.remove(team, tool).await?, true)?;
    info!("tools: {:?}", rentals.list_tools(team).await?);
    expect("add", rentals.add(team, "time travel machine").await?, true)?;
    expect("add", rentals.add(team, tool).await?, true)?;

    expect("reserve", rentals.reserve(team, jo, tool, "2044-03-12").await?, true)?;
    expect("reserve taken day", rentals.reserve(team, jo, tool, "2044-03-12").await?, false)?;
    expect("reserve", rentals.reserve(team, charlie, tool, "2044-06-12").await?, true)?;

    expect("unreserve free day", rentals.unreserve(team, jo, tool, "2044-06-13").await?, true)?;
    expect("unreserve other's day", rentals.unreserve(team, jo, tool, "2044-06-12").await?, false)?;
    expect("unreserve", rentals.unreserve(team, jo, tool, "2044-03-12").await?, true)?;

    info!("lookup: {:?}", rentals.lookup(team, tool).await?);
    Ok(())
}

async fn race(rentals: &Arc<Rentals>, team: &str) -> Result<()> {
    let tool = "time travel machine";

    // Start from an empty entry with a real revision.
    while !rentals.remove(team, tool).await?.is_applied() {}
    while !rentals.add(team, tool).await?.is_applied() {}

    let mut handles = Vec::with_capacity(RACERS);
    for id in 1..=RACERS {
        let rentals = Arc::clone(rentals);
        let team = team.to_string();
        handles.push(tokio::spawn(async move {
            let user = format!("user{}", id);
            let day = format!("2044-10-0{}", id);
            let mut attempts = 0;
            loop {
                attempts += 1;
                let rental = rentals.reserve(&team, &user, tool, &day).await?;
                if rental.is_applied() {
                    info!("{} reserved {} after {} attempt(s)", user, day, attempts);
                    return Ok::<_, keybase_bot::BotError>(());
                }
            }
        }));
    }
    for handle in handles {
        handle.await.context("reservation task panicked")??;
    }

    let days = rentals.lookup(team, tool).await?.fields.unwrap_or_default();
    if days.len() != RACERS {
        bail!("expected {} reservations, found {:?}", RACERS, days);
    }
    info!("All {} reservations landed: {:?}", RACERS, days);
    Ok(())
}
