use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use rumblebot_common::models::{Chatter, UserTier};
use rumblebot_common::traits::store_traits::{PointsLedger, ResponseEmitter, StateStore};
use rumblebot_common::Error;
use rumblebot_core::services::games::{GameConfig, GameContext, GameServices};
use rumblebot_core::services::Dispatcher;
use rumblebot_core::storage::{
    MemoryPointsLedger, MemoryStateStore, PostgresPointsLedger, PostgresStateStore,
};
use rumblebot_core::tasks::expiry_sweeper::spawn_expiry_sweeper;
use rumblebot_core::Scheduler;

#[derive(Parser, Debug, Clone)]
#[command(name = "rumblebot")]
#[command(author, version, about = "rumblebot - chat minigame engine with a local simulator")]
struct Args {
    /// Postgres connection URL; omit to run fully in memory.
    #[arg(long, env = "DATABASE_URL")]
    db_url: Option<String>,

    /// Channel the simulator feeds commands into.
    #[arg(long, default_value = "demo")]
    channel: String,

    /// Starting balance granted to each simulated chatter.
    #[arg(long, default_value_t = 1000)]
    starter_points: i64,

    /// Seconds between expiry-sweeper passes.
    #[arg(long, default_value_t = 30)]
    sweep_secs: u64,
}

/// Emitter for the local simulator: chat lines go to stdout.
struct ConsoleEmitter;

#[async_trait]
impl ResponseEmitter for ConsoleEmitter {
    async fn say(&self, channel: &str, text: &str) {
        println!("[#{}] {}", channel, text);
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenv::dotenv().ok();
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let (store, ledger): (Arc<dyn StateStore>, Arc<dyn PointsLedger>) = match &args.db_url {
        Some(url) => {
            info!("connecting to Postgres at {}", url);
            let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
            let store = PostgresStateStore::new(pool.clone());
            store.ensure_schema().await?;
            let ledger = PostgresPointsLedger::new(pool);
            ledger.ensure_schema().await?;
            (Arc::new(store), Arc::new(ledger))
        }
        None => {
            info!("no DATABASE_URL set; using in-memory backends");
            (
                Arc::new(MemoryStateStore::new()),
                Arc::new(MemoryPointsLedger::new()),
            )
        }
    };

    let emitter: Arc<dyn ResponseEmitter> = Arc::new(ConsoleEmitter);
    let ctx = Arc::new(GameContext::new(
        store,
        ledger.clone(),
        emitter.clone(),
        Scheduler::new(),
    ));
    let games = GameServices::new(ctx.clone(), GameConfig::default());
    let mut dispatcher = Dispatcher::new(emitter);
    games.register_all(&mut dispatcher);

    let _sweeper = spawn_expiry_sweeper(
        ctx.activities.clone(),
        games.engines(),
        Duration::from_secs(args.sweep_secs),
    );

    info!(
        "simulator ready on #{} — lines are '<login>[:tier] !command args', e.g. 'alice !heist start 100' or 'mods:mod !raffle start 10'",
        args.channel
    );

    // Stable identities per login for the lifetime of the simulator, with a
    // starter balance granted on first sight.
    let mut identities: HashMap<String, Chatter> = HashMap::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (speaker, message) = match line.split_once(' ') {
            Some(parts) => parts,
            None => {
                info!("ignoring line without a message: '{}'", line);
                continue;
            }
        };
        let (login, tier) = match speaker.split_once(':') {
            Some((login, tier_raw)) => match UserTier::parse(tier_raw) {
                Some(tier) => (login, tier),
                None => {
                    error!("unknown tier '{}', defaulting to everyone", tier_raw);
                    (login, UserTier::Everyone)
                }
            },
            None => (speaker, UserTier::Everyone),
        };

        let login_key = login.to_lowercase();
        let chatter = match identities.get(&login_key).cloned() {
            Some(c) => c,
            None => {
                let chatter = Chatter::new(Uuid::new_v4(), login);
                if let Err(e) = ledger
                    .add_points(&args.channel, chatter.user_id, args.starter_points, "starter")
                    .await
                {
                    error!("failed to grant starter points to '{}': {:?}", login, e);
                }
                identities.insert(login_key, chatter.clone());
                chatter
            }
        };

        dispatcher
            .dispatch(&args.channel, &chatter, tier, message)
            .await;
    }

    info!("stdin closed; shutting down");
    Ok(())
}
