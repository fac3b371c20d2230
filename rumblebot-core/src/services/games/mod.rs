// File: rumblebot-core/src/services/games/mod.rs
//
// The timed-group-activity engines plus the plumbing they all share.

pub mod boss_battle;
pub mod duel;
pub mod giveaway;
pub mod heist;
pub mod poll;
pub mod prediction;
pub mod raffle;
pub mod tournament;

use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::error;
use uuid::Uuid;

use rumblebot_common::traits::activity_traits::GroupActivity;
use rumblebot_common::traits::store_traits::{PointsLedger, ResponseEmitter, StateStore};
use rumblebot_common::Error;

use crate::scheduler::Scheduler;
use crate::services::dispatcher::Dispatcher;
use crate::storage::ActivityStore;

pub use boss_battle::{BossBattleConfig, BossBattleService};
pub use duel::{DuelConfig, DuelService};
pub use giveaway::{GiveawayConfig, GiveawayService};
pub use heist::{HeistConfig, HeistScenario, HeistService};
pub use poll::{PollConfig, PollService};
pub use prediction::{PredictionConfig, PredictionService};
pub use raffle::{RaffleConfig, RaffleService};
pub use tournament::{TournamentConfig, TournamentService};

/// Everything an engine needs to run: activity documents, the points
/// ledger, the channel emitter, the timer scheduler and a shared RNG.
/// Handles are injected so tests can wire in-memory fakes per channel
/// without any global state.
pub struct GameContext {
    pub activities: ActivityStore,
    pub ledger: Arc<dyn PointsLedger>,
    pub emitter: Arc<dyn ResponseEmitter>,
    pub scheduler: Scheduler,
    rng: Mutex<StdRng>,
}

impl GameContext {
    pub fn new(
        store: Arc<dyn StateStore>,
        ledger: Arc<dyn PointsLedger>,
        emitter: Arc<dyn ResponseEmitter>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            activities: ActivityStore::new(store),
            ledger,
            emitter,
            scheduler,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic variant for tests: every draw comes from the seeded
    /// sequence, so outcomes are exactly reproducible.
    pub fn with_seed(
        store: Arc<dyn StateStore>,
        ledger: Arc<dyn PointsLedger>,
        emitter: Arc<dyn ResponseEmitter>,
        scheduler: Scheduler,
        seed: u64,
    ) -> Self {
        Self {
            activities: ActivityStore::new(store),
            ledger,
            emitter,
            scheduler,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    // ----------------------------------------------------------------
    // RNG draws. The guard never crosses an await point.
    // ----------------------------------------------------------------

    pub fn roll(&self, range: RangeInclusive<i64>) -> i64 {
        self.rng.lock().unwrap().random_range(range)
    }

    pub fn roll_f64(&self, lo: f64, hi: f64) -> f64 {
        if lo >= hi {
            return lo;
        }
        self.rng.lock().unwrap().random_range(lo..=hi)
    }

    /// Single success draw against probability `p` (clamped to [0, 1]).
    pub fn chance(&self, p: f64) -> bool {
        self.rng.lock().unwrap().random_bool(p.clamp(0.0, 1.0))
    }

    pub fn shuffle<T>(&self, items: &mut [T]) {
        items.shuffle(&mut *self.rng.lock().unwrap());
    }

    // ----------------------------------------------------------------
    // Ledger and chat helpers shared by every engine.
    // ----------------------------------------------------------------

    pub async fn say(&self, channel: &str, text: &str) {
        self.emitter.say(channel, text).await;
    }

    pub async fn balance(&self, channel: &str, user_id: Uuid) -> Result<i64, Error> {
        self.ledger.get_points(channel, user_id).await
    }

    /// Debit a stake. Fails (before any side effect) when the balance is
    /// short.
    pub async fn charge(
        &self,
        channel: &str,
        user_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> Result<(), Error> {
        self.ledger
            .remove_points(channel, user_id, amount, reason)
            .await
    }

    pub async fn payout(
        &self,
        channel: &str,
        user_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> Result<(), Error> {
        self.ledger.add_points(channel, user_id, amount, reason).await
    }

    /// Return committed stakes after the activity record has already been
    /// deleted (delete-first keeps repeated cancels at-most-once). A failed
    /// credit is logged and does not stop the remaining refunds.
    pub async fn refund_all(&self, channel: &str, refunds: &[(Uuid, i64)], reason: &str) {
        for &(user_id, amount) in refunds {
            if amount <= 0 {
                continue;
            }
            if let Err(e) = self.ledger.add_points(channel, user_id, amount, reason).await {
                error!(
                    "refund of {} to {} in '{}' failed ({}): {:?}",
                    amount, user_id, channel, reason, e
                );
            }
        }
    }
}

/// Multiply a stake by a drawn multiplier, rounding down.
pub(crate) fn scaled(amount: i64, multiplier: f64) -> i64 {
    (amount as f64 * multiplier).floor() as i64
}

/// Parse a positive point amount from a command argument.
pub(crate) fn parse_points(arg: Option<&str>, what: &str) -> Result<i64, Error> {
    let raw = arg.ok_or_else(|| Error::InvalidParams(format!("missing {}", what)))?;
    let value: i64 = raw
        .parse()
        .map_err(|_| Error::InvalidParams(format!("'{}' is not a valid {}", raw, what)))?;
    if value <= 0 {
        return Err(Error::InvalidParams(format!("{} must be positive", what)));
    }
    Ok(value)
}

/// Parse an optional duration argument (seconds), falling back to the
/// configured default.
pub(crate) fn parse_duration_secs(arg: Option<&str>, default_secs: u64) -> Result<u64, Error> {
    match arg {
        None => Ok(default_secs),
        Some(raw) => {
            let secs: u64 = raw
                .parse()
                .map_err(|_| Error::InvalidParams(format!("'{}' is not a duration in seconds", raw)))?;
            if secs == 0 || secs > 24 * 3600 {
                return Err(Error::InvalidParams(
                    "duration must be between 1 second and 24 hours".to_string(),
                ));
            }
            Ok(secs)
        }
    }
}

/// Parse a 1-based option index into a 0-based one.
pub(crate) fn parse_option_index(arg: Option<&str>, option_count: usize) -> Result<usize, Error> {
    let raw = arg.ok_or_else(|| Error::InvalidParams("missing option number".to_string()))?;
    let idx: usize = raw
        .parse()
        .map_err(|_| Error::InvalidParams(format!("'{}' is not an option number", raw)))?;
    if idx == 0 || idx > option_count {
        return Err(Error::InvalidParams(format!(
            "pick an option between 1 and {}",
            option_count
        )));
    }
    Ok(idx - 1)
}

/// Subcommand-level tier gate, for commands whose base command is open to
/// everyone but whose management subcommands are not.
pub(crate) fn require_tier(
    actual: rumblebot_common::models::UserTier,
    required: rumblebot_common::models::UserTier,
    what: &str,
) -> Result<(), Error> {
    if actual.satisfies(required) {
        Ok(())
    } else {
        Err(Error::InvalidParams(format!(
            "{} requires {} or higher.",
            what,
            required.label()
        )))
    }
}

/// Split `args` on "|" separators into trimmed, non-empty segments.
/// Used by poll and prediction option lists.
pub(crate) fn split_options(args: &[&str]) -> Vec<String> {
    args.join(" ")
        .split('|')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Tunables for every engine, with sensible chat-scale defaults.
#[derive(Debug, Clone, Default)]
pub struct GameConfig {
    pub duel: DuelConfig,
    pub heist: HeistConfig,
    pub boss: BossBattleConfig,
    pub raffle: RaffleConfig,
    pub giveaway: GiveawayConfig,
    pub poll: PollConfig,
    pub prediction: PredictionConfig,
    pub tournament: TournamentConfig,
}

/// All engines wired to one context. Construct once per process and
/// register the command handlers on a dispatcher.
pub struct GameServices {
    pub duel: DuelService,
    pub heist: HeistService,
    pub boss: BossBattleService,
    pub raffle: RaffleService,
    pub giveaway: GiveawayService,
    pub poll: PollService,
    pub prediction: PredictionService,
    pub tournament: TournamentService,
}

impl GameServices {
    pub fn new(ctx: Arc<GameContext>, config: GameConfig) -> Self {
        Self {
            duel: DuelService::new(ctx.clone(), config.duel),
            heist: HeistService::new(ctx.clone(), config.heist),
            boss: BossBattleService::new(ctx.clone(), config.boss),
            raffle: RaffleService::new(ctx.clone(), config.raffle),
            giveaway: GiveawayService::new(ctx.clone(), config.giveaway),
            poll: PollService::new(ctx.clone(), config.poll),
            prediction: PredictionService::new(ctx.clone(), config.prediction),
            tournament: TournamentService::new(ctx, config.tournament),
        }
    }

    /// Engines as trait objects, for the expiry sweeper.
    pub fn engines(&self) -> Vec<Arc<dyn GroupActivity>> {
        vec![
            Arc::new(self.duel.clone()),
            Arc::new(self.heist.clone()),
            Arc::new(self.boss.clone()),
            Arc::new(self.raffle.clone()),
            Arc::new(self.giveaway.clone()),
            Arc::new(self.poll.clone()),
            Arc::new(self.prediction.clone()),
            Arc::new(self.tournament.clone()),
        ]
    }

    /// Register one command per activity kind on the dispatcher.
    pub fn register_all(&self, dispatcher: &mut Dispatcher) {
        dispatcher.register(Arc::new(duel::DuelCommand::new(self.duel.clone())));
        dispatcher.register(Arc::new(heist::HeistCommand::new(self.heist.clone())));
        dispatcher.register(Arc::new(boss_battle::BossBattleCommand::new(self.boss.clone())));
        dispatcher.register(Arc::new(raffle::RaffleCommand::new(self.raffle.clone())));
        dispatcher.register(Arc::new(giveaway::GiveawayCommand::new(self.giveaway.clone())));
        dispatcher.register(Arc::new(poll::PollCommand::new(self.poll.clone())));
        dispatcher.register(Arc::new(prediction::PredictionCommand::new(
            self.prediction.clone(),
        )));
        dispatcher.register(Arc::new(tournament::TournamentCommand::new(
            self.tournament.clone(),
        )));
    }
}
