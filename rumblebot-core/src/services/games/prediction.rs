//! !predict: back an outcome, winners split the whole pool.
//!
//! Betting stays open until the lock (timer or moderator), which closes
//! betting without ending the prediction; a moderator then resolves it with
//! the winning option or cancels for a full refund. The pool is split
//! among winning-side bettors proportionally to each bet's share of the
//! winning option's total, rounding down; any residual from rounding stays
//! unassigned.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use rumblebot_common::models::{
    ActivityKind, ActivityRecord, ActivityState, Chatter, CommandSpec, PredictionBet,
    PredictionOption, PredictionState, PredictionStatus, UserTier,
};
use rumblebot_common::traits::activity_traits::GroupActivity;
use rumblebot_common::Error;

use crate::services::dispatcher::{CommandContext, CommandHandler};
use crate::services::games::{
    parse_duration_secs, parse_option_index, parse_points, require_tier, split_options,
    GameContext,
};

#[derive(Debug, Clone)]
pub struct PredictionConfig {
    pub default_open_secs: u64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            default_open_secs: 120,
        }
    }
}

#[derive(Clone)]
pub struct PredictionService {
    ctx: Arc<GameContext>,
    config: PredictionConfig,
}

impl PredictionService {
    pub fn new(ctx: Arc<GameContext>, config: PredictionConfig) -> Self {
        Self { ctx, config }
    }

    pub async fn open(
        &self,
        channel: &str,
        options: Vec<String>,
        open_secs: u64,
    ) -> Result<(), Error> {
        if options.len() < 2 {
            return Err(Error::InvalidParams(
                "a prediction needs at least two options separated by '|'.".to_string(),
            ));
        }
        if self.load(channel).await?.is_some() {
            return Err(Error::AlreadyActive(
                "a prediction is already running.".to_string(),
            ));
        }

        let now = Utc::now();
        let record = ActivityRecord::new(
            channel,
            now,
            ActivityState::Prediction(PredictionState {
                status: PredictionStatus::Open,
                options: options
                    .iter()
                    .map(|label| PredictionOption {
                        label: label.clone(),
                        total: 0,
                    })
                    .collect(),
                bets: vec![],
                locks_at: now + chrono::Duration::seconds(open_secs as i64),
            }),
        );
        self.ctx.activities.save(&record).await?;
        self.schedule_lock(channel, Duration::from_secs(open_secs));

        let listing: Vec<String> = options
            .iter()
            .enumerate()
            .map(|(i, label)| format!("[{}] {}", i + 1, label))
            .collect();
        self.ctx
            .say(
                channel,
                &format!(
                    "🔮 prediction open: {} — bet with !predict bet <n> <points> ({}s until lock).",
                    listing.join("  "),
                    open_secs
                ),
            )
            .await;
        Ok(())
    }

    pub async fn bet(
        &self,
        channel: &str,
        chatter: &Chatter,
        option_arg: Option<&str>,
        amount: i64,
    ) -> Result<(), Error> {
        let prediction = match self.load(channel).await? {
            Some(p) => p,
            None => {
                return Err(Error::NotFound("no prediction is running right now.".to_string()))
            }
        };
        if prediction.status != PredictionStatus::Open || Utc::now() > prediction.locks_at {
            return Err(Error::WrongStatus("betting is locked.".to_string()));
        }
        let option = parse_option_index(option_arg, prediction.options.len())?;
        if let Some(existing) = prediction.bet_by(chatter.user_id) {
            if existing.option != option {
                return Err(Error::InvalidParams(format!(
                    "you already backed '{}' — options are mutually exclusive.",
                    prediction.options[existing.option].label
                )));
            }
        }

        self.ctx
            .charge(channel, chatter.user_id, amount, "prediction:bet")
            .await?;

        // Read-verify-write after the debit.
        let mut record = match self
            .ctx
            .activities
            .load(ActivityKind::Prediction, channel)
            .await?
        {
            Some(r) => r,
            None => {
                self.ctx
                    .payout(channel, chatter.user_id, amount, "prediction:refund")
                    .await?;
                debug!("prediction in '{}' ended mid-bet; amount returned", channel);
                return Ok(());
            }
        };
        match &mut record.state {
            ActivityState::Prediction(p)
                if p.status == PredictionStatus::Open
                    && Utc::now() <= p.locks_at
                    && option < p.options.len()
                    && p
                        .bet_by(chatter.user_id)
                        .map(|b| b.option == option)
                        .unwrap_or(true) =>
            {
                p.options[option].total += amount;
                match p.bets.iter_mut().find(|b| b.user_id == chatter.user_id) {
                    Some(b) => b.amount += amount,
                    None => p.bets.push(PredictionBet {
                        user_id: chatter.user_id,
                        login: chatter.login.clone(),
                        option,
                        amount,
                    }),
                }
                let (label, total) =
                    (p.options[option].label.clone(), p.options[option].total);
                self.ctx.activities.save(&record).await?;
                self.ctx
                    .say(
                        channel,
                        &format!(
                            "@{} puts {} on '{}' ({} total on that side).",
                            chatter.login, amount, label, total
                        ),
                    )
                    .await;
            }
            _ => {
                self.ctx
                    .payout(channel, chatter.user_id, amount, "prediction:refund")
                    .await?;
                debug!("prediction bet precondition lost in '{}'; amount returned", channel);
            }
        }
        Ok(())
    }

    /// Close betting without ending the prediction. Idempotent: locking a
    /// locked prediction is a no-op.
    pub async fn lock(&self, channel: &str) -> Result<(), Error> {
        let mut record = match self
            .ctx
            .activities
            .load(ActivityKind::Prediction, channel)
            .await?
        {
            Some(r) => r,
            None => return Ok(()),
        };
        match &mut record.state {
            ActivityState::Prediction(p) if p.status == PredictionStatus::Open => {
                p.status = PredictionStatus::Locked;
                self.ctx.activities.save(&record).await?;
                self.ctx
                    .say(channel, "🔒 betting is locked — waiting for the result.")
                    .await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Settle on the winning option, paying the entire pool out to that
    /// side proportionally by bet share.
    pub async fn resolve(&self, channel: &str, option_arg: Option<&str>) -> Result<(), Error> {
        let prediction = match self.load(channel).await? {
            Some(p) => p,
            None => {
                return Err(Error::NotFound("no prediction is running right now.".to_string()))
            }
        };
        let winning = parse_option_index(option_arg, prediction.options.len())?;
        let pool = prediction.pot();
        let winning_total = prediction.options[winning].total;
        let label = prediction.options[winning].label.clone();

        if winning_total == 0 {
            // No one backed the outcome; hand every bet back.
            let refunds: Vec<(uuid::Uuid, i64)> = prediction
                .bets
                .iter()
                .map(|b| (b.user_id, b.amount))
                .collect();
            self.remove(channel).await?;
            self.ctx
                .refund_all(channel, &refunds, "prediction:refund")
                .await;
            self.ctx
                .say(
                    channel,
                    &format!("nobody backed '{}' — all bets refunded.", label),
                )
                .await;
            return Ok(());
        }

        let winners: Vec<(PredictionBet, i64)> = prediction
            .bets
            .iter()
            .filter(|b| b.option == winning)
            .map(|b| {
                let share = (pool as i128 * b.amount as i128 / winning_total as i128) as i64;
                (b.clone(), share)
            })
            .collect();
        let paid: i64 = winners.iter().map(|(_, share)| share).sum();
        if pool - paid > 0 {
            debug!(
                "prediction payout residual of {} in '{}' left unassigned",
                pool - paid,
                channel
            );
        }

        self.remove(channel).await?;
        for (bet, share) in &winners {
            self.ctx
                .payout(channel, bet.user_id, *share, "prediction:payout")
                .await?;
        }
        let lines: Vec<String> = winners
            .iter()
            .map(|(b, share)| format!("@{} +{}", b.login, share))
            .collect();
        self.ctx
            .say(
                channel,
                &format!(
                    "🔮 '{}' wins the {}-point pool! {}",
                    label,
                    pool,
                    lines.join(", ")
                ),
            )
            .await;
        Ok(())
    }

    pub async fn cancel_as(&self, channel: &str) -> Result<(), Error> {
        if !self.cancel(channel).await? {
            return Err(Error::NotFound("no prediction is running right now.".to_string()));
        }
        Ok(())
    }

    pub async fn status_line(&self, channel: &str) -> Result<String, Error> {
        match self.load(channel).await? {
            Some(p) => {
                let sides: Vec<String> = p
                    .options
                    .iter()
                    .enumerate()
                    .map(|(i, o)| format!("[{}] {} ({})", i + 1, o.label, o.total))
                    .collect();
                let phase = match p.status {
                    PredictionStatus::Open => {
                        let left = (p.locks_at - Utc::now()).num_seconds().max(0);
                        format!("open for {}s", left)
                    }
                    PredictionStatus::Locked => "locked".to_string(),
                };
                Ok(format!("prediction ({}): {}.", phase, sides.join("  ")))
            }
            None => Ok("no prediction is running.".to_string()),
        }
    }

    async fn load(&self, channel: &str) -> Result<Option<PredictionState>, Error> {
        match self
            .ctx
            .activities
            .load(ActivityKind::Prediction, channel)
            .await?
        {
            Some(record) => match record.state {
                ActivityState::Prediction(p) => Ok(Some(p)),
                _ => Err(Error::Store(format!(
                    "prediction record corrupt for '{}'",
                    channel
                ))),
            },
            None => Ok(None),
        }
    }

    async fn remove(&self, channel: &str) -> Result<(), Error> {
        self.ctx
            .activities
            .remove(ActivityKind::Prediction, channel)
            .await?;
        self.ctx
            .scheduler
            .cancel(&ActivityKind::Prediction.storage_key(channel));
        Ok(())
    }

    fn schedule_lock(&self, channel: &str, delay: Duration) {
        let svc = self.clone();
        let chan = channel.to_string();
        self.ctx.scheduler.schedule(
            &ActivityKind::Prediction.storage_key(channel),
            delay,
            async move {
                if let Err(e) = svc.advance(&chan).await {
                    warn!("scheduled prediction lock for '{}' failed: {:?}", chan, e);
                }
            },
        );
    }
}

#[async_trait]
impl GroupActivity for PredictionService {
    fn kind(&self) -> ActivityKind {
        ActivityKind::Prediction
    }

    /// The timed transition is the lock; resolution always needs a
    /// moderator to name the outcome.
    async fn advance(&self, channel: &str) -> Result<(), Error> {
        let prediction = match self.load(channel).await? {
            Some(p) => p,
            None => return Ok(()),
        };
        if prediction.status != PredictionStatus::Open {
            return Ok(());
        }
        if Utc::now() < prediction.locks_at {
            debug!("prediction timer for '{}' fired early; ignoring", channel);
            return Ok(());
        }
        self.lock(channel).await
    }

    async fn cancel(&self, channel: &str) -> Result<bool, Error> {
        let prediction = match self.load(channel).await? {
            Some(p) => p,
            None => return Ok(false),
        };
        let refunds: Vec<(uuid::Uuid, i64)> = prediction
            .bets
            .iter()
            .map(|b| (b.user_id, b.amount))
            .collect();
        self.remove(channel).await?;
        self.ctx
            .refund_all(channel, &refunds, "prediction:refund")
            .await;
        self.ctx
            .say(channel, "the prediction was cancelled — all bets refunded.")
            .await;
        Ok(true)
    }
}

static PREDICTION_SPEC: CommandSpec =
    CommandSpec::new("predict", &["prediction"], UserTier::Everyone, 0);

pub struct PredictionCommand {
    svc: PredictionService,
}

impl PredictionCommand {
    pub fn new(svc: PredictionService) -> Self {
        Self { svc }
    }
}

#[async_trait]
impl CommandHandler for PredictionCommand {
    fn spec(&self) -> &CommandSpec {
        &PREDICTION_SPEC
    }

    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Vec<String>, Error> {
        match ctx.arg(0) {
            Some("open") => {
                require_tier(ctx.tier, UserTier::Moderator, "!predict open")?;
                // !predict open [secs] option | option
                let (open_secs, rest) = match ctx.arg(1).and_then(|a| a.parse::<u64>().ok()) {
                    Some(_) => (
                        parse_duration_secs(ctx.arg(1), self.svc.config.default_open_secs)?,
                        &ctx.args[2..],
                    ),
                    None => (self.svc.config.default_open_secs, &ctx.args[1..]),
                };
                let options = split_options(rest);
                self.svc.open(ctx.channel, options, open_secs).await?;
                Ok(vec![])
            }
            Some("bet") => {
                let amount = parse_points(ctx.arg(2), "bet amount")?;
                self.svc.bet(ctx.channel, ctx.chatter, ctx.arg(1), amount).await?;
                Ok(vec![])
            }
            Some("lock") => {
                require_tier(ctx.tier, UserTier::Moderator, "!predict lock")?;
                self.svc.lock(ctx.channel).await?;
                Ok(vec![])
            }
            Some("resolve") => {
                require_tier(ctx.tier, UserTier::Moderator, "!predict resolve")?;
                self.svc.resolve(ctx.channel, ctx.arg(1)).await?;
                Ok(vec![])
            }
            Some("cancel") => {
                require_tier(ctx.tier, UserTier::Moderator, "!predict cancel")?;
                self.svc.cancel_as(ctx.channel).await?;
                Ok(vec![])
            }
            Some("status") => Ok(vec![self.svc.status_line(ctx.channel).await?]),
            _ => Ok(vec![
                "usage: !predict open [secs] opt | opt — bet <n> <points> | lock | resolve <n> | cancel | status"
                    .to_string(),
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestHarness;
    use rumblebot_common::traits::store_traits::PointsLedger;

    const CHAN: &str = "testchan";

    fn service(h: &TestHarness) -> PredictionService {
        PredictionService::new(h.ctx.clone(), PredictionConfig::default())
    }

    async fn open_ab(svc: &PredictionService) {
        svc.open(CHAN, vec!["a".into(), "b".into()], 3600).await.unwrap();
    }

    #[tokio::test]
    async fn pool_splits_proportionally_by_bet_share() {
        let h = TestHarness::with_seed(61);
        let svc = service(&h);
        let u1 = h.chatter(CHAN, "user1", 1000);
        let u2 = h.chatter(CHAN, "user2", 1000);
        let u3 = h.chatter(CHAN, "user3", 1000);

        open_ab(&svc).await;
        svc.bet(CHAN, &u1, Some("1"), 100).await.unwrap();
        svc.bet(CHAN, &u2, Some("2"), 50).await.unwrap();
        svc.bet(CHAN, &u3, Some("2"), 150).await.unwrap();

        svc.lock(CHAN).await.unwrap();
        svc.resolve(CHAN, Some("2")).await.unwrap();

        // 300-point pool split 50/150 over the 200-point winning side.
        assert_eq!(h.ledger.get_points(CHAN, u1.user_id).await.unwrap(), 900);
        assert_eq!(h.ledger.get_points(CHAN, u2.user_id).await.unwrap(), 1025);
        assert_eq!(h.ledger.get_points(CHAN, u3.user_id).await.unwrap(), 1075);
        assert_eq!(h.ledger.net_for_reason("prediction:"), 0);
        assert!(svc.load(CHAN).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn betting_after_lock_is_rejected() {
        let h = TestHarness::with_seed(62);
        let svc = service(&h);
        let u1 = h.chatter(CHAN, "user1", 1000);

        open_ab(&svc).await;
        svc.lock(CHAN).await.unwrap();
        assert!(matches!(
            svc.bet(CHAN, &u1, Some("1"), 100).await.unwrap_err(),
            Error::WrongStatus(_)
        ));
        // Lock closed betting but did not end the prediction.
        assert!(svc.load(CHAN).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn switching_sides_is_rejected_but_same_side_accumulates() {
        let h = TestHarness::with_seed(63);
        let svc = service(&h);
        let u1 = h.chatter(CHAN, "user1", 1000);

        open_ab(&svc).await;
        svc.bet(CHAN, &u1, Some("1"), 100).await.unwrap();
        assert!(matches!(
            svc.bet(CHAN, &u1, Some("2"), 50).await.unwrap_err(),
            Error::InvalidParams(_)
        ));
        svc.bet(CHAN, &u1, Some("1"), 50).await.unwrap();

        let p = svc.load(CHAN).await.unwrap().unwrap();
        assert_eq!(p.options[0].total, 150);
        assert_eq!(p.bets.len(), 1);
        assert_eq!(p.bets[0].amount, 150);
    }

    #[tokio::test]
    async fn cancel_refunds_every_bet_regardless_of_option() {
        let h = TestHarness::with_seed(64);
        let svc = service(&h);
        let u1 = h.chatter(CHAN, "user1", 1000);
        let u2 = h.chatter(CHAN, "user2", 1000);

        open_ab(&svc).await;
        svc.bet(CHAN, &u1, Some("1"), 200).await.unwrap();
        svc.bet(CHAN, &u2, Some("2"), 300).await.unwrap();

        assert!(svc.cancel(CHAN).await.unwrap());
        assert!(!svc.cancel(CHAN).await.unwrap());
        assert_eq!(h.ledger.get_points(CHAN, u1.user_id).await.unwrap(), 1000);
        assert_eq!(h.ledger.get_points(CHAN, u2.user_id).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn unbacked_winner_refunds_instead_of_burning_the_pool() {
        let h = TestHarness::with_seed(65);
        let svc = service(&h);
        let u1 = h.chatter(CHAN, "user1", 1000);

        open_ab(&svc).await;
        svc.bet(CHAN, &u1, Some("1"), 250).await.unwrap();
        svc.resolve(CHAN, Some("2")).await.unwrap();

        assert_eq!(h.ledger.get_points(CHAN, u1.user_id).await.unwrap(), 1000);
        assert!(h.emitter.contains("refunded"));
    }

    #[tokio::test]
    async fn rounding_residual_is_never_overpaid() {
        let h = TestHarness::with_seed(66);
        let svc = service(&h);
        let u1 = h.chatter(CHAN, "user1", 1000);
        let u2 = h.chatter(CHAN, "user2", 1000);
        let u3 = h.chatter(CHAN, "user3", 1000);

        open_ab(&svc).await;
        // Pool 100 over a 6-point winning side: each winner gets
        // floor(100 * 3 / 6) = 50.
        svc.bet(CHAN, &u1, Some("1"), 94).await.unwrap();
        svc.bet(CHAN, &u2, Some("2"), 3).await.unwrap();
        svc.bet(CHAN, &u3, Some("2"), 3).await.unwrap();
        svc.resolve(CHAN, Some("2")).await.unwrap();

        // Each winner gets floor(100 * 3 / 6) = 50; pool fully paid here,
        // and in no case may more than the pool leave the ledger.
        let net = h.ledger.net_for_reason("prediction:");
        assert!(net <= 0, "prediction flow created points: net {}", net);
    }
}
