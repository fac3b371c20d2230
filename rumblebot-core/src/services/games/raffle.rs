//! !raffle: buy weighted tickets, one winner takes the pot.
//!
//! Single active phase: tickets are sold until the stored deadline or an
//! explicit moderator end, whichever comes first (the loser of that race is
//! a no-op). The winner is drawn uniformly over the expanded ticket pool,
//! so three of ten tickets means a 30% shot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use rumblebot_common::models::{
    ActivityKind, ActivityRecord, ActivityState, Chatter, CommandSpec, RaffleEntry, RaffleState,
    UserTier,
};
use rumblebot_common::traits::activity_traits::GroupActivity;
use rumblebot_common::Error;

use crate::services::dispatcher::{CommandContext, CommandHandler};
use crate::services::games::{parse_duration_secs, parse_points, require_tier, GameContext};

#[derive(Debug, Clone)]
pub struct RaffleConfig {
    pub default_duration_secs: u64,
    pub max_tickets_per_user: u32,
}

impl Default for RaffleConfig {
    fn default() -> Self {
        Self {
            default_duration_secs: 120,
            max_tickets_per_user: 100,
        }
    }
}

#[derive(Clone)]
pub struct RaffleService {
    ctx: Arc<GameContext>,
    config: RaffleConfig,
}

impl RaffleService {
    pub fn new(ctx: Arc<GameContext>, config: RaffleConfig) -> Self {
        Self { ctx, config }
    }

    pub async fn start(
        &self,
        channel: &str,
        ticket_cost: i64,
        duration_secs: u64,
    ) -> Result<(), Error> {
        if self.load(channel).await?.is_some() {
            return Err(Error::AlreadyActive("a raffle is already running.".to_string()));
        }
        let now = Utc::now();
        let ends_at = now + chrono::Duration::seconds(duration_secs as i64);
        let record = ActivityRecord::new(
            channel,
            now,
            ActivityState::Raffle(RaffleState {
                ticket_cost,
                ends_at,
                entries: vec![],
            }),
        );
        self.ctx.activities.save(&record).await?;
        self.schedule_draw(channel, Duration::from_secs(duration_secs));

        self.ctx
            .say(
                channel,
                &format!(
                    "🎟️ raffle time! Tickets cost {} points each — !raffle buy <n>. Drawing in {}s.",
                    ticket_cost, duration_secs
                ),
            )
            .await;
        Ok(())
    }

    pub async fn buy(&self, channel: &str, chatter: &Chatter, count: u32) -> Result<(), Error> {
        let raffle = match self.load(channel).await? {
            Some(r) => r,
            None => return Err(Error::NotFound("no raffle is running right now.".to_string())),
        };
        if Utc::now() > raffle.ends_at {
            return Err(Error::WrongStatus("ticket sales are closed.".to_string()));
        }
        if count == 0 {
            return Err(Error::InvalidParams("buy at least one ticket.".to_string()));
        }
        let held = raffle
            .entries
            .iter()
            .find(|e| e.user_id == chatter.user_id)
            .map(|e| e.tickets)
            .unwrap_or(0);
        if held + count > self.config.max_tickets_per_user {
            return Err(Error::InvalidParams(format!(
                "ticket limit is {} per person (you hold {}).",
                self.config.max_tickets_per_user, held
            )));
        }

        let cost = count as i64 * raffle.ticket_cost;
        self.ctx
            .charge(channel, chatter.user_id, cost, "raffle:tickets")
            .await?;

        // Read-verify-write: put the points back if the raffle closed while
        // the debit was in flight.
        let mut record = match self.ctx.activities.load(ActivityKind::Raffle, channel).await? {
            Some(r) => r,
            None => {
                self.ctx
                    .payout(channel, chatter.user_id, cost, "raffle:refund")
                    .await?;
                debug!("raffle in '{}' ended mid-purchase; cost returned", channel);
                return Ok(());
            }
        };
        match &mut record.state {
            ActivityState::Raffle(r) if Utc::now() <= r.ends_at => {
                match r.entries.iter_mut().find(|e| e.user_id == chatter.user_id) {
                    Some(entry) => entry.tickets += count,
                    None => r.entries.push(RaffleEntry {
                        user_id: chatter.user_id,
                        login: chatter.login.clone(),
                        tickets: count,
                    }),
                }
                let total = r
                    .entries
                    .iter()
                    .find(|e| e.user_id == chatter.user_id)
                    .map(|e| e.tickets)
                    .unwrap_or(count);
                self.ctx.activities.save(&record).await?;
                self.ctx
                    .say(
                        channel,
                        &format!("@{} now holds {} ticket(s).", chatter.login, total),
                    )
                    .await;
            }
            _ => {
                self.ctx
                    .payout(channel, chatter.user_id, cost, "raffle:refund")
                    .await?;
                debug!("raffle purchase precondition lost in '{}'; cost returned", channel);
            }
        }
        Ok(())
    }

    /// Moderator-initiated end; the timer path goes through `advance`.
    pub async fn end_now(&self, channel: &str) -> Result<(), Error> {
        if self.load(channel).await?.is_none() {
            return Err(Error::NotFound("no raffle is running right now.".to_string()));
        }
        self.finish(channel).await
    }

    pub async fn cancel_as(&self, channel: &str) -> Result<(), Error> {
        if !self.cancel(channel).await? {
            return Err(Error::NotFound("no raffle is running right now.".to_string()));
        }
        Ok(())
    }

    pub async fn status_line(&self, channel: &str) -> Result<String, Error> {
        match self.load(channel).await? {
            Some(r) => {
                let left = (r.ends_at - Utc::now()).num_seconds().max(0);
                Ok(format!(
                    "raffle: {} tickets sold ({} points each), pot {}, drawing in {}s.",
                    r.total_tickets(),
                    r.ticket_cost,
                    r.pot(),
                    left
                ))
            }
            None => Ok("no raffle is running.".to_string()),
        }
    }

    /// Draw the winner and settle. Idempotent through deletion: the second
    /// of a timer/moderator race finds no record and does nothing.
    async fn finish(&self, channel: &str) -> Result<(), Error> {
        let raffle = match self.load(channel).await? {
            Some(r) => r,
            None => return Ok(()),
        };

        let total = raffle.total_tickets();
        if total == 0 {
            self.remove(channel).await?;
            self.ctx
                .say(channel, "the raffle closed with no tickets sold.")
                .await;
            return Ok(());
        }

        // Uniform over the expanded pool, not over unique participants.
        let mut idx = self.ctx.roll(0..=(total as i64 - 1)) as u64;
        let mut winner: Option<&RaffleEntry> = None;
        for entry in &raffle.entries {
            if idx < entry.tickets as u64 {
                winner = Some(entry);
                break;
            }
            idx -= entry.tickets as u64;
        }
        let winner = match winner {
            Some(w) => w,
            None => return Err(Error::Internal("raffle ticket walk missed the pool".to_string())),
        };
        let pot = raffle.pot();

        self.remove(channel).await?;
        self.ctx
            .payout(channel, winner.user_id, pot, "raffle:win")
            .await?;
        self.ctx
            .say(
                channel,
                &format!(
                    "🎉 @{} wins the raffle pot of {} points with {} of {} tickets!",
                    winner.login, pot, winner.tickets, total
                ),
            )
            .await;
        Ok(())
    }

    async fn load(&self, channel: &str) -> Result<Option<RaffleState>, Error> {
        match self.ctx.activities.load(ActivityKind::Raffle, channel).await? {
            Some(record) => match record.state {
                ActivityState::Raffle(r) => Ok(Some(r)),
                _ => Err(Error::Store(format!("raffle record corrupt for '{}'", channel))),
            },
            None => Ok(None),
        }
    }

    async fn remove(&self, channel: &str) -> Result<(), Error> {
        self.ctx.activities.remove(ActivityKind::Raffle, channel).await?;
        self.ctx
            .scheduler
            .cancel(&ActivityKind::Raffle.storage_key(channel));
        Ok(())
    }

    fn schedule_draw(&self, channel: &str, delay: Duration) {
        let svc = self.clone();
        let chan = channel.to_string();
        self.ctx.scheduler.schedule(
            &ActivityKind::Raffle.storage_key(channel),
            delay,
            async move {
                if let Err(e) = svc.advance(&chan).await {
                    warn!("scheduled raffle draw for '{}' failed: {:?}", chan, e);
                }
            },
        );
    }
}

#[async_trait]
impl GroupActivity for RaffleService {
    fn kind(&self) -> ActivityKind {
        ActivityKind::Raffle
    }

    async fn advance(&self, channel: &str) -> Result<(), Error> {
        let raffle = match self.load(channel).await? {
            Some(r) => r,
            None => return Ok(()),
        };
        if Utc::now() < raffle.ends_at {
            debug!("raffle timer for '{}' fired early; ignoring", channel);
            return Ok(());
        }
        self.finish(channel).await
    }

    async fn cancel(&self, channel: &str) -> Result<bool, Error> {
        let raffle = match self.load(channel).await? {
            Some(r) => r,
            None => return Ok(false),
        };
        let refunds: Vec<(uuid::Uuid, i64)> = raffle
            .entries
            .iter()
            .map(|e| (e.user_id, e.tickets as i64 * raffle.ticket_cost))
            .collect();
        self.remove(channel).await?;
        self.ctx.refund_all(channel, &refunds, "raffle:refund").await;
        self.ctx
            .say(channel, "the raffle was cancelled — all tickets refunded.")
            .await;
        Ok(true)
    }
}

static RAFFLE_SPEC: CommandSpec = CommandSpec::new("raffle", &[], UserTier::Everyone, 5);

pub struct RaffleCommand {
    svc: RaffleService,
}

impl RaffleCommand {
    pub fn new(svc: RaffleService) -> Self {
        Self { svc }
    }
}

#[async_trait]
impl CommandHandler for RaffleCommand {
    fn spec(&self) -> &CommandSpec {
        &RAFFLE_SPEC
    }

    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Vec<String>, Error> {
        match ctx.arg(0) {
            Some("start") => {
                require_tier(ctx.tier, UserTier::Moderator, "!raffle start")?;
                let cost = parse_points(ctx.arg(1), "ticket cost")?;
                let duration =
                    parse_duration_secs(ctx.arg(2), self.svc.config.default_duration_secs)?;
                self.svc.start(ctx.channel, cost, duration).await?;
                Ok(vec![])
            }
            Some("buy") => {
                let count = parse_points(ctx.arg(1), "ticket count")? as u32;
                self.svc.buy(ctx.channel, ctx.chatter, count).await?;
                Ok(vec![])
            }
            Some("end") => {
                require_tier(ctx.tier, UserTier::Moderator, "!raffle end")?;
                self.svc.end_now(ctx.channel).await?;
                Ok(vec![])
            }
            Some("cancel") => {
                require_tier(ctx.tier, UserTier::Moderator, "!raffle cancel")?;
                self.svc.cancel_as(ctx.channel).await?;
                Ok(vec![])
            }
            Some("status") => Ok(vec![self.svc.status_line(ctx.channel).await?]),
            _ => Ok(vec![
                "usage: !raffle start <cost> [secs] | buy <n> | end | cancel | status".to_string(),
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

    fn service(h: &TestHarness) -> RaffleService {
        RaffleService::new(h.ctx.clone(), RaffleConfig::default())
    }

    #[tokio::test]
    async fn winner_takes_the_whole_pot() {
        let h = TestHarness::with_seed(31);
        let svc = service(&h);
        let alice = h.chatter(CHAN, "alice", 1000);
        let bob = h.chatter(CHAN, "bob", 1000);

        svc.start(CHAN, 10, 3600).await.unwrap();
        svc.buy(CHAN, &alice, 3).await.unwrap();
        svc.buy(CHAN, &bob, 7).await.unwrap();

        svc.end_now(CHAN).await.unwrap();

        let a = h.ledger.get_points(CHAN, alice.user_id).await.unwrap();
        let b = h.ledger.get_points(CHAN, bob.user_id).await.unwrap();
        // 100-point pot lands entirely on one of them.
        assert_eq!(a + b, 2000);
        assert!(a == 1070 || b == 1030, "pot went somewhere unexpected: {} / {}", a, b);
        assert_eq!(h.ledger.net_for_reason("raffle:"), 0);
        assert!(svc.load(CHAN).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn timer_and_moderator_end_race_is_single_settlement() {
        let h = TestHarness::with_seed(32);
        let svc = service(&h);
        let alice = h.chatter(CHAN, "alice", 1000);

        svc.start(CHAN, 10, 3600).await.unwrap();
        svc.buy(CHAN, &alice, 5).await.unwrap();

        svc.end_now(CHAN).await.unwrap();
        // A stale timer firing afterwards must not settle again.
        svc.advance(CHAN).await.unwrap();

        assert_eq!(h.ledger.get_points(CHAN, alice.user_id).await.unwrap(), 1000);
        let wins: usize = h
            .emitter
            .texts_for(CHAN)
            .iter()
            .filter(|t| t.contains("wins the raffle"))
            .count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn empty_raffle_closes_quietly() {
        let h = TestHarness::with_seed(33);
        let svc = service(&h);
        svc.start(CHAN, 10, 3600).await.unwrap();
        svc.end_now(CHAN).await.unwrap();
        assert!(h.emitter.contains("no tickets sold"));
        assert!(svc.load(CHAN).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_refunds_each_buyer_exactly_once() {
        let h = TestHarness::with_seed(34);
        let svc = service(&h);
        let alice = h.chatter(CHAN, "alice", 1000);
        let bob = h.chatter(CHAN, "bob", 1000);

        svc.start(CHAN, 25, 3600).await.unwrap();
        svc.buy(CHAN, &alice, 4).await.unwrap();
        svc.buy(CHAN, &bob, 2).await.unwrap();

        assert!(svc.cancel(CHAN).await.unwrap());
        assert!(!svc.cancel(CHAN).await.unwrap());

        assert_eq!(h.ledger.get_points(CHAN, alice.user_id).await.unwrap(), 1000);
        assert_eq!(h.ledger.get_points(CHAN, bob.user_id).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn ticket_cap_is_enforced() {
        let h = TestHarness::with_seed(35);
        let svc = RaffleService::new(
            h.ctx.clone(),
            RaffleConfig {
                max_tickets_per_user: 5,
                ..RaffleConfig::default()
            },
        );
        let alice = h.chatter(CHAN, "alice", 1000);

        svc.start(CHAN, 10, 3600).await.unwrap();
        svc.buy(CHAN, &alice, 4).await.unwrap();
        let err = svc.buy(CHAN, &alice, 2).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
        assert_eq!(h.ledger.get_points(CHAN, alice.user_id).await.unwrap(), 960);
    }
}
