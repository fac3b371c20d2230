//! !giveaway: free entry, one uniform winner, prize paid from the house.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use rumblebot_common::models::{
    ActivityKind, ActivityRecord, ActivityState, Chatter, CommandSpec, Entrant, GiveawayState,
    UserTier,
};
use rumblebot_common::traits::activity_traits::GroupActivity;
use rumblebot_common::Error;

use crate::services::dispatcher::{CommandContext, CommandHandler};
use crate::services::games::{parse_duration_secs, parse_points, require_tier, GameContext};

#[derive(Debug, Clone)]
pub struct GiveawayConfig {
    pub default_duration_secs: u64,
}

impl Default for GiveawayConfig {
    fn default() -> Self {
        Self {
            default_duration_secs: 120,
        }
    }
}

#[derive(Clone)]
pub struct GiveawayService {
    ctx: Arc<GameContext>,
    config: GiveawayConfig,
}

impl GiveawayService {
    pub fn new(ctx: Arc<GameContext>, config: GiveawayConfig) -> Self {
        Self { ctx, config }
    }

    pub async fn start(&self, channel: &str, prize: i64, duration_secs: u64) -> Result<(), Error> {
        if self.load(channel).await?.is_some() {
            return Err(Error::AlreadyActive("a giveaway is already running.".to_string()));
        }
        let now = Utc::now();
        let record = ActivityRecord::new(
            channel,
            now,
            ActivityState::Giveaway(GiveawayState {
                prize,
                ends_at: now + chrono::Duration::seconds(duration_secs as i64),
                entrants: vec![],
            }),
        );
        self.ctx.activities.save(&record).await?;
        self.schedule_draw(channel, Duration::from_secs(duration_secs));

        self.ctx
            .say(
                channel,
                &format!(
                    "🎁 giveaway for {} points! Type !giveaway enter — winner drawn in {}s.",
                    prize, duration_secs
                ),
            )
            .await;
        Ok(())
    }

    pub async fn enter(&self, channel: &str, chatter: &Chatter) -> Result<(), Error> {
        let mut record = match self.ctx.activities.load(ActivityKind::Giveaway, channel).await? {
            Some(r) => r,
            None => return Err(Error::NotFound("no giveaway is running right now.".to_string())),
        };
        match &mut record.state {
            ActivityState::Giveaway(g) => {
                if Utc::now() > g.ends_at {
                    return Err(Error::WrongStatus("entries are closed.".to_string()));
                }
                if g.has_entrant(chatter.user_id) {
                    return Err(Error::AlreadyJoined("you are already entered.".to_string()));
                }
                g.entrants.push(Entrant {
                    user_id: chatter.user_id,
                    login: chatter.login.clone(),
                });
            }
            _ => return Err(Error::Store(format!("giveaway record corrupt for '{}'", channel))),
        }
        self.ctx.activities.save(&record).await
    }

    pub async fn end_now(&self, channel: &str) -> Result<(), Error> {
        if self.load(channel).await?.is_none() {
            return Err(Error::NotFound("no giveaway is running right now.".to_string()));
        }
        self.finish(channel).await
    }

    pub async fn cancel_as(&self, channel: &str) -> Result<(), Error> {
        if !self.cancel(channel).await? {
            return Err(Error::NotFound("no giveaway is running right now.".to_string()));
        }
        Ok(())
    }

    pub async fn status_line(&self, channel: &str) -> Result<String, Error> {
        match self.load(channel).await? {
            Some(g) => {
                let left = (g.ends_at - Utc::now()).num_seconds().max(0);
                Ok(format!(
                    "giveaway for {} points: {} entered, drawing in {}s.",
                    g.prize,
                    g.entrants.len(),
                    left
                ))
            }
            None => Ok("no giveaway is running.".to_string()),
        }
    }

    async fn finish(&self, channel: &str) -> Result<(), Error> {
        let giveaway = match self.load(channel).await? {
            Some(g) => g,
            None => return Ok(()),
        };

        if giveaway.entrants.is_empty() {
            self.remove(channel).await?;
            self.ctx.say(channel, "the giveaway closed with no entries.").await;
            return Ok(());
        }

        let idx = self.ctx.roll(0..=(giveaway.entrants.len() as i64 - 1)) as usize;
        let winner = giveaway.entrants[idx].clone();

        self.remove(channel).await?;
        self.ctx
            .payout(channel, winner.user_id, giveaway.prize, "giveaway:win")
            .await?;
        self.ctx
            .say(
                channel,
                &format!(
                    "🎁 @{} wins the {}-point giveaway out of {} entries!",
                    winner.login,
                    giveaway.prize,
                    giveaway.entrants.len()
                ),
            )
            .await;
        Ok(())
    }

    async fn load(&self, channel: &str) -> Result<Option<GiveawayState>, Error> {
        match self.ctx.activities.load(ActivityKind::Giveaway, channel).await? {
            Some(record) => match record.state {
                ActivityState::Giveaway(g) => Ok(Some(g)),
                _ => Err(Error::Store(format!("giveaway record corrupt for '{}'", channel))),
            },
            None => Ok(None),
        }
    }

    async fn remove(&self, channel: &str) -> Result<(), Error> {
        self.ctx.activities.remove(ActivityKind::Giveaway, channel).await?;
        self.ctx
            .scheduler
            .cancel(&ActivityKind::Giveaway.storage_key(channel));
        Ok(())
    }

    fn schedule_draw(&self, channel: &str, delay: Duration) {
        let svc = self.clone();
        let chan = channel.to_string();
        self.ctx.scheduler.schedule(
            &ActivityKind::Giveaway.storage_key(channel),
            delay,
            async move {
                if let Err(e) = svc.advance(&chan).await {
                    warn!("scheduled giveaway draw for '{}' failed: {:?}", chan, e);
                }
            },
        );
    }
}

#[async_trait]
impl GroupActivity for GiveawayService {
    fn kind(&self) -> ActivityKind {
        ActivityKind::Giveaway
    }

    async fn advance(&self, channel: &str) -> Result<(), Error> {
        let giveaway = match self.load(channel).await? {
            Some(g) => g,
            None => return Ok(()),
        };
        if Utc::now() < giveaway.ends_at {
            debug!("giveaway timer for '{}' fired early; ignoring", channel);
            return Ok(());
        }
        self.finish(channel).await
    }

    /// Nothing is staked on a giveaway, so cancelling just deletes.
    async fn cancel(&self, channel: &str) -> Result<bool, Error> {
        if self.load(channel).await?.is_none() {
            return Ok(false);
        }
        self.remove(channel).await?;
        self.ctx.say(channel, "the giveaway was cancelled.").await;
        Ok(true)
    }
}

static GIVEAWAY_SPEC: CommandSpec = CommandSpec::new("giveaway", &[], UserTier::Everyone, 5);

pub struct GiveawayCommand {
    svc: GiveawayService,
}

impl GiveawayCommand {
    pub fn new(svc: GiveawayService) -> Self {
        Self { svc }
    }
}

#[async_trait]
impl CommandHandler for GiveawayCommand {
    fn spec(&self) -> &CommandSpec {
        &GIVEAWAY_SPEC
    }

    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Vec<String>, Error> {
        match ctx.arg(0) {
            Some("start") => {
                require_tier(ctx.tier, UserTier::Moderator, "!giveaway start")?;
                let prize = parse_points(ctx.arg(1), "prize")?;
                let duration =
                    parse_duration_secs(ctx.arg(2), self.svc.config.default_duration_secs)?;
                self.svc.start(ctx.channel, prize, duration).await?;
                Ok(vec![])
            }
            Some("enter") => {
                self.svc.enter(ctx.channel, ctx.chatter).await?;
                Ok(vec![])
            }
            Some("end") => {
                require_tier(ctx.tier, UserTier::Moderator, "!giveaway end")?;
                self.svc.end_now(ctx.channel).await?;
                Ok(vec![])
            }
            Some("cancel") => {
                require_tier(ctx.tier, UserTier::Moderator, "!giveaway cancel")?;
                self.svc.cancel_as(ctx.channel).await?;
                Ok(vec![])
            }
            Some("status") => Ok(vec![self.svc.status_line(ctx.channel).await?]),
            _ => Ok(vec![
                "usage: !giveaway start <prize> [secs] | enter | end | cancel | status".to_string(),
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

    fn service(h: &TestHarness) -> GiveawayService {
        GiveawayService::new(h.ctx.clone(), GiveawayConfig::default())
    }

    #[tokio::test]
    async fn winner_is_credited_the_prize() {
        let h = TestHarness::with_seed(41);
        let svc = service(&h);
        let alice = h.chatter(CHAN, "alice", 0);
        let bob = h.chatter(CHAN, "bob", 0);

        svc.start(CHAN, 500, 3600).await.unwrap();
        svc.enter(CHAN, &alice).await.unwrap();
        svc.enter(CHAN, &bob).await.unwrap();
        svc.end_now(CHAN).await.unwrap();

        let total = h.ledger.get_points(CHAN, alice.user_id).await.unwrap()
            + h.ledger.get_points(CHAN, bob.user_id).await.unwrap();
        assert_eq!(total, 500);
        assert!(svc.load(CHAN).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_entry_is_rejected() {
        let h = TestHarness::with_seed(42);
        let svc = service(&h);
        let alice = h.chatter(CHAN, "alice", 0);

        svc.start(CHAN, 100, 3600).await.unwrap();
        svc.enter(CHAN, &alice).await.unwrap();
        assert!(matches!(
            svc.enter(CHAN, &alice).await.unwrap_err(),
            Error::AlreadyJoined(_)
        ));
    }

    #[tokio::test]
    async fn double_end_pays_once() {
        let h = TestHarness::with_seed(43);
        let svc = service(&h);
        let alice = h.chatter(CHAN, "alice", 0);

        svc.start(CHAN, 100, 3600).await.unwrap();
        svc.enter(CHAN, &alice).await.unwrap();
        svc.end_now(CHAN).await.unwrap();
        svc.advance(CHAN).await.unwrap();

        assert_eq!(h.ledger.get_points(CHAN, alice.user_id).await.unwrap(), 100);
    }
}
