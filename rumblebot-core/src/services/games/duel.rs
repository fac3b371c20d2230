//! !duel: a one-on-one wager resolved by opposed rolls.
//!
//! A challenge sits in the store awaiting the target's response; nothing is
//! escrowed until acceptance, so an unanswered or cancelled challenge never
//! locks anyone's points. On acceptance both stakes are debited, each side
//! rolls 1..=100 (ties re-rolled) and the winner takes the doubled stake.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use rumblebot_common::models::{
    ActivityKind, ActivityRecord, ActivityState, Chatter, CommandSpec, DuelState, UserTier,
};
use rumblebot_common::traits::activity_traits::GroupActivity;
use rumblebot_common::Error;

use crate::services::dispatcher::{CommandContext, CommandHandler};
use crate::services::games::{parse_points, GameContext};

#[derive(Debug, Clone)]
pub struct DuelConfig {
    pub min_stake: i64,
    pub response_window_secs: u64,
}

impl Default for DuelConfig {
    fn default() -> Self {
        Self {
            min_stake: 10,
            response_window_secs: 120,
        }
    }
}

#[derive(Clone)]
pub struct DuelService {
    ctx: Arc<GameContext>,
    config: DuelConfig,
}

impl DuelService {
    pub fn new(ctx: Arc<GameContext>, config: DuelConfig) -> Self {
        Self { ctx, config }
    }

    pub async fn challenge(
        &self,
        channel: &str,
        challenger: &Chatter,
        target_login: &str,
        stake: i64,
    ) -> Result<(), Error> {
        let target_login = target_login.trim_start_matches('@').to_lowercase();
        if target_login.is_empty() {
            return Err(Error::InvalidParams("usage: !duel <target> <stake>".to_string()));
        }
        if target_login == challenger.login {
            return Err(Error::InvalidParams("you cannot duel yourself.".to_string()));
        }
        if stake < self.config.min_stake {
            return Err(Error::InvalidParams(format!(
                "duel stake must be at least {} points.",
                self.config.min_stake
            )));
        }

        if self.load(channel).await?.is_some() {
            return Err(Error::AlreadyActive(
                "a duel challenge is already pending in this channel.".to_string(),
            ));
        }

        // No escrow yet, but refuse challenges the challenger clearly
        // cannot honor.
        let balance = self.ctx.balance(channel, challenger.user_id).await?;
        if balance < stake {
            return Err(Error::InsufficientPoints {
                needed: stake,
                available: balance,
            });
        }

        let now = Utc::now();
        let responds_by = now + chrono::Duration::seconds(self.config.response_window_secs as i64);
        let record = ActivityRecord::new(
            channel,
            now,
            ActivityState::Duel(DuelState {
                challenger_id: challenger.user_id,
                challenger_login: challenger.login.clone(),
                target_login: target_login.clone(),
                stake,
                responds_by,
            }),
        );
        self.ctx.activities.save(&record).await?;
        self.schedule_expiry(channel);

        self.ctx
            .say(
                channel,
                &format!(
                    "⚔️ @{} challenges @{} to a duel for {} points! Type !duel accept or !duel decline within {}s.",
                    challenger.login, target_login, stake, self.config.response_window_secs
                ),
            )
            .await;
        Ok(())
    }

    pub async fn accept(&self, channel: &str, chatter: &Chatter) -> Result<(), Error> {
        let duel = match self.load(channel).await? {
            Some(d) => d,
            None => {
                return Err(Error::NotFound(
                    "no duel challenge is waiting right now.".to_string(),
                ))
            }
        };
        if chatter.login != duel.target_login {
            return Err(Error::InvalidParams(format!(
                "this challenge is for @{}.",
                duel.target_login
            )));
        }
        if Utc::now() > duel.responds_by {
            // The timer lost the race; expire in place.
            self.remove(channel).await?;
            self.ctx
                .say(channel, &format!("the duel challenge from @{} already expired.", duel.challenger_login))
                .await;
            return Ok(());
        }

        // Escrow both stakes. The challenger was checked at challenge time
        // but may have spent points since, so both debits can still fail;
        // a half-applied escrow is rolled back before voiding.
        if let Err(e) = self
            .ctx
            .charge(channel, chatter.user_id, duel.stake, "duel:escrow")
            .await
        {
            if matches!(e, Error::InsufficientPoints { .. }) {
                self.void(channel, &format!("@{} cannot cover the stake — duel voided.", chatter.login))
                    .await?;
                return Ok(());
            }
            return Err(e);
        }
        if let Err(e) = self
            .ctx
            .charge(channel, duel.challenger_id, duel.stake, "duel:escrow")
            .await
        {
            self.ctx
                .payout(channel, chatter.user_id, duel.stake, "duel:refund")
                .await?;
            if matches!(e, Error::InsufficientPoints { .. }) {
                self.void(
                    channel,
                    &format!(
                        "@{} no longer has {} points — duel voided.",
                        duel.challenger_login, duel.stake
                    ),
                )
                .await?;
                return Ok(());
            }
            return Err(e);
        }

        // Opposed rolls; integer draws can collide, so re-roll ties.
        let (challenger_roll, target_roll) = loop {
            let a = self.ctx.roll(1..=100);
            let b = self.ctx.roll(1..=100);
            if a != b {
                break (a, b);
            }
        };
        let (winner_id, winner_login) = if challenger_roll > target_roll {
            (duel.challenger_id, duel.challenger_login.clone())
        } else {
            (chatter.user_id, chatter.login.clone())
        };

        self.remove(channel).await?;
        self.ctx
            .payout(channel, winner_id, duel.stake * 2, "duel:win")
            .await?;
        self.ctx
            .say(
                channel,
                &format!(
                    "⚔️ @{} rolls {} — @{} rolls {}. @{} takes the pot of {} points!",
                    duel.challenger_login,
                    challenger_roll,
                    chatter.login,
                    target_roll,
                    winner_login,
                    duel.stake * 2
                ),
            )
            .await;
        Ok(())
    }

    pub async fn decline(&self, channel: &str, chatter: &Chatter) -> Result<(), Error> {
        let duel = match self.load(channel).await? {
            Some(d) => d,
            None => {
                return Err(Error::NotFound(
                    "no duel challenge is waiting right now.".to_string(),
                ))
            }
        };
        if chatter.login != duel.target_login {
            return Err(Error::InvalidParams(format!(
                "this challenge is for @{}.",
                duel.target_login
            )));
        }
        self.remove(channel).await?;
        self.ctx
            .say(
                channel,
                &format!("@{} declines the duel from @{}.", chatter.login, duel.challenger_login),
            )
            .await;
        Ok(())
    }

    /// Cancel by the challenger (or a moderator). Nothing was escrowed, so
    /// there is nothing to refund.
    pub async fn cancel_as(
        &self,
        channel: &str,
        chatter: &Chatter,
        tier: UserTier,
    ) -> Result<(), Error> {
        let duel = match self.load(channel).await? {
            Some(d) => d,
            None => {
                return Err(Error::NotFound(
                    "no duel challenge is waiting right now.".to_string(),
                ))
            }
        };
        if chatter.user_id != duel.challenger_id && !tier.satisfies(UserTier::Moderator) {
            return Err(Error::InvalidParams(format!(
                "only @{} or a moderator can cancel this challenge.",
                duel.challenger_login
            )));
        }
        self.remove(channel).await?;
        self.ctx
            .say(channel, &format!("the duel challenge from @{} was cancelled.", duel.challenger_login))
            .await;
        Ok(())
    }

    pub async fn status_line(&self, channel: &str) -> Result<String, Error> {
        match self.load(channel).await? {
            Some(d) => {
                let left = (d.responds_by - Utc::now()).num_seconds().max(0);
                Ok(format!(
                    "@{} has challenged @{} for {} points — {}s left to answer.",
                    d.challenger_login, d.target_login, d.stake, left
                ))
            }
            None => Ok("no duel challenge is pending.".to_string()),
        }
    }

    async fn load(&self, channel: &str) -> Result<Option<DuelState>, Error> {
        match self.ctx.activities.load(ActivityKind::Duel, channel).await? {
            Some(record) => match record.state {
                ActivityState::Duel(d) => Ok(Some(d)),
                _ => Err(Error::Store(format!("duel record corrupt for '{}'", channel))),
            },
            None => Ok(None),
        }
    }

    async fn remove(&self, channel: &str) -> Result<(), Error> {
        self.ctx.activities.remove(ActivityKind::Duel, channel).await?;
        self.ctx
            .scheduler
            .cancel(&ActivityKind::Duel.storage_key(channel));
        Ok(())
    }

    async fn void(&self, channel: &str, message: &str) -> Result<(), Error> {
        self.remove(channel).await?;
        self.ctx.say(channel, message).await;
        Ok(())
    }

    fn schedule_expiry(&self, channel: &str) {
        let svc = self.clone();
        let chan = channel.to_string();
        self.ctx.scheduler.schedule(
            &ActivityKind::Duel.storage_key(channel),
            Duration::from_secs(self.config.response_window_secs),
            async move {
                if let Err(e) = svc.advance(&chan).await {
                    warn!("duel expiry for '{}' failed: {:?}", chan, e);
                }
            },
        );
    }
}

#[async_trait]
impl GroupActivity for DuelService {
    fn kind(&self) -> ActivityKind {
        ActivityKind::Duel
    }

    /// Expire an unanswered challenge. Verifies the stored deadline, so a
    /// stale or early firing is a no-op.
    async fn advance(&self, channel: &str) -> Result<(), Error> {
        let duel = match self.load(channel).await? {
            Some(d) => d,
            None => return Ok(()),
        };
        if Utc::now() < duel.responds_by {
            debug!("duel timer for '{}' fired early; ignoring", channel);
            return Ok(());
        }
        self.remove(channel).await?;
        self.ctx
            .say(
                channel,
                &format!(
                    "@{} never answered — the duel challenge from @{} expired.",
                    duel.target_login, duel.challenger_login
                ),
            )
            .await;
        Ok(())
    }

    async fn cancel(&self, channel: &str) -> Result<bool, Error> {
        if self.load(channel).await?.is_none() {
            return Ok(false);
        }
        self.remove(channel).await?;
        Ok(true)
    }
}

static DUEL_SPEC: CommandSpec = CommandSpec::new("duel", &[], UserTier::Everyone, 15);

pub struct DuelCommand {
    svc: DuelService,
}

impl DuelCommand {
    pub fn new(svc: DuelService) -> Self {
        Self { svc }
    }
}

#[async_trait]
impl CommandHandler for DuelCommand {
    fn spec(&self) -> &CommandSpec {
        &DUEL_SPEC
    }

    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Vec<String>, Error> {
        match ctx.arg(0) {
            Some("accept") => {
                self.svc.accept(ctx.channel, ctx.chatter).await?;
                Ok(vec![])
            }
            Some("decline") => {
                self.svc.decline(ctx.channel, ctx.chatter).await?;
                Ok(vec![])
            }
            Some("cancel") => {
                self.svc.cancel_as(ctx.channel, ctx.chatter, ctx.tier).await?;
                Ok(vec![])
            }
            Some("status") => Ok(vec![self.svc.status_line(ctx.channel).await?]),
            Some(target) => {
                let stake = parse_points(ctx.arg(1), "stake")?;
                self.svc.challenge(ctx.channel, ctx.chatter, target, stake).await?;
                Ok(vec![])
            }
            None => Ok(vec![
                "usage: !duel <target> <stake> | accept | decline | cancel | status".to_string(),
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

    fn service(h: &TestHarness) -> DuelService {
        DuelService::new(h.ctx.clone(), DuelConfig::default())
    }

    #[tokio::test]
    async fn accepted_duel_pays_double_stake_and_conserves_points() {
        let h = TestHarness::with_seed(7);
        let svc = service(&h);
        let alice = h.chatter(CHAN, "alice", 500);
        let bob = h.chatter(CHAN, "bob", 500);

        svc.challenge(CHAN, &alice, "bob", 100).await.unwrap();
        svc.accept(CHAN, &bob).await.unwrap();

        let a = h.ledger.get_points(CHAN, alice.user_id).await.unwrap();
        let b = h.ledger.get_points(CHAN, bob.user_id).await.unwrap();
        // Exactly one winner, payout 2x stake, nothing created or destroyed.
        assert_eq!(a + b, 1000);
        assert!((a == 600 && b == 400) || (a == 400 && b == 600));
        assert_eq!(h.ledger.net_for_reason("duel:"), 0);

        // Terminal: the record is gone.
        assert!(h
            .ctx
            .activities
            .load(ActivityKind::Duel, CHAN)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn second_challenge_is_rejected_not_overwritten() {
        let h = TestHarness::with_seed(1);
        let svc = service(&h);
        let alice = h.chatter(CHAN, "alice", 500);
        let carol = h.chatter(CHAN, "carol", 500);

        svc.challenge(CHAN, &alice, "bob", 50).await.unwrap();
        let err = svc.challenge(CHAN, &carol, "dave", 50).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyActive(_)));

        // The original challenge is untouched.
        let d = svc.load(CHAN).await.unwrap().unwrap();
        assert_eq!(d.challenger_login, "alice");
    }

    #[tokio::test]
    async fn acceptance_by_broke_target_voids_without_escrow_leak() {
        let h = TestHarness::with_seed(2);
        let svc = service(&h);
        let alice = h.chatter(CHAN, "alice", 500);
        let bob = h.chatter(CHAN, "bob", 30);

        svc.challenge(CHAN, &alice, "bob", 100).await.unwrap();
        svc.accept(CHAN, &bob).await.unwrap();

        // Voided, not silently ignored: the record is gone and no points moved.
        assert!(svc.load(CHAN).await.unwrap().is_none());
        assert_eq!(h.ledger.get_points(CHAN, alice.user_id).await.unwrap(), 500);
        assert_eq!(h.ledger.get_points(CHAN, bob.user_id).await.unwrap(), 30);
        assert!(h.emitter.contains("voided"));
    }

    #[tokio::test]
    async fn expiry_advance_is_idempotent() {
        let h = TestHarness::with_seed(3);
        let svc = DuelService::new(
            h.ctx.clone(),
            DuelConfig {
                response_window_secs: 0,
                ..DuelConfig::default()
            },
        );
        let alice = h.chatter(CHAN, "alice", 500);

        svc.challenge(CHAN, &alice, "bob", 50).await.unwrap();
        svc.advance(CHAN).await.unwrap();
        assert!(svc.load(CHAN).await.unwrap().is_none());

        // Stale timer firing again: nothing happens.
        svc.advance(CHAN).await.unwrap();
        assert_eq!(h.ledger.net_for_reason("duel:"), 0);
    }

    #[tokio::test]
    async fn self_duel_and_low_stake_are_user_errors() {
        let h = TestHarness::with_seed(4);
        let svc = service(&h);
        let alice = h.chatter(CHAN, "alice", 500);

        assert!(matches!(
            svc.challenge(CHAN, &alice, "alice", 100).await.unwrap_err(),
            Error::InvalidParams(_)
        ));
        assert!(matches!(
            svc.challenge(CHAN, &alice, "bob", 5).await.unwrap_err(),
            Error::InvalidParams(_)
        ));
    }
}
