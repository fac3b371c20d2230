//! !boss: the channel gangs up on a persistent, levelling boss.
//!
//! Recruiting works like a heist; once the battle begins, rounds fire on an
//! interval and every fighter contributes randomized damage to a shared
//! health pool. Killing the boss pays every fighter and raises the boss
//! level for the next battle (the level lives under its own store key so it
//! survives across battles); hitting the round cap loses the stakes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use rumblebot_common::models::{
    ActivityKind, ActivityRecord, ActivityState, BossBattleState, Chatter, CommandSpec,
    CrewStatus, Fighter, UserTier,
};
use rumblebot_common::traits::activity_traits::GroupActivity;
use rumblebot_common::Error;

use crate::services::dispatcher::{CommandContext, CommandHandler};
use crate::services::games::{parse_points, scaled, GameContext};

#[derive(Debug, Clone)]
pub struct BossBattleConfig {
    pub min_stake: i64,
    pub recruit_secs: u64,
    pub round_interval_secs: u64,
    pub max_rounds: u32,
    pub base_health: i64,
    pub health_per_fighter: i64,
    /// Extra health per boss level above 1, as a fraction of the base pool.
    pub level_health_step: f64,
    pub damage_min: i64,
    pub damage_max: i64,
    pub payout_min: f64,
    pub payout_max: f64,
}

impl Default for BossBattleConfig {
    fn default() -> Self {
        Self {
            min_stake: 20,
            recruit_secs: 60,
            round_interval_secs: 15,
            max_rounds: 5,
            base_health: 600,
            health_per_fighter: 150,
            level_health_step: 0.25,
            damage_min: 40,
            damage_max: 120,
            payout_min: 1.5,
            payout_max: 2.5,
        }
    }
}

#[derive(Clone)]
pub struct BossBattleService {
    ctx: Arc<GameContext>,
    config: BossBattleConfig,
}

impl BossBattleService {
    pub fn new(ctx: Arc<GameContext>, config: BossBattleConfig) -> Self {
        Self { ctx, config }
    }

    pub async fn start(&self, channel: &str, chatter: &Chatter, stake: i64) -> Result<(), Error> {
        if stake < self.config.min_stake {
            return Err(Error::InvalidParams(format!(
                "boss battle stake must be at least {} points.",
                self.config.min_stake
            )));
        }
        if self.load(channel).await?.is_some() {
            return Err(Error::AlreadyActive(
                "a boss battle is already underway.".to_string(),
            ));
        }

        self.ctx
            .charge(channel, chatter.user_id, stake, "boss:stake")
            .await?;

        let level = self.boss_level(channel).await?;
        let now = Utc::now();
        let recruit_until = now + chrono::Duration::seconds(self.config.recruit_secs as i64);
        let record = ActivityRecord::new(
            channel,
            now,
            ActivityState::BossBattle(BossBattleState {
                status: CrewStatus::Recruiting,
                crew: vec![Fighter {
                    user_id: chatter.user_id,
                    login: chatter.login.clone(),
                    stake,
                    damage_dealt: 0,
                }],
                recruit_until,
                level,
                health: 0,
                max_health: 0,
                round: 0,
                next_round_at: None,
            }),
        );
        self.ctx.activities.save(&record).await?;
        self.schedule_advance(channel, Duration::from_secs(self.config.recruit_secs));

        self.ctx
            .say(
                channel,
                &format!(
                    "🐲 a level {} boss approaches! Type !boss join <stake> within {}s to fight.",
                    level, self.config.recruit_secs
                ),
            )
            .await;
        Ok(())
    }

    pub async fn join(&self, channel: &str, chatter: &Chatter, stake: i64) -> Result<(), Error> {
        let battle = match self.load(channel).await? {
            Some(b) => b,
            None => {
                return Err(Error::NotFound(
                    "no boss battle is forming right now.".to_string(),
                ))
            }
        };
        if battle.status != CrewStatus::Recruiting || Utc::now() > battle.recruit_until {
            return Err(Error::WrongStatus("the battle has already begun.".to_string()));
        }
        if battle.has_fighter(chatter.user_id) {
            return Err(Error::AlreadyJoined("you are already in the fight.".to_string()));
        }
        if stake < self.config.min_stake {
            return Err(Error::InvalidParams(format!(
                "boss battle stake must be at least {} points.",
                self.config.min_stake
            )));
        }

        self.ctx
            .charge(channel, chatter.user_id, stake, "boss:stake")
            .await?;

        let mut record = match self
            .ctx
            .activities
            .load(ActivityKind::BossBattle, channel)
            .await?
        {
            Some(r) => r,
            None => {
                self.ctx
                    .payout(channel, chatter.user_id, stake, "boss:refund")
                    .await?;
                debug!("boss battle in '{}' vanished mid-join; stake returned", channel);
                return Ok(());
            }
        };
        match &mut record.state {
            ActivityState::BossBattle(b)
                if b.status == CrewStatus::Recruiting && !b.has_fighter(chatter.user_id) =>
            {
                b.crew.push(Fighter {
                    user_id: chatter.user_id,
                    login: chatter.login.clone(),
                    stake,
                    damage_dealt: 0,
                });
                let crew_size = b.crew.len();
                self.ctx.activities.save(&record).await?;
                self.ctx
                    .say(
                        channel,
                        &format!("@{} joins the fight — {} fighters ready.", chatter.login, crew_size),
                    )
                    .await;
            }
            _ => {
                self.ctx
                    .payout(channel, chatter.user_id, stake, "boss:refund")
                    .await?;
                debug!("boss join precondition lost in '{}'; stake returned", channel);
            }
        }
        Ok(())
    }

    pub async fn cancel_as(
        &self,
        channel: &str,
        chatter: &Chatter,
        tier: UserTier,
    ) -> Result<(), Error> {
        let battle = match self.load(channel).await? {
            Some(b) => b,
            None => {
                return Err(Error::NotFound(
                    "no boss battle is running right now.".to_string(),
                ))
            }
        };
        let is_initiator = battle
            .crew
            .first()
            .map(|f| f.user_id == chatter.user_id)
            .unwrap_or(false);
        let allowed = match battle.status {
            CrewStatus::Recruiting => is_initiator || tier.satisfies(UserTier::Moderator),
            // Once the fight is on, only a moderator can pull the plug.
            CrewStatus::Active => tier.satisfies(UserTier::Moderator),
        };
        if !allowed {
            return Err(Error::InvalidParams(
                "you cannot call off this boss battle.".to_string(),
            ));
        }
        self.cancel(channel).await?;
        Ok(())
    }

    pub async fn status_line(&self, channel: &str) -> Result<String, Error> {
        match self.load(channel).await? {
            Some(b) => match b.status {
                CrewStatus::Recruiting => {
                    let left = (b.recruit_until - Utc::now()).num_seconds().max(0);
                    Ok(format!(
                        "level {} boss battle forming: {} fighters, pot {}, {}s to join.",
                        b.level,
                        b.crew.len(),
                        b.pot(),
                        left
                    ))
                }
                CrewStatus::Active => Ok(format!(
                    "round {}/{} — boss at {}/{} HP, {} fighters.",
                    b.round,
                    self.config.max_rounds,
                    b.health.max(0),
                    b.max_health,
                    b.crew.len()
                )),
            },
            None => Ok("no boss battle is running.".to_string()),
        }
    }

    /// Current boss level for the channel; defaults to 1.
    pub async fn boss_level(&self, channel: &str) -> Result<u32, Error> {
        let key = level_key(channel);
        match self.ctx.activities.backing().get(&key).await? {
            Some(bytes) => Ok(std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(1)),
            None => Ok(1),
        }
    }

    async fn save_boss_level(&self, channel: &str, level: u32) -> Result<(), Error> {
        self.ctx
            .activities
            .backing()
            .set(&level_key(channel), level.to_string().into_bytes())
            .await
    }

    async fn run_round(&self, channel: &str, record: &mut ActivityRecord) -> Result<(), Error> {
        let battle = match &mut record.state {
            ActivityState::BossBattle(b) => b,
            _ => return Ok(()),
        };
        battle.round += 1;
        let mut round_damage = 0i64;
        for fighter in &mut battle.crew {
            let dmg = self.ctx.roll(self.config.damage_min..=self.config.damage_max);
            fighter.damage_dealt += dmg;
            round_damage += dmg;
        }
        battle.health -= round_damage;

        if battle.health <= 0 {
            // Victory: everyone gets paid, the boss levels up.
            let multiplier = self.ctx.roll_f64(self.config.payout_min, self.config.payout_max);
            let crew = battle.crew.clone();
            let level = battle.level;
            for fighter in &crew {
                self.ctx
                    .payout(
                        channel,
                        fighter.user_id,
                        scaled(fighter.stake, multiplier),
                        "boss:payout",
                    )
                    .await?;
            }
            self.save_boss_level(channel, level + 1).await?;
            self.remove(channel).await?;

            let mvp = crew
                .iter()
                .max_by_key(|f| f.damage_dealt)
                .map(|f| format!("@{} ({} dmg)", f.login, f.damage_dealt))
                .unwrap_or_default();
            self.ctx
                .say(
                    channel,
                    &format!(
                        "🏆 the level {} boss goes down after {} damage this round! MVP: {}. Stakes paid out at {:.1}x.",
                        level, round_damage, mvp, multiplier
                    ),
                )
                .await;
            return Ok(());
        }

        if battle.round >= self.config.max_rounds {
            let level = battle.level;
            self.remove(channel).await?;
            self.ctx
                .say(
                    channel,
                    &format!(
                        "💀 the level {} boss shrugs off the assault — the crew is wiped and the stakes are lost.",
                        level
                    ),
                )
                .await;
            return Ok(());
        }

        let now = Utc::now();
        battle.next_round_at =
            Some(now + chrono::Duration::seconds(self.config.round_interval_secs as i64));
        let (round, health, max_health) = (battle.round, battle.health, battle.max_health);
        self.ctx.activities.save(record).await?;
        self.ctx
            .say(
                channel,
                &format!(
                    "⚔️ round {}: {} damage dealt — boss at {}/{} HP.",
                    round, round_damage, health, max_health
                ),
            )
            .await;
        self.schedule_advance(channel, Duration::from_secs(self.config.round_interval_secs));
        Ok(())
    }

    async fn load(&self, channel: &str) -> Result<Option<BossBattleState>, Error> {
        match self
            .ctx
            .activities
            .load(ActivityKind::BossBattle, channel)
            .await?
        {
            Some(record) => match record.state {
                ActivityState::BossBattle(b) => Ok(Some(b)),
                _ => Err(Error::Store(format!(
                    "boss battle record corrupt for '{}'",
                    channel
                ))),
            },
            None => Ok(None),
        }
    }

    async fn remove(&self, channel: &str) -> Result<(), Error> {
        self.ctx
            .activities
            .remove(ActivityKind::BossBattle, channel)
            .await?;
        self.ctx
            .scheduler
            .cancel(&ActivityKind::BossBattle.storage_key(channel));
        Ok(())
    }

    fn schedule_advance(&self, channel: &str, delay: Duration) {
        let svc = self.clone();
        let chan = channel.to_string();
        self.ctx.scheduler.schedule(
            &ActivityKind::BossBattle.storage_key(channel),
            delay,
            async move {
                if let Err(e) = svc.advance(&chan).await {
                    warn!("scheduled boss advance for '{}' failed: {:?}", chan, e);
                }
            },
        );
    }
}

fn level_key(channel: &str) -> String {
    format!("bosslevel:{}", channel.to_lowercase())
}

#[async_trait]
impl GroupActivity for BossBattleService {
    fn kind(&self) -> ActivityKind {
        ActivityKind::BossBattle
    }

    async fn advance(&self, channel: &str) -> Result<(), Error> {
        let mut record = match self
            .ctx
            .activities
            .load(ActivityKind::BossBattle, channel)
            .await?
        {
            Some(r) => r,
            None => return Ok(()),
        };
        let battle = match &mut record.state {
            ActivityState::BossBattle(b) => b,
            _ => return Ok(()),
        };
        let now = Utc::now();
        match battle.status {
            CrewStatus::Recruiting => {
                if now < battle.recruit_until {
                    debug!("boss timer for '{}' fired early; ignoring", channel);
                    return Ok(());
                }
                let base = self.config.base_health
                    + self.config.health_per_fighter * battle.crew.len() as i64;
                let max_health = (base as f64
                    * (1.0 + self.config.level_health_step * battle.level.saturating_sub(1) as f64))
                    .round() as i64;
                battle.status = CrewStatus::Active;
                battle.health = max_health;
                battle.max_health = max_health;
                battle.next_round_at =
                    Some(now + chrono::Duration::seconds(self.config.round_interval_secs as i64));
                let (level, crew_size) = (battle.level, battle.crew.len());
                self.ctx.activities.save(&record).await?;
                self.ctx
                    .say(
                        channel,
                        &format!(
                            "⚔️ the level {} boss wades in with {} HP against {} fighters!",
                            level, max_health, crew_size
                        ),
                    )
                    .await;
                self.schedule_advance(channel, Duration::from_secs(self.config.round_interval_secs));
                Ok(())
            }
            CrewStatus::Active => {
                if let Some(next) = battle.next_round_at {
                    if now < next {
                        debug!("boss round timer for '{}' fired early; ignoring", channel);
                        return Ok(());
                    }
                }
                self.run_round(channel, &mut record).await
            }
        }
    }

    async fn cancel(&self, channel: &str) -> Result<bool, Error> {
        let battle = match self.load(channel).await? {
            Some(b) => b,
            None => return Ok(false),
        };
        let refunds: Vec<(uuid::Uuid, i64)> =
            battle.crew.iter().map(|f| (f.user_id, f.stake)).collect();
        self.remove(channel).await?;
        self.ctx.refund_all(channel, &refunds, "boss:refund").await;
        self.ctx
            .say(channel, "the boss battle was called off — all stakes refunded.")
            .await;
        Ok(true)
    }
}

static BOSS_SPEC: CommandSpec = CommandSpec::new("boss", &["bossbattle"], UserTier::Everyone, 30);

pub struct BossBattleCommand {
    svc: BossBattleService,
}

impl BossBattleCommand {
    pub fn new(svc: BossBattleService) -> Self {
        Self { svc }
    }
}

#[async_trait]
impl CommandHandler for BossBattleCommand {
    fn spec(&self) -> &CommandSpec {
        &BOSS_SPEC
    }

    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Vec<String>, Error> {
        match ctx.arg(0) {
            Some("start") => {
                let stake = parse_points(ctx.arg(1), "stake")?;
                self.svc.start(ctx.channel, ctx.chatter, stake).await?;
                Ok(vec![])
            }
            Some("join") => {
                let stake = parse_points(ctx.arg(1), "stake")?;
                self.svc.join(ctx.channel, ctx.chatter, stake).await?;
                Ok(vec![])
            }
            Some("cancel") => {
                self.svc.cancel_as(ctx.channel, ctx.chatter, ctx.tier).await?;
                Ok(vec![])
            }
            Some("level") => {
                let level = self.svc.boss_level(ctx.channel).await?;
                Ok(vec![format!("the boss is currently level {}.", level)])
            }
            Some("status") => Ok(vec![self.svc.status_line(ctx.channel).await?]),
            _ => Ok(vec![
                "usage: !boss start <stake> | join <stake> | cancel | level | status".to_string(),
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

    fn service(h: &TestHarness, config: BossBattleConfig) -> BossBattleService {
        BossBattleService::new(h.ctx.clone(), config)
    }

    /// Rewind the stored deadline so the next advance call acts now,
    /// without racing the real timer (which stays far in the future).
    async fn rewind_deadlines(h: &TestHarness) {
        let mut record = h
            .ctx
            .activities
            .load(ActivityKind::BossBattle, CHAN)
            .await
            .unwrap()
            .unwrap();
        if let ActivityState::BossBattle(b) = &mut record.state {
            let past = Utc::now() - chrono::Duration::seconds(1);
            b.recruit_until = past;
            if b.next_round_at.is_some() {
                b.next_round_at = Some(past);
            }
        }
        h.ctx.activities.save(&record).await.unwrap();
    }

    fn long_windows() -> BossBattleConfig {
        BossBattleConfig {
            recruit_secs: 3600,
            round_interval_secs: 3600,
            ..BossBattleConfig::default()
        }
    }

    #[tokio::test]
    async fn battle_runs_rounds_until_victory_and_levels_up() {
        let h = TestHarness::with_seed(21);
        // Tiny boss so two fighters kill it within the round cap.
        let config = BossBattleConfig {
            base_health: 100,
            health_per_fighter: 10,
            max_rounds: 10,
            ..long_windows()
        };
        let svc = service(&h, config);
        let alice = h.chatter(CHAN, "alice", 1000);
        let bob = h.chatter(CHAN, "bob", 1000);

        svc.start(CHAN, &alice, 100).await.unwrap();
        svc.join(CHAN, &bob, 100).await.unwrap();

        rewind_deadlines(&h).await;
        svc.advance(CHAN).await.unwrap(); // recruiting -> active

        let battle = svc.load(CHAN).await.unwrap().unwrap();
        assert_eq!(battle.status, CrewStatus::Active);
        assert_eq!(battle.health, battle.max_health);

        // Two fighters deal 80..=240 per round against 120 HP; at most two
        // rounds are needed.
        for _ in 0..3 {
            if svc.load(CHAN).await.unwrap().is_none() {
                break;
            }
            rewind_deadlines(&h).await;
            svc.advance(CHAN).await.unwrap();
        }

        assert!(svc.load(CHAN).await.unwrap().is_none(), "battle should have resolved");
        assert_eq!(svc.boss_level(CHAN).await.unwrap(), 2);
        assert!(h.emitter.contains("goes down"));

        // Victory pays between 1.5x and 2.5x of each 100-point stake.
        let a = h.ledger.get_points(CHAN, alice.user_id).await.unwrap();
        let b = h.ledger.get_points(CHAN, bob.user_id).await.unwrap();
        assert!((1050..=1150).contains(&a), "alice balance {}", a);
        assert!((1050..=1150).contains(&b), "bob balance {}", b);
    }

    #[tokio::test]
    async fn round_cap_defeat_keeps_level_and_pays_nothing() {
        let h = TestHarness::with_seed(22);
        let config = BossBattleConfig {
            base_health: 1_000_000,
            max_rounds: 2,
            ..long_windows()
        };
        let svc = service(&h, config);
        let alice = h.chatter(CHAN, "alice", 500);

        svc.start(CHAN, &alice, 100).await.unwrap();
        rewind_deadlines(&h).await;
        svc.advance(CHAN).await.unwrap();
        for _ in 0..2 {
            rewind_deadlines(&h).await;
            svc.advance(CHAN).await.unwrap();
        }

        assert!(svc.load(CHAN).await.unwrap().is_none());
        assert_eq!(svc.boss_level(CHAN).await.unwrap(), 1);
        assert_eq!(h.ledger.get_points(CHAN, alice.user_id).await.unwrap(), 400);
        assert!(h.emitter.contains("wiped"));
    }

    #[tokio::test]
    async fn fighters_damage_tally_accumulates() {
        let h = TestHarness::with_seed(23);
        let config = BossBattleConfig {
            base_health: 1_000_000,
            max_rounds: 10,
            ..long_windows()
        };
        let svc = service(&h, config.clone());
        let alice = h.chatter(CHAN, "alice", 500);

        svc.start(CHAN, &alice, 100).await.unwrap();
        rewind_deadlines(&h).await;
        svc.advance(CHAN).await.unwrap();
        rewind_deadlines(&h).await;
        svc.advance(CHAN).await.unwrap();

        let battle = svc.load(CHAN).await.unwrap().unwrap();
        let dealt = battle.crew[0].damage_dealt;
        assert!(dealt >= config.damage_min && dealt <= config.damage_max);
        assert_eq!(battle.max_health - battle.health, dealt);
    }

    #[tokio::test]
    async fn mid_battle_cancel_refunds_every_stake_once() {
        let h = TestHarness::with_seed(24);
        let svc = service(&h, long_windows());
        let alice = h.chatter(CHAN, "alice", 1000);
        let bob = h.chatter(CHAN, "bob", 1000);

        svc.start(CHAN, &alice, 200).await.unwrap();
        svc.join(CHAN, &bob, 300).await.unwrap();
        rewind_deadlines(&h).await;
        svc.advance(CHAN).await.unwrap(); // now active

        assert!(svc.cancel(CHAN).await.unwrap());
        assert!(!svc.cancel(CHAN).await.unwrap());
        assert_eq!(h.ledger.get_points(CHAN, alice.user_id).await.unwrap(), 1000);
        assert_eq!(h.ledger.get_points(CHAN, bob.user_id).await.unwrap(), 1000);
        assert_eq!(h.ledger.net_for_reason("boss:"), 0);
    }
}
