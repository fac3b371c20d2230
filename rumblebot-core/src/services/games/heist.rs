//! !heist: crew up, stake points, split the take.
//!
//! Three-phase: a 60 second recruiting window (stakes are debited the
//! moment someone joins), one resolution round against a randomly chosen
//! scenario, then the record is deleted. Success odds come from the
//! scenario's range plus a monotonic crew-size bonus; each crew member's
//! outcome is drawn independently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use rumblebot_common::models::{
    ActivityKind, ActivityRecord, ActivityState, Chatter, CommandSpec, CrewMember, CrewStatus,
    HeistState, UserTier,
};
use rumblebot_common::traits::activity_traits::GroupActivity;
use rumblebot_common::Error;

use crate::services::dispatcher::{CommandContext, CommandHandler};
use crate::services::games::{parse_points, scaled, GameContext};

#[derive(Debug, Clone)]
pub struct HeistScenario {
    pub name: String,
    pub success_min: f64,
    pub success_max: f64,
    pub payout_min: f64,
    pub payout_max: f64,
}

#[derive(Debug, Clone)]
pub struct HeistConfig {
    pub min_stake: i64,
    pub recruit_secs: u64,
    /// (crew size threshold, bonus) pairs; the largest threshold not
    /// exceeding the crew size applies. Must be sorted ascending.
    pub crew_bonus: Vec<(usize, f64)>,
    pub scenarios: Vec<HeistScenario>,
}

impl Default for HeistConfig {
    fn default() -> Self {
        Self {
            min_stake: 20,
            recruit_secs: 60,
            crew_bonus: vec![(2, 0.02), (4, 0.05), (7, 0.08), (10, 0.12)],
            scenarios: vec![
                HeistScenario {
                    name: "bank vault".to_string(),
                    success_min: 0.25,
                    success_max: 0.45,
                    payout_min: 2.2,
                    payout_max: 3.0,
                },
                HeistScenario {
                    name: "armored train".to_string(),
                    success_min: 0.35,
                    success_max: 0.55,
                    payout_min: 1.8,
                    payout_max: 2.4,
                },
                HeistScenario {
                    name: "casino floor".to_string(),
                    success_min: 0.45,
                    success_max: 0.65,
                    payout_min: 1.4,
                    payout_max: 1.9,
                },
            ],
        }
    }
}

impl HeistConfig {
    pub fn bonus_for(&self, crew_size: usize) -> f64 {
        self.crew_bonus
            .iter()
            .take_while(|(threshold, _)| crew_size >= *threshold)
            .last()
            .map(|(_, bonus)| *bonus)
            .unwrap_or(0.0)
    }
}

#[derive(Clone)]
pub struct HeistService {
    ctx: Arc<GameContext>,
    config: HeistConfig,
}

impl HeistService {
    pub fn new(ctx: Arc<GameContext>, config: HeistConfig) -> Self {
        Self { ctx, config }
    }

    pub async fn start(&self, channel: &str, chatter: &Chatter, stake: i64) -> Result<(), Error> {
        if stake < self.config.min_stake {
            return Err(Error::InvalidParams(format!(
                "heist stake must be at least {} points.",
                self.config.min_stake
            )));
        }
        if self.load(channel).await?.is_some() {
            return Err(Error::AlreadyActive("a heist is already forming.".to_string()));
        }

        self.ctx
            .charge(channel, chatter.user_id, stake, "heist:stake")
            .await?;

        let now = Utc::now();
        let recruit_until = now + chrono::Duration::seconds(self.config.recruit_secs as i64);
        let record = ActivityRecord::new(
            channel,
            now,
            ActivityState::Heist(HeistState {
                status: CrewStatus::Recruiting,
                crew: vec![CrewMember {
                    user_id: chatter.user_id,
                    login: chatter.login.clone(),
                    stake,
                }],
                recruit_until,
            }),
        );
        self.ctx.activities.save(&record).await?;
        self.schedule_advance(channel, Duration::from_secs(self.config.recruit_secs));

        self.ctx
            .say(
                channel,
                &format!(
                    "🚨 @{} is putting a crew together! Type !heist join <stake> within {}s to get in.",
                    chatter.login, self.config.recruit_secs
                ),
            )
            .await;
        Ok(())
    }

    pub async fn join(&self, channel: &str, chatter: &Chatter, stake: i64) -> Result<(), Error> {
        let heist = match self.load(channel).await? {
            Some(h) => h,
            None => return Err(Error::NotFound("no heist is forming right now.".to_string())),
        };
        if heist.status != CrewStatus::Recruiting || Utc::now() > heist.recruit_until {
            return Err(Error::WrongStatus("the heist is already underway.".to_string()));
        }
        if heist.has_member(chatter.user_id) {
            return Err(Error::AlreadyJoined("you are already on the crew.".to_string()));
        }
        if stake < self.config.min_stake {
            return Err(Error::InvalidParams(format!(
                "heist stake must be at least {} points.",
                self.config.min_stake
            )));
        }

        self.ctx
            .charge(channel, chatter.user_id, stake, "heist:stake")
            .await?;

        // Read-verify-write: the record may have moved on while the debit
        // was in flight. If the precondition no longer holds, put the
        // points back and abort quietly.
        let mut record = match self.ctx.activities.load(ActivityKind::Heist, channel).await? {
            Some(r) => r,
            None => {
                self.ctx
                    .payout(channel, chatter.user_id, stake, "heist:refund")
                    .await?;
                debug!("heist in '{}' vanished mid-join; stake returned", channel);
                return Ok(());
            }
        };
        match &mut record.state {
            ActivityState::Heist(h)
                if h.status == CrewStatus::Recruiting && !h.has_member(chatter.user_id) =>
            {
                h.crew.push(CrewMember {
                    user_id: chatter.user_id,
                    login: chatter.login.clone(),
                    stake,
                });
                let crew_size = h.crew.len();
                let pot = h.pot();
                self.ctx.activities.save(&record).await?;
                self.ctx
                    .say(
                        channel,
                        &format!(
                            "@{} joins the crew with {} points. {} in, pot at {}.",
                            chatter.login, stake, crew_size, pot
                        ),
                    )
                    .await;
            }
            _ => {
                self.ctx
                    .payout(channel, chatter.user_id, stake, "heist:refund")
                    .await?;
                debug!("heist join precondition lost in '{}'; stake returned", channel);
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
        let heist = match self.load(channel).await? {
            Some(h) => h,
            None => return Err(Error::NotFound("no heist is forming right now.".to_string())),
        };
        if heist.status != CrewStatus::Recruiting {
            return Err(Error::WrongStatus("too late to call it off.".to_string()));
        }
        let is_initiator = heist
            .crew
            .first()
            .map(|m| m.user_id == chatter.user_id)
            .unwrap_or(false);
        if !is_initiator && !tier.satisfies(UserTier::Moderator) {
            return Err(Error::InvalidParams(
                "only the crew leader or a moderator can call off the heist.".to_string(),
            ));
        }
        self.cancel(channel).await?;
        Ok(())
    }

    pub async fn status_line(&self, channel: &str) -> Result<String, Error> {
        match self.load(channel).await? {
            Some(h) => {
                let left = (h.recruit_until - Utc::now()).num_seconds().max(0);
                Ok(format!(
                    "heist forming: {} crew, pot {}, {}s left to join.",
                    h.crew.len(),
                    h.pot(),
                    left
                ))
            }
            None => Ok("no heist is forming.".to_string()),
        }
    }

    /// Resolve the heist. Draw order is fixed (scenario, odds, multiplier,
    /// then one outcome per crew member in join order) so seeded runs are
    /// exactly reproducible.
    async fn resolve(&self, channel: &str, heist: &HeistState) -> Result<(), Error> {
        let scenario_idx = self.ctx.roll(0..=(self.config.scenarios.len() as i64 - 1)) as usize;
        let scenario = &self.config.scenarios[scenario_idx];
        let chance = self
            .ctx
            .roll_f64(scenario.success_min, scenario.success_max)
            + self.config.bonus_for(heist.crew.len());
        let multiplier = self.ctx.roll_f64(scenario.payout_min, scenario.payout_max);

        let mut winners: Vec<(&CrewMember, i64)> = Vec::new();
        let mut busted = 0usize;
        for member in &heist.crew {
            if self.ctx.chance(chance) {
                winners.push((member, scaled(member.stake, multiplier)));
            } else {
                busted += 1;
            }
        }

        for (member, payout) in &winners {
            self.ctx
                .payout(channel, member.user_id, *payout, "heist:payout")
                .await?;
        }
        self.remove(channel).await?;

        self.ctx
            .say(
                channel,
                &format!(
                    "💥 the crew hits the {}! Success odds were {:.0}%.",
                    scenario.name,
                    chance * 100.0
                ),
            )
            .await;
        if winners.is_empty() {
            self.ctx
                .say(channel, "nobody made it out — the whole pot is gone.")
                .await;
        } else {
            let lines: Vec<String> = winners
                .iter()
                .map(|(m, p)| format!("@{} +{}", m.login, p))
                .collect();
            self.ctx
                .say(
                    channel,
                    &format!("💰 made it out: {} ({} busted).", lines.join(", "), busted),
                )
                .await;
        }
        Ok(())
    }

    async fn load(&self, channel: &str) -> Result<Option<HeistState>, Error> {
        match self.ctx.activities.load(ActivityKind::Heist, channel).await? {
            Some(record) => match record.state {
                ActivityState::Heist(h) => Ok(Some(h)),
                _ => Err(Error::Store(format!("heist record corrupt for '{}'", channel))),
            },
            None => Ok(None),
        }
    }

    async fn remove(&self, channel: &str) -> Result<(), Error> {
        self.ctx.activities.remove(ActivityKind::Heist, channel).await?;
        self.ctx
            .scheduler
            .cancel(&ActivityKind::Heist.storage_key(channel));
        Ok(())
    }

    fn schedule_advance(&self, channel: &str, delay: Duration) {
        let svc = self.clone();
        let chan = channel.to_string();
        self.ctx.scheduler.schedule(
            &ActivityKind::Heist.storage_key(channel),
            delay,
            async move {
                if let Err(e) = svc.advance(&chan).await {
                    warn!("scheduled heist advance for '{}' failed: {:?}", chan, e);
                }
            },
        );
    }
}

#[async_trait]
impl GroupActivity for HeistService {
    fn kind(&self) -> ActivityKind {
        ActivityKind::Heist
    }

    async fn advance(&self, channel: &str) -> Result<(), Error> {
        let mut record = match self.ctx.activities.load(ActivityKind::Heist, channel).await? {
            Some(r) => r,
            None => return Ok(()),
        };
        let heist = match &mut record.state {
            ActivityState::Heist(h) => h,
            _ => return Ok(()),
        };
        match heist.status {
            CrewStatus::Recruiting => {
                if Utc::now() < heist.recruit_until {
                    debug!("heist timer for '{}' fired early; ignoring", channel);
                    return Ok(());
                }
                // Flip to Active before paying anything out so a racing
                // join sees the closed window and aborts.
                heist.status = CrewStatus::Active;
                let snapshot = heist.clone();
                self.ctx.activities.save(&record).await?;
                self.resolve(channel, &snapshot).await
            }
            // A record stuck in Active means a previous resolution was cut
            // short before the delete; finish the job.
            CrewStatus::Active => {
                let snapshot = heist.clone();
                self.resolve(channel, &snapshot).await
            }
        }
    }

    async fn cancel(&self, channel: &str) -> Result<bool, Error> {
        let heist = match self.load(channel).await? {
            Some(h) => h,
            None => return Ok(false),
        };
        let refunds: Vec<(uuid::Uuid, i64)> =
            heist.crew.iter().map(|m| (m.user_id, m.stake)).collect();
        self.remove(channel).await?;
        self.ctx.refund_all(channel, &refunds, "heist:refund").await;
        self.ctx
            .say(channel, "the heist was called off — all stakes refunded.")
            .await;
        Ok(true)
    }
}

static HEIST_SPEC: CommandSpec = CommandSpec::new("heist", &[], UserTier::Everyone, 30);

pub struct HeistCommand {
    svc: HeistService,
}

impl HeistCommand {
    pub fn new(svc: HeistService) -> Self {
        Self { svc }
    }
}

#[async_trait]
impl CommandHandler for HeistCommand {
    fn spec(&self) -> &CommandSpec {
        &HEIST_SPEC
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
            Some("status") => Ok(vec![self.svc.status_line(ctx.channel).await?]),
            _ => Ok(vec![
                "usage: !heist start <stake> | join <stake> | cancel | status".to_string(),
            ]),
        }
    }
}
