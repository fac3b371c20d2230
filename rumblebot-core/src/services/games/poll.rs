//! !poll: vote on options, optionally at a point cost per vote.
//!
//! Tally is vote count per option with percentages over total votes cast.
//! Repeat voting is allowed only when the poll was opened with `multi`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use rumblebot_common::models::{
    ActivityKind, ActivityRecord, ActivityState, Chatter, CommandSpec, PollOption, PollState,
    PollVoter, UserTier,
};
use rumblebot_common::traits::activity_traits::GroupActivity;
use rumblebot_common::Error;

use crate::services::dispatcher::{CommandContext, CommandHandler};
use crate::services::games::{
    parse_duration_secs, parse_option_index, require_tier, split_options, GameContext,
};

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub default_duration_secs: u64,
    /// Cost per vote; zero makes voting free.
    pub vote_cost: i64,
    pub allow_multi: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            default_duration_secs: 90,
            vote_cost: 0,
            allow_multi: false,
        }
    }
}

#[derive(Clone)]
pub struct PollService {
    ctx: Arc<GameContext>,
    config: PollConfig,
}

impl PollService {
    pub fn new(ctx: Arc<GameContext>, config: PollConfig) -> Self {
        Self { ctx, config }
    }

    pub async fn start(
        &self,
        channel: &str,
        question: &str,
        options: Vec<String>,
        duration_secs: u64,
    ) -> Result<(), Error> {
        if options.len() < 2 {
            return Err(Error::InvalidParams(
                "a poll needs a question and at least two options separated by '|'.".to_string(),
            ));
        }
        if self.load(channel).await?.is_some() {
            return Err(Error::AlreadyActive("a poll is already open.".to_string()));
        }

        let now = Utc::now();
        let record = ActivityRecord::new(
            channel,
            now,
            ActivityState::Poll(PollState {
                question: question.to_string(),
                options: options
                    .iter()
                    .map(|label| PollOption {
                        label: label.clone(),
                        votes: 0,
                    })
                    .collect(),
                vote_cost: self.config.vote_cost,
                allow_multi: self.config.allow_multi,
                ends_at: now + chrono::Duration::seconds(duration_secs as i64),
                voters: vec![],
            }),
        );
        self.ctx.activities.save(&record).await?;
        self.schedule_close(channel, Duration::from_secs(duration_secs));

        let listing: Vec<String> = options
            .iter()
            .enumerate()
            .map(|(i, label)| format!("[{}] {}", i + 1, label))
            .collect();
        self.ctx
            .say(
                channel,
                &format!(
                    "📊 poll: {} — {} — vote with !poll vote <n> ({}s).",
                    question,
                    listing.join("  "),
                    duration_secs
                ),
            )
            .await;
        Ok(())
    }

    pub async fn vote(&self, channel: &str, chatter: &Chatter, option_arg: Option<&str>) -> Result<(), Error> {
        let poll = match self.load(channel).await? {
            Some(p) => p,
            None => return Err(Error::NotFound("no poll is open right now.".to_string())),
        };
        if Utc::now() > poll.ends_at {
            return Err(Error::WrongStatus("the poll has closed.".to_string()));
        }
        let option = parse_option_index(option_arg, poll.options.len())?;
        if !poll.allow_multi && poll.votes_by(chatter.user_id) > 0 {
            return Err(Error::AlreadyJoined("you already voted in this poll.".to_string()));
        }

        if poll.vote_cost > 0 {
            self.ctx
                .charge(channel, chatter.user_id, poll.vote_cost, "poll:vote")
                .await?;
        }

        // Read-verify-write after the (possible) debit.
        let mut record = match self.ctx.activities.load(ActivityKind::Poll, channel).await? {
            Some(r) => r,
            None => {
                if poll.vote_cost > 0 {
                    self.ctx
                        .payout(channel, chatter.user_id, poll.vote_cost, "poll:refund")
                        .await?;
                }
                debug!("poll in '{}' closed mid-vote; cost returned", channel);
                return Ok(());
            }
        };
        match &mut record.state {
            ActivityState::Poll(p)
                if Utc::now() <= p.ends_at
                    && option < p.options.len()
                    && (p.allow_multi || p.votes_by(chatter.user_id) == 0) =>
            {
                p.options[option].votes += 1;
                match p.voters.iter_mut().find(|v| v.user_id == chatter.user_id) {
                    Some(v) => v.votes += 1,
                    None => p.voters.push(PollVoter {
                        user_id: chatter.user_id,
                        login: chatter.login.clone(),
                        votes: 1,
                    }),
                }
                self.ctx.activities.save(&record).await?;
            }
            _ => {
                if poll.vote_cost > 0 {
                    self.ctx
                        .payout(channel, chatter.user_id, poll.vote_cost, "poll:refund")
                        .await?;
                }
                debug!("poll vote precondition lost in '{}'; cost returned", channel);
            }
        }
        Ok(())
    }

    pub async fn end_now(&self, channel: &str) -> Result<(), Error> {
        if self.load(channel).await?.is_none() {
            return Err(Error::NotFound("no poll is open right now.".to_string()));
        }
        self.finish(channel).await
    }

    pub async fn cancel_as(&self, channel: &str) -> Result<(), Error> {
        if !self.cancel(channel).await? {
            return Err(Error::NotFound("no poll is open right now.".to_string()));
        }
        Ok(())
    }

    pub async fn status_line(&self, channel: &str) -> Result<String, Error> {
        match self.load(channel).await? {
            Some(p) => {
                let left = (p.ends_at - Utc::now()).num_seconds().max(0);
                Ok(format!(
                    "poll '{}': {} votes so far, closing in {}s.",
                    p.question,
                    p.total_votes(),
                    left
                ))
            }
            None => Ok("no poll is open.".to_string()),
        }
    }

    async fn finish(&self, channel: &str) -> Result<(), Error> {
        let poll = match self.load(channel).await? {
            Some(p) => p,
            None => return Ok(()),
        };
        self.remove(channel).await?;

        let total = poll.total_votes();
        if total == 0 {
            self.ctx
                .say(channel, &format!("poll '{}' closed with no votes.", poll.question))
                .await;
            return Ok(());
        }
        let results: Vec<String> = poll
            .options
            .iter()
            .map(|o| {
                format!(
                    "{}: {} ({}%)",
                    o.label,
                    o.votes,
                    o.votes * 100 / total
                )
            })
            .collect();
        self.ctx
            .say(
                channel,
                &format!("📊 poll '{}' results — {}.", poll.question, results.join(", ")),
            )
            .await;
        Ok(())
    }

    async fn load(&self, channel: &str) -> Result<Option<PollState>, Error> {
        match self.ctx.activities.load(ActivityKind::Poll, channel).await? {
            Some(record) => match record.state {
                ActivityState::Poll(p) => Ok(Some(p)),
                _ => Err(Error::Store(format!("poll record corrupt for '{}'", channel))),
            },
            None => Ok(None),
        }
    }

    async fn remove(&self, channel: &str) -> Result<(), Error> {
        self.ctx.activities.remove(ActivityKind::Poll, channel).await?;
        self.ctx
            .scheduler
            .cancel(&ActivityKind::Poll.storage_key(channel));
        Ok(())
    }

    fn schedule_close(&self, channel: &str, delay: Duration) {
        let svc = self.clone();
        let chan = channel.to_string();
        self.ctx.scheduler.schedule(
            &ActivityKind::Poll.storage_key(channel),
            delay,
            async move {
                if let Err(e) = svc.advance(&chan).await {
                    warn!("scheduled poll close for '{}' failed: {:?}", chan, e);
                }
            },
        );
    }
}

#[async_trait]
impl GroupActivity for PollService {
    fn kind(&self) -> ActivityKind {
        ActivityKind::Poll
    }

    async fn advance(&self, channel: &str) -> Result<(), Error> {
        let poll = match self.load(channel).await? {
            Some(p) => p,
            None => return Ok(()),
        };
        if Utc::now() < poll.ends_at {
            debug!("poll timer for '{}' fired early; ignoring", channel);
            return Ok(());
        }
        self.finish(channel).await
    }

    async fn cancel(&self, channel: &str) -> Result<bool, Error> {
        let poll = match self.load(channel).await? {
            Some(p) => p,
            None => return Ok(false),
        };
        let refunds: Vec<(uuid::Uuid, i64)> = poll
            .voters
            .iter()
            .map(|v| (v.user_id, v.votes as i64 * poll.vote_cost))
            .collect();
        self.remove(channel).await?;
        if poll.vote_cost > 0 {
            self.ctx.refund_all(channel, &refunds, "poll:refund").await;
        }
        self.ctx.say(channel, "the poll was cancelled.").await;
        Ok(true)
    }
}

static POLL_SPEC: CommandSpec = CommandSpec::new("poll", &["vote"], UserTier::Everyone, 0);

pub struct PollCommand {
    svc: PollService,
}

impl PollCommand {
    pub fn new(svc: PollService) -> Self {
        Self { svc }
    }
}

#[async_trait]
impl CommandHandler for PollCommand {
    fn spec(&self) -> &CommandSpec {
        &POLL_SPEC
    }

    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Vec<String>, Error> {
        match ctx.arg(0) {
            Some("start") => {
                require_tier(ctx.tier, UserTier::Moderator, "!poll start")?;
                // !poll start [secs] question | option | option
                let (duration, rest) = match ctx.arg(1).and_then(|a| a.parse::<u64>().ok()) {
                    Some(_) => (
                        parse_duration_secs(ctx.arg(1), self.svc.config.default_duration_secs)?,
                        &ctx.args[2..],
                    ),
                    None => (self.svc.config.default_duration_secs, &ctx.args[1..]),
                };
                let mut segments = split_options(rest);
                if segments.len() < 3 {
                    return Err(Error::InvalidParams(
                        "usage: !poll start [secs] question | option | option".to_string(),
                    ));
                }
                let question = segments.remove(0);
                self.svc.start(ctx.channel, &question, segments, duration).await?;
                Ok(vec![])
            }
            Some("vote") => {
                self.svc.vote(ctx.channel, ctx.chatter, ctx.arg(1)).await?;
                Ok(vec![])
            }
            Some("end") => {
                require_tier(ctx.tier, UserTier::Moderator, "!poll end")?;
                self.svc.end_now(ctx.channel).await?;
                Ok(vec![])
            }
            Some("cancel") => {
                require_tier(ctx.tier, UserTier::Moderator, "!poll cancel")?;
                self.svc.cancel_as(ctx.channel).await?;
                Ok(vec![])
            }
            Some("status") => Ok(vec![self.svc.status_line(ctx.channel).await?]),
            // Bare "!vote 2" comes in through the alias.
            Some(_) if ctx.args.len() == 1 => {
                self.svc.vote(ctx.channel, ctx.chatter, ctx.arg(0)).await?;
                Ok(vec![])
            }
            _ => Ok(vec![
                "usage: !poll start [secs] question | opt | opt — then !poll vote <n>".to_string(),
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

    fn service(h: &TestHarness, config: PollConfig) -> PollService {
        PollService::new(h.ctx.clone(), config)
    }

    #[tokio::test]
    async fn tally_reports_counts_and_percentages() {
        let h = TestHarness::with_seed(51);
        let svc = service(&h, PollConfig::default());
        let alice = h.chatter(CHAN, "alice", 0);
        let bob = h.chatter(CHAN, "bob", 0);
        let carol = h.chatter(CHAN, "carol", 0);

        svc.start(CHAN, "tea or coffee?", vec!["tea".into(), "coffee".into()], 3600)
            .await
            .unwrap();
        svc.vote(CHAN, &alice, Some("1")).await.unwrap();
        svc.vote(CHAN, &bob, Some("2")).await.unwrap();
        svc.vote(CHAN, &carol, Some("2")).await.unwrap();
        svc.end_now(CHAN).await.unwrap();

        assert!(h.emitter.contains("tea: 1 (33%)"));
        assert!(h.emitter.contains("coffee: 2 (66%)"));
    }

    #[tokio::test]
    async fn single_vote_mode_rejects_repeat_votes() {
        let h = TestHarness::with_seed(52);
        let svc = service(&h, PollConfig::default());
        let alice = h.chatter(CHAN, "alice", 0);

        svc.start(CHAN, "q?", vec!["a".into(), "b".into()], 3600)
            .await
            .unwrap();
        svc.vote(CHAN, &alice, Some("1")).await.unwrap();
        assert!(matches!(
            svc.vote(CHAN, &alice, Some("2")).await.unwrap_err(),
            Error::AlreadyJoined(_)
        ));
    }

    #[tokio::test]
    async fn multi_vote_mode_allows_repeats_and_charges_each() {
        let h = TestHarness::with_seed(53);
        let svc = service(
            &h,
            PollConfig {
                vote_cost: 10,
                allow_multi: true,
                ..PollConfig::default()
            },
        );
        let alice = h.chatter(CHAN, "alice", 100);

        svc.start(CHAN, "q?", vec!["a".into(), "b".into()], 3600)
            .await
            .unwrap();
        svc.vote(CHAN, &alice, Some("1")).await.unwrap();
        svc.vote(CHAN, &alice, Some("1")).await.unwrap();
        svc.vote(CHAN, &alice, Some("2")).await.unwrap();

        assert_eq!(h.ledger.get_points(CHAN, alice.user_id).await.unwrap(), 70);
        let poll = svc.load(CHAN).await.unwrap().unwrap();
        assert_eq!(poll.total_votes(), 3);
        assert_eq!(poll.votes_by(alice.user_id), 3);
    }

    #[tokio::test]
    async fn cancel_refunds_paid_votes() {
        let h = TestHarness::with_seed(54);
        let svc = service(
            &h,
            PollConfig {
                vote_cost: 25,
                allow_multi: true,
                ..PollConfig::default()
            },
        );
        let alice = h.chatter(CHAN, "alice", 100);

        svc.start(CHAN, "q?", vec!["a".into(), "b".into()], 3600)
            .await
            .unwrap();
        svc.vote(CHAN, &alice, Some("1")).await.unwrap();
        svc.vote(CHAN, &alice, Some("2")).await.unwrap();

        assert!(svc.cancel(CHAN).await.unwrap());
        assert!(!svc.cancel(CHAN).await.unwrap());
        assert_eq!(h.ledger.get_points(CHAN, alice.user_id).await.unwrap(), 100);
        assert_eq!(h.ledger.net_for_reason("poll:"), 0);
    }

    #[tokio::test]
    async fn invalid_option_is_a_user_error() {
        let h = TestHarness::with_seed(55);
        let svc = service(&h, PollConfig::default());
        let alice = h.chatter(CHAN, "alice", 0);

        svc.start(CHAN, "q?", vec!["a".into(), "b".into()], 3600)
            .await
            .unwrap();
        assert!(matches!(
            svc.vote(CHAN, &alice, Some("3")).await.unwrap_err(),
            Error::InvalidParams(_)
        ));
        assert!(matches!(
            svc.vote(CHAN, &alice, Some("zero")).await.unwrap_err(),
            Error::InvalidParams(_)
        ));
    }
}
