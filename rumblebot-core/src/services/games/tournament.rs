//! !tournament: an entry-fee bracket resolved match by match.
//!
//! Recruiting collects a flat fee per entrant up to capacity. On start the
//! field is shuffled and paired into round 1; an odd entrant is dropped
//! from the bracket (and refunded) rather than given a bye. Moderators
//! record each match with `win <user>`; a completed round seeds the next
//! from its winners, and the last survivor takes first place. The prize
//! pool splits 60/30/10 across first, the loser of the final, and the
//! loser of the first match of the round before the final; rounding
//! residue stays in the house.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use rumblebot_common::models::{
    ActivityKind, ActivityRecord, ActivityState, BracketMatch, Chatter, CommandSpec, Entrant,
    TournamentState, TournamentStatus, UserTier,
};
use rumblebot_common::traits::activity_traits::GroupActivity;
use rumblebot_common::Error;

use crate::services::dispatcher::{CommandContext, CommandHandler};
use crate::services::games::{parse_points, require_tier, GameContext};

#[derive(Debug, Clone)]
pub struct TournamentConfig {
    pub default_capacity: usize,
    pub max_capacity: usize,
}

impl Default for TournamentConfig {
    fn default() -> Self {
        Self {
            default_capacity: 16,
            max_capacity: 64,
        }
    }
}

#[derive(Clone)]
pub struct TournamentService {
    ctx: Arc<GameContext>,
    config: TournamentConfig,
}

impl TournamentService {
    pub fn new(ctx: Arc<GameContext>, config: TournamentConfig) -> Self {
        Self { ctx, config }
    }

    pub async fn open(
        &self,
        channel: &str,
        entry_fee: i64,
        capacity: Option<usize>,
    ) -> Result<(), Error> {
        let capacity = capacity.unwrap_or(self.config.default_capacity);
        if capacity < 2 || capacity > self.config.max_capacity {
            return Err(Error::InvalidParams(format!(
                "capacity must be between 2 and {}.",
                self.config.max_capacity
            )));
        }
        if self.load(channel).await?.is_some() {
            return Err(Error::AlreadyActive(
                "a tournament is already running.".to_string(),
            ));
        }

        let record = ActivityRecord::new(
            channel,
            Utc::now(),
            ActivityState::Tournament(TournamentState {
                status: TournamentStatus::Recruiting,
                entry_fee,
                capacity,
                entrants: vec![],
                round: 0,
                matches: vec![],
                pool: 0,
            }),
        );
        self.ctx.activities.save(&record).await?;
        self.ctx
            .say(
                channel,
                &format!(
                    "🏟️ tournament open! Entry fee {} points, {} seats — !tournament join.",
                    entry_fee, capacity
                ),
            )
            .await;
        Ok(())
    }

    pub async fn join(&self, channel: &str, chatter: &Chatter) -> Result<(), Error> {
        let tournament = match self.load(channel).await? {
            Some(t) => t,
            None => {
                return Err(Error::NotFound("no tournament is running right now.".to_string()))
            }
        };
        if tournament.status != TournamentStatus::Recruiting {
            return Err(Error::WrongStatus("the bracket is already underway.".to_string()));
        }
        if tournament.has_entrant(chatter.user_id) {
            return Err(Error::AlreadyJoined("you are already entered.".to_string()));
        }
        if tournament.entrants.len() >= tournament.capacity {
            return Err(Error::InvalidParams("the bracket is full.".to_string()));
        }

        self.ctx
            .charge(channel, chatter.user_id, tournament.entry_fee, "tournament:fee")
            .await?;

        // Read-verify-write after the debit.
        let mut record = match self
            .ctx
            .activities
            .load(ActivityKind::Tournament, channel)
            .await?
        {
            Some(r) => r,
            None => {
                self.ctx
                    .payout(channel, chatter.user_id, tournament.entry_fee, "tournament:refund")
                    .await?;
                debug!("tournament in '{}' vanished mid-join; fee returned", channel);
                return Ok(());
            }
        };
        match &mut record.state {
            ActivityState::Tournament(t)
                if t.status == TournamentStatus::Recruiting
                    && !t.has_entrant(chatter.user_id)
                    && t.entrants.len() < t.capacity =>
            {
                t.entrants.push(Entrant {
                    user_id: chatter.user_id,
                    login: chatter.login.clone(),
                });
                t.pool += t.entry_fee;
                let (count, capacity) = (t.entrants.len(), t.capacity);
                self.ctx.activities.save(&record).await?;
                self.ctx
                    .say(
                        channel,
                        &format!("@{} enters the bracket ({}/{}).", chatter.login, count, capacity),
                    )
                    .await;
            }
            _ => {
                self.ctx
                    .payout(channel, chatter.user_id, tournament.entry_fee, "tournament:refund")
                    .await?;
                debug!("tournament join precondition lost in '{}'; fee returned", channel);
            }
        }
        Ok(())
    }

    /// Seed and pair round 1. An odd entrant is dropped from the bracket
    /// and refunded rather than granted a bye.
    pub async fn start(&self, channel: &str) -> Result<(), Error> {
        let mut record = match self
            .ctx
            .activities
            .load(ActivityKind::Tournament, channel)
            .await?
        {
            Some(r) => r,
            None => {
                return Err(Error::NotFound("no tournament is running right now.".to_string()))
            }
        };
        let tournament = match &mut record.state {
            ActivityState::Tournament(t) => t,
            _ => return Err(Error::Store(format!("tournament record corrupt for '{}'", channel))),
        };
        if tournament.status != TournamentStatus::Recruiting {
            return Err(Error::WrongStatus("the bracket is already underway.".to_string()));
        }
        if tournament.entrants.len() < 2 {
            return Err(Error::InvalidParams(
                "at least two entrants are needed to start.".to_string(),
            ));
        }

        self.ctx.shuffle(&mut tournament.entrants);

        let mut dropped: Option<Entrant> = None;
        if tournament.entrants.len() % 2 == 1 {
            // Safe: len >= 3 here.
            dropped = tournament.entrants.pop();
            tournament.pool -= tournament.entry_fee;
        }

        tournament.round = 1;
        tournament.matches = tournament
            .entrants
            .chunks(2)
            .map(|pair| BracketMatch {
                round: 1,
                a: pair[0].user_id,
                b: pair[1].user_id,
                winner: None,
            })
            .collect();
        tournament.status = TournamentStatus::Active;

        let fee = tournament.entry_fee;
        let pairings = describe_round(tournament, 1);
        self.ctx.activities.save(&record).await?;

        if let Some(out) = dropped {
            self.ctx
                .payout(channel, out.user_id, fee, "tournament:refund")
                .await?;
            self.ctx
                .say(
                    channel,
                    &format!(
                        "odd field — @{} is dropped from the bracket and refunded.",
                        out.login
                    ),
                )
                .await;
        }
        self.ctx
            .say(channel, &format!("🏟️ round 1: {}", pairings))
            .await;
        Ok(())
    }

    /// Record a match winner. When the round completes, either the next
    /// round is generated or the tournament settles.
    pub async fn win(&self, channel: &str, winner_login: &str) -> Result<(), Error> {
        let winner_login = winner_login.trim_start_matches('@').to_lowercase();
        let mut record = match self
            .ctx
            .activities
            .load(ActivityKind::Tournament, channel)
            .await?
        {
            Some(r) => r,
            None => {
                return Err(Error::NotFound("no tournament is running right now.".to_string()))
            }
        };
        let tournament = match &mut record.state {
            ActivityState::Tournament(t) => t,
            _ => return Err(Error::Store(format!("tournament record corrupt for '{}'", channel))),
        };
        if tournament.status != TournamentStatus::Active {
            return Err(Error::WrongStatus("the bracket has not started yet.".to_string()));
        }

        let winner_id = match tournament
            .entrants
            .iter()
            .find(|e| e.login == winner_login)
        {
            Some(e) => e.user_id,
            None => {
                return Err(Error::NotFound(format!(
                    "@{} is not in this tournament.",
                    winner_login
                )))
            }
        };

        let round = tournament.round;
        let open_match = tournament.matches.iter_mut().find(|m| {
            m.round == round && m.winner.is_none() && (m.a == winner_id || m.b == winner_id)
        });
        match open_match {
            Some(m) => m.winner = Some(winner_id),
            None => {
                return Err(Error::InvalidParams(format!(
                    "@{} has no undecided match in round {}.",
                    winner_login, round
                )))
            }
        }

        if !tournament.round_complete(round) {
            self.ctx.activities.save(&record).await?;
            self.ctx
                .say(channel, &format!("@{} advances!", winner_login))
                .await;
            return Ok(());
        }

        let winners: Vec<Uuid> = tournament
            .round_matches(round)
            .filter_map(|m| m.winner)
            .collect();

        if winners.len() == 1 {
            let snapshot = tournament.clone();
            return self.settle(channel, &snapshot, winners[0]).await;
        }

        // Seed the next round; an odd winner count drops the last seed,
        // mirroring the start-time rule.
        let mut seeds = winners;
        let mut cut: Option<Uuid> = None;
        if seeds.len() % 2 == 1 {
            cut = seeds.pop();
        }
        let next_round = round + 1;
        for pair in seeds.chunks(2) {
            tournament.matches.push(BracketMatch {
                round: next_round,
                a: pair[0],
                b: pair[1],
                winner: None,
            });
        }
        tournament.round = next_round;

        let cut_login = cut
            .and_then(|id| tournament.login_of(id))
            .map(str::to_string);
        let pairings = describe_round(tournament, next_round);
        self.ctx.activities.save(&record).await?;

        if let Some(login) = cut_login {
            self.ctx
                .say(channel, &format!("odd field — @{} misses the cut.", login))
                .await;
        }
        self.ctx
            .say(channel, &format!("🏟️ round {}: {}", next_round, pairings))
            .await;
        Ok(())
    }

    /// Pay out 60/30/10 and delete the bracket. Third place is the loser
    /// of the first-found match of the round before the final; with a
    /// single-round bracket there is no third and that share stays unpaid.
    async fn settle(
        &self,
        channel: &str,
        tournament: &TournamentState,
        champion: Uuid,
    ) -> Result<(), Error> {
        let final_round = tournament.round;
        let final_match = tournament
            .round_matches(final_round)
            .next()
            .cloned()
            .ok_or_else(|| Error::Internal("settled tournament without a final".to_string()))?;
        let runner_up = if final_match.a == champion {
            final_match.b
        } else {
            final_match.a
        };
        let third = if final_round > 1 {
            tournament
                .round_matches(final_round - 1)
                .find(|m| m.winner.is_some())
                .map(|m| {
                    let w = m.winner.unwrap_or(m.a);
                    if m.a == w {
                        m.b
                    } else {
                        m.a
                    }
                })
        } else {
            None
        };

        let pool = tournament.pool;
        let first_share = pool * 60 / 100;
        let second_share = pool * 30 / 100;
        let third_share = pool * 10 / 100;
        let paid = first_share + second_share + if third.is_some() { third_share } else { 0 };
        if pool - paid > 0 {
            debug!(
                "tournament payout residual of {} in '{}' left unassigned",
                pool - paid,
                channel
            );
        }

        let name_of = |id: Uuid| {
            tournament
                .login_of(id)
                .map(str::to_string)
                .unwrap_or_else(|| id.to_string())
        };

        self.remove(channel).await?;
        self.ctx
            .payout(channel, champion, first_share, "tournament:first")
            .await?;
        self.ctx
            .payout(channel, runner_up, second_share, "tournament:second")
            .await?;
        if let Some(third_id) = third {
            self.ctx
                .payout(channel, third_id, third_share, "tournament:third")
                .await?;
        }

        let mut podium = format!(
            "🏆 @{} wins the tournament and {} points! @{} takes {} for second",
            name_of(champion),
            first_share,
            name_of(runner_up),
            second_share
        );
        if let Some(third_id) = third {
            podium.push_str(&format!(", @{} takes {} for third", name_of(third_id), third_share));
        }
        podium.push('.');
        self.ctx.say(channel, &podium).await;
        Ok(())
    }

    pub async fn cancel_as(&self, channel: &str) -> Result<(), Error> {
        if !self.cancel(channel).await? {
            return Err(Error::NotFound("no tournament is running right now.".to_string()));
        }
        Ok(())
    }

    pub async fn status_line(&self, channel: &str) -> Result<String, Error> {
        match self.load(channel).await? {
            Some(t) => match t.status {
                TournamentStatus::Recruiting => Ok(format!(
                    "tournament recruiting: {}/{} entered, {} point entry.",
                    t.entrants.len(),
                    t.capacity,
                    t.entry_fee
                )),
                TournamentStatus::Active => {
                    let open: Vec<String> = t
                        .round_matches(t.round)
                        .filter(|m| m.winner.is_none())
                        .map(|m| {
                            format!(
                                "@{} vs @{}",
                                t.login_of(m.a).unwrap_or("?"),
                                t.login_of(m.b).unwrap_or("?")
                            )
                        })
                        .collect();
                    Ok(format!(
                        "tournament round {}: {} still to play.",
                        t.round,
                        if open.is_empty() {
                            "nothing".to_string()
                        } else {
                            open.join(", ")
                        }
                    ))
                }
            },
            None => Ok("no tournament is running.".to_string()),
        }
    }

    async fn load(&self, channel: &str) -> Result<Option<TournamentState>, Error> {
        match self
            .ctx
            .activities
            .load(ActivityKind::Tournament, channel)
            .await?
        {
            Some(record) => match record.state {
                ActivityState::Tournament(t) => Ok(Some(t)),
                _ => Err(Error::Store(format!(
                    "tournament record corrupt for '{}'",
                    channel
                ))),
            },
            None => Ok(None),
        }
    }

    async fn remove(&self, channel: &str) -> Result<(), Error> {
        self.ctx
            .activities
            .remove(ActivityKind::Tournament, channel)
            .await
    }
}

fn describe_round(tournament: &TournamentState, round: u32) -> String {
    let pairs: Vec<String> = tournament
        .round_matches(round)
        .map(|m| {
            format!(
                "@{} vs @{}",
                tournament.login_of(m.a).unwrap_or("?"),
                tournament.login_of(m.b).unwrap_or("?")
            )
        })
        .collect();
    pairs.join(", ")
}

#[async_trait]
impl GroupActivity for TournamentService {
    fn kind(&self) -> ActivityKind {
        ActivityKind::Tournament
    }

    /// Tournaments advance only on explicit moderator commands; there is
    /// no timed transition for a stale timer to replay.
    async fn advance(&self, _channel: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn cancel(&self, channel: &str) -> Result<bool, Error> {
        let tournament = match self.load(channel).await? {
            Some(t) => t,
            None => return Ok(false),
        };
        let refunds: Vec<(Uuid, i64)> = tournament
            .entrants
            .iter()
            .map(|e| (e.user_id, tournament.entry_fee))
            .collect();
        self.remove(channel).await?;
        self.ctx
            .refund_all(channel, &refunds, "tournament:refund")
            .await;
        self.ctx
            .say(channel, "the tournament was cancelled — entry fees refunded.")
            .await;
        Ok(true)
    }
}

static TOURNAMENT_SPEC: CommandSpec =
    CommandSpec::new("tournament", &["tourney"], UserTier::Everyone, 5);

pub struct TournamentCommand {
    svc: TournamentService,
}

impl TournamentCommand {
    pub fn new(svc: TournamentService) -> Self {
        Self { svc }
    }
}

#[async_trait]
impl CommandHandler for TournamentCommand {
    fn spec(&self) -> &CommandSpec {
        &TOURNAMENT_SPEC
    }

    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Vec<String>, Error> {
        match ctx.arg(0) {
            Some("open") => {
                require_tier(ctx.tier, UserTier::Moderator, "!tournament open")?;
                let fee = parse_points(ctx.arg(1), "entry fee")?;
                let capacity = match ctx.arg(2) {
                    Some(raw) => Some(raw.parse::<usize>().map_err(|_| {
                        Error::InvalidParams(format!("'{}' is not a capacity", raw))
                    })?),
                    None => None,
                };
                self.svc.open(ctx.channel, fee, capacity).await?;
                Ok(vec![])
            }
            Some("join") => {
                self.svc.join(ctx.channel, ctx.chatter).await?;
                Ok(vec![])
            }
            Some("start") => {
                require_tier(ctx.tier, UserTier::Moderator, "!tournament start")?;
                self.svc.start(ctx.channel).await?;
                Ok(vec![])
            }
            Some("win") => {
                require_tier(ctx.tier, UserTier::Moderator, "!tournament win")?;
                let login = ctx
                    .arg(1)
                    .ok_or_else(|| Error::InvalidParams("usage: !tournament win <user>".to_string()))?;
                self.svc.win(ctx.channel, login).await?;
                Ok(vec![])
            }
            Some("cancel") => {
                require_tier(ctx.tier, UserTier::Moderator, "!tournament cancel")?;
                self.svc.cancel_as(ctx.channel).await?;
                Ok(vec![])
            }
            Some("status") => Ok(vec![self.svc.status_line(ctx.channel).await?]),
            _ => Ok(vec![
                "usage: !tournament open <fee> [capacity] | join | start | win <user> | cancel | status"
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

    fn service(h: &TestHarness) -> TournamentService {
        TournamentService::new(h.ctx.clone(), TournamentConfig::default())
    }

    /// Drive every open match of the current round by declaring the `a`
    /// side the winner. Returns the number of rounds played.
    async fn play_out(svc: &TournamentService) -> u32 {
        let mut rounds = 0;
        loop {
            let t = match svc.load(CHAN).await.unwrap() {
                Some(t) => t,
                None => return rounds,
            };
            rounds = t.round;
            let open: Vec<String> = t
                .round_matches(t.round)
                .filter(|m| m.winner.is_none())
                .map(|m| t.login_of(m.a).unwrap_or("?").to_string())
                .collect();
            assert!(!open.is_empty(), "active tournament with no open matches");
            for login in open {
                svc.win(CHAN, &login).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn four_entrants_terminate_in_two_rounds_with_full_split() {
        let h = TestHarness::with_seed(71);
        let svc = service(&h);
        let players: Vec<Chatter> = ["p1", "p2", "p3", "p4"]
            .iter()
            .map(|login| h.chatter(CHAN, login, 1000))
            .collect();

        svc.open(CHAN, 100, Some(8)).await.unwrap();
        for p in &players {
            svc.join(CHAN, p).await.unwrap();
        }
        svc.start(CHAN).await.unwrap();

        let rounds = play_out(&svc).await;
        assert_eq!(rounds, 2, "4 entrants must finish in log2(4) rounds");

        // 400-point pool splits 240/120/40 and fully pays out.
        let mut balances: Vec<i64> = Vec::new();
        for p in &players {
            balances.push(h.ledger.get_points(CHAN, p.user_id).await.unwrap());
        }
        let total: i64 = balances.iter().sum();
        assert_eq!(total, 4000, "split must sum to the pool");
        balances.sort();
        assert_eq!(balances, vec![900, 940, 1020, 1140]);
        assert_eq!(h.ledger.net_for_reason("tournament:"), 0);
    }

    #[tokio::test]
    async fn eight_entrants_terminate_in_three_rounds() {
        let h = TestHarness::with_seed(72);
        let svc = service(&h);
        let players: Vec<Chatter> = (1..=8)
            .map(|i| h.chatter(CHAN, &format!("p{}", i), 1000))
            .collect();

        svc.open(CHAN, 50, Some(8)).await.unwrap();
        for p in &players {
            svc.join(CHAN, p).await.unwrap();
        }
        svc.start(CHAN).await.unwrap();

        let rounds = play_out(&svc).await;
        assert_eq!(rounds, 3);

        // 400-point pool: 240 + 120 + 40 = 400, residual 0.
        let total: i64 = {
            let mut sum = 0;
            for p in &players {
                sum += h.ledger.get_points(CHAN, p.user_id).await.unwrap();
            }
            sum
        };
        assert_eq!(total, 8000);
    }

    #[tokio::test]
    async fn odd_entrant_is_dropped_and_refunded() {
        let h = TestHarness::with_seed(73);
        let svc = service(&h);
        let players: Vec<Chatter> = (1..=5)
            .map(|i| h.chatter(CHAN, &format!("p{}", i), 1000))
            .collect();

        svc.open(CHAN, 100, Some(8)).await.unwrap();
        for p in &players {
            svc.join(CHAN, p).await.unwrap();
        }
        svc.start(CHAN).await.unwrap();

        let t = svc.load(CHAN).await.unwrap().unwrap();
        assert_eq!(t.entrants.len(), 4);
        assert_eq!(t.pool, 400);
        assert!(h.emitter.contains("dropped from the bracket"));

        // Exactly one player has their fee back already.
        let mut refunded = 0;
        for p in &players {
            if h.ledger.get_points(CHAN, p.user_id).await.unwrap() == 1000 {
                refunded += 1;
            }
        }
        assert_eq!(refunded, 1);
    }

    #[tokio::test]
    async fn cancel_refunds_every_entrant_once() {
        let h = TestHarness::with_seed(74);
        let svc = service(&h);
        let players: Vec<Chatter> = (1..=4)
            .map(|i| h.chatter(CHAN, &format!("p{}", i), 500))
            .collect();

        svc.open(CHAN, 100, Some(8)).await.unwrap();
        for p in &players {
            svc.join(CHAN, p).await.unwrap();
        }
        svc.start(CHAN).await.unwrap();
        // Partially played bracket still refunds everyone.
        let t = svc.load(CHAN).await.unwrap().unwrap();
        let first = t.login_of(t.matches[0].a).unwrap().to_string();
        svc.win(CHAN, &first).await.unwrap();

        assert!(svc.cancel(CHAN).await.unwrap());
        assert!(!svc.cancel(CHAN).await.unwrap());
        for p in &players {
            assert_eq!(h.ledger.get_points(CHAN, p.user_id).await.unwrap(), 500);
        }
        assert_eq!(h.ledger.net_for_reason("tournament:"), 0);
    }

    #[tokio::test]
    async fn win_for_unknown_or_decided_player_is_a_user_error() {
        let h = TestHarness::with_seed(75);
        let svc = service(&h);
        let players: Vec<Chatter> = (1..=4)
            .map(|i| h.chatter(CHAN, &format!("p{}", i), 500))
            .collect();

        svc.open(CHAN, 100, Some(8)).await.unwrap();
        for p in &players {
            svc.join(CHAN, p).await.unwrap();
        }
        svc.start(CHAN).await.unwrap();

        assert!(matches!(
            svc.win(CHAN, "nobody").await.unwrap_err(),
            Error::NotFound(_)
        ));

        let t = svc.load(CHAN).await.unwrap().unwrap();
        let loser = t.login_of(t.matches[0].b).unwrap().to_string();
        let winner = t.login_of(t.matches[0].a).unwrap().to_string();
        svc.win(CHAN, &winner).await.unwrap();
        // The beaten player has no undecided match left this round.
        assert!(matches!(
            svc.win(CHAN, &loser).await.unwrap_err(),
            Error::InvalidParams(_)
        ));
    }

    #[tokio::test]
    async fn full_bracket_rejects_further_joins() {
        let h = TestHarness::with_seed(76);
        let svc = service(&h);
        let a = h.chatter(CHAN, "a", 500);
        let b = h.chatter(CHAN, "b", 500);
        let c = h.chatter(CHAN, "c", 500);

        svc.open(CHAN, 100, Some(2)).await.unwrap();
        svc.join(CHAN, &a).await.unwrap();
        svc.join(CHAN, &b).await.unwrap();
        let err = svc.join(CHAN, &c).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
        assert_eq!(h.ledger.get_points(CHAN, c.user_id).await.unwrap(), 500);
    }
}
