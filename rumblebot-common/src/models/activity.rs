use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bumped whenever the stored document layout changes. Readers reject any
/// record whose version does not match, so stale documents fail closed.
pub const ACTIVITY_SCHEMA_VERSION: u32 = 1;

/// Every kind of timed group activity the bot can run. At most one record
/// per (channel, kind) exists in the state store at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityKind {
    Duel,
    Heist,
    BossBattle,
    Raffle,
    Giveaway,
    Poll,
    Prediction,
    Tournament,
}

impl ActivityKind {
    pub const ALL: [ActivityKind; 8] = [
        ActivityKind::Duel,
        ActivityKind::Heist,
        ActivityKind::BossBattle,
        ActivityKind::Raffle,
        ActivityKind::Giveaway,
        ActivityKind::Poll,
        ActivityKind::Prediction,
        ActivityKind::Tournament,
    ];

    /// Namespace prefix for state-store keys, `<prefix>:<channel>`.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            ActivityKind::Duel => "duel",
            ActivityKind::Heist => "heist",
            ActivityKind::BossBattle => "boss",
            ActivityKind::Raffle => "raffle",
            ActivityKind::Giveaway => "giveaway",
            ActivityKind::Poll => "poll",
            ActivityKind::Prediction => "prediction",
            ActivityKind::Tournament => "tournament",
        }
    }

    pub fn storage_key(&self, channel: &str) -> String {
        format!("{}:{}", self.key_prefix(), channel.to_lowercase())
    }

    /// Human label used in chat lines ("a heist is already running").
    pub fn label(&self) -> &'static str {
        match self {
            ActivityKind::Duel => "duel",
            ActivityKind::Heist => "heist",
            ActivityKind::BossBattle => "boss battle",
            ActivityKind::Raffle => "raffle",
            ActivityKind::Giveaway => "giveaway",
            ActivityKind::Poll => "poll",
            ActivityKind::Prediction => "prediction",
            ActivityKind::Tournament => "tournament",
        }
    }
}

/// Envelope stored in the state store. `version` is validated on every
/// read; `state` is the discriminated per-kind payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub version: u32,
    pub channel: String,
    pub created_at: DateTime<Utc>,
    pub state: ActivityState,
}

impl ActivityRecord {
    pub fn new(channel: &str, created_at: DateTime<Utc>, state: ActivityState) -> Self {
        Self {
            version: ACTIVITY_SCHEMA_VERSION,
            channel: channel.to_lowercase(),
            created_at,
            state,
        }
    }

    pub fn kind(&self) -> ActivityKind {
        self.state.kind()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ActivityState {
    Duel(DuelState),
    Heist(HeistState),
    BossBattle(BossBattleState),
    Raffle(RaffleState),
    Giveaway(GiveawayState),
    Poll(PollState),
    Prediction(PredictionState),
    Tournament(TournamentState),
}

impl ActivityState {
    pub fn kind(&self) -> ActivityKind {
        match self {
            ActivityState::Duel(_) => ActivityKind::Duel,
            ActivityState::Heist(_) => ActivityKind::Heist,
            ActivityState::BossBattle(_) => ActivityKind::BossBattle,
            ActivityState::Raffle(_) => ActivityKind::Raffle,
            ActivityState::Giveaway(_) => ActivityKind::Giveaway,
            ActivityState::Poll(_) => ActivityKind::Poll,
            ActivityState::Prediction(_) => ActivityKind::Prediction,
            ActivityState::Tournament(_) => ActivityKind::Tournament,
        }
    }

    /// The next wall-clock deadline stored in the record, if any. The
    /// expiry sweeper uses this to decide which records are overdue; the
    /// deadline was fixed when the record (or phase) was created, so status
    /// plus this timestamp alone decide validity.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        match self {
            ActivityState::Duel(d) => Some(d.responds_by),
            // An Active heist resolves in the same tick it activates; keep
            // the recruit deadline visible so the sweeper can rescue a
            // record orphaned between activation and resolution.
            ActivityState::Heist(h) => Some(h.recruit_until),
            ActivityState::BossBattle(b) => match b.status {
                CrewStatus::Recruiting => Some(b.recruit_until),
                CrewStatus::Active => b.next_round_at,
            },
            ActivityState::Raffle(r) => Some(r.ends_at),
            ActivityState::Giveaway(g) => Some(g.ends_at),
            ActivityState::Poll(p) => Some(p.ends_at),
            ActivityState::Prediction(p) => match p.status {
                PredictionStatus::Open => Some(p.locks_at),
                PredictionStatus::Locked => None,
            },
            // Tournaments recruit until an explicit start and advance only
            // on moderator commands.
            ActivityState::Tournament(_) => None,
        }
    }
}

// ----------------------------------------------------------------
// Duel
// ----------------------------------------------------------------

/// A pending challenge. Acceptance, decline, expiry and cancellation are
/// all terminal and delete the record, so the stored document always means
/// "awaiting the target's response". No points are escrowed until the
/// target accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuelState {
    pub challenger_id: Uuid,
    pub challenger_login: String,
    pub target_login: String,
    pub stake: i64,
    pub responds_by: DateTime<Utc>,
}

// ----------------------------------------------------------------
// Heist / Boss battle
// ----------------------------------------------------------------

/// Shared recruit-then-run phase marker for crew activities. `Ended` is not
/// stored: a finished activity is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrewStatus {
    Recruiting,
    Active,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrewMember {
    pub user_id: Uuid,
    pub login: String,
    pub stake: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeistState {
    pub status: CrewStatus,
    pub crew: Vec<CrewMember>,
    pub recruit_until: DateTime<Utc>,
}

impl HeistState {
    pub fn pot(&self) -> i64 {
        self.crew.iter().map(|m| m.stake).sum()
    }

    pub fn has_member(&self, user_id: Uuid) -> bool {
        self.crew.iter().any(|m| m.user_id == user_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fighter {
    pub user_id: Uuid,
    pub login: String,
    pub stake: i64,
    pub damage_dealt: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BossBattleState {
    pub status: CrewStatus,
    pub crew: Vec<Fighter>,
    pub recruit_until: DateTime<Utc>,
    /// Current boss level; persisted separately across battles and copied
    /// in here when the battle is created.
    pub level: u32,
    pub health: i64,
    pub max_health: i64,
    pub round: u32,
    pub next_round_at: Option<DateTime<Utc>>,
}

impl BossBattleState {
    pub fn pot(&self) -> i64 {
        self.crew.iter().map(|f| f.stake).sum()
    }

    pub fn has_fighter(&self, user_id: Uuid) -> bool {
        self.crew.iter().any(|f| f.user_id == user_id)
    }
}

// ----------------------------------------------------------------
// Raffle / Giveaway
// ----------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaffleEntry {
    pub user_id: Uuid,
    pub login: String,
    pub tickets: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaffleState {
    pub ticket_cost: i64,
    pub ends_at: DateTime<Utc>,
    pub entries: Vec<RaffleEntry>,
}

impl RaffleState {
    pub fn total_tickets(&self) -> u64 {
        self.entries.iter().map(|e| e.tickets as u64).sum()
    }

    pub fn pot(&self) -> i64 {
        self.total_tickets() as i64 * self.ticket_cost
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entrant {
    pub user_id: Uuid,
    pub login: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GiveawayState {
    pub prize: i64,
    pub ends_at: DateTime<Utc>,
    pub entrants: Vec<Entrant>,
}

impl GiveawayState {
    pub fn has_entrant(&self, user_id: Uuid) -> bool {
        self.entrants.iter().any(|e| e.user_id == user_id)
    }
}

// ----------------------------------------------------------------
// Poll
// ----------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollOption {
    pub label: String,
    pub votes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollVoter {
    pub user_id: Uuid,
    pub login: String,
    pub votes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollState {
    pub question: String,
    pub options: Vec<PollOption>,
    pub vote_cost: i64,
    pub allow_multi: bool,
    pub ends_at: DateTime<Utc>,
    pub voters: Vec<PollVoter>,
}

impl PollState {
    pub fn total_votes(&self) -> u32 {
        self.options.iter().map(|o| o.votes).sum()
    }

    pub fn votes_by(&self, user_id: Uuid) -> u32 {
        self.voters
            .iter()
            .find(|v| v.user_id == user_id)
            .map(|v| v.votes)
            .unwrap_or(0)
    }
}

// ----------------------------------------------------------------
// Prediction
// ----------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictionStatus {
    /// Accepting bets.
    Open,
    /// Betting closed, waiting for a moderator to resolve or cancel.
    Locked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionOption {
    pub label: String,
    /// Running total of all bets on this option.
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionBet {
    pub user_id: Uuid,
    pub login: String,
    pub option: usize,
    pub amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionState {
    pub status: PredictionStatus,
    pub options: Vec<PredictionOption>,
    pub bets: Vec<PredictionBet>,
    pub locks_at: DateTime<Utc>,
}

impl PredictionState {
    pub fn pot(&self) -> i64 {
        self.options.iter().map(|o| o.total).sum()
    }

    pub fn bet_by(&self, user_id: Uuid) -> Option<&PredictionBet> {
        self.bets.iter().find(|b| b.user_id == user_id)
    }
}

// ----------------------------------------------------------------
// Tournament
// ----------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TournamentStatus {
    Recruiting,
    Active,
}

/// One bracket pairing. A round is complete when every match in it has a
/// winner recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketMatch {
    pub round: u32,
    pub a: Uuid,
    pub b: Uuid,
    pub winner: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TournamentState {
    pub status: TournamentStatus,
    pub entry_fee: i64,
    pub capacity: usize,
    pub entrants: Vec<Entrant>,
    pub round: u32,
    pub matches: Vec<BracketMatch>,
    /// Entry fees still held by the tournament. Decremented by the odd-
    /// entrant refund at start so the split never pays out more than was
    /// actually collected.
    pub pool: i64,
}

impl TournamentState {
    pub fn has_entrant(&self, user_id: Uuid) -> bool {
        self.entrants.iter().any(|e| e.user_id == user_id)
    }

    pub fn login_of(&self, user_id: Uuid) -> Option<&str> {
        self.entrants
            .iter()
            .find(|e| e.user_id == user_id)
            .map(|e| e.login.as_str())
    }

    pub fn round_matches(&self, round: u32) -> impl Iterator<Item = &BracketMatch> {
        self.matches.iter().filter(move |m| m.round == round)
    }

    pub fn round_complete(&self, round: u32) -> bool {
        self.round_matches(round).all(|m| m.winner.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_keys_are_namespaced_per_channel_and_kind() {
        assert_eq!(ActivityKind::Heist.storage_key("MyChannel"), "heist:mychannel");
        assert_eq!(ActivityKind::BossBattle.storage_key("a"), "boss:a");
        assert_ne!(
            ActivityKind::Raffle.storage_key("chan1"),
            ActivityKind::Raffle.storage_key("chan2")
        );
    }

    #[test]
    fn record_round_trips_with_kind_tag() {
        let rec = ActivityRecord::new(
            "chan",
            Utc::now(),
            ActivityState::Heist(HeistState {
                status: CrewStatus::Recruiting,
                crew: vec![],
                recruit_until: Utc::now(),
            }),
        );
        let bytes = serde_json::to_vec(&rec).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"kind\":\"Heist\""));
        let back: ActivityRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.kind(), ActivityKind::Heist);
        assert_eq!(back.version, ACTIVITY_SCHEMA_VERSION);
    }
}
