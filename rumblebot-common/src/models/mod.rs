// File: rumblebot-common/src/models/mod.rs
pub mod activity;
pub mod command;
pub mod user;

pub use activity::{
    ActivityKind, ActivityRecord, ActivityState, BossBattleState, BracketMatch, CrewMember,
    CrewStatus, DuelState, Entrant, Fighter, GiveawayState, HeistState, PollOption, PollState,
    PollVoter, PredictionBet, PredictionOption, PredictionState, PredictionStatus, RaffleEntry,
    RaffleState, TournamentState, TournamentStatus, ACTIVITY_SCHEMA_VERSION,
};
pub use command::{CommandSpec, UserTier};
pub use user::Chatter;
