// File: rumblebot-core/src/services/mod.rs
pub mod dispatcher;
pub mod games;

pub use dispatcher::{CommandContext, CommandHandler, CooldownTracker, Dispatcher};
pub use games::{GameConfig, GameContext, GameServices};
