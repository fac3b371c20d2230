use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};
use uuid::Uuid;

use rumblebot_common::models::{Chatter, CommandSpec, UserTier};
use rumblebot_common::traits::store_traits::ResponseEmitter;
use rumblebot_common::Error;

/// Context passed to command handlers.
pub struct CommandContext<'a> {
    pub channel: &'a str,
    pub chatter: &'a Chatter,
    pub tier: UserTier,
    pub args: &'a [&'a str],
}

impl CommandContext<'_> {
    pub fn arg(&self, idx: usize) -> Option<&str> {
        self.args.get(idx).copied()
    }
}

/// One chat command. Implementations parse their own subcommands and
/// drive the matching activity engine; simple textual replies come back as
/// lines, announcements go out through the engines' emitter.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn spec(&self) -> &CommandSpec;
    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<Vec<String>, Error>;
}

/// Tracks per-(channel, command, user) cooldowns. Eviction is lazy: an
/// expired entry is overwritten on the next successful invocation.
#[derive(Debug, Default)]
pub struct CooldownTracker {
    last_use: HashMap<(String, &'static str, Uuid), DateTime<Utc>>,
}

impl CooldownTracker {
    /// Returns true when the invocation may proceed and records it.
    /// Returns false while the previous invocation for the same key is
    /// still inside its cooldown window.
    pub fn check_and_touch(
        &mut self,
        channel: &str,
        command: &'static str,
        user_id: Uuid,
        cooldown_seconds: u32,
        now: DateTime<Utc>,
    ) -> bool {
        if cooldown_seconds == 0 {
            return true;
        }
        let key = (channel.to_string(), command, user_id);
        if let Some(last) = self.last_use.get(&key) {
            let elapsed = now.signed_duration_since(*last).num_seconds();
            if elapsed < cooldown_seconds as i64 {
                return false;
            }
        }
        self.last_use.insert(key, now);
        true
    }
}

/// Resolves inbound chat lines to registered commands, enforcing
/// authorization tier and cooldown before invoking the handler. Every
/// handler failure is contained here: user errors become a chat reply,
/// anything else is logged and reported generically. Nothing that happens
/// inside one command can affect another channel or user.
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    cooldowns: Mutex<CooldownTracker>,
    emitter: Arc<dyn ResponseEmitter>,
}

impl Dispatcher {
    pub fn new(emitter: Arc<dyn ResponseEmitter>) -> Self {
        debug!("Initializing Dispatcher");
        Self {
            handlers: HashMap::new(),
            cooldowns: Mutex::new(CooldownTracker::default()),
            emitter,
        }
    }

    /// Register a handler under its name and all aliases (lowercased).
    /// A colliding registration keeps the first handler and is reported.
    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        let spec = handler.spec().clone();
        for name in std::iter::once(spec.name).chain(spec.aliases.iter().copied()) {
            let key = name.to_lowercase();
            if self.handlers.contains_key(&key) {
                warn!("command '{}' is already registered; keeping the first", key);
                continue;
            }
            self.handlers.insert(key, handler.clone());
        }
    }

    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Process one inbound chat line.
    pub async fn dispatch(&self, channel: &str, chatter: &Chatter, tier: UserTier, raw: &str) {
        let text = raw.trim();

        // 1) Must start with '!'
        if !text.starts_with('!') {
            return;
        }
        let parts: Vec<&str> = text.split_whitespace().collect();
        let name = parts[0].trim_start_matches('!').to_lowercase();
        if name.is_empty() {
            return;
        }

        // 2) Unknown command => no-op, nothing surfaced to the channel.
        let handler = match self.handlers.get(&name) {
            Some(h) => h,
            None => {
                debug!("no command found matching '{}'", name);
                return;
            }
        };
        let spec = handler.spec();

        // 3) Authorization tier.
        if !tier.satisfies(spec.min_tier) {
            debug!(
                "user '{}' ({}) lacks tier '{}' for '!{}'",
                chatter.login,
                tier.label(),
                spec.min_tier.label(),
                spec.name
            );
            self.emitter
                .say(
                    channel,
                    &format!(
                        "@{}: !{} requires {} or higher.",
                        chatter.login,
                        spec.name,
                        spec.min_tier.label()
                    ),
                )
                .await;
            return;
        }

        // 4) Cooldown: an invocation inside the window is silently dropped.
        {
            let mut cd_lock = self.cooldowns.lock().unwrap();
            if !cd_lock.check_and_touch(
                channel,
                spec.name,
                chatter.user_id,
                spec.cooldown_seconds,
                Utc::now(),
            ) {
                debug!(
                    "dropping '!{}' from '{}' in '{}' (cooldown)",
                    spec.name, chatter.login, channel
                );
                return;
            }
        }

        debug!(
            "dispatching '!{}' from '{}' in '{}' (args: {:?})",
            spec.name,
            chatter.login,
            channel,
            &parts[1..]
        );

        // 5) Invoke the handler; contain every failure.
        let ctx = CommandContext {
            channel,
            chatter,
            tier,
            args: &parts[1..],
        };
        match handler.handle(&ctx).await {
            Ok(lines) => {
                for line in lines {
                    self.emitter.say(channel, &line).await;
                }
            }
            Err(e) if e.is_user_error() => {
                self.emitter
                    .say(channel, &format!("@{}: {}", chatter.login, e))
                    .await;
            }
            Err(e) => {
                error!(
                    "command '!{}' from '{}' in '{}' failed: {:?}",
                    spec.name, chatter.login, channel, e
                );
                self.emitter
                    .say(
                        channel,
                        &format!("@{}: something went wrong running !{}.", chatter.login, spec.name),
                    )
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn cooldown_window_boundaries() {
        let mut tracker = CooldownTracker::default();
        let user = Uuid::new_v4();
        let t0 = Utc::now();

        assert!(tracker.check_and_touch("chan", "heist", user, 30, t0));
        // Just inside the window: dropped.
        assert!(!tracker.check_and_touch(
            "chan",
            "heist",
            user,
            30,
            t0 + Duration::seconds(30) - Duration::milliseconds(500)
        ));
        // Just past the window: proceeds.
        assert!(tracker.check_and_touch(
            "chan",
            "heist",
            user,
            30,
            t0 + Duration::seconds(30) + Duration::milliseconds(500)
        ));
    }

    #[test]
    fn cooldowns_are_scoped_per_channel_and_user() {
        let mut tracker = CooldownTracker::default();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let t0 = Utc::now();

        assert!(tracker.check_and_touch("chan", "duel", alice, 60, t0));
        // Same user, same command, different channel: independent window.
        assert!(tracker.check_and_touch("other", "duel", alice, 60, t0));
        // Different user in the same channel: independent window.
        assert!(tracker.check_and_touch("chan", "duel", bob, 60, t0));
        // Same key again: dropped.
        assert!(!tracker.check_and_touch("chan", "duel", alice, 60, t0 + Duration::seconds(1)));
    }

    #[test]
    fn zero_cooldown_always_proceeds() {
        let mut tracker = CooldownTracker::default();
        let user = Uuid::new_v4();
        let t0 = Utc::now();
        for _ in 0..5 {
            assert!(tracker.check_and_touch("chan", "status", user, 0, t0));
        }
    }
}
