/// Authorization ladder for chat commands. Ordering matters: a user
/// satisfies a requirement when their own tier is >= the required one, so
/// the broadcaster always passes every check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UserTier {
    Everyone,
    Subscriber,
    Vip,
    Moderator,
    Broadcaster,
}

impl UserTier {
    pub fn parse(s: &str) -> Option<UserTier> {
        match s.trim().to_lowercase().as_str() {
            "everyone" | "viewer" => Some(UserTier::Everyone),
            "subscriber" | "sub" => Some(UserTier::Subscriber),
            "vip" => Some(UserTier::Vip),
            "moderator" | "mod" => Some(UserTier::Moderator),
            "broadcaster" | "streamer" => Some(UserTier::Broadcaster),
            _ => None,
        }
    }

    pub fn satisfies(self, required: UserTier) -> bool {
        self >= required
    }

    pub fn label(self) -> &'static str {
        match self {
            UserTier::Everyone => "everyone",
            UserTier::Subscriber => "subscriber",
            UserTier::Vip => "vip",
            UserTier::Moderator => "moderator",
            UserTier::Broadcaster => "broadcaster",
        }
    }
}

/// Static description of a chat command. Immutable after registration;
/// the dispatcher owns the lookup table built from these.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub min_tier: UserTier,
    pub cooldown_seconds: u32,
}

impl CommandSpec {
    pub const fn new(
        name: &'static str,
        aliases: &'static [&'static str],
        min_tier: UserTier,
        cooldown_seconds: u32,
    ) -> Self {
        Self {
            name,
            aliases,
            min_tier,
            cooldown_seconds,
        }
    }
}
