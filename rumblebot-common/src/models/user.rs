use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The chat identity a platform session hands us for each inbound message.
/// Logins are stored lowercased so lookups by name are case-insensitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chatter {
    pub user_id: Uuid,
    pub login: String,
}

impl Chatter {
    pub fn new(user_id: Uuid, login: &str) -> Self {
        Self {
            user_id,
            login: login.to_lowercase(),
        }
    }
}
