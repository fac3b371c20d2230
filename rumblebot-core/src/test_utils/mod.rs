// File: rumblebot-core/src/test_utils/mod.rs
//
// Shared fakes for unit and integration tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use rumblebot_common::models::Chatter;
use rumblebot_common::traits::store_traits::ResponseEmitter;

use crate::scheduler::Scheduler;
use crate::services::games::GameContext;
use crate::storage::{MemoryPointsLedger, MemoryStateStore};

/// Captures everything the engines would have said, per channel.
#[derive(Default)]
pub struct RecordingEmitter {
    lines: Mutex<Vec<(String, String)>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(String, String)> {
        self.lines.lock().unwrap().clone()
    }

    pub fn texts_for(&self, channel: &str) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .any(|(_, t)| t.contains(needle))
    }

    pub fn clear(&self) {
        self.lines.lock().unwrap().clear();
    }
}

#[async_trait]
impl ResponseEmitter for RecordingEmitter {
    async fn say(&self, channel: &str, text: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((channel.to_string(), text.to_string()));
    }
}

/// In-memory wiring for a single test: store, ledger with audit trail,
/// recording emitter and a seeded RNG so every draw is reproducible.
pub struct TestHarness {
    pub ctx: Arc<GameContext>,
    pub store: Arc<MemoryStateStore>,
    pub ledger: Arc<MemoryPointsLedger>,
    pub emitter: Arc<RecordingEmitter>,
}

impl TestHarness {
    pub fn with_seed(seed: u64) -> Self {
        let store = Arc::new(MemoryStateStore::new());
        let ledger = Arc::new(MemoryPointsLedger::new());
        let emitter = Arc::new(RecordingEmitter::new());
        let ctx = Arc::new(GameContext::with_seed(
            store.clone(),
            ledger.clone(),
            emitter.clone(),
            Scheduler::new(),
            seed,
        ));
        Self {
            ctx,
            store,
            ledger,
            emitter,
        }
    }

    /// A chatter with the given login and a seeded balance.
    pub fn chatter(&self, channel: &str, login: &str, points: i64) -> Chatter {
        let chatter = Chatter::new(Uuid::new_v4(), login);
        self.ledger.set_points(channel, chatter.user_id, points);
        chatter
    }
}
