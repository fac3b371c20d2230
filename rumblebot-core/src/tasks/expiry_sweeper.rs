// rumblebot-core/src/tasks/expiry_sweeper.rs
//
// Safety net for scheduled transitions lost to a process restart: scan
// every stored activity and advance the ones whose stored deadline has
// passed. Sound because every `advance` re-verifies state and is
// idempotent against both stale timers and this sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use rumblebot_common::traits::activity_traits::GroupActivity;
use rumblebot_common::Error;

use crate::storage::ActivityStore;

/// Spawns a background task that periodically sweeps overdue activities.
pub fn spawn_expiry_sweeper(
    activities: ActivityStore,
    engines: Vec<Arc<dyn GroupActivity>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(interval).await;
            match sweep_once(&activities, &engines).await {
                Ok(0) => {}
                Ok(n) => debug!("expiry sweep advanced {} overdue activities", n),
                Err(e) => warn!("expiry sweep failed: {:?}", e),
            }
        }
    })
}

/// One sweep pass; returns how many activities were advanced.
pub async fn sweep_once(
    activities: &ActivityStore,
    engines: &[Arc<dyn GroupActivity>],
) -> Result<usize, Error> {
    let now = Utc::now();
    let mut advanced = 0usize;

    for engine in engines {
        let kind = engine.kind();
        for channel in activities.channels_with(kind).await? {
            // A malformed document must not stall the rest of the sweep.
            let record = match activities.load(kind, &channel).await {
                Ok(Some(r)) => r,
                Ok(None) => continue,
                Err(e) => {
                    warn!("skipping unreadable {:?} record in '{}': {:?}", kind, channel, e);
                    continue;
                }
            };
            let overdue = record
                .state
                .next_deadline()
                .map(|deadline| deadline <= now)
                .unwrap_or(false);
            if !overdue {
                continue;
            }
            debug!("sweeping overdue {:?} in '{}'", kind, channel);
            if let Err(e) = engine.advance(&channel).await {
                warn!("sweep advance of {:?} in '{}' failed: {:?}", kind, channel, e);
            } else {
                advanced += 1;
            }
        }
    }
    Ok(advanced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumblebot_common::models::{ActivityKind, ActivityState, Chatter};
    use rumblebot_common::traits::store_traits::StateStore;
    use uuid::Uuid;

    use crate::services::games::{GameConfig, GameServices};
    use crate::test_utils::TestHarness;

    const CHAN: &str = "testchan";

    #[tokio::test]
    async fn sweep_resolves_overdue_and_leaves_fresh_alone() {
        let h = TestHarness::with_seed(81);
        let games = GameServices::new(h.ctx.clone(), GameConfig::default());
        let alice = Chatter::new(Uuid::new_v4(), "alice");
        h.ledger.set_points(CHAN, alice.user_id, 1000);

        // A raffle with time left and a duel already past its window.
        games.raffle.start(CHAN, 10, 3600).await.unwrap();
        games.duel.challenge(CHAN, &alice, "bob", 50).await.unwrap();
        {
            let mut record = h
                .ctx
                .activities
                .load(ActivityKind::Duel, CHAN)
                .await
                .unwrap()
                .unwrap();
            if let ActivityState::Duel(d) = &mut record.state {
                d.responds_by = Utc::now() - chrono::Duration::seconds(5);
            }
            h.ctx.activities.save(&record).await.unwrap();
        }

        let advanced = sweep_once(&h.ctx.activities, &games.engines()).await.unwrap();
        assert_eq!(advanced, 1);

        assert!(h
            .ctx
            .activities
            .load(ActivityKind::Duel, CHAN)
            .await
            .unwrap()
            .is_none());
        assert!(h
            .ctx
            .activities
            .load(ActivityKind::Raffle, CHAN)
            .await
            .unwrap()
            .is_some());

        // Second sweep finds nothing overdue.
        let advanced = sweep_once(&h.ctx.activities, &games.engines()).await.unwrap();
        assert_eq!(advanced, 0);
    }

    #[tokio::test]
    async fn malformed_record_does_not_stall_the_sweep() {
        let h = TestHarness::with_seed(82);
        let games = GameServices::new(h.ctx.clone(), GameConfig::default());

        h.store.set("duel:broken", b"{garbage".to_vec()).await.unwrap();
        let advanced = sweep_once(&h.ctx.activities, &games.engines()).await.unwrap();
        assert_eq!(advanced, 0);
    }
}
