// tests/dispatcher_tests.rs
//
// Dispatcher behavior end to end: parsing, tiers, cooldowns and failure
// isolation, plus the full wiring of every game command.

use std::sync::Arc;

use async_trait::async_trait;

use rumblebot_common::models::{ActivityKind, Chatter, CommandSpec, UserTier};
use rumblebot_common::traits::store_traits::PointsLedger;
use rumblebot_common::Error;
use rumblebot_core::services::dispatcher::{CommandContext, CommandHandler, Dispatcher};
use rumblebot_core::services::games::{GameConfig, GameServices};
use rumblebot_core::test_utils::TestHarness;
use uuid::Uuid;

const CHAN: &str = "testchan";

fn wired_dispatcher(h: &TestHarness) -> (Dispatcher, GameServices) {
    let games = GameServices::new(h.ctx.clone(), GameConfig::default());
    let mut dispatcher = Dispatcher::new(h.emitter.clone());
    games.register_all(&mut dispatcher);
    (dispatcher, games)
}

/// Minimal handler for exercising the dispatcher gates in isolation.
struct ProbeCommand {
    spec: CommandSpec,
    fail_with: Option<fn() -> Error>,
}

#[async_trait]
impl CommandHandler for ProbeCommand {
    fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    async fn handle(&self, _ctx: &CommandContext<'_>) -> Result<Vec<String>, Error> {
        match self.fail_with {
            Some(make) => Err(make()),
            None => Ok(vec!["probe ok".to_string()]),
        }
    }
}

#[tokio::test]
async fn unknown_commands_and_plain_chat_are_ignored() {
    let h = TestHarness::with_seed(1);
    let (dispatcher, _games) = wired_dispatcher(&h);
    let alice = Chatter::new(Uuid::new_v4(), "alice");

    dispatcher.dispatch(CHAN, &alice, UserTier::Everyone, "hello chat").await;
    dispatcher.dispatch(CHAN, &alice, UserTier::Everyone, "!nosuchcommand foo").await;
    dispatcher.dispatch(CHAN, &alice, UserTier::Everyone, "!").await;

    assert!(h.emitter.lines().is_empty());
}

#[tokio::test]
async fn command_tier_gate_blocks_and_broadcaster_bypasses() {
    let h = TestHarness::with_seed(2);
    let mut dispatcher = Dispatcher::new(h.emitter.clone());
    dispatcher.register(Arc::new(ProbeCommand {
        spec: CommandSpec::new("modonly", &[], UserTier::Moderator, 0),
        fail_with: None,
    }));
    let alice = Chatter::new(Uuid::new_v4(), "alice");

    dispatcher.dispatch(CHAN, &alice, UserTier::Subscriber, "!modonly").await;
    assert!(h.emitter.contains("requires moderator"));
    assert!(!h.emitter.contains("probe ok"));

    h.emitter.clear();
    dispatcher.dispatch(CHAN, &alice, UserTier::Broadcaster, "!modonly").await;
    assert!(h.emitter.contains("probe ok"));
}

#[tokio::test]
async fn cooldown_drops_repeat_invocations_silently() {
    let h = TestHarness::with_seed(3);
    let mut dispatcher = Dispatcher::new(h.emitter.clone());
    dispatcher.register(Arc::new(ProbeCommand {
        spec: CommandSpec::new("slow", &[], UserTier::Everyone, 60),
        fail_with: None,
    }));
    let alice = Chatter::new(Uuid::new_v4(), "alice");
    let bob = Chatter::new(Uuid::new_v4(), "bob");

    dispatcher.dispatch(CHAN, &alice, UserTier::Everyone, "!slow").await;
    dispatcher.dispatch(CHAN, &alice, UserTier::Everyone, "!slow").await;
    // Silent drop: exactly one response, no cooldown chatter.
    assert_eq!(h.emitter.lines().len(), 1);

    // Another user is on their own cooldown key.
    dispatcher.dispatch(CHAN, &bob, UserTier::Everyone, "!slow").await;
    assert_eq!(h.emitter.lines().len(), 2);
}

#[tokio::test]
async fn handler_failures_are_contained_per_invocation() {
    let h = TestHarness::with_seed(4);
    let mut dispatcher = Dispatcher::new(h.emitter.clone());
    dispatcher.register(Arc::new(ProbeCommand {
        spec: CommandSpec::new("broken", &[], UserTier::Everyone, 0),
        fail_with: Some(|| Error::Store("backend offline".to_string())),
    }));
    dispatcher.register(Arc::new(ProbeCommand {
        spec: CommandSpec::new("fine", &[], UserTier::Everyone, 0),
        fail_with: None,
    }));
    let alice = Chatter::new(Uuid::new_v4(), "alice");

    dispatcher.dispatch(CHAN, &alice, UserTier::Everyone, "!broken").await;
    assert!(h.emitter.contains("something went wrong"));
    // The raw backend error is not shown to chat.
    assert!(!h.emitter.contains("backend offline"));

    // The dispatcher keeps serving other commands afterwards.
    dispatcher.dispatch(CHAN, &alice, UserTier::Everyone, "!fine").await;
    assert!(h.emitter.contains("probe ok"));
}

#[tokio::test]
async fn user_errors_come_back_as_a_chat_reply() {
    let h = TestHarness::with_seed(5);
    let (dispatcher, _games) = wired_dispatcher(&h);
    let alice = h.chatter(CHAN, "alice", 50);

    dispatcher
        .dispatch(CHAN, &alice, UserTier::Everyone, "!heist start 5000")
        .await;
    assert!(h.emitter.contains("@alice: not enough points"));
}

#[tokio::test]
async fn subcommand_tier_gate_is_enforced_for_management_ops() {
    let h = TestHarness::with_seed(6);
    let (dispatcher, _games) = wired_dispatcher(&h);
    let alice = h.chatter(CHAN, "alice", 500);

    dispatcher
        .dispatch(CHAN, &alice, UserTier::Everyone, "!raffle start 10")
        .await;
    assert!(h.emitter.contains("requires moderator"));

    h.emitter.clear();
    dispatcher
        .dispatch(CHAN, &alice, UserTier::Moderator, "!raffle start 10")
        .await;
    assert!(h.emitter.contains("raffle time"));
}

#[tokio::test]
async fn aliases_resolve_case_insensitively() {
    let h = TestHarness::with_seed(7);
    let (dispatcher, _games) = wired_dispatcher(&h);
    let modchat = h.chatter(CHAN, "modchat", 0);

    dispatcher
        .dispatch(CHAN, &modchat, UserTier::Moderator, "!TOURNEY open 100")
        .await;
    assert!(h.emitter.contains("tournament open"));
}

#[tokio::test]
async fn full_wiring_runs_a_heist_through_chat_commands() {
    let h = TestHarness::with_seed(8);
    let (dispatcher, _games) = wired_dispatcher(&h);
    let alice = h.chatter(CHAN, "alice", 1000);
    let bob = h.chatter(CHAN, "bob", 1000);

    dispatcher
        .dispatch(CHAN, &alice, UserTier::Everyone, "!heist start 100")
        .await;
    dispatcher
        .dispatch(CHAN, &bob, UserTier::Everyone, "!heist join 150")
        .await;

    assert_eq!(h.ledger.get_points(CHAN, alice.user_id).await.unwrap(), 900);
    assert_eq!(h.ledger.get_points(CHAN, bob.user_id).await.unwrap(), 850);

    let record = h
        .ctx
        .activities
        .load(ActivityKind::Heist, CHAN)
        .await
        .unwrap();
    assert!(record.is_some(), "heist record should be recruiting in the store");

    // Channels are isolated: the other channel has no record.
    let other = h
        .ctx
        .activities
        .load(ActivityKind::Heist, "otherchan")
        .await
        .unwrap();
    assert!(other.is_none());
}
