//! Per-user serialization and cross-user isolation.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::future::join_all,
    tokio::{
        sync::{Notify, Semaphore},
        time::timeout,
    },
};

use parley_flows::{
    ChatId, FlowData, FlowDefinition, FlowEngine, FlowEngineConfig, FlowRegistry, FlowTransport,
    HandleOutcome, InboundEvent, MessageRef, OutboundMessage, PromptSpec, StepBuilder, StepContext,
    StepHandler, StepInput, StepOutcome, StepResult, TemplateRenderer, UserId,
    testing::RecordingTransport,
};

/// Records which step processed each event, yielding in between so that
/// unsynchronized callers would interleave.
struct SlowRecorder {
    seen: Arc<Mutex<Vec<(UserId, String)>>>,
}

#[async_trait]
impl StepHandler for SlowRecorder {
    async fn process(&self, ctx: &mut StepContext, _input: StepInput) -> anyhow::Result<StepResult> {
        tokio::task::yield_now().await;
        self.seen
            .lock()
            .unwrap()
            .push((ctx.user_id, ctx.step.clone()));
        tokio::task::yield_now().await;
        Ok(StepResult::next())
    }
}

fn engine(seen: &Arc<Mutex<Vec<(UserId, String)>>>) -> FlowEngine {
    let engine = FlowEngine::new(
        Arc::new(FlowRegistry::new()),
        Arc::new(TemplateRenderer),
        Arc::new(RecordingTransport::new()),
        FlowEngineConfig::default(),
    );
    let mut builder = FlowDefinition::builder("steps");
    for name in ["a", "b", "c"] {
        builder = builder.step(StepBuilder::new(name).handler(SlowRecorder {
            seen: Arc::clone(seen),
        }));
    }
    engine.register_flow(builder.build().unwrap());
    engine
}

#[tokio::test]
async fn duplicate_events_for_one_user_are_serialized() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let engine = engine(&seen);
    let user = UserId(1);
    engine
        .start_flow(user, ChatId(1), "steps", FlowData::new())
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        engine.handle(InboundEvent::text(user, ChatId(1), "go")),
        engine.handle(InboundEvent::text(user, ChatId(1), "go")),
    );

    let steps: Vec<String> = seen.lock().unwrap().iter().map(|(_, s)| s.clone()).collect();
    assert_eq!(steps, vec!["a", "b"]);
    let mut outcomes = vec![first, second];
    outcomes.sort_by_key(|o| format!("{o:?}"));
    assert_eq!(outcomes, vec![
        HandleOutcome::Handled(StepOutcome::Advanced { to: "b".into() }),
        HandleOutcome::Handled(StepOutcome::Advanced { to: "c".into() }),
    ]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn users_advance_independently() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let engine = Arc::new(engine(&seen));
    let users: Vec<UserId> = (1..=32).map(UserId).collect();
    for user in &users {
        engine
            .start_flow(*user, ChatId(user.0 as i64), "steps", FlowData::new())
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for user in &users {
        for _ in 0..3 {
            let engine = Arc::clone(&engine);
            let user = *user;
            tasks.push(tokio::spawn(async move {
                engine
                    .handle(InboundEvent::text(user, ChatId(user.0 as i64), "go"))
                    .await
            }));
        }
    }
    let outcomes = join_all(tasks).await;
    assert!(outcomes.into_iter().all(|o| o.unwrap().is_handled()));

    let seen = seen.lock().unwrap().clone();
    for user in &users {
        let steps: Vec<&str> = seen
            .iter()
            .filter(|(u, _)| u == user)
            .map(|(_, s)| s.as_str())
            .collect();
        assert_eq!(steps, vec!["a", "b", "c"], "user {user}");
        assert!(!engine.is_user_in_flow(*user).await);
    }
    assert_eq!(engine.registry().tokens().user_count(), 0);
}

/// Transport whose sends block, once armed, until the test hands out permits.
struct GatedTransport {
    inner: RecordingTransport,
    armed: AtomicBool,
    entered: Notify,
    permits: Semaphore,
}

impl GatedTransport {
    fn new() -> Self {
        Self {
            inner: RecordingTransport::new(),
            armed: AtomicBool::new(false),
            entered: Notify::new(),
            permits: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl FlowTransport for GatedTransport {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<Option<MessageRef>> {
        if self.armed.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.permits.acquire().await?.forget();
        }
        self.inner.send(message).await
    }

    async fn acknowledge(&self, callback_id: &str, notice: Option<&str>) -> anyhow::Result<()> {
        self.inner.acknowledge(callback_id, notice).await
    }

    async fn delete_message(&self, message: MessageRef) -> anyhow::Result<()> {
        self.inner.delete_message(message).await
    }

    async fn clear_keyboard(&self, message: MessageRef) -> anyhow::Result<()> {
        self.inner.clear_keyboard(message).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_delivery_does_not_hold_the_user_lock() {
    let transport = Arc::new(GatedTransport::new());
    let engine = Arc::new(FlowEngine::new(
        Arc::new(FlowRegistry::new()),
        Arc::new(TemplateRenderer),
        transport.clone(),
        FlowEngineConfig::default(),
    ));
    let mut builder = FlowDefinition::builder("steps");
    for (name, prompt) in [("a", "A"), ("b", "B"), ("c", "C")] {
        builder = builder.step(
            StepBuilder::new(name)
                .prompt(PromptSpec::text(prompt))
                .process(|_, _| Ok(StepResult::next())),
        );
    }
    engine.register_flow(builder.build().unwrap());
    let (user, chat) = (UserId(1), ChatId(1));
    engine
        .start_flow(user, chat, "steps", FlowData::new())
        .await
        .unwrap();
    transport.armed.store(true, Ordering::SeqCst);

    let entered = transport.entered.notified();
    let first = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.handle(InboundEvent::text(user, chat, "go")).await }
    });
    entered.await;

    // Delivery of "B" is stuck in the transport; state is still readable and
    // the next event is applied without waiting for it.
    timeout(Duration::from_millis(500), async {
        assert!(engine.is_user_in_flow(user).await);
        assert_eq!(engine.registry().snapshot(user).await.unwrap().current_step, "b");
        assert_eq!(engine.registry().active_flow_count().await, 1);
        let second = engine.handle(InboundEvent::text(user, chat, "go")).await;
        assert_eq!(
            second,
            HandleOutcome::Handled(StepOutcome::Advanced { to: "c".into() })
        );
    })
    .await
    .expect("user state stayed locked during delivery");

    transport.permits.add_permits(2);
    assert_eq!(
        first.await.unwrap(),
        HandleOutcome::Handled(StepOutcome::Advanced { to: "b".into() })
    );
    assert_eq!(transport.inner.sent_texts(), vec!["A", "B", "C"]);
}
