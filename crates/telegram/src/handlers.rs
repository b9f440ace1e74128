use {
    async_trait::async_trait,
    teloxide::{
        Bot,
        types::{CallbackQuery, Message},
    },
    tracing::debug,
};

use parley_flows::{ChatId, FlowEngine, HandleOutcome, InboundEvent, MessageRef, UserId};

#[cfg(feature = "metrics")]
use parley_metrics::{counter, labels, telegram as tg_metrics};

/// An update the flow engine did not consume.
#[derive(Debug, Clone)]
pub enum Unhandled {
    Message(Message),
    /// Button presses reach the fallback already answered.
    CallbackQuery(CallbackQuery),
}

/// Host-side dispatch for everything outside a flow: commands, free chat,
/// buttons that belong to other features.
#[async_trait]
pub trait UpdateFallback: Send + Sync {
    async fn handle(&self, bot: &Bot, update: Unhandled) -> anyhow::Result<()>;
}

/// Fallback that drops unhandled updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreUnhandled;

#[async_trait]
impl UpdateFallback for IgnoreUnhandled {
    async fn handle(&self, _bot: &Bot, update: Unhandled) -> anyhow::Result<()> {
        match update {
            Unhandled::Message(msg) => {
                debug!(chat_id = msg.chat.id.0, "ignoring message outside of a flow");
            },
            Unhandled::CallbackQuery(query) => {
                debug!(user_id = query.from.id.0, "ignoring button press outside of a flow");
            },
        }
        Ok(())
    }
}

/// Convert a text message (or a media caption) from a human sender.
pub fn event_from_message(msg: &Message) -> Option<InboundEvent> {
    let from = msg.from.as_ref().filter(|user| !user.is_bot)?;
    let text = msg.text().or_else(|| msg.caption())?;
    Some(InboundEvent::text(
        UserId(from.id.0),
        ChatId(msg.chat.id.0),
        text,
    ))
}

/// Convert an inline-keyboard press. The callback data is the token.
pub fn event_from_callback(query: &CallbackQuery) -> Option<InboundEvent> {
    let token = query.data.as_deref()?;
    let user_id = UserId(query.from.id.0);
    let message = query
        .message
        .as_ref()
        .map(|m| MessageRef::new(ChatId(m.chat().id.0), m.id().0));
    // Without the originating message, the private chat with the user is the
    // only place to answer.
    let chat_id = message.map_or(ChatId(query.from.id.0 as i64), |m| m.chat_id);
    Some(InboundEvent::button(
        user_id,
        chat_id,
        query.id.clone(),
        token,
        message,
    ))
}

/// Route an inbound message through the engine, or to the fallback.
pub async fn handle_message(
    msg: Message,
    bot: &Bot,
    engine: &FlowEngine,
    fallback: &dyn UpdateFallback,
) -> anyhow::Result<()> {
    #[cfg(feature = "metrics")]
    counter!(tg_metrics::UPDATES_RECEIVED_TOTAL, labels::KIND => "message").increment(1);

    let Some(event) = event_from_message(&msg) else {
        return fallback.handle(bot, Unhandled::Message(msg)).await;
    };
    let outcome = engine.handle(event).await;
    debug!(chat_id = msg.chat.id.0, ?outcome, "telegram message routed");
    finish(outcome, bot, fallback, Unhandled::Message(msg), "message").await
}

/// Route an inline-keyboard press through the engine, or to the fallback.
pub async fn handle_callback_query(
    query: CallbackQuery,
    bot: &Bot,
    engine: &FlowEngine,
    fallback: &dyn UpdateFallback,
) -> anyhow::Result<()> {
    #[cfg(feature = "metrics")]
    counter!(tg_metrics::UPDATES_RECEIVED_TOTAL, labels::KIND => "callback_query").increment(1);

    let Some(event) = event_from_callback(&query) else {
        return fallback.handle(bot, Unhandled::CallbackQuery(query)).await;
    };
    let outcome = engine.handle(event).await;
    debug!(user_id = query.from.id.0, ?outcome, "telegram callback routed");
    finish(outcome, bot, fallback, Unhandled::CallbackQuery(query), "callback_query").await
}

async fn finish(
    outcome: HandleOutcome,
    bot: &Bot,
    fallback: &dyn UpdateFallback,
    update: Unhandled,
    _kind: &'static str,
) -> anyhow::Result<()> {
    if outcome.is_handled() {
        #[cfg(feature = "metrics")]
        counter!(tg_metrics::UPDATES_HANDLED_TOTAL, labels::KIND => _kind).increment(1);
        return Ok(());
    }
    fallback.handle(bot, update).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        std::sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use {
        axum::{Json, Router, body::Bytes, extract::State, http::Uri, routing::post},
        parley_flows::{
            ButtonSpec, CallbackPayload, FlowData, FlowDefinition, FlowEngineConfig, FlowRegistry,
            InboundKind, PromptSpec, StepBuilder, StepResult, TemplateRenderer,
        },
        serde_json::{Value, json},
        tokio::sync::oneshot,
    };

    use crate::outbound::TelegramTransport;

    #[derive(Debug, Clone)]
    struct CapturedRequest {
        method: String,
        body: Value,
    }

    #[derive(Clone, Default)]
    struct MockTelegramApi {
        requests: Arc<Mutex<Vec<CapturedRequest>>>,
        next_message_id: Arc<AtomicUsize>,
    }

    impl MockTelegramApi {
        fn calls(&self, method: &str) -> Vec<Value> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.method.eq_ignore_ascii_case(method))
                .map(|r| r.body.clone())
                .collect()
        }
    }

    async fn telegram_api_handler(
        State(state): State<MockTelegramApi>,
        uri: Uri,
        body: Bytes,
    ) -> Json<Value> {
        let method = uri.path().rsplit('/').next().unwrap_or_default().to_string();
        let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        let chat_id = body.get("chat_id").and_then(Value::as_i64).unwrap_or(42);
        state.requests.lock().unwrap().push(CapturedRequest {
            method: method.clone(),
            body,
        });

        if method.eq_ignore_ascii_case("SendMessage") {
            let id = state.next_message_id.fetch_add(1, Ordering::SeqCst) + 1;
            Json(json!({
                "ok": true,
                "result": {
                    "message_id": id,
                    "date": 0,
                    "chat": { "id": chat_id, "type": "private", "first_name": "Alice" },
                    "text": "ok"
                }
            }))
        } else {
            Json(json!({ "ok": true, "result": true }))
        }
    }

    struct MockServer {
        api: MockTelegramApi,
        bot: Bot,
        shutdown: oneshot::Sender<()>,
        server: tokio::task::JoinHandle<()>,
    }

    async fn start_mock_api() -> MockServer {
        let api = MockTelegramApi::default();
        let app = Router::new()
            .route("/{*path}", post(telegram_api_handler))
            .with_state(api.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("serve mock telegram api");
        });

        let api_url = reqwest::Url::parse(&format!("http://{addr}/")).expect("parse api url");
        let bot = Bot::new("test-token").set_api_url(api_url);
        MockServer {
            api,
            bot,
            shutdown,
            server,
        }
    }

    #[derive(Default)]
    struct CountingFallback {
        messages: AtomicUsize,
        callbacks: AtomicUsize,
    }

    #[async_trait]
    impl UpdateFallback for CountingFallback {
        async fn handle(&self, _bot: &Bot, update: Unhandled) -> anyhow::Result<()> {
            match update {
                Unhandled::Message(_) => self.messages.fetch_add(1, Ordering::SeqCst),
                Unhandled::CallbackQuery(_) => self.callbacks.fetch_add(1, Ordering::SeqCst),
            };
            Ok(())
        }
    }

    fn text_message(text: &str) -> Message {
        serde_json::from_value(json!({
            "message_id": 10,
            "date": 1,
            "chat": { "id": 42, "type": "private", "first_name": "Alice" },
            "from": { "id": 1001, "is_bot": false, "first_name": "Alice" },
            "text": text
        }))
        .expect("deserialize text message")
    }

    fn callback_query(data: &str, message_id: i32) -> CallbackQuery {
        serde_json::from_value(json!({
            "id": "cbq-1",
            "from": { "id": 1001, "is_bot": false, "first_name": "Alice" },
            "chat_instance": "ci",
            "data": data,
            "message": {
                "message_id": message_id,
                "date": 1,
                "chat": { "id": 42, "type": "private", "first_name": "Alice" },
                "from": { "id": 999, "is_bot": true, "first_name": "Bot" },
                "text": "Pick a size"
            }
        }))
        .expect("deserialize callback query")
    }

    #[test]
    fn message_event_carries_sender_and_chat() {
        let event = event_from_message(&text_message("hello")).unwrap();
        assert_eq!(event, InboundEvent::text(UserId(1001), ChatId(42), "hello"));
    }

    #[test]
    fn messages_from_bots_are_skipped() {
        let msg: Message = serde_json::from_value(json!({
            "message_id": 1,
            "date": 1,
            "chat": { "id": 42, "type": "private", "first_name": "Alice" },
            "from": { "id": 7, "is_bot": true, "first_name": "Other" },
            "text": "beep"
        }))
        .unwrap();
        assert!(event_from_message(&msg).is_none());
    }

    #[test]
    fn callback_event_carries_token_and_message() {
        let event = event_from_callback(&callback_query("abc123", 5)).unwrap();
        assert_eq!(event.user_id, UserId(1001));
        assert_eq!(event.chat_id, ChatId(42));
        assert_eq!(event.kind, InboundKind::Button {
            callback_id: "cbq-1".into(),
            token: "abc123".into(),
            message: Some(MessageRef::new(ChatId(42), 5)),
        });
    }

    #[tokio::test]
    async fn button_round_trip_through_telegram_api() {
        let mock = start_mock_api().await;
        let engine = FlowEngine::new(
            Arc::new(FlowRegistry::new()),
            Arc::new(TemplateRenderer),
            Arc::new(TelegramTransport::new(mock.bot.clone())),
            FlowEngineConfig::default(),
        );
        let chosen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&chosen);
        engine.register_flow(
            FlowDefinition::builder("coffee")
                .step(
                    StepBuilder::new("size")
                        .prompt(PromptSpec::text("Pick a size").with_row(vec![
                            ButtonSpec::new("Small", CallbackPayload::new(250_u32)),
                            ButtonSpec::new("Large", CallbackPayload::new(400_u32)),
                        ]))
                        .process(move |_, input| {
                            let ml = input.payload().and_then(|p| p.downcast_ref::<u32>());
                            *sink.lock().unwrap() = ml.copied();
                            Ok(StepResult::complete().with_text("Brewing."))
                        }),
                )
                .build()
                .unwrap(),
        );

        engine
            .start_flow(UserId(1001), ChatId(42), "coffee", FlowData::new())
            .await
            .unwrap();

        let sent = mock.api.calls("SendMessage");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["text"], "Pick a size");
        let keyboard = &sent[0]["reply_markup"]["inline_keyboard"][0];
        assert_eq!(keyboard[1]["text"], "Large");
        let token = keyboard[1]["callback_data"].as_str().unwrap().to_string();
        assert!(token.len() <= 64);

        let fallback = CountingFallback::default();
        handle_callback_query(callback_query(&token, 1), &mock.bot, &engine, &fallback)
            .await
            .unwrap();

        assert_eq!(*chosen.lock().unwrap(), Some(400));
        let answers = mock.api.calls("AnswerCallbackQuery");
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0]["callback_query_id"], "cbq-1");
        let sent = mock.api.calls("SendMessage");
        assert_eq!(sent.last().unwrap()["text"], "Brewing.");
        assert!(sent.last().unwrap().get("reply_markup").is_none());
        assert_eq!(fallback.callbacks.load(Ordering::SeqCst), 0);

        // Outside of a flow, text goes to the fallback.
        handle_message(text_message("hi"), &mock.bot, &engine, &fallback)
            .await
            .unwrap();
        assert_eq!(fallback.messages.load(Ordering::SeqCst), 1);

        let _ = mock.shutdown.send(());
        mock.server.await.expect("server join");
    }
}
