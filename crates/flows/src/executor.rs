//! Applies exactly one transition per inbound event.

use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use {
    futures::FutureExt,
    tracing::{debug, info, warn},
};

use parley_common::{ChatId, MessageRef, UserId};

use crate::{
    data::FlowData,
    definition::{
        ButtonClick, ButtonClickPolicy, ErrorPolicy, FlowDefinition, StepContext, StepDefinition,
        StepInput, StepResult,
    },
    engine::InboundKind,
    error::Error,
    outbox::Effect,
    prompt::{PromptRenderer, PromptSpec},
    registry::{FlowEndReason, FlowRegistry},
    state::UserFlowState,
    transport::{FlowTransport, InlineButton, OutboundMessage},
};

#[cfg(feature = "metrics")]
use parley_metrics::{counter, flows as flow_metrics, histogram, labels};

/// What a single call to [`StepExecutor::execute`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The pressed token was unknown (already cleaned up or never issued).
    StaleButton,
    /// The step's validator rejected the text; nothing changed.
    ValidationFailed,
    /// The step asked to stay where it is.
    Retried,
    /// The user moved to step `to`.
    Advanced { to: String },
    Completed,
    Cancelled,
    /// Step logic failed and the flow's error policy was applied.
    Recovered { cancelled: bool },
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StaleButton => "stale_button",
            Self::ValidationFailed => "validation_failed",
            Self::Retried => "retried",
            Self::Advanced { .. } => "advanced",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Recovered { .. } => "recovered",
        }
    }

    /// Whether the user's flow is over after this outcome.
    pub fn ended_flow(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Recovered { cancelled: true }
        )
    }
}

/// Runs step logic and interprets its [`StepResult`].
pub struct StepExecutor {
    registry: Arc<FlowRegistry>,
    renderer: Arc<dyn PromptRenderer>,
    transport: Arc<dyn FlowTransport>,
    default_button_policy: ButtonClickPolicy,
    stale_button_text: Option<String>,
}

impl StepExecutor {
    pub fn new(
        registry: Arc<FlowRegistry>,
        renderer: Arc<dyn PromptRenderer>,
        transport: Arc<dyn FlowTransport>,
    ) -> Self {
        Self {
            registry,
            renderer,
            transport,
            default_button_policy: ButtonClickPolicy::default(),
            stale_button_text: None,
        }
    }

    /// Policy for flows that do not set one themselves.
    #[must_use]
    pub fn with_default_button_policy(mut self, policy: ButtonClickPolicy) -> Self {
        self.default_button_policy = policy;
        self
    }

    /// Notice shown when acknowledging a press on an unknown token.
    #[must_use]
    pub fn with_stale_button_text(mut self, text: Option<String>) -> Self {
        self.stale_button_text = text;
        self
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn FlowTransport> {
        &self.transport
    }

    /// Process one event against the state held in `slot`.
    ///
    /// The caller must hold the user's slot lock for the whole call. Nothing
    /// is sent from here: transport calls are appended to `effects`, in the
    /// order they must reach the user, for the caller to hand to
    /// [`perform`](Self::perform) once the lock is released.
    ///
    /// Returns `None` when the slot holds no active flow. A stale button press
    /// is still acknowledged in that case.
    pub async fn execute(
        &self,
        slot: &mut Option<UserFlowState>,
        input: &InboundKind,
        effects: &mut Vec<Effect>,
    ) -> Option<StepOutcome> {
        let Some(state) = slot.as_ref() else {
            if let InboundKind::Button { callback_id, .. } = input {
                effects.push(acknowledgement(callback_id, self.stale_button_text.clone()));
            }
            return None;
        };
        let user_id = state.user_id;
        let chat_id = state.chat_id;
        let flow_name = state.flow_name.clone();
        let step_name = state.current_step.clone();
        let data = state.data.clone();

        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();

        // Resolve button tokens before anything else so that stale presses
        // never reach step logic.
        let click = match input {
            InboundKind::Button {
                callback_id, token, ..
            } => match self.registry.tokens().resolve(user_id, token) {
                Some(payload) => {
                    effects.push(acknowledgement(callback_id, None));
                    Some(ButtonClick {
                        token: token.clone(),
                        payload,
                    })
                },
                None => {
                    debug!(%user_id, flow = %flow_name, step = %step_name, %token, "stale button press");
                    #[cfg(feature = "metrics")]
                    counter!(flow_metrics::STALE_BUTTON_CLICKS_TOTAL, labels::FLOW => flow_name.clone())
                        .increment(1);
                    effects.push(acknowledgement(callback_id, self.stale_button_text.clone()));
                    return Some(StepOutcome::StaleButton);
                },
            },
            InboundKind::Text { .. } => None,
        };

        let Some(definition) = self.registry.flow(&flow_name) else {
            warn!(%user_id, flow = %flow_name, "active flow is no longer registered, cancelling");
            self.registry.end_flow(slot, FlowEndReason::Cancelled);
            if let Some(message) = ErrorPolicy::default().message() {
                queue_text(effects, chat_id, message);
            }
            return Some(StepOutcome::Recovered { cancelled: true });
        };
        let Some(step) = definition.step(&step_name) else {
            warn!(%user_id, flow = %flow_name, step = %step_name, "current step no longer exists, cancelling");
            self.registry.end_flow(slot, FlowEndReason::Cancelled);
            if let Some(message) = definition.error_policy().message() {
                queue_text(effects, chat_id, message);
            }
            return Some(StepOutcome::Recovered { cancelled: true });
        };

        let mut ctx = StepContext {
            user_id,
            chat_id,
            flow: flow_name.clone(),
            step: step_name.clone(),
            data,
        };
        let result = match (input, click) {
            (_, Some(click)) => self.run_handler(step, &mut ctx, StepInput::Button(click)).await,
            (InboundKind::Text { text }, None) => {
                match catch_unwind(AssertUnwindSafe(|| step.validate(text))) {
                    Ok(Ok(())) => self.run_handler(step, &mut ctx, StepInput::Text(text.clone())).await,
                    Ok(Err(reason)) => {
                        info!(%user_id, flow = %flow_name, step = %step_name, "input failed validation");
                        #[cfg(feature = "metrics")]
                        counter!(
                            flow_metrics::VALIDATION_FAILURES_TOTAL,
                            labels::FLOW => flow_name.clone(),
                            labels::STEP => step_name.clone()
                        )
                        .increment(1);
                        queue_text(effects, chat_id, &reason);
                        return Some(StepOutcome::ValidationFailed);
                    },
                    Err(payload) => Err(format!(
                        "validator panicked: {}",
                        panic_message(payload.as_ref())
                    )),
                }
            },
            (InboundKind::Button { .. }, None) => return Some(StepOutcome::StaleButton),
        };

        let applied = match result {
            Ok(result) => {
                debug!(%user_id, flow = %flow_name, step = %step_name, result = result.kind(), "step returned");
                self.apply(slot, &definition, ctx, result, effects).await
            },
            Err(reason) => Err(reason),
        };
        let outcome = match applied {
            Ok(outcome) => outcome,
            Err(reason) => {
                warn!(%user_id, flow = %flow_name, step = %step_name, %reason, "step failed");
                #[cfg(feature = "metrics")]
                counter!(
                    flow_metrics::STEP_FAILURES_TOTAL,
                    labels::FLOW => flow_name.clone(),
                    labels::STEP => step_name.clone()
                )
                .increment(1);
                self.apply_error_policy(slot, &definition, chat_id, effects)
            },
        };

        if let InboundKind::Button { token, message, .. } = input {
            let policy = definition
                .button_policy()
                .unwrap_or(self.default_button_policy);
            self.apply_button_policy(user_id, token, *message, policy, effects);
        }

        info!(
            %user_id,
            flow = %flow_name,
            step = %step_name,
            outcome = outcome.as_str(),
            "transition applied"
        );
        #[cfg(feature = "metrics")]
        {
            counter!(
                flow_metrics::TRANSITIONS_TOTAL,
                labels::FLOW => flow_name.clone(),
                labels::OUTCOME => outcome.as_str()
            )
            .increment(1);
            histogram!(flow_metrics::TRANSITION_DURATION_SECONDS, labels::FLOW => flow_name)
                .record(started.elapsed().as_secs_f64());
        }
        Some(outcome)
    }

    /// Run the step's handler. Errors and panics both come back as a reason
    /// string for the error policy.
    async fn run_handler(
        &self,
        step: &StepDefinition,
        ctx: &mut StepContext,
        input: StepInput,
    ) -> Result<StepResult, String> {
        let handler = Arc::clone(step.handler());
        match AssertUnwindSafe(handler.process(ctx, input))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(payload) => Err(format!("step panicked: {}", panic_message(payload.as_ref()))),
        }
    }

    /// Interpret a successful step result. `Err` is a step-defined failure
    /// (unknown jump target) and leaves the state untouched.
    async fn apply(
        &self,
        slot: &mut Option<UserFlowState>,
        definition: &FlowDefinition,
        ctx: StepContext,
        result: StepResult,
        effects: &mut Vec<Effect>,
    ) -> Result<StepOutcome, String> {
        let StepContext {
            user_id,
            chat_id,
            step,
            data,
            ..
        } = ctx;
        match result {
            StepResult::Retry { prompt } => {
                if let Some(state) = slot.as_mut() {
                    state.data = data.clone();
                    state.touch();
                }
                if let Some(prompt) = prompt {
                    self.queue_prompt(user_id, chat_id, &prompt, &data, true, effects)
                        .await;
                }
                Ok(StepOutcome::Retried)
            },
            StepResult::NextStep { prompt } => match definition.step_after(&step) {
                Some(next) => Ok(self.advance(slot, next, data, prompt, effects).await),
                None => Ok(self
                    .finish(slot, FlowEndReason::Completed, user_id, chat_id, data, prompt, effects)
                    .await),
            },
            StepResult::GoToStep { target, prompt } => match definition.step(&target) {
                Some(next) => Ok(self.advance(slot, next, data, prompt, effects).await),
                None => Err(Error::UnknownStep {
                    flow: definition.name().to_string(),
                    step: target,
                }
                .to_string()),
            },
            StepResult::CompleteFlow { prompt } => Ok(self
                .finish(slot, FlowEndReason::Completed, user_id, chat_id, data, prompt, effects)
                .await),
            StepResult::CancelFlow { prompt } => Ok(self
                .finish(slot, FlowEndReason::Cancelled, user_id, chat_id, data, prompt, effects)
                .await),
        }
    }

    async fn advance(
        &self,
        slot: &mut Option<UserFlowState>,
        next: &StepDefinition,
        data: FlowData,
        over: Option<PromptSpec>,
        effects: &mut Vec<Effect>,
    ) -> StepOutcome {
        let to = next.name().to_string();
        let Some(state) = slot.as_mut() else {
            return StepOutcome::Advanced { to };
        };
        state.data = data;
        state.move_to(&to);
        let (user_id, chat_id, data) = (state.user_id, state.chat_id, state.data.clone());

        let prompt = match over {
            Some(over) => next.prompt().merged_with(&over),
            None => next.prompt().clone(),
        };
        self.queue_prompt(user_id, chat_id, &prompt, &data, true, effects)
            .await;
        StepOutcome::Advanced { to }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        slot: &mut Option<UserFlowState>,
        reason: FlowEndReason,
        user_id: UserId,
        chat_id: ChatId,
        data: FlowData,
        prompt: Option<PromptSpec>,
        effects: &mut Vec<Effect>,
    ) -> StepOutcome {
        if let Some(state) = slot.as_mut() {
            state.data = data;
        }
        let ended = self.registry.end_flow(slot, reason);
        if let Some(prompt) = prompt {
            if !prompt.keyboard.is_empty() {
                debug!(%user_id, "dropping keyboard from final prompt of an ended flow");
            }
            let data = ended.map(|state| state.data).unwrap_or_default();
            self.queue_prompt(user_id, chat_id, &prompt, &data, false, effects)
                .await;
        }
        match reason {
            FlowEndReason::Completed => StepOutcome::Completed,
            FlowEndReason::Cancelled => StepOutcome::Cancelled,
        }
    }

    fn apply_error_policy(
        &self,
        slot: &mut Option<UserFlowState>,
        definition: &FlowDefinition,
        chat_id: ChatId,
        effects: &mut Vec<Effect>,
    ) -> StepOutcome {
        let policy = definition.error_policy();
        let cancelled = match policy {
            ErrorPolicy::CancelFlow { .. } => {
                self.registry.end_flow(slot, FlowEndReason::Cancelled);
                true
            },
            ErrorPolicy::Retry { .. } => {
                if let Some(state) = slot.as_mut() {
                    state.touch();
                }
                false
            },
        };
        if let Some(message) = policy.message() {
            queue_text(effects, chat_id, message);
        }
        StepOutcome::Recovered { cancelled }
    }

    fn apply_button_policy(
        &self,
        user_id: UserId,
        token: &str,
        message: Option<MessageRef>,
        policy: ButtonClickPolicy,
        effects: &mut Vec<Effect>,
    ) {
        if policy.invalidates_token() {
            self.registry.tokens().cleanup_token(user_id, token);
        }
        let Some(message) = message else {
            return;
        };
        match policy {
            ButtonClickPolicy::DeleteMessage => effects.push(Effect::DeleteMessage(message)),
            ButtonClickPolicy::DeleteKeyboard => effects.push(Effect::ClearKeyboard(message)),
            ButtonClickPolicy::Keep => {},
        }
    }

    /// Render `prompt` against `data` and queue it for delivery.
    ///
    /// With `with_buttons`, every button payload is registered as a token for
    /// `user_id` and the token goes on the wire in its place; otherwise the
    /// keyboard is dropped. A prompt that renders to nothing but buttons is
    /// skipped before any token is issued, since no platform will send a
    /// keyboard without a message. Returns whether a message was queued.
    pub async fn queue_prompt(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        prompt: &PromptSpec,
        data: &FlowData,
        with_buttons: bool,
        effects: &mut Vec<Effect>,
    ) -> bool {
        if prompt.is_empty() {
            return false;
        }
        let rendered = match self.renderer.render(prompt, data).await {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(%user_id, error = %e, "failed to render prompt");
                return false;
            },
        };
        if rendered.text.trim().is_empty() && rendered.image.is_none() {
            if with_buttons && rendered.button_count() > 0 {
                warn!(%user_id, buttons = rendered.button_count(), "prompt has buttons but no text or image, not sending");
            }
            return false;
        }

        let keyboard = if with_buttons {
            let tokens = self.registry.tokens();
            rendered
                .keyboard
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .map(|button| InlineButton {
                            label: button.label,
                            token: tokens.register(user_id, button.payload),
                        })
                        .collect()
                })
                .collect()
        } else {
            Vec::new()
        };

        effects.push(Effect::Send(OutboundMessage {
            chat_id,
            text: rendered.text,
            image: rendered.image,
            keyboard,
        }));
        true
    }

    /// Deliver one queued effect. Transport failures are logged and
    /// swallowed: the transition they belong to has already been applied.
    pub async fn perform(&self, effect: Effect) {
        match effect {
            Effect::Send(message) => {
                let chat_id = message.chat_id;
                if let Err(e) = self.transport.send(message).await {
                    warn!(%chat_id, error = %e, "failed to send message");
                }
            },
            Effect::Acknowledge {
                callback_id,
                notice,
            } => {
                if let Err(e) = self
                    .transport
                    .acknowledge(&callback_id, notice.as_deref())
                    .await
                {
                    warn!(callback_id, error = %e, "failed to acknowledge button press");
                }
            },
            Effect::DeleteMessage(message) => {
                if let Err(e) = self.transport.delete_message(message).await {
                    warn!(chat_id = %message.chat_id, error = %e, "failed to delete message");
                }
            },
            Effect::ClearKeyboard(message) => {
                if let Err(e) = self.transport.clear_keyboard(message).await {
                    warn!(chat_id = %message.chat_id, error = %e, "failed to clear keyboard");
                }
            },
        }
    }
}

fn acknowledgement(callback_id: &str, notice: Option<String>) -> Effect {
    Effect::Acknowledge {
        callback_id: callback_id.to_string(),
        notice,
    }
}

/// Queue plain text. Blank text is skipped.
pub(crate) fn queue_text(effects: &mut Vec<Effect>, chat_id: ChatId, text: &str) {
    if !text.trim().is_empty() {
        effects.push(Effect::Send(OutboundMessage::text(chat_id, text)));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
