//! Single entry point for inbound chat events.

use std::sync::Arc;

use tracing::{debug, info};

use parley_common::{ChatId, MessageRef, UserId};

use crate::{
    config::{FlowEngineConfig, StartConflictPolicy},
    data::FlowData,
    definition::FlowDefinition,
    error::{Error, Result},
    executor::{StepExecutor, StepOutcome, queue_text},
    prompt::PromptRenderer,
    registry::{FlowEndReason, FlowRegistry, UserEntry},
    state::UserFlowState,
    transport::FlowTransport,
};

/// A platform-neutral inbound update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub kind: InboundKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    Text {
        text: String,
    },
    Button {
        /// Platform id used to acknowledge the press.
        callback_id: String,
        token: String,
        /// Message carrying the pressed keyboard, when known.
        message: Option<MessageRef>,
    },
}

impl InboundEvent {
    pub fn text(user_id: UserId, chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            user_id,
            chat_id,
            kind: InboundKind::Text { text: text.into() },
        }
    }

    pub fn button(
        user_id: UserId,
        chat_id: ChatId,
        callback_id: impl Into<String>,
        token: impl Into<String>,
        message: Option<MessageRef>,
    ) -> Self {
        Self {
            user_id,
            chat_id,
            kind: InboundKind::Button {
                callback_id: callback_id.into(),
                token: token.into(),
                message,
            },
        }
    }
}

/// Result of [`FlowEngine::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The event drove a transition (or was rejected by validation, or was a
    /// stale button press).
    Handled(StepOutcome),
    /// An exit command cancelled the user's flow.
    Exited,
    /// The user has no active flow; the caller should dispatch normally.
    NotInFlow,
    /// A global command; the caller should dispatch normally and the flow is
    /// left untouched.
    GlobalCommand,
}

impl HandleOutcome {
    /// Whether the engine consumed the event.
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled(_) | Self::Exited)
    }
}

/// Routes inbound events to the user's active flow.
pub struct FlowEngine {
    registry: Arc<FlowRegistry>,
    executor: StepExecutor,
    config: FlowEngineConfig,
}

impl FlowEngine {
    pub fn new(
        registry: Arc<FlowRegistry>,
        renderer: Arc<dyn PromptRenderer>,
        transport: Arc<dyn FlowTransport>,
        config: FlowEngineConfig,
    ) -> Self {
        let executor = StepExecutor::new(Arc::clone(&registry), renderer, transport)
            .with_default_button_policy(config.default_button_policy)
            .with_stale_button_text(config.stale_button_text.clone());
        Self {
            registry,
            executor,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &FlowEngineConfig {
        &self.config
    }

    pub fn register_flow(&self, definition: FlowDefinition) -> Option<Arc<FlowDefinition>> {
        self.registry.register_flow(definition)
    }

    pub fn unregister_flow(&self, name: &str) -> Option<Arc<FlowDefinition>> {
        self.registry.unregister_flow(name)
    }

    pub async fn is_user_in_flow(&self, user_id: UserId) -> bool {
        self.registry.is_user_in_flow(user_id).await
    }

    /// Start `flow_name` for the user and send its first prompt.
    ///
    /// If the user is already in a flow, the configured
    /// [`StartConflictPolicy`] decides between failing with
    /// [`Error::AlreadyInFlow`] and cancelling the old flow first.
    pub async fn start_flow(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        flow_name: &str,
        initial_data: FlowData,
    ) -> Result<UserFlowState> {
        self.start_with(
            user_id,
            chat_id,
            flow_name,
            initial_data,
            self.config.start_conflict,
        )
        .await
    }

    /// Start `flow_name`, cancelling any active flow first.
    pub async fn restart_flow(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        flow_name: &str,
        initial_data: FlowData,
    ) -> Result<UserFlowState> {
        self.start_with(
            user_id,
            chat_id,
            flow_name,
            initial_data,
            StartConflictPolicy::Restart,
        )
        .await
    }

    async fn start_with(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        flow_name: &str,
        initial_data: FlowData,
        on_conflict: StartConflictPolicy,
    ) -> Result<UserFlowState> {
        let definition = self
            .registry
            .flow(flow_name)
            .ok_or_else(|| Error::unknown_flow(flow_name))?;
        let slot = self.registry.slot(user_id);
        let started = {
            let mut state = slot.state.lock().await;
            let mut effects = Vec::new();
            if let Some(active) = state.as_ref() {
                match on_conflict {
                    StartConflictPolicy::Reject => {
                        return Err(Error::AlreadyInFlow {
                            user_id,
                            flow: active.flow_name.clone(),
                        });
                    },
                    StartConflictPolicy::Restart => {
                        info!(%user_id, from = %active.flow_name, to = flow_name, "restarting flow");
                        self.registry
                            .end_flow(&mut state, FlowEndReason::Cancelled);
                    },
                }
            }

            let installed = self
                .registry
                .install(&mut state, &definition, user_id, chat_id, initial_data);
            self.executor
                .queue_prompt(
                    user_id,
                    chat_id,
                    definition.first_step().prompt(),
                    &installed.data,
                    true,
                    &mut effects,
                )
                .await;
            slot.outbox.push(effects);
            installed
        };
        self.flush(&slot).await;
        Ok(started)
    }

    /// Cancel the user's flow from outside step logic, optionally telling
    /// them why. Returns whether a flow was active.
    pub async fn cancel_flow(&self, user_id: UserId, message: Option<&str>) -> bool {
        let Some(slot) = self.registry.existing_slot(user_id) else {
            return false;
        };
        let ended = {
            let mut state = slot.state.lock().await;
            let ended = self
                .registry
                .end_flow(&mut state, FlowEndReason::Cancelled);
            if let (Some(ended), Some(message)) = (&ended, message) {
                let mut effects = Vec::new();
                queue_text(&mut effects, ended.chat_id, message);
                slot.outbox.push(effects);
            }
            ended.is_some()
        };
        self.flush(&slot).await;
        drop(slot);
        self.registry.release_slot(user_id);
        ended
    }

    /// Route one inbound event.
    ///
    /// Events for the same user are processed one at a time; events for
    /// different users run concurrently.
    pub async fn handle(&self, event: InboundEvent) -> HandleOutcome {
        let InboundEvent {
            user_id,
            chat_id,
            kind,
        } = event;
        debug!(%user_id, %chat_id, button = matches!(kind, InboundKind::Button { .. }), "inbound event");

        let slot = self.registry.slot(user_id);
        let outcome = {
            let mut state = slot.state.lock().await;
            let mut effects = Vec::new();
            let command = match &kind {
                InboundKind::Text { text } => Some(text.as_str()),
                InboundKind::Button { .. } => None,
            };

            let outcome = if state.is_some()
                && command.is_some_and(|text| self.config.is_exit_command(text))
            {
                if let Some(ended) = self
                    .registry
                    .end_flow(&mut state, FlowEndReason::Cancelled)
                {
                    info!(%user_id, flow = %ended.flow_name, "flow exited by command");
                }
                queue_text(&mut effects, chat_id, &self.config.exit_message);
                HandleOutcome::Exited
            } else if command.is_some_and(|text| self.config.is_global_command(text)) {
                HandleOutcome::GlobalCommand
            } else {
                match self.executor.execute(&mut state, &kind, &mut effects).await {
                    Some(outcome) => HandleOutcome::Handled(outcome),
                    None => HandleOutcome::NotInFlow,
                }
            };
            // Queued before the lock is released so delivery follows the
            // order in which transitions were applied.
            slot.outbox.push(effects);
            outcome
        };
        self.flush(&slot).await;
        drop(slot);
        self.registry.release_slot(user_id);
        outcome
    }

    /// Deliver queued effects for one user, unless another task is already
    /// doing so. Must be called without holding the user's state lock.
    async fn flush(&self, entry: &UserEntry) {
        let Some(mut drain) = entry.outbox.claim() else {
            return;
        };
        while let Some(effect) = drain.next_effect() {
            self.executor.perform(effect).await;
        }
    }
}
