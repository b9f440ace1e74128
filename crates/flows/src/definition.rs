//! Immutable flow and step definitions, and the builder that validates them.

use std::{collections::HashMap, fmt, sync::Arc};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
};

use parley_common::{ChatId, UserId};

use crate::{
    data::FlowData,
    error::{DefinitionError, Error, Result},
    payload::CallbackPayload,
    prompt::PromptSpec,
};

// ── Step inputs and results ─────────────────────────────────────────────────

/// A resolved button press: the token the user tapped and the payload it
/// stood for.
#[derive(Debug, Clone)]
pub struct ButtonClick {
    pub token: String,
    pub payload: CallbackPayload,
}

/// Input handed to a step's process function.
#[derive(Debug, Clone)]
pub enum StepInput {
    Text(String),
    Button(ButtonClick),
}

impl StepInput {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Button(_) => None,
        }
    }

    pub fn button(&self) -> Option<&ButtonClick> {
        match self {
            Self::Button(click) => Some(click),
            Self::Text(_) => None,
        }
    }

    pub fn payload(&self) -> Option<&CallbackPayload> {
        self.button().map(|click| &click.payload)
    }
}

/// What step logic sees while it runs.
///
/// `data` is a working copy of the user's data bag. It is written back only
/// when the step returns a result the engine can apply, so a failing step
/// never leaves half-written data behind.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub flow: String,
    pub step: String,
    pub data: FlowData,
}

/// The transition requested by a step. Each variant may carry a prompt that
/// overrides (or for `NextStep`/`GoToStep`, is merged into) what gets shown.
#[derive(Debug, Clone)]
pub enum StepResult {
    /// Stay on the current step.
    Retry { prompt: Option<PromptSpec> },
    /// Advance to the next step in definition order. Past the last step this
    /// completes the flow.
    NextStep { prompt: Option<PromptSpec> },
    /// Jump to a named step.
    GoToStep {
        target: String,
        prompt: Option<PromptSpec>,
    },
    /// Finish the flow and run the completion callback.
    CompleteFlow { prompt: Option<PromptSpec> },
    /// Abort the flow and run the cancellation callback.
    CancelFlow { prompt: Option<PromptSpec> },
}

impl StepResult {
    pub fn retry() -> Self {
        Self::Retry { prompt: None }
    }

    pub fn next() -> Self {
        Self::NextStep { prompt: None }
    }

    pub fn go_to(target: impl Into<String>) -> Self {
        Self::GoToStep {
            target: target.into(),
            prompt: None,
        }
    }

    pub fn complete() -> Self {
        Self::CompleteFlow { prompt: None }
    }

    pub fn cancel() -> Self {
        Self::CancelFlow { prompt: None }
    }

    /// Attach an override prompt.
    #[must_use]
    pub fn with_prompt(mut self, new_prompt: PromptSpec) -> Self {
        match &mut self {
            Self::Retry { prompt }
            | Self::NextStep { prompt }
            | Self::GoToStep { prompt, .. }
            | Self::CompleteFlow { prompt }
            | Self::CancelFlow { prompt } => *prompt = Some(new_prompt),
        }
        self
    }

    /// Attach a text-only override prompt.
    #[must_use]
    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_prompt(PromptSpec::text(text))
    }

    pub fn prompt(&self) -> Option<&PromptSpec> {
        match self {
            Self::Retry { prompt }
            | Self::NextStep { prompt }
            | Self::GoToStep { prompt, .. }
            | Self::CompleteFlow { prompt }
            | Self::CancelFlow { prompt } => prompt.as_ref(),
        }
    }

    /// Short name used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Retry { .. } => "retry",
            Self::NextStep { .. } => "next_step",
            Self::GoToStep { .. } => "go_to_step",
            Self::CompleteFlow { .. } => "complete_flow",
            Self::CancelFlow { .. } => "cancel_flow",
        }
    }
}

// ── Step logic ──────────────────────────────────────────────────────────────

/// Business logic of one step.
///
/// Returning `Err` (or panicking) is treated as a step failure and resolved
/// through the flow's [`ErrorPolicy`].
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn process(&self, ctx: &mut StepContext, input: StepInput) -> anyhow::Result<StepResult>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> StepHandler for FnHandler<F>
where
    F: Fn(&mut StepContext, StepInput) -> anyhow::Result<StepResult> + Send + Sync,
{
    async fn process(&self, ctx: &mut StepContext, input: StepInput) -> anyhow::Result<StepResult> {
        (self.0)(ctx, input)
    }
}

/// Checks free-text input before the process function runs. `Err` carries
/// the text sent back to the user.
pub type Validator = Arc<dyn Fn(&str) -> std::result::Result<(), String> + Send + Sync>;

/// Called with the final data bag when a flow completes or is cancelled.
pub type FlowCallback = Arc<dyn Fn(UserId, &FlowData) + Send + Sync>;

// ── Policies ────────────────────────────────────────────────────────────────

const DEFAULT_ERROR_MESSAGE: &str = "Something went wrong. Please start again.";

/// How a step failure (error, panic, unknown `GoToStep` target) is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// End the flow through the cancellation path and optionally tell the user.
    CancelFlow { message: Option<String> },
    /// Keep the user on the current step and optionally tell them to retry.
    Retry { message: Option<String> },
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::CancelFlow {
            message: Some(DEFAULT_ERROR_MESSAGE.to_string()),
        }
    }
}

impl ErrorPolicy {
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::CancelFlow { message } | Self::Retry { message } => message.as_deref(),
        }
    }
}

/// What happens to a message whose button was just pressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonClickPolicy {
    /// Delete the whole message and invalidate the pressed token.
    DeleteMessage,
    /// Strip the inline keyboard and invalidate the pressed token.
    DeleteKeyboard,
    /// Leave the message alone; old buttons stay valid until the flow ends.
    #[default]
    Keep,
}

impl ButtonClickPolicy {
    pub fn invalidates_token(self) -> bool {
        !matches!(self, Self::Keep)
    }
}

// ── Definitions ─────────────────────────────────────────────────────────────

/// One stage of a flow.
pub struct StepDefinition {
    name: String,
    prompt: PromptSpec,
    validator: Option<Validator>,
    handler: Arc<dyn StepHandler>,
}

impl StepDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prompt(&self) -> &PromptSpec {
        &self.prompt
    }

    pub fn has_validator(&self) -> bool {
        self.validator.is_some()
    }

    /// Run the validator, if any.
    pub fn validate(&self, text: &str) -> std::result::Result<(), String> {
        match &self.validator {
            Some(validator) => validator(text),
            None => Ok(()),
        }
    }

    pub fn handler(&self) -> &Arc<dyn StepHandler> {
        &self.handler
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("prompt", &self.prompt.text)
            .field("validator", &self.validator.is_some())
            .finish_non_exhaustive()
    }
}

/// A named, ordered sequence of steps. Built once, shared read-only.
pub struct FlowDefinition {
    name: String,
    steps: Vec<StepDefinition>,
    index: HashMap<String, usize>,
    error_policy: ErrorPolicy,
    button_policy: Option<ButtonClickPolicy>,
    on_complete: Option<FlowCallback>,
    on_cancel: Option<FlowCallback>,
}

impl FlowDefinition {
    pub fn builder(name: impl Into<String>) -> FlowBuilder {
        FlowBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.index.get(name).map(|&i| &self.steps[i])
    }

    /// Entry step. `build` guarantees there is at least one.
    pub fn first_step(&self) -> &StepDefinition {
        &self.steps[0]
    }

    /// Step following `name` in definition order.
    pub fn step_after(&self, name: &str) -> Option<&StepDefinition> {
        self.index.get(name).and_then(|&i| self.steps.get(i + 1))
    }

    pub fn error_policy(&self) -> &ErrorPolicy {
        &self.error_policy
    }

    /// Explicit button-click policy; `None` defers to the engine default.
    pub fn button_policy(&self) -> Option<ButtonClickPolicy> {
        self.button_policy
    }

    pub fn on_complete(&self) -> Option<&FlowCallback> {
        self.on_complete.as_ref()
    }

    pub fn on_cancel(&self) -> Option<&FlowCallback> {
        self.on_cancel.as_ref()
    }
}

impl fmt::Debug for FlowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowDefinition")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("error_policy", &self.error_policy)
            .field("button_policy", &self.button_policy)
            .finish_non_exhaustive()
    }
}

// ── Builders ────────────────────────────────────────────────────────────────

/// Declares one step for [`FlowBuilder::step`].
pub struct StepBuilder {
    name: String,
    prompt: PromptSpec,
    validator: Option<Validator>,
    handler: Option<Arc<dyn StepHandler>>,
}

impl StepBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: PromptSpec::default(),
            validator: None,
            handler: None,
        }
    }

    #[must_use]
    pub fn prompt(mut self, prompt: PromptSpec) -> Self {
        self.prompt = prompt;
        self
    }

    #[must_use]
    pub fn validator<V>(mut self, validator: V) -> Self
    where
        V: Fn(&str) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Synchronous process function.
    #[must_use]
    pub fn process<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut StepContext, StepInput) -> anyhow::Result<StepResult> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(FnHandler(f)));
        self
    }

    /// Async process function implemented as a [`StepHandler`].
    #[must_use]
    pub fn handler(mut self, handler: impl StepHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }
}

/// Collects steps and flow-level policies, validated by [`FlowBuilder::build`].
pub struct FlowBuilder {
    name: String,
    steps: Vec<StepBuilder>,
    error_policy: ErrorPolicy,
    button_policy: Option<ButtonClickPolicy>,
    on_complete: Option<FlowCallback>,
    on_cancel: Option<FlowCallback>,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            error_policy: ErrorPolicy::default(),
            button_policy: None,
            on_complete: None,
            on_cancel: None,
        }
    }

    /// Append a step. Steps run in the order they are added.
    #[must_use]
    pub fn step(mut self, step: StepBuilder) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    #[must_use]
    pub fn button_policy(mut self, policy: ButtonClickPolicy) -> Self {
        self.button_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(UserId, &FlowData) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_cancel<F>(mut self, f: F) -> Self
    where
        F: Fn(UserId, &FlowData) + Send + Sync + 'static,
    {
        self.on_cancel = Some(Arc::new(f));
        self
    }

    /// Validate the structure and freeze the definition.
    ///
    /// Every problem is reported at once in [`Error::InvalidDefinition`].
    pub fn build(self) -> Result<FlowDefinition> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push(DefinitionError::EmptyName);
        }
        if self.steps.is_empty() {
            errors.push(DefinitionError::NoSteps);
        }

        let mut index = HashMap::with_capacity(self.steps.len());
        let mut steps = Vec::with_capacity(self.steps.len());
        for (i, step) in self.steps.into_iter().enumerate() {
            if step.name.trim().is_empty() {
                errors.push(DefinitionError::EmptyStepName { index: i });
            } else if index.insert(step.name.clone(), i).is_some() {
                errors.push(DefinitionError::DuplicateStep {
                    name: step.name.clone(),
                });
            }
            match step.handler {
                Some(handler) => steps.push(StepDefinition {
                    name: step.name,
                    prompt: step.prompt,
                    validator: step.validator,
                    handler,
                }),
                None => errors.push(DefinitionError::MissingProcess { step: step.name }),
            }
        }

        if !errors.is_empty() {
            return Err(Error::InvalidDefinition {
                flow: self.name,
                errors,
            });
        }

        Ok(FlowDefinition {
            name: self.name,
            steps,
            index,
            error_policy: self.error_policy,
            button_policy: self.button_policy,
            on_complete: self.on_complete,
            on_cancel: self.on_cancel,
        })
    }
}
