//! Conversational flow engine.
//!
//! Each user's conversation is an independent state machine that advances
//! through the ordered steps of a [`FlowDefinition`] in response to free text
//! or inline-button presses. Button payloads never travel over the wire: the
//! [`CallbackTokenRegistry`] swaps them for short opaque tokens and resolves
//! them back when the user taps.
//!
//! ```rust,ignore
//! let signup = FlowDefinition::builder("signup")
//!     .step(
//!         StepBuilder::new("name")
//!             .prompt(PromptSpec::text("What's your name?"))
//!             .process(|ctx, input| {
//!                 ctx.data.insert("name", input.text().unwrap_or_default());
//!                 Ok(StepResult::next())
//!             }),
//!     )
//!     .build()?;
//! engine.register_flow(signup);
//! engine.start_flow(user, chat, "signup", FlowData::new()).await?;
//! ```

pub mod config;
pub mod data;
pub mod definition;
pub mod engine;
pub mod error;
pub mod executor;
pub mod outbox;
pub mod payload;
pub mod prompt;
pub mod registry;
pub mod state;
pub mod testing;
pub mod token;
pub mod transport;

pub use {
    config::{FlowEngineConfig, StartConflictPolicy, command_word},
    data::FlowData,
    definition::{
        ButtonClick, ButtonClickPolicy, ErrorPolicy, FlowBuilder, FlowDefinition, StepBuilder,
        StepContext, StepDefinition, StepHandler, StepInput, StepResult,
    },
    engine::{FlowEngine, HandleOutcome, InboundEvent, InboundKind},
    error::{DefinitionError, Error, Result},
    executor::{StepExecutor, StepOutcome},
    outbox::Effect,
    payload::CallbackPayload,
    parley_common::{ChatId, MessageRef, UserId},
    prompt::{ButtonSpec, PromptRenderer, PromptSpec, RenderedButton, RenderedPrompt, TemplateRenderer},
    registry::{FlowEndReason, FlowRegistry},
    state::UserFlowState,
    token::CallbackTokenRegistry,
    transport::{FlowTransport, InlineButton, OutboundMessage},
};
