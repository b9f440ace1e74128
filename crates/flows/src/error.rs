use parley_common::{FromMessage, UserId};

/// Crate-wide result type for flow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed flow engine errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A flow definition failed structural validation. Carries every problem
    /// found, not just the first.
    #[error("invalid flow definition {flow:?}: {}", join_errors(.errors))]
    InvalidDefinition {
        flow: String,
        errors: Vec<DefinitionError>,
    },

    /// No flow is registered under this name.
    #[error("unknown flow: {name}")]
    UnknownFlow { name: String },

    /// The flow has no step with this name.
    #[error("unknown step {step:?} in flow {flow:?}")]
    UnknownStep { flow: String, step: String },

    /// The user already has an active flow and the start policy rejects restarts.
    #[error("user {user_id} is already in flow {flow:?}")]
    AlreadyInFlow { user_id: UserId, flow: String },

    /// Engine configuration could not be loaded.
    #[error("invalid flow engine config: {message}")]
    Config { message: String },

    /// JSON (de)serialization failed.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    /// TOML parsing failed.
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn config(message: impl std::fmt::Display) -> Self {
        Self::Config {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn unknown_flow(name: impl Into<String>) -> Self {
        Self::UnknownFlow { name: name.into() }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

parley_common::impl_context!();

/// Structural problems detected while building a [`FlowDefinition`](crate::FlowDefinition).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("flow name is empty")]
    EmptyName,

    #[error("flow has no steps")]
    NoSteps,

    #[error("step #{index} has an empty name")]
    EmptyStepName { index: usize },

    #[error("duplicate step name {name:?}")]
    DuplicateStep { name: String },

    #[error("step {step:?} has no process function")]
    MissingProcess { step: String },
}

fn join_errors(errors: &[DefinitionError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
