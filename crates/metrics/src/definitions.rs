//! Metric name and label definitions.
//!
//! This module defines all metric names and common label keys used throughout parley.

/// Conversational flow engine metrics
pub mod flows {
    /// Flows started
    pub const STARTED_TOTAL: &str = "parley_flows_started_total";
    /// Flows that reached `CompleteFlow`
    pub const COMPLETED_TOTAL: &str = "parley_flows_completed_total";
    /// Flows cancelled (step result, exit command, error policy, or idle expiry)
    pub const CANCELLED_TOTAL: &str = "parley_flows_cancelled_total";
    /// Number of users currently inside a flow
    pub const ACTIVE: &str = "parley_flows_active";
    /// Step transitions applied
    pub const TRANSITIONS_TOTAL: &str = "parley_flows_transitions_total";
    /// Step transition duration in seconds (process function plus render)
    pub const TRANSITION_DURATION_SECONDS: &str = "parley_flows_transition_duration_seconds";
    /// Free-text inputs rejected by a step validator
    pub const VALIDATION_FAILURES_TOTAL: &str = "parley_flows_validation_failures_total";
    /// Process functions that returned an error or panicked
    pub const STEP_FAILURES_TOTAL: &str = "parley_flows_step_failures_total";
    /// Button presses whose token no longer resolves
    pub const STALE_BUTTON_CLICKS_TOTAL: &str = "parley_flows_stale_button_clicks_total";
    /// Callback tokens currently registered across all users
    pub const REGISTERED_TOKENS: &str = "parley_flows_registered_tokens";
}

/// Telegram transport metrics
pub mod telegram {
    /// Updates received from Telegram
    pub const UPDATES_RECEIVED_TOTAL: &str = "parley_telegram_updates_received_total";
    /// Updates consumed by the flow engine
    pub const UPDATES_HANDLED_TOTAL: &str = "parley_telegram_updates_handled_total";
    /// Messages sent to Telegram
    pub const MESSAGES_SENT_TOTAL: &str = "parley_telegram_messages_sent_total";
    /// Message send errors
    pub const MESSAGE_SEND_ERRORS_TOTAL: &str = "parley_telegram_message_send_errors_total";
    /// getUpdates polling errors
    pub const POLLING_ERRORS_TOTAL: &str = "parley_telegram_polling_errors_total";
}

/// Common label keys used across metrics
pub mod labels {
    pub const FLOW: &str = "flow";
    pub const STEP: &str = "step";
    pub const OUTCOME: &str = "outcome";
    pub const KIND: &str = "kind";
}
