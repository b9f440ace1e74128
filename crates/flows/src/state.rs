use {
    chrono::{DateTime, Duration, Utc},
    serde::{Deserialize, Serialize},
};

use parley_common::{ChatId, UserId};

use crate::data::FlowData;

/// Runtime record of one user's position inside a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFlowState {
    pub user_id: UserId,
    /// Chat the flow's prompts are delivered to.
    pub chat_id: ChatId,
    pub flow_name: String,
    pub current_step: String,
    pub data: FlowData,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl UserFlowState {
    pub fn new(
        user_id: UserId,
        chat_id: ChatId,
        flow_name: impl Into<String>,
        first_step: impl Into<String>,
        data: FlowData,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            chat_id,
            flow_name: flow_name.into(),
            current_step: first_step.into(),
            data,
            created_at: now,
            last_active_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }

    pub fn move_to(&mut self, step: impl Into<String>) {
        self.current_step = step.into();
        self.touch();
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_active_at)
    }
}
