//! Process-wide store of flow definitions and per-user flow state.
//!
//! Each user gets a slot guarded by its own async mutex. Everything that
//! reads-then-writes a user's state holds that slot's lock for the whole
//! operation, so two events for the same user are applied one after the
//! other while different users never contend. Transport calls are queued on
//! the slot's outbox and delivered after the lock is released.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, MutexGuard, RwLock},
    time::Duration,
};

use {
    chrono::Utc,
    tokio::sync::Mutex as AsyncMutex,
    tracing::{debug, info, warn},
};

use parley_common::{ChatId, UserId};

use crate::{
    data::FlowData,
    definition::FlowDefinition,
    error::{Error, Result},
    outbox::Outbox,
    state::UserFlowState,
    token::CallbackTokenRegistry,
};

#[cfg(feature = "metrics")]
use parley_metrics::{counter, flows as flow_metrics, gauge, labels};

/// A user's state plus the effects waiting to be delivered to them.
#[derive(Default)]
pub(crate) struct UserEntry {
    pub(crate) state: AsyncMutex<Option<UserFlowState>>,
    pub(crate) outbox: Outbox,
}

pub(crate) type UserSlot = Arc<UserEntry>;

/// Why a flow stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEndReason {
    Completed,
    Cancelled,
}

impl FlowEndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Registered flows plus the live state of every user currently in one.
pub struct FlowRegistry {
    flows: RwLock<HashMap<String, Arc<FlowDefinition>>>,
    users: Mutex<HashMap<UserId, UserSlot>>,
    tokens: Arc<CallbackTokenRegistry>,
}

impl Default for FlowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::with_tokens(Arc::new(CallbackTokenRegistry::new()))
    }

    /// Use an existing token registry (e.g. one shared with other handlers).
    pub fn with_tokens(tokens: Arc<CallbackTokenRegistry>) -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            tokens,
        }
    }

    pub fn tokens(&self) -> &Arc<CallbackTokenRegistry> {
        &self.tokens
    }

    fn users_lock(&self) -> MutexGuard<'_, HashMap<UserId, UserSlot>> {
        self.users.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Definitions ─────────────────────────────────────────────────────────

    /// Store a definition under its name. A later registration with the same
    /// name replaces the earlier one; the replaced definition is returned.
    pub fn register_flow(&self, definition: FlowDefinition) -> Option<Arc<FlowDefinition>> {
        let name = definition.name().to_string();
        let steps = definition.steps().len();
        let previous = self
            .flows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.clone(), Arc::new(definition));
        if previous.is_some() {
            info!(flow = %name, steps, "replaced flow definition");
        } else {
            info!(flow = %name, steps, "registered flow");
        }
        previous
    }

    /// Remove a definition. Users already in the flow keep their state; their
    /// next event cancels it with the default error message.
    pub fn unregister_flow(&self, name: &str) -> Option<Arc<FlowDefinition>> {
        let removed = self
            .flows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        if removed.is_some() {
            info!(flow = %name, "unregistered flow");
        }
        removed
    }

    pub fn flow(&self, name: &str) -> Option<Arc<FlowDefinition>> {
        self.flows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn flow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .flows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    // ── Per-user slots ──────────────────────────────────────────────────────

    pub(crate) fn slot(&self, user_id: UserId) -> UserSlot {
        Arc::clone(self.users_lock().entry(user_id).or_default())
    }

    pub(crate) fn existing_slot(&self, user_id: UserId) -> Option<UserSlot> {
        self.users_lock().get(&user_id).cloned()
    }

    /// Forget an empty slot nobody else is holding and with nothing left to
    /// deliver.
    ///
    /// Callers must have dropped their own handle to the slot first. Slots are
    /// only cloned under the map lock, so a strong count of one here means no
    /// task can be waiting on it.
    pub(crate) fn release_slot(&self, user_id: UserId) {
        let mut users = self.users_lock();
        let idle = users.get(&user_id).is_some_and(|slot| {
            Arc::strong_count(slot) == 1
                && slot.outbox.is_idle()
                && slot.state.try_lock().is_ok_and(|state| state.is_none())
        });
        if idle {
            users.remove(&user_id);
        }
    }

    // ── User state ──────────────────────────────────────────────────────────

    pub async fn is_user_in_flow(&self, user_id: UserId) -> bool {
        match self.existing_slot(user_id) {
            Some(slot) => slot.state.lock().await.is_some(),
            None => false,
        }
    }

    /// Copy of the user's current state.
    pub async fn snapshot(&self, user_id: UserId) -> Option<UserFlowState> {
        let slot = self.existing_slot(user_id)?;
        let state = slot.state.lock().await.clone();
        state
    }

    /// Number of users currently inside a flow.
    pub async fn active_flow_count(&self) -> usize {
        let slots: Vec<UserSlot> = self.users_lock().values().cloned().collect();
        let mut active = 0;
        for slot in slots {
            if slot.state.lock().await.is_some() {
                active += 1;
            }
        }
        active
    }

    /// Put the user at the first step of `flow_name`.
    ///
    /// Fails with [`Error::UnknownFlow`] if no such flow is registered and with
    /// [`Error::AlreadyInFlow`] if the user is already in a flow.
    pub async fn start_flow(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        flow_name: &str,
        initial_data: FlowData,
    ) -> Result<UserFlowState> {
        let definition = self
            .flow(flow_name)
            .ok_or_else(|| Error::unknown_flow(flow_name))?;
        let slot = self.slot(user_id);
        let mut state = slot.state.lock().await;
        if let Some(active) = state.as_ref() {
            return Err(Error::AlreadyInFlow {
                user_id,
                flow: active.flow_name.clone(),
            });
        }
        Ok(self.install(&mut state, &definition, user_id, chat_id, initial_data))
    }

    /// Like [`start_flow`](Self::start_flow), but an active flow is cancelled
    /// first (callback and token cleanup included).
    pub async fn restart_flow(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        flow_name: &str,
        initial_data: FlowData,
    ) -> Result<UserFlowState> {
        let definition = self
            .flow(flow_name)
            .ok_or_else(|| Error::unknown_flow(flow_name))?;
        let slot = self.slot(user_id);
        let mut state = slot.state.lock().await;
        self.end_flow(&mut state, FlowEndReason::Cancelled);
        Ok(self.install(&mut state, &definition, user_id, chat_id, initial_data))
    }

    /// Cancel the user's active flow, if any. Returns whether one was active.
    pub async fn cancel_flow(&self, user_id: UserId) -> bool {
        let Some(slot) = self.existing_slot(user_id) else {
            return false;
        };
        let ended = {
            let mut state = slot.state.lock().await;
            self.end_flow(&mut state, FlowEndReason::Cancelled)
                .is_some()
        };
        drop(slot);
        self.release_slot(user_id);
        ended
    }

    /// Cancel every flow whose last activity is older than `max_idle`.
    ///
    /// Nothing calls this implicitly; hosts that want idle expiry run it on
    /// their own schedule.
    pub async fn expire_idle(&self, max_idle: Duration) -> Vec<UserId> {
        let slots: Vec<(UserId, UserSlot)> = self
            .users_lock()
            .iter()
            .map(|(user_id, slot)| (*user_id, Arc::clone(slot)))
            .collect();

        let now = Utc::now();
        let mut expired = Vec::new();
        for (user_id, slot) in slots {
            let mut state = slot.state.lock().await;
            let stale = state.as_ref().is_some_and(|s| {
                s.idle_for(now)
                    .to_std()
                    .is_ok_and(|idle| idle >= max_idle)
            });
            if stale {
                debug!(%user_id, "expiring idle flow");
                self.end_flow(&mut state, FlowEndReason::Cancelled);
                expired.push(user_id);
            }
        }

        for user_id in &expired {
            self.release_slot(*user_id);
        }
        expired
    }

    /// Install fresh state at the flow's first step. The slot must be empty.
    pub(crate) fn install(
        &self,
        slot: &mut Option<UserFlowState>,
        definition: &FlowDefinition,
        user_id: UserId,
        chat_id: ChatId,
        data: FlowData,
    ) -> UserFlowState {
        let state = UserFlowState::new(
            user_id,
            chat_id,
            definition.name(),
            definition.first_step().name(),
            data,
        );
        info!(
            %user_id,
            flow = definition.name(),
            step = %state.current_step,
            "flow started"
        );
        #[cfg(feature = "metrics")]
        {
            counter!(flow_metrics::STARTED_TOTAL, labels::FLOW => definition.name().to_string())
                .increment(1);
            gauge!(flow_metrics::ACTIVE).increment(1.0);
        }
        *slot = Some(state.clone());
        state
    }

    /// Remove the user's state, drop all of their tokens, and run the
    /// matching completion/cancellation callback with the final data.
    ///
    /// Returns the removed state, or `None` if the slot was already empty.
    pub(crate) fn end_flow(
        &self,
        slot: &mut Option<UserFlowState>,
        reason: FlowEndReason,
    ) -> Option<UserFlowState> {
        let state = slot.take()?;
        let tokens_removed = self.tokens.cleanup_user(state.user_id);

        let callback = self.flow(&state.flow_name).and_then(|definition| match reason {
            FlowEndReason::Completed => definition.on_complete().cloned(),
            FlowEndReason::Cancelled => definition.on_cancel().cloned(),
        });
        if let Some(callback) = callback
            && catch_unwind(AssertUnwindSafe(|| callback(state.user_id, &state.data))).is_err()
        {
            warn!(
                user_id = %state.user_id,
                flow = %state.flow_name,
                reason = reason.as_str(),
                "flow end callback panicked"
            );
        }

        info!(
            user_id = %state.user_id,
            flow = %state.flow_name,
            step = %state.current_step,
            reason = reason.as_str(),
            tokens_removed,
            "flow ended"
        );
        #[cfg(feature = "metrics")]
        {
            let name = match reason {
                FlowEndReason::Completed => flow_metrics::COMPLETED_TOTAL,
                FlowEndReason::Cancelled => flow_metrics::CANCELLED_TOTAL,
            };
            counter!(name, labels::FLOW => state.flow_name.clone()).increment(1);
            gauge!(flow_metrics::ACTIVE).decrement(1.0);
        }
        Some(state)
    }
}
