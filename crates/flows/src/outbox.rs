//! Ordered per-user delivery of transport side effects.
//!
//! Transitions are computed under the user's state lock, but nothing talks
//! to the transport while that lock is held. Instead each event queues its
//! effects here, in lock order, and the first task to find the queue idle
//! delivers everything queued until it runs dry. Effects for one user are
//! therefore delivered in the order their transitions were applied, and a
//! slow transport never keeps other readers of the state waiting.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

use parley_common::MessageRef;

use crate::transport::OutboundMessage;

/// One transport call requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send(OutboundMessage),
    Acknowledge {
        callback_id: String,
        notice: Option<String>,
    },
    DeleteMessage(MessageRef),
    ClearKeyboard(MessageRef),
}

#[derive(Debug, Default)]
struct Queue {
    pending: VecDeque<Effect>,
    draining: bool,
}

/// FIFO of effects waiting for delivery, with at most one active drainer.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    queue: Mutex<Queue>,
}

impl Outbox {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn push(&self, effects: impl IntoIterator<Item = Effect>) {
        self.lock().pending.extend(effects);
    }

    /// Become the drainer, unless another task already is.
    pub(crate) fn claim(&self) -> Option<Drain<'_>> {
        let mut queue = self.lock();
        if queue.draining {
            return None;
        }
        queue.draining = true;
        Some(Drain {
            outbox: self,
            done: false,
        })
    }

    /// Nothing queued and nobody draining.
    pub(crate) fn is_idle(&self) -> bool {
        let queue = self.lock();
        !queue.draining && queue.pending.is_empty()
    }
}

/// Exclusive right to deliver the queue. Dropping it mid-way (a panicking
/// transport) hands the queue to the next claimant.
pub(crate) struct Drain<'a> {
    outbox: &'a Outbox,
    done: bool,
}

impl Drain<'_> {
    /// Next effect to deliver. Once the queue is empty the claim is released
    /// under the same lock, so an effect pushed concurrently is never left
    /// without a drainer.
    pub(crate) fn next_effect(&mut self) -> Option<Effect> {
        if self.done {
            return None;
        }
        let mut queue = self.outbox.lock();
        let effect = queue.pending.pop_front();
        if effect.is_none() {
            queue.draining = false;
            self.done = true;
        }
        effect
    }
}

impl Drop for Drain<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.outbox.lock().draining = false;
        }
    }
}
