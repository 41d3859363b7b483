//! Bounded conversation history.
//!
//! The system preamble is never stored: it is prepended fresh on every
//! outbound request and does not count against the capacity.

use crate::protocol::{Message, Role};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct ConversationState {
    system_prompt: String,
    history: VecDeque<Message>,
    capacity: usize,
}

impl ConversationState {
    /// A capacity of zero is clamped to one so the latest message always survives.
    pub fn new(system_prompt: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            system_prompt: system_prompt.into(),
            history: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn append(&mut self, message: Message) {
        self.history.push_back(message);
        self.trim_to_capacity();
    }

    /// Drops the oldest entries until at most `capacity` remain.
    pub fn trim_to_capacity(&mut self) {
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
    }

    /// System preamble followed by the retained history.
    ///
    /// Tool results at the head of the window whose originating assistant
    /// message was trimmed away are left out, since the model service rejects
    /// a tool result with no matching call. History itself is not touched.
    pub fn snapshot_for_request(&self) -> Vec<Message> {
        let orphaned = self
            .history
            .iter()
            .take_while(|m| m.role == Role::Tool)
            .count();

        let mut out = Vec::with_capacity(self.history.len() + 1 - orphaned);
        out.push(Message::system(self.system_prompt.clone()));
        out.extend(self.history.iter().skip(orphaned).cloned());
        out
    }

    pub fn history(&self) -> impl ExactSizeIterator<Item = &Message> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
