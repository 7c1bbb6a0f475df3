//! Send Queue
//!
//! Per-socket outbound queue: three FIFOs (High, Normal, Low) with weighted
//! fair selection. High always wins; Normal is preferred over Low with a
//! 5-to-1 weight so neither starves. Within one priority the send order is
//! the enqueue order.

use crate::message::{MessagePtr, Priority};
use crate::registry;
use std::collections::VecDeque;
use tracing::trace;
use uuid::Uuid;

/// Normal-priority messages sent per one Low-priority message.
const NORMAL_WEIGHT: u32 = 5;

#[derive(Default)]
pub(crate) struct SendQueue {
    high: VecDeque<MessagePtr>,
    normal: VecDeque<MessagePtr>,
    low: VecDeque<MessagePtr>,
    normal_counter: u32,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: MessagePtr) {
        match message.priority() {
            Priority::High => self.high.push_back(message),
            Priority::Normal => self.normal.push_back(message),
            Priority::Low => self.low.push_back(message),
        }
    }

    /// Takes the next message to send.
    ///
    /// Selection: High first; else Normal while the fairness counter allows;
    /// at every fifth Normal in a row one Low is preferred; Low drains last.
    pub fn next(&mut self) -> Option<MessagePtr> {
        if let Some(m) = self.high.pop_front() {
            return Some(m);
        }
        if !self.normal.is_empty() {
            if self.normal_counter < NORMAL_WEIGHT {
                self.normal_counter += 1;
                return self.normal.pop_front();
            }
            self.normal_counter = 0;
            if let Some(m) = self.low.pop_front() {
                return Some(m);
            }
            return self.normal.pop_front();
        }
        self.low.pop_front()
    }

    /// Removes queued messages with this command id from all three queues.
    pub fn remove(&mut self, command: &Uuid) {
        let retain = |queue: &mut VecDeque<MessagePtr>| {
            queue.retain(|m| {
                let matches = m.command() == *command;
                if matches {
                    trace!(
                        "Message removed from queue to sending. Id: {}. Command: {}",
                        m.id(),
                        registry::command_label(&m.command())
                    );
                }
                !matches
            });
        };
        retain(&mut self.high);
        retain(&mut self.normal);
        retain(&mut self.low);
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
