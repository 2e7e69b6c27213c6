//! Display queue for received chat lines.
//!
//! Handlers push messages as they arrive; listeners drain the queue when
//! they have nothing else to read, so lines that arrived together are shown
//! in timestamp order.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use parking_lot::Mutex;

use ringchat_proto::message::{Message, Timestamp};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Queued {
    timestamp: Timestamp,
    seq: u64,
    sender: String,
    text: String,
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Reverse<Queued>>,
    next_seq: u64,
}

/// Thread-safe, timestamp-ordered chat queue.
#[derive(Debug, Default)]
pub struct ChatQueue {
    inner: Mutex<Inner>,
}

impl ChatQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a received chat message.
    pub fn push(&self, message: &Message) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Reverse(Queued {
            timestamp: message.timestamp,
            seq,
            sender: message.sender.name.clone(),
            text: message.content.clone(),
        }));
    }

    /// Removes every queued message, oldest first, formatted as
    /// `"sender: text"`.
    pub fn drain(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        let mut lines = Vec::with_capacity(inner.heap.len());
        while let Some(Reverse(item)) = inner.heap.pop() {
            lines.push(format_line(&item.sender, &item.text));
        }
        lines
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Formats a chat line the way it is shown to the user.
#[must_use]
pub fn format_line(sender: &str, text: &str) -> String {
    format!("{sender}: {text}")
}
