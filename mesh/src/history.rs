//! Bounded history of recently sent and received key/value messages.
//!
//! Kept for debugging; sized in bytes of the original messages. A zero
//! budget disables recording entirely.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::wire::KeyValuePair;

#[derive(Debug, Clone)]
pub struct Message {
    pub time: DateTime<Utc>,
    pub size: usize,
    /// Pair with the encoded value elided.
    pub pair: KeyValuePair,
    pub version: u64,
    pub changes: Vec<String>,
}

#[derive(Debug, Default)]
struct Ring {
    messages: VecDeque<Message>,
    bytes: usize,
}

impl Ring {
    fn push(&mut self, msg: Message, limit: usize) {
        self.bytes += msg.size;
        self.messages.push_back(msg);
        while self.bytes > limit {
            match self.messages.pop_front() {
                Some(old) => self.bytes -= old.size,
                None => break,
            }
        }
    }
}

#[derive(Debug)]
pub struct MessageHistory {
    limit_bytes: usize,
    sent: Mutex<Ring>,
    received: Mutex<Ring>,
}

impl MessageHistory {
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            limit_bytes,
            sent: Mutex::new(Ring::default()),
            received: Mutex::new(Ring::default()),
        }
    }

    pub fn add_sent(&self, msg: Message) {
        if self.limit_bytes == 0 {
            return;
        }
        self.sent.lock().push(strip_value(msg), self.limit_bytes);
    }

    pub fn add_received(&self, msg: Message) {
        if self.limit_bytes == 0 {
            return;
        }
        self.received.lock().push(strip_value(msg), self.limit_bytes);
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().messages.iter().cloned().collect()
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().messages.iter().cloned().collect()
    }

    pub fn clear(&self) {
        *self.sent.lock() = Ring::default();
        *self.received.lock() = Ring::default();
    }
}

fn strip_value(mut msg: Message) -> Message {
    msg.pair.value = Vec::new();
    msg
}
