//! Retained message storage.
//!
//! Last-value-wins per topic: a retained publish overwrites the previous
//! entry, and an empty retained payload clears it. The store carries its own
//! lock, independent from the session table, so retention bookkeeping never
//! couples with fan-out latency.

use super::topics::topic_matches;
use crate::protocol::ApplicationMessage;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Storage for the last retained message per topic.
///
/// Brokers that do not need retention install [`NoopRetained`].
pub trait RetainedStore: Send + Sync {
    /// Record a retained publish, overwriting any previous entry for the
    /// topic. An empty payload clears the entry.
    fn store(&self, msg: &ApplicationMessage);

    /// Fetch the retained message for an exact topic.
    fn fetch(&self, topic: &str) -> Option<ApplicationMessage>;

    /// Collect retained messages whose topic matches any of the filters.
    fn matching(&self, filters: &[String], wildcards_enabled: bool) -> Vec<ApplicationMessage>;

    /// Number of retained entries.
    fn count(&self) -> usize;
}

/// In-memory retained store (BTreeMap for deterministic replay order).
#[derive(Default)]
pub struct MemoryRetained {
    messages: Mutex<BTreeMap<String, ApplicationMessage>>,
}

impl MemoryRetained {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RetainedStore for MemoryRetained {
    fn store(&self, msg: &ApplicationMessage) {
        let mut messages = self.messages.lock();
        if msg.payload.is_empty() {
            messages.remove(&msg.topic);
        } else {
            messages.insert(msg.topic.clone(), msg.clone());
        }
    }

    fn fetch(&self, topic: &str) -> Option<ApplicationMessage> {
        self.messages.lock().get(topic).cloned()
    }

    fn matching(&self, filters: &[String], wildcards_enabled: bool) -> Vec<ApplicationMessage> {
        let messages = self.messages.lock();
        messages
            .values()
            .filter(|msg| {
                filters.iter().any(|filter| {
                    if wildcards_enabled {
                        topic_matches(filter, &msg.topic)
                    } else {
                        filter == &msg.topic
                    }
                })
            })
            .cloned()
            .collect()
    }

    fn count(&self) -> usize {
        self.messages.lock().len()
    }
}

/// Disabled retention.
pub struct NoopRetained;

impl RetainedStore for NoopRetained {
    fn store(&self, _msg: &ApplicationMessage) {}

    fn fetch(&self, _topic: &str) -> Option<ApplicationMessage> {
        None
    }

    fn matching(&self, _filters: &[String], _wildcards_enabled: bool) -> Vec<ApplicationMessage> {
        Vec::new()
    }

    fn count(&self) -> usize {
        0
    }
}
