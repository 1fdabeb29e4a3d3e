//! Queue of user inputs submitted while a generation is running.
//!
//! FIFO unless reordered. A paused queue keeps its items but stops handing
//! them out until [`MessageQueue::resume`] or the next enqueue.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedMessage {
    pub id: String,
    pub content: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageQueue {
    items: VecDeque<QueuedMessage>,
    paused: bool,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> impl ExactSizeIterator<Item = &QueuedMessage> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    fn require(&self, id: &str) -> CoreResult<usize> {
        self.position(id)
            .ok_or_else(|| CoreError::UnknownMessage(id.to_string()))
    }

    /// Adds `content` at the back. Enqueueing also lifts a pause.
    pub fn enqueue(&mut self, content: impl Into<String>) -> QueuedMessage {
        let item = QueuedMessage {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            queued_at: Utc::now(),
        };
        self.items.push_back(item.clone());
        self.paused = false;
        debug!(id = %item.id, len = self.items.len(), "message queued");
        item
    }

    pub fn remove(&mut self, id: &str) -> CoreResult<QueuedMessage> {
        let pos = self.require(id)?;
        self.items
            .remove(pos)
            .ok_or_else(|| CoreError::UnknownMessage(id.to_string()))
    }

    /// Applies an explicit order. `ids` must name every queued item exactly
    /// once.
    pub fn reorder(&mut self, ids: &[String]) -> CoreResult<()> {
        if ids.len() != self.items.len() {
            return Err(CoreError::InvalidReorder(format!(
                "expected {} ids, got {}",
                self.items.len(),
                ids.len()
            )));
        }
        let unique: HashSet<&str> = ids.iter().map(String::as_str).collect();
        if unique.len() != ids.len() {
            return Err(CoreError::InvalidReorder("duplicate ids".to_string()));
        }

        let mut reordered = VecDeque::with_capacity(ids.len());
        for id in ids {
            let pos = self
                .position(id)
                .ok_or_else(|| CoreError::InvalidReorder(format!("unknown id {id}")))?;
            reordered.push_back(self.items[pos].clone());
        }
        self.items = reordered;
        Ok(())
    }

    /// Replaces the content of a not-yet-sent item in place.
    pub fn edit(&mut self, id: &str, content: impl Into<String>) -> CoreResult<()> {
        let pos = self.require(id)?;
        self.items[pos].content = content.into();
        Ok(())
    }

    /// Removes an item regardless of its position, for immediate sending.
    pub fn take(&mut self, id: &str) -> CoreResult<QueuedMessage> {
        self.remove(id)
    }

    pub fn pause(&mut self) {
        if !self.paused {
            debug!(len = self.items.len(), "queue paused");
        }
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Front item, unless the queue is paused.
    pub fn next_ready(&mut self) -> Option<QueuedMessage> {
        if self.paused {
            return None;
        }
        self.items.pop_front()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.paused = false;
    }
}
