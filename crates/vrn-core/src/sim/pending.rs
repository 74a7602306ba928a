// ── Pending next-hop resolutions ──
//
// Packets suspended on an unresolved next hop wait here, grouped by
// resolution key. Each key carries one deadline; when it passes, every
// packet held under the key is released to the caller as expired.

use std::collections::HashMap;
use std::future::poll_fn;
use std::time::Duration;

use tokio_util::time::{DelayQueue, delay_queue};

use super::verdict::ResolutionKey;
use crate::config::MAX_TIMER;

/// What `hold` did with the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldResult {
    /// First waiter on this key; the caller should send the request.
    First,
    /// Joined an outstanding resolution.
    Queued,
    /// The key already holds its maximum; the item was not kept.
    Overflow,
}

#[derive(Debug)]
struct Waiting<T> {
    held: Vec<T>,
    delay: delay_queue::Key,
}

#[derive(Debug)]
pub struct PendingResolutions<T> {
    waiting: HashMap<ResolutionKey, Waiting<T>>,
    delays: DelayQueue<ResolutionKey>,
}

impl<T> Default for PendingResolutions<T> {
    fn default() -> Self {
        Self {
            waiting: HashMap::new(),
            delays: DelayQueue::new(),
        }
    }
}

impl<T> PendingResolutions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `item` until `key` resolves. The deadline is set by the first
    /// waiter and is not extended by later ones; it is clamped to
    /// [`MAX_TIMER`].
    pub fn hold(&mut self, key: ResolutionKey, item: T, timeout: Duration, max: usize) -> HoldResult {
        if let Some(waiting) = self.waiting.get_mut(&key) {
            if waiting.held.len() >= max {
                return HoldResult::Overflow;
            }
            waiting.held.push(item);
            return HoldResult::Queued;
        }
        if max == 0 {
            return HoldResult::Overflow;
        }
        let delay = self.delays.insert(key, timeout.min(MAX_TIMER));
        self.waiting.insert(key, Waiting { held: vec![item], delay });
        HoldResult::First
    }

    /// Release everything waiting on `key`, cancelling its deadline.
    pub fn take(&mut self, key: &ResolutionKey) -> Vec<T> {
        match self.waiting.remove(key) {
            Some(waiting) => {
                self.delays.remove(&waiting.delay);
                waiting.held
            }
            None => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Number of keys with an outstanding resolution.
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    /// Packets held across all keys.
    pub fn held(&self) -> usize {
        self.waiting.values().map(|w| w.held.len()).sum()
    }

    /// Wait for the next deadline to pass. Resolves to `None` at once
    /// when nothing is pending, so guard `select!` arms with `is_empty`.
    pub async fn next_expired(&mut self) -> Option<(ResolutionKey, Vec<T>)> {
        let expired = poll_fn(|cx| self.delays.poll_expired(cx)).await?;
        let key = expired.into_inner();
        let held = self.waiting.remove(&key).map(|w| w.held).unwrap_or_default();
        Some((key, held))
    }

    /// Drop everything without reporting it.
    pub fn clear(&mut self) {
        self.waiting.clear();
        self.delays.clear();
    }
}
