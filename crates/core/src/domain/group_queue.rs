// Group Queue Domain Model
// Ordered active requests of one work-group (Notified first, then Waiting)

use crate::domain::{BreakRequest, BreakStatus, GroupId, RequestId};
use std::collections::{HashMap, VecDeque};

/// Gap between consecutive queue keys, leaving room for midpoint inserts
pub const QUEUE_KEY_STEP: i64 = 1 << 20;

/// Where a requeued request re-enters the Waiting sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReinsertSlot {
    /// Zero-based Waiting index
    pub index: usize,
    /// Queue key placing the request at `index`
    pub queue_key: i64,
    /// New keys for Waiting requests when the gap at `index` is exhausted
    pub renumbered: Vec<(RequestId, i64)>,
}

/// Per-group queue state
///
/// Holds only active requests. The group sequence is the Notified requests
/// (in notification order) followed by the Waiting requests in `queue_key`
/// order.
#[derive(Debug, Clone)]
pub struct GroupQueue {
    group: GroupId,
    requests: HashMap<RequestId, BreakRequest>,
    notified: Vec<RequestId>,
    waiting: VecDeque<RequestId>,
}

impl GroupQueue {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            requests: HashMap::new(),
            notified: Vec::new(),
            waiting: VecDeque::new(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Number of active requests
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn get(&self, id: &str) -> Option<&BreakRequest> {
        self.requests.get(id)
    }

    /// Active request owned by `user_id`, if any
    pub fn active_for_user(&self, user_id: &str) -> Option<&BreakRequest> {
        self.requests.values().find(|r| r.user_id == user_id)
    }

    /// Head of the Waiting sequence
    pub fn peek_waiting(&self) -> Option<&BreakRequest> {
        self.waiting.front().and_then(|id| self.requests.get(id))
    }

    /// Currently Notified requests, oldest notification first
    pub fn notified(&self) -> impl Iterator<Item = &BreakRequest> {
        self.notified.iter().filter_map(|id| self.requests.get(id))
    }

    /// Zero-based position of a Waiting request
    pub fn waiting_position(&self, id: &str) -> Option<usize> {
        self.waiting.iter().position(|w| w == id)
    }

    /// Full ordered sequence (Notified, then Waiting)
    pub fn sequence(&self) -> Vec<BreakRequest> {
        self.notified
            .iter()
            .chain(self.waiting.iter())
            .filter_map(|id| self.requests.get(id))
            .cloned()
            .collect()
    }

    /// Queue key for a request appended at the Waiting tail
    pub fn tail_key(&self) -> i64 {
        self.waiting
            .back()
            .map_or(0, |id| self.key_of(id) + QUEUE_KEY_STEP)
    }

    /// Slot `shift` places behind the Waiting head for request `id`
    ///
    /// The index is clamped to the Waiting length. When the neighbouring keys
    /// leave no room, every Waiting request is renumbered and the new keys are
    /// returned in `renumbered`.
    pub fn reinsertion_slot(&self, id: &str, shift: usize) -> ReinsertSlot {
        let others: Vec<(&RequestId, i64)> = self
            .waiting
            .iter()
            .filter(|w| w.as_str() != id)
            .map(|w| (w, self.key_of(w)))
            .collect();
        let index = shift.min(others.len());
        let prev = index.checked_sub(1).map(|i| others[i].1);
        let next = others.get(index).map(|(_, key)| *key);

        let queue_key = match (prev, next) {
            (None, None) => Some(0),
            (Some(prev), None) => Some(prev + QUEUE_KEY_STEP),
            (None, Some(next)) => Some(next - QUEUE_KEY_STEP),
            (Some(prev), Some(next)) if next - prev >= 2 => Some(prev + (next - prev) / 2),
            (Some(_), Some(_)) => None,
        };

        match queue_key {
            Some(queue_key) => ReinsertSlot {
                index,
                queue_key,
                renumbered: Vec::new(),
            },
            None => {
                let renumbered = others
                    .iter()
                    .enumerate()
                    .map(|(i, (w, _))| {
                        let slot = if i < index { i } else { i + 1 };
                        (w.to_string(), slot as i64 * QUEUE_KEY_STEP)
                    })
                    .collect();
                ReinsertSlot {
                    index,
                    queue_key: index as i64 * QUEUE_KEY_STEP,
                    renumbered,
                }
            }
        }
    }

    /// Overwrite queue keys of tracked requests
    pub fn apply_queue_keys(&mut self, keys: &[(RequestId, i64)]) {
        for (id, key) in keys {
            if let Some(request) = self.requests.get_mut(id) {
                request.queue_key = *key;
            }
        }
    }

    /// Append a Waiting request at the tail
    pub fn push_waiting(&mut self, request: BreakRequest) {
        debug_assert_eq!(request.status, BreakStatus::Waiting);
        self.detach(&request.id);
        self.waiting.push_back(request.id.clone());
        self.requests.insert(request.id.clone(), request);
    }

    /// Insert a Waiting request at the position given by its queue key
    ///
    /// Equal keys keep insertion order. Returns the index used.
    pub fn insert_by_key(&mut self, request: BreakRequest) -> usize {
        debug_assert_eq!(request.status, BreakStatus::Waiting);
        self.detach(&request.id);
        let index = self
            .waiting
            .iter()
            .position(|w| self.key_of(w) > request.queue_key)
            .unwrap_or(self.waiting.len());
        self.waiting.insert(index, request.id.clone());
        self.requests.insert(request.id.clone(), request);
        index
    }

    /// Move a request into the Notified list
    pub fn mark_notified(&mut self, request: BreakRequest) {
        debug_assert_eq!(request.status, BreakStatus::Notified);
        self.detach(&request.id);
        self.notified.push(request.id.clone());
        self.requests.insert(request.id.clone(), request);
    }

    /// Place a request recovered from storage according to its status
    ///
    /// Waiting requests are ordered by queue key, Notified ones are appended
    /// to the Notified list. Anything else is ignored.
    pub fn restore(&mut self, request: BreakRequest) -> bool {
        match request.status {
            BreakStatus::Waiting => {
                self.insert_by_key(request);
            }
            BreakStatus::Notified => self.mark_notified(request),
            _ => return false,
        }
        true
    }

    /// Drop a request from active tracking
    pub fn remove(&mut self, id: &str) -> Option<BreakRequest> {
        self.detach(id);
        self.requests.remove(id)
    }

    fn key_of(&self, id: &str) -> i64 {
        self.requests.get(id).map_or(0, |r| r.queue_key)
    }

    fn detach(&mut self, id: &str) {
        self.notified.retain(|n| n != id);
        self.waiting.retain(|w| w != id);
    }
}
