use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use uuid::Uuid;

use crate::models::TransferReason;

/// One pending transfer in the priority queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub asset_id: Uuid,
    pub priority: u8,
    pub reason: TransferReason,
    pub enqueued_at: Instant,
    generation: u64,
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Max-heap order: higher priority first, earlier enqueue wins ties,
    // insertion sequence breaks exact-time ties deterministically.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Max-priority queue over asset ids.
///
/// Re-enqueuing an id that is already queued updates the existing entry
/// instead of duplicating it; stale heap entries are invalidated lazily via a
/// per-id generation counter.
#[derive(Default)]
pub struct TransferQueue {
    heap: BinaryHeap<QueueEntry>,
    live: HashMap<Uuid, u64>,
    next_generation: u64,
    next_seq: u64,
}

impl TransferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue (or re-queue) a transfer. Priorities clamp to 0-100. The original
    /// enqueue time of an already-queued id is kept so an update never lets an
    /// entry jump the FIFO order within its tier.
    pub fn enqueue(&mut self, asset_id: Uuid, priority: u8, reason: TransferReason) {
        let priority = priority.min(100);
        let enqueued_at = self
            .heap
            .iter()
            .find(|e| e.asset_id == asset_id && Some(&e.generation) == self.live.get(&asset_id))
            .map(|e| e.enqueued_at)
            .unwrap_or_else(Instant::now);

        self.next_generation += 1;
        self.next_seq += 1;
        let entry = QueueEntry {
            asset_id,
            priority,
            reason,
            enqueued_at,
            generation: self.next_generation,
            seq: self.next_seq,
        };
        self.live.insert(asset_id, self.next_generation);
        self.heap.push(entry);
    }

    /// Idempotent priority change; queues the id if it was not queued yet.
    pub fn update_priority(&mut self, asset_id: Uuid, priority: u8, reason: TransferReason) {
        self.enqueue(asset_id, priority, reason);
    }

    /// Pop the highest-priority live entry.
    pub fn dequeue_next(&mut self) -> Option<QueueEntry> {
        while let Some(entry) = self.heap.pop() {
            match self.live.get(&entry.asset_id) {
                Some(generation) if *generation == entry.generation => {
                    self.live.remove(&entry.asset_id);
                    return Some(entry);
                }
                // Stale copy of an updated or removed entry.
                _ => continue,
            }
        }
        None
    }

    pub fn remove(&mut self, asset_id: Uuid) -> bool {
        self.live.remove(&asset_id).is_some()
    }

    pub fn contains(&self, asset_id: Uuid) -> bool {
        self.live.contains_key(&asset_id)
    }

    /// Current priority of a queued id, if any.
    pub fn priority_of(&self, asset_id: Uuid) -> Option<u8> {
        let generation = self.live.get(&asset_id)?;
        self.heap
            .iter()
            .find(|e| e.asset_id == asset_id && e.generation == *generation)
            .map(|e| e.priority)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PRIORITY_NAVIGATION, PRIORITY_PREFETCH, PRIORITY_RENDER};

    #[test]
    fn dequeues_by_priority_then_fifo() {
        let mut q = TransferQueue::new();
        let low1 = Uuid::new_v4();
        let low2 = Uuid::new_v4();
        let high = Uuid::new_v4();

        q.enqueue(low1, PRIORITY_PREFETCH, TransferReason::Prefetch);
        q.enqueue(low2, PRIORITY_PREFETCH, TransferReason::Prefetch);
        q.enqueue(high, PRIORITY_RENDER, TransferReason::Render);

        assert_eq!(q.dequeue_next().unwrap().asset_id, high);
        assert_eq!(q.dequeue_next().unwrap().asset_id, low1);
        assert_eq!(q.dequeue_next().unwrap().asset_id, low2);
        assert!(q.dequeue_next().is_none());
    }

    #[test]
    fn update_replaces_instead_of_duplicating() {
        let mut q = TransferQueue::new();
        let id = Uuid::new_v4();

        q.enqueue(id, PRIORITY_PREFETCH, TransferReason::Prefetch);
        q.update_priority(id, PRIORITY_NAVIGATION, TransferReason::Navigation);
        assert_eq!(q.len(), 1);
        assert_eq!(q.priority_of(id), Some(PRIORITY_NAVIGATION));

        let entry = q.dequeue_next().unwrap();
        assert_eq!(entry.asset_id, id);
        assert_eq!(entry.priority, PRIORITY_NAVIGATION);
        assert!(q.dequeue_next().is_none());
    }

    #[test]
    fn removed_entries_never_surface() {
        let mut q = TransferQueue::new();
        let keep = Uuid::new_v4();
        let drop = Uuid::new_v4();

        q.enqueue(keep, PRIORITY_PREFETCH, TransferReason::Prefetch);
        q.enqueue(drop, PRIORITY_RENDER, TransferReason::Render);
        assert!(q.remove(drop));
        assert!(!q.remove(drop));

        assert_eq!(q.dequeue_next().unwrap().asset_id, keep);
        assert!(q.dequeue_next().is_none());
    }

    #[test]
    fn priorities_clamp_to_hundred() {
        let mut q = TransferQueue::new();
        let id = Uuid::new_v4();
        q.enqueue(id, 255, TransferReason::Render);
        assert_eq!(q.priority_of(id), Some(100));
    }
}
