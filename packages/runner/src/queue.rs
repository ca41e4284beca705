//! Thread-safe priority queue of pending invocations.
//!
//! Ordering is `(priority rank, arrival sequence)`: higher priority first,
//! FIFO within a priority band. Types flagged `preserve_order` are grouped
//! into per-type FIFOs; the heap holds at most one head marker per such type,
//! refilled when the head is consumed, so cross-type priority still applies
//! while within-type order stays strictly first-in first-out.

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::{debug, error};
use uuid::Uuid;

use crate::invocation::Invocation;

/// Result of offering an invocation to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Accepted; the id is the pushed invocation's.
    Enqueued(Uuid),
    /// Dropped: a pending invocation of the same type already carries this
    /// dedup key. The id is the existing invocation's.
    Duplicate(Uuid),
    /// Dropped: the queue has been closed.
    Closed,
}

struct HeapEntry {
    rank: i16,
    seq: u64,
    kind: EntryKind,
}

enum EntryKind {
    Direct(Invocation),
    /// Claim ticket for the front of a `preserve_order` FIFO.
    OrderedHead(String),
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap; invert so the smallest (rank, seq) pops first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.rank, other.seq).cmp(&(self.rank, self.seq))
    }
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<HeapEntry>,
    ordered_fifos: HashMap<String, VecDeque<Invocation>>,
    /// Ordered types that currently have a head marker in the heap.
    heads: HashSet<String>,
    pending_by_type: HashMap<String, usize>,
    /// `job_type -> dedup_key -> pending invocation id`.
    dedup_index: HashMap<String, HashMap<String, Uuid>>,
    next_seq: u64,
    closed: bool,
}

/// Priority queue shared between the scheduler, the enqueue path, and the
/// worker pool. One internal mutex; waiting poppers park on a `Notify`.
pub struct InvocationQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    ordered_types: HashSet<String>,
}

impl InvocationQueue {
    /// `ordered_types` is the set of job types registered with
    /// `preserve_order`.
    pub fn new(ordered_types: HashSet<String>) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            ordered_types,
        }
    }

    /// Offer an invocation, applying push-side deduplication.
    pub fn push(&self, invocation: Invocation) -> PushOutcome {
        self.insert(invocation, false)
    }

    /// Put an invocation back after a failed concurrency acquisition.
    ///
    /// Ordered types are reinstated at the front of their FIFO; everything
    /// else lands at the tail of its priority band with `enqueued_at`
    /// untouched.
    pub fn requeue(&self, invocation: Invocation) -> PushOutcome {
        self.insert(invocation, true)
    }

    fn insert(&self, invocation: Invocation, front: bool) -> PushOutcome {
        let mut inner = self.lock();
        if inner.closed {
            debug!(job_type = %invocation.job_type, "queue closed, dropping invocation");
            return PushOutcome::Closed;
        }

        if let Some(key) = &invocation.dedup_key {
            if let Some(existing) = inner
                .dedup_index
                .get(&invocation.job_type)
                .and_then(|keys| keys.get(key))
            {
                debug!(
                    job_type = %invocation.job_type,
                    dedup_key = %key,
                    existing = %existing,
                    "duplicate invocation dropped"
                );
                return PushOutcome::Duplicate(*existing);
            }
        }

        let id = invocation.id;
        let rank = invocation.priority.as_i16();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        if let Some(key) = invocation.dedup_key.clone() {
            inner
                .dedup_index
                .entry(invocation.job_type.clone())
                .or_default()
                .insert(key, id);
        }
        *inner
            .pending_by_type
            .entry(invocation.job_type.clone())
            .or_default() += 1;

        if self.ordered_types.contains(&invocation.job_type) {
            let job_type = invocation.job_type.clone();
            let fifo = inner.ordered_fifos.entry(job_type.clone()).or_default();
            if front {
                fifo.push_front(invocation);
            } else {
                fifo.push_back(invocation);
            }
            if !inner.heads.contains(&job_type) {
                inner.heads.insert(job_type.clone());
                inner.heap.push(HeapEntry {
                    rank,
                    seq,
                    kind: EntryKind::OrderedHead(job_type),
                });
            }
        } else {
            inner.heap.push(HeapEntry {
                rank,
                seq,
                kind: EntryKind::Direct(invocation),
            });
        }

        drop(inner);
        self.notify.notify_one();
        PushOutcome::Enqueued(id)
    }

    /// Take the next invocation, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Invocation> {
        loop {
            // Register interest before checking state so a push between the
            // check and the await still wakes us.
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if let Some(invocation) = Self::take_next(&mut inner) {
                    let more = !inner.heap.is_empty();
                    drop(inner);
                    if more {
                        // Wake the next parked worker, if any.
                        self.notify.notify_one();
                    }
                    return Some(invocation);
                }
                if inner.closed {
                    drop(inner);
                    // Pass the wakeup on so every parked worker observes the
                    // close.
                    self.notify.notify_one();
                    return None;
                }
            }
            notified.await;
        }
    }

    fn take_next(inner: &mut QueueInner) -> Option<Invocation> {
        while let Some(entry) = inner.heap.pop() {
            match entry.kind {
                EntryKind::Direct(invocation) => {
                    Self::note_removed(inner, &invocation);
                    return Some(invocation);
                }
                EntryKind::OrderedHead(job_type) => {
                    inner.heads.remove(&job_type);
                    let (invocation, next_rank) =
                        match inner.ordered_fifos.get_mut(&job_type) {
                            Some(fifo) => {
                                let head = fifo.pop_front();
                                let next = fifo.front().map(|f| f.priority.as_i16());
                                (head, next)
                            }
                            None => (None, None),
                        };
                    let Some(invocation) = invocation else {
                        // Stale marker left behind by remove_matching.
                        continue;
                    };
                    if let Some(rank) = next_rank {
                        let seq = inner.next_seq;
                        inner.next_seq += 1;
                        inner.heads.insert(job_type.clone());
                        inner.heap.push(HeapEntry {
                            rank,
                            seq,
                            kind: EntryKind::OrderedHead(job_type),
                        });
                    }
                    Self::note_removed(inner, &invocation);
                    return Some(invocation);
                }
            }
        }
        None
    }

    fn note_removed(inner: &mut QueueInner, invocation: &Invocation) {
        match inner.pending_by_type.get_mut(&invocation.job_type) {
            Some(count) if *count > 0 => *count -= 1,
            _ => {
                error!(
                    critical = true,
                    job_type = %invocation.job_type,
                    "queue pending count underflow"
                );
            }
        }
        if let Some(key) = &invocation.dedup_key {
            if let Some(keys) = inner.dedup_index.get_mut(&invocation.job_type) {
                if keys.get(key) == Some(&invocation.id) {
                    keys.remove(key);
                }
            }
        }
    }

    /// Remove every pending invocation matching `predicate`; returns how many
    /// were dropped. Used to purge a type's backlog when it is disabled and
    /// to clear the queue at the graceful-shutdown deadline.
    pub fn remove_matching(&self, predicate: impl Fn(&Invocation) -> bool) -> usize {
        let mut inner = self.lock();
        let mut removed = 0;

        let entries = std::mem::take(&mut inner.heap).into_vec();
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            let matched = matches!(&entry.kind, EntryKind::Direct(inv) if predicate(inv));
            if matched {
                if let EntryKind::Direct(invocation) = entry.kind {
                    removed += 1;
                    Self::note_removed(&mut inner, &invocation);
                }
            } else {
                kept.push(entry);
            }
        }
        inner.heap = BinaryHeap::from(kept);

        let mut fifos = std::mem::take(&mut inner.ordered_fifos);
        for fifo in fifos.values_mut() {
            let mut keep = VecDeque::with_capacity(fifo.len());
            while let Some(invocation) = fifo.pop_front() {
                if predicate(&invocation) {
                    removed += 1;
                    Self::note_removed(&mut inner, &invocation);
                } else {
                    keep.push_back(invocation);
                }
            }
            *fifo = keep;
        }
        inner.ordered_fifos = fifos;

        removed
    }

    /// Total pending invocations.
    pub fn len(&self) -> usize {
        self.lock().pending_by_type.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending invocations of one type; used by stacking prevention.
    pub fn len_by_type(&self, job_type: &str) -> usize {
        self.lock()
            .pending_by_type
            .get(job_type)
            .copied()
            .unwrap_or(0)
    }

    /// Close the queue: pending items remain poppable, blocked and future
    /// `pop` calls return `None` once drained, pushes are dropped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        // A popper between its empty-check and its park would miss the
        // broadcast; the stored permit catches it.
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::invocation::{InvocationSource, JobPriority};

    fn invocation(job_type: &str, priority: JobPriority, dedup_key: Option<&str>) -> Invocation {
        let now = Utc::now();
        Invocation {
            id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            priority,
            enqueued_at: now,
            attempt: 1,
            source: InvocationSource::External,
            payload: None,
            dedup_key: dedup_key.map(str::to_string),
            deadline: now + Duration::from_secs(60),
        }
    }

    fn queue() -> InvocationQueue {
        InvocationQueue::new(HashSet::new())
    }

    #[tokio::test]
    async fn pops_in_priority_order() {
        let q = queue();
        q.push(invocation("low", JobPriority::Low, None));
        q.push(invocation("normal", JobPriority::Normal, None));
        q.push(invocation("crit", JobPriority::Critical, None));

        assert_eq!(q.pop().await.unwrap().job_type, "crit");
        assert_eq!(q.pop().await.unwrap().job_type, "normal");
        assert_eq!(q.pop().await.unwrap().job_type, "low");
    }

    #[tokio::test]
    async fn fifo_within_priority_band() {
        let q = queue();
        let first = invocation("a", JobPriority::Normal, None);
        let second = invocation("b", JobPriority::Normal, None);
        let first_id = first.id;
        let second_id = second.id;
        q.push(first);
        q.push(second);

        assert_eq!(q.pop().await.unwrap().id, first_id);
        assert_eq!(q.pop().await.unwrap().id, second_id);
    }

    #[tokio::test]
    async fn duplicate_dedup_key_is_dropped() {
        let q = queue();
        let first = invocation("sync", JobPriority::Normal, Some("sync"));
        let first_id = first.id;
        assert!(matches!(q.push(first), PushOutcome::Enqueued(_)));

        let outcome = q.push(invocation("sync", JobPriority::Normal, Some("sync")));
        assert_eq!(outcome, PushOutcome::Duplicate(first_id));
        assert_eq!(q.len_by_type("sync"), 1);

        // Same key on a different type is unrelated.
        assert!(matches!(
            q.push(invocation("other", JobPriority::Normal, Some("sync"))),
            PushOutcome::Enqueued(_)
        ));
    }

    #[tokio::test]
    async fn dedup_key_is_released_on_pop() {
        let q = queue();
        q.push(invocation("sync", JobPriority::Normal, Some("sync")));
        q.pop().await.unwrap();

        assert!(matches!(
            q.push(invocation("sync", JobPriority::Normal, Some("sync"))),
            PushOutcome::Enqueued(_)
        ));
    }

    #[tokio::test]
    async fn preserve_order_type_ignores_priority_within_type() {
        let ordered: HashSet<String> = ["ordered".to_string()].into_iter().collect();
        let q = InvocationQueue::new(ordered);

        let first = invocation("ordered", JobPriority::Low, None);
        let second = invocation("ordered", JobPriority::Critical, None);
        let ids = [first.id, second.id];
        q.push(first);
        q.push(second);

        // The low-priority head was enqueued first; strict FIFO wins.
        assert_eq!(q.pop().await.unwrap().id, ids[0]);
        assert_eq!(q.pop().await.unwrap().id, ids[1]);
    }

    #[tokio::test]
    async fn ordered_head_competes_with_other_types_by_priority() {
        let ordered: HashSet<String> = ["ordered".to_string()].into_iter().collect();
        let q = InvocationQueue::new(ordered);

        q.push(invocation("ordered", JobPriority::Low, None));
        q.push(invocation("plain", JobPriority::Critical, None));

        assert_eq!(q.pop().await.unwrap().job_type, "plain");
        assert_eq!(q.pop().await.unwrap().job_type, "ordered");
    }

    #[tokio::test]
    async fn requeue_ordered_type_goes_back_to_front() {
        let ordered: HashSet<String> = ["ordered".to_string()].into_iter().collect();
        let q = InvocationQueue::new(ordered);

        q.push(invocation("ordered", JobPriority::Normal, None));
        q.push(invocation("ordered", JobPriority::Normal, None));

        let head = q.pop().await.unwrap();
        let head_id = head.id;
        q.requeue(head);

        assert_eq!(q.pop().await.unwrap().id, head_id);
    }

    #[tokio::test]
    async fn requeue_lands_at_tail_of_priority_band() {
        let q = queue();
        let first = invocation("a", JobPriority::Normal, None);
        let first_id = first.id;
        q.push(first);
        q.push(invocation("b", JobPriority::Normal, None));

        let popped = q.pop().await.unwrap();
        assert_eq!(popped.id, first_id);
        q.requeue(popped);

        // The other normal-priority entry now pops first.
        assert_eq!(q.pop().await.unwrap().job_type, "b");
        assert_eq!(q.pop().await.unwrap().id, first_id);
    }

    #[tokio::test]
    async fn pop_blocks_until_push() {
        let q = Arc::new(queue());
        let popper = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!popper.is_finished());

        q.push(invocation("late", JobPriority::Normal, None));
        let popped = popper.await.unwrap().unwrap();
        assert_eq!(popped.job_type, "late");
    }

    #[tokio::test]
    async fn close_releases_blocked_pop() {
        let q = Arc::new(queue());
        let popper = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();

        assert!(popper.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_drains_remaining_items_first() {
        let q = queue();
        q.push(invocation("a", JobPriority::Normal, None));
        q.close();

        assert!(q.push(invocation("b", JobPriority::Normal, None)) == PushOutcome::Closed);
        assert_eq!(q.pop().await.unwrap().job_type, "a");
        assert!(q.pop().await.is_none());
    }

    #[tokio::test]
    async fn remove_matching_drops_pending() {
        let ordered: HashSet<String> = ["ordered".to_string()].into_iter().collect();
        let q = InvocationQueue::new(ordered);

        q.push(invocation("a", JobPriority::Normal, None));
        q.push(invocation("a", JobPriority::Normal, None));
        q.push(invocation("ordered", JobPriority::Normal, None));
        q.push(invocation("keep", JobPriority::Normal, None));

        let removed = q.remove_matching(|inv| inv.job_type != "keep");
        assert_eq!(removed, 3);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().await.unwrap().job_type, "keep");
    }

    #[tokio::test]
    async fn len_by_type_tracks_pushes_and_pops() {
        let q = queue();
        q.push(invocation("a", JobPriority::Normal, None));
        q.push(invocation("a", JobPriority::Normal, None));
        q.push(invocation("b", JobPriority::Normal, None));

        assert_eq!(q.len_by_type("a"), 2);
        assert_eq!(q.len_by_type("b"), 1);
        assert_eq!(q.len(), 3);

        q.pop().await.unwrap();
        assert_eq!(q.len(), 2);
    }
}
