use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::models::OcrRequest;

struct QueuedRequest {
    priority: i32,
    seq: u64,
    request: OcrRequest,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier arrival first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending requests ordered by priority, ties broken by submission order.
#[derive(Default)]
pub(crate) struct PendingQueue {
    heap: BinaryHeap<QueuedRequest>,
    next_seq: u64,
}

impl PendingQueue {
    pub fn push(&mut self, request: OcrRequest) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedRequest {
            priority: request.priority,
            seq,
            request,
        });
    }

    pub fn pop(&mut self) -> Option<OcrRequest> {
        self.heap.pop().map(|queued| queued.request)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
