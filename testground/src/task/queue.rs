//! In-memory scheduling queue.
//!
//! A max-heap ordered by (priority desc, created asc): higher-priority
//! tasks pop first, and tasks of equal priority pop in submission order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};

use super::{Task, TaskId};

/// Heap entry for one scheduled task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub id: TaskId,
    pub priority: i32,
    pub created: DateTime<Utc>,
}

impl From<&Task> for QueuedTask {
    fn from(t: &Task) -> Self {
        Self {
            id: t.id.clone(),
            priority: t.priority,
            created: t.created,
        }
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest element: greater means higher
        // priority, then earlier creation, then lower id for stability.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created.cmp(&self.created))
            .then_with(|| other.id.as_str().cmp(self.id.as_str()))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of scheduled task ids.
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<QueuedTask>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: QueuedTask) {
        self.heap.push(entry);
    }

    pub fn pop(&mut self) -> Option<QueuedTask> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(id: &str, priority: i32, created: DateTime<Utc>) -> QueuedTask {
        QueuedTask {
            id: TaskId::from(id),
            priority,
            created,
        }
    }

    #[test]
    fn test_pops_higher_priority_first() {
        // Submissions A(1), B(5), C(1): the worker pops B, then A, then C.
        let t0 = Utc::now();
        let mut q = TaskQueue::new();
        q.push(entry("a", 1, t0));
        q.push(entry("b", 5, t0 + Duration::seconds(1)));
        q.push(entry("c", 1, t0 + Duration::seconds(2)));

        assert_eq!(q.pop().unwrap().id.as_str(), "b");
        assert_eq!(q.pop().unwrap().id.as_str(), "a");
        assert_eq!(q.pop().unwrap().id.as_str(), "c");
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_sorts_priority_then_time() {
        let earlier = Utc::now();
        let later = earlier + Duration::minutes(1);

        let mut q = TaskQueue::new();
        for i in 0..=10 {
            q.push(entry(&format!("e{}", i), i, earlier));
        }
        for i in 0..=10 {
            q.push(entry(&format!("l{}", i), i, later));
        }

        let mut head = q.pop().unwrap();
        while let Some(next) = q.pop() {
            if head.priority != next.priority {
                assert!(
                    head.priority > next.priority,
                    "should prefer higher priority tasks"
                );
            } else {
                assert!(head.created < next.created, "should prefer older tasks");
            }
            head = next;
        }
    }
}
