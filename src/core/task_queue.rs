//! 优先级任务队列
//!
//! 按 (优先级升序, 入队序号升序) 排序的二叉堆；序号保证同优先级先进先出。
//! 出队时跳过并永久丢弃已用尽重试次数的任务。

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::core::task::{Task, TaskPriority, TaskStatus};

struct QueueEntry {
    priority: TaskPriority,
    seq: u64,
    task: Task,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

/// 任务队列
#[derive(Default)]
pub struct PriorityTaskQueue {
    heap: Mutex<BinaryHeap<Reverse<QueueEntry>>>,
    next_seq: AtomicU64,
    dropped: AtomicU64,
}

impl PriorityTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// O(log n) 入队
    pub fn push(&self, task: Task) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(task = %task.name, priority = ?task.priority, "Task added");
        let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        heap.push(Reverse(QueueEntry {
            priority: task.priority,
            seq,
            task,
        }));
    }

    pub fn extend(&self, tasks: impl IntoIterator<Item = Task>) {
        for task in tasks {
            self.push(task);
        }
    }

    /// 取出最重要的、仍在重试预算内的任务
    pub fn pop(&self) -> Option<Task> {
        self.pop_where(|_| true)
    }

    /// 取出满足条件的最重要任务；不满足条件的任务保持原有顺序留在队列中
    pub fn pop_where(&self, accept: impl Fn(&Task) -> bool) -> Option<Task> {
        let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        let mut passed = Vec::new();
        let mut found = None;
        while let Some(Reverse(entry)) = heap.pop() {
            if entry.task.retries_exhausted() {
                let mut task = entry.task;
                task.status = TaskStatus::Failed;
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(task = %task.name, attempts = task.attempts, "Task failed max attempts, dropped");
                continue;
            }
            if accept(&entry.task) {
                found = Some(entry.task);
                break;
            }
            passed.push(Reverse(entry));
        }
        // 原样放回，seq 不变，先进先出不受影响
        heap.extend(passed);
        found
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 出队时因重试耗尽而丢弃的任务数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
