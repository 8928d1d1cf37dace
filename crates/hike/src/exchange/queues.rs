// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Task queues and exchange-collision adoption.
//!
//! Three ordered lists with distinct roles:
//!
//! - **queued**: future work, each entry with an earliest-start time
//! - **active**: tasks whose request is in flight, this end initiating
//! - **passive**: tasks answering a peer-initiated exchange
//!
//! Insertion order within a list is execution order. A task lives on
//! exactly one list at a time; collision adoption transfers ownership into
//! the adopting active task.

use std::time::Instant;

use crate::task::{Task, TaskType};

/// Which task list an operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskQueue {
    Queued,
    Active,
    Passive,
}

/// A task waiting for activation.
pub struct QueuedTask {
    pub task: Box<dyn Task>,
    /// Earliest instant the task may be activated.
    pub not_before: Instant,
}

/// The three task lists of one exchange manager.
#[derive(Default)]
pub struct TaskQueues {
    queued: Vec<QueuedTask>,
    active: Vec<Box<dyn Task>>,
    passive: Vec<Box<dyn Task>>,
}

impl TaskQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task to the queued list.
    pub fn queue(&mut self, task: Box<dyn Task>, not_before: Instant) {
        log::debug!("queueing {:?} task", task.task_type());
        self.queued.push(QueuedTask { task, not_before });
    }

    /// Put a queued task at the front (adoption, reset re-queueing).
    pub fn queue_front(&mut self, task: Box<dyn Task>, not_before: Instant) {
        self.queued.insert(0, QueuedTask { task, not_before });
    }

    /// Whether a task of the given type sits on the given list.
    pub fn has_queued(&self, queue: TaskQueue, task_type: TaskType) -> bool {
        match queue {
            TaskQueue::Queued => self.queued.iter().any(|q| q.task.task_type() == task_type),
            TaskQueue::Active => self.active.iter().any(|t| t.task_type() == task_type),
            TaskQueue::Passive => self.passive.iter().any(|t| t.task_type() == task_type),
        }
    }

    /// Move the first non-delayed queued task of the given type to the
    /// active list. Returns whether one was activated.
    pub fn activate(&mut self, task_type: TaskType, now: Instant) -> bool {
        let position = self
            .queued
            .iter()
            .position(|q| q.task.task_type() == task_type && q.not_before <= now);
        match position {
            Some(idx) => {
                log::debug!("  activating {task_type:?} task");
                let queued = self.queued.remove(idx);
                self.active.push(queued.task);
                true
            }
            None => false,
        }
    }

    /// Append a peer-spawned task to the passive list.
    pub fn push_passive(&mut self, task: Box<dyn Task>) {
        self.passive.push(task);
    }

    pub fn active_tasks(&self) -> &[Box<dyn Task>] {
        &self.active
    }

    pub fn active_tasks_mut(&mut self) -> &mut Vec<Box<dyn Task>> {
        &mut self.active
    }

    pub fn passive_tasks_mut(&mut self) -> &mut Vec<Box<dyn Task>> {
        &mut self.passive
    }

    pub fn queued_tasks_mut(&mut self) -> &mut Vec<QueuedTask> {
        &mut self.queued
    }

    /// Whether an exchange is being initiated.
    pub fn busy(&self) -> bool {
        !self.active.is_empty()
    }

    /// Count of entries on a list.
    pub fn len(&self, queue: TaskQueue) -> usize {
        match queue {
            TaskQueue::Queued => self.queued.len(),
            TaskQueue::Active => self.active.len(),
            TaskQueue::Passive => self.passive.len(),
        }
    }

    /// Iterate a list's tasks in order.
    pub fn tasks(&self, queue: TaskQueue) -> Box<dyn Iterator<Item = &dyn Task> + '_> {
        match queue {
            TaskQueue::Queued => Box::new(self.queued.iter().map(|q| q.task.as_ref())),
            TaskQueue::Active => Box::new(self.active.iter().map(|t| t.as_ref())),
            TaskQueue::Passive => Box::new(self.passive.iter().map(|t| t.as_ref())),
        }
    }

    /// Remove the task at `index` from a list.
    pub fn remove(&mut self, queue: TaskQueue, index: usize) -> Option<Box<dyn Task>> {
        match queue {
            TaskQueue::Queued => {
                if index < self.queued.len() {
                    Some(self.queued.remove(index).task)
                } else {
                    None
                }
            }
            TaskQueue::Active => {
                if index < self.active.len() {
                    Some(self.active.remove(index))
                } else {
                    None
                }
            }
            TaskQueue::Passive => {
                if index < self.passive.len() {
                    Some(self.passive.remove(index))
                } else {
                    None
                }
            }
        }
    }

    /// Drop all tasks on a list.
    pub fn flush(&mut self, queue: TaskQueue) {
        match queue {
            TaskQueue::Queued => self.queued.clear(),
            TaskQueue::Active => self.active.clear(),
            TaskQueue::Passive => self.passive.clear(),
        }
    }

    /// Drop everything.
    pub fn flush_all(&mut self) {
        self.queued.clear();
        self.passive.clear();
        self.active.clear();
    }

    /// Offer a passive task to a colliding active task.
    ///
    /// An active IKE rekey adopts a passive IKE rekey or IKE delete; an
    /// active CHILD rekey adopts a passive CHILD rekey. Returns `None` when
    /// the task was adopted (ownership moved into the active task),
    /// otherwise hands the task back.
    pub fn handle_collision(&mut self, task: Box<dyn Task>) -> Option<Box<dyn Task>> {
        let passive_type = task.task_type();
        let wanted_active = match passive_type {
            TaskType::IkeRekey | TaskType::IkeDelete => TaskType::IkeRekey,
            TaskType::ChildRekey => TaskType::ChildRekey,
            _ => return Some(task),
        };

        for active in &mut self.active {
            if active.task_type() == wanted_active {
                match active.collide(task) {
                    None => {
                        log::debug!(
                            "{passive_type:?} task adopted by active {wanted_active:?} task"
                        );
                        return None;
                    }
                    Some(returned) => return Some(returned),
                }
            }
        }
        Some(task)
    }
}
