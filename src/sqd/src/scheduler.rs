//! Generic multi-chain task scheduler.
//!
//! A *task* carries an arbitrary payload and belongs to one or more *chains*;
//! each chain is a totally ordered sequence of tasks. The scheduler releases
//! tasks for execution such that release order within a chain follows creation
//! order, and reports, per release, the immediate live predecessor on each of
//! the task's chains. Callers use those predecessors to tell the executing
//! side what must be observed first.
//!
//! The scheduler is payload-agnostic and knows nothing about queries,
//! transports, or retries; [`MultiChainDispatcher`](crate::MultiChainDispatcher)
//! layers those semantics on top.

use std::collections::BTreeMap;

use fxhash::FxHashMap;

/// Identifier of a chain. Allocation of the id space is the caller's business;
/// the scheduler creates chains lazily on first use and drops them when their
/// last task finishes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ChainId(
    /// The raw chain id value.
    pub u64,
);

/// Stable identifier of a task, assigned at creation in monotonically
/// increasing order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// The raw id value, usable as an external correlation token.
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum TaskState {
    Pending,
    Active,
}

struct TaskEntry<E> {
    extra: E,
    state: TaskState,
    chains: Vec<ChainId>,
}

/// A task released by [`ChainScheduler::start_next_task`].
#[derive(Debug)]
pub struct StartedTask {
    /// The released task.
    pub task_id: TaskId,
    /// The immediate live predecessor on each of the task's chains,
    /// deduplicated, in chain-declaration order. Tasks that already finished
    /// do not appear.
    pub parents: Vec<TaskId>,
}

/// Generic ordering engine over tasks tagged with 1..k chains.
///
/// A task is released only when, on every one of its chains, all earlier
/// tasks have themselves been released (they may still be running). Finishing
/// a task removes it from its chains; resetting a task makes it eligible for
/// re-release at its original chain position, with predecessors recomputed.
pub struct ChainScheduler<E> {
    // Creation-order iteration matters for release fairness, hence a BTreeMap
    // keyed by the monotone task id.
    tasks: BTreeMap<u64, TaskEntry<E>>,
    chains: FxHashMap<ChainId, Vec<u64>>,
    next_task_id: u64,
}

impl<E> Default for ChainScheduler<E> {
    fn default() -> Self {
        ChainScheduler {
            tasks: BTreeMap::new(),
            chains: FxHashMap::default(),
            next_task_id: 1,
        }
    }
}

impl<E> ChainScheduler<E> {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new pending task to every chain in `chains`.
    ///
    /// # Panics
    ///
    /// Panics if `chains` is empty: a task with no chains would never be
    /// ordered against anything and is a programming error.
    pub fn create_task(&mut self, chains: &[ChainId], extra: E) -> TaskId {
        assert!(
            !chains.is_empty(),
            "create_task: a task must belong to at least one chain"
        );
        let id = self.next_task_id;
        self.next_task_id += 1;

        let mut task_chains = Vec::with_capacity(chains.len());
        for &chain in chains {
            if task_chains.contains(&chain) {
                continue;
            }
            task_chains.push(chain);
            self.chains.entry(chain).or_default().push(id);
        }
        self.tasks.insert(
            id,
            TaskEntry {
                extra,
                state: TaskState::Pending,
                chains: task_chains,
            },
        );
        TaskId(id)
    }

    /// Releases the earliest pending task that is eligible on every one of its
    /// chains, or returns `None` when no task can run yet.
    ///
    /// Eligible means: on each chain the task belongs to, every earlier task
    /// has already been released (active); a pending predecessor blocks the
    /// whole tail of its chain.
    pub fn start_next_task(&mut self) -> Option<StartedTask> {
        let id = self.find_eligible()?;

        let chains = self.tasks[&id].chains.clone();
        let mut parents = Vec::new();
        for chain in &chains {
            let members = &self.chains[chain];
            let pos = members
                .iter()
                .position(|&member| member == id)
                .expect("task listed in each of its chains");
            if pos > 0 {
                let parent = TaskId(members[pos - 1]);
                if !parents.contains(&parent) {
                    parents.push(parent);
                }
            }
        }

        self.tasks
            .get_mut(&id)
            .expect("eligible task exists")
            .state = TaskState::Active;
        Some(StartedTask {
            task_id: TaskId(id),
            parents,
        })
    }

    fn find_eligible(&self) -> Option<u64> {
        'scan: for (&id, entry) in &self.tasks {
            if entry.state != TaskState::Pending {
                continue;
            }
            for chain in &entry.chains {
                let members = self
                    .chains
                    .get(chain)
                    .expect("chain of a live task exists");
                for &member in members {
                    if member == id {
                        break;
                    }
                    if self.tasks[&member].state == TaskState::Pending {
                        continue 'scan;
                    }
                }
            }
            return Some(id);
        }
        None
    }

    /// Removes a finished task from every chain it belongs to; chains it
    /// headed advance, empty chains are dropped.
    ///
    /// # Panics
    ///
    /// Panics if `task` is unknown.
    pub fn finish_task(&mut self, task: TaskId) {
        let entry = self
            .tasks
            .remove(&task.0)
            .expect("finish_task: unknown task");
        for chain in &entry.chains {
            let members = self
                .chains
                .get_mut(chain)
                .expect("chain of a live task exists");
            members.retain(|&member| member != task.0);
            if members.is_empty() {
                self.chains.remove(chain);
            }
        }
    }

    /// Makes an active task pending again, at its original chain position.
    /// The next release recomputes its predecessors, which may differ from
    /// the first release.
    ///
    /// # Panics
    ///
    /// Panics if `task` is unknown or has not been released.
    pub fn reset_task(&mut self, task: TaskId) {
        let entry = self
            .tasks
            .get_mut(&task.0)
            .expect("reset_task: unknown task");
        assert!(
            entry.state == TaskState::Active,
            "reset_task: task has not been released"
        );
        entry.state = TaskState::Pending;
    }

    /// Mutable access to a task's payload.
    pub fn get_extra(&mut self, task: TaskId) -> Option<&mut E> {
        self.tasks.get_mut(&task.0).map(|entry| &mut entry.extra)
    }

    /// Visits every live payload. Intended for teardown sweeps.
    pub fn for_each(&mut self, mut f: impl FnMut(&mut E)) {
        for entry in self.tasks.values_mut() {
            f(&mut entry.extra);
        }
    }

    /// Whether any task is still live.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
