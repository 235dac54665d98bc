//! Cooperative single-threaded scheduler with a virtual clock.
//!
//! Nothing runs until the owner drives the loop with [`RunLoop::run_pending`]
//! or [`RunLoop::advance`]. Sources use it to resolve requests
//! asynchronously; the memory manager uses it to yield between sweeps.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

type Task = Box<dyn FnOnce()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

#[derive(Default)]
struct RunLoopState {
    now: Duration,
    next_id: u64,
    ticks: VecDeque<(TaskId, Task)>,
    timers: BTreeMap<(Duration, TaskId), Task>,
}

impl RunLoopState {
    fn next_id(&mut self) -> TaskId {
        self.next_id += 1;
        TaskId(self.next_id)
    }
}

#[derive(Clone, Default)]
pub struct RunLoop {
    inner: Rc<RefCell<RunLoopState>>,
}

impl std::fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("RunLoop")
            .field("now", &state.now)
            .field("ticks", &state.ticks.len())
            .field("timers", &state.timers.len())
            .finish()
    }
}

impl RunLoop {
    pub fn new() -> Self {
        RunLoop::default()
    }

    pub fn now(&self) -> Duration {
        self.inner.borrow().now
    }

    /// Queue `task` to run on the next turn of the loop.
    pub fn next_tick(&self, task: impl FnOnce() + 'static) -> TaskId {
        let mut state = self.inner.borrow_mut();
        let id = state.next_id();
        state.ticks.push_back((id, Box::new(task)));
        id
    }

    /// Run `task` once the virtual clock has advanced by `delay`.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + 'static) -> TaskId {
        let mut state = self.inner.borrow_mut();
        let id = state.next_id();
        let due = state.now + delay;
        state.timers.insert((due, id), Box::new(task));
        id
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        let mut state = self.inner.borrow_mut();
        if let Some(pos) = state.ticks.iter().position(|(task_id, _)| *task_id == id) {
            state.ticks.remove(pos);
            return true;
        }
        let key = state.timers.keys().find(|(_, task_id)| *task_id == id).copied();
        match key {
            Some(key) => state.timers.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.borrow().ticks.is_empty()
    }

    pub fn scheduled_timers(&self) -> usize {
        self.inner.borrow().timers.len()
    }

    /// Run queued tasks, including tasks queued while running, until the
    /// queue is empty. Returns the number of tasks run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.inner.borrow_mut().ticks.pop_front();
            let Some((_, task)) = task else {
                return ran;
            };
            task();
            ran += 1;
        }
    }

    /// Advance the virtual clock, firing due timers in order and draining the
    /// tick queue after each one.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.now() + by;
        let mut ran = self.run_pending();
        loop {
            let due = {
                let mut state = self.inner.borrow_mut();
                let next = state.timers.keys().next().copied();
                match next {
                    Some(key) if key.0 <= target => {
                        state.now = key.0;
                        state.timers.remove(&key)
                    }
                    _ => None,
                }
            };
            let Some(task) = due else {
                break;
            };
            task();
            ran += 1;
            ran += self.run_pending();
        }
        self.inner.borrow_mut().now = target;
        ran
    }
}
