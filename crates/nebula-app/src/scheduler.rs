//! Throttled per-frame work.
//!
//! Every subsystem that does not run each frame registers a task with an
//! interval and a phase. [`FrameScheduler::due`] yields the tasks that fire
//! on a frame, always in registration order, so a given frame number runs
//! the same work in the same sequence on every run.

use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
struct ScheduledTask<T> {
    name: &'static str,
    every_n: u64,
    phase: u64,
    task: T,
}

/// Fires registered tasks when `frame % every_n == phase`.
#[derive(Clone, Debug, Default)]
pub struct FrameScheduler<T> {
    tasks: Vec<ScheduledTask<T>>,
}

impl<T: Copy> FrameScheduler<T> {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Register `task` to fire every `every_n` frames, offset by `phase`.
    ///
    /// An interval of zero is treated as one. The phase wraps into
    /// `0..every_n`.
    pub fn register(&mut self, name: &'static str, every_n: u64, phase: u64, task: T) {
        let every_n = every_n.max(1);
        let phase = phase % every_n;
        debug!("Scheduled {name} every {every_n} frames (phase {phase})");
        self.tasks.push(ScheduledTask {
            name,
            every_n,
            phase,
            task,
        });
    }

    /// Tasks that fire on `frame`, in registration order.
    pub fn due(&self, frame: u64) -> impl Iterator<Item = T> + '_ {
        self.tasks
            .iter()
            .filter(move |t| frame % t.every_n == t.phase)
            .map(|t| t.task)
    }

    /// Names of the tasks that fire on `frame`.
    pub fn due_names(&self, frame: u64) -> Vec<&'static str> {
        self.tasks
            .iter()
            .filter(|t| frame % t.every_n == t.phase)
            .map(|t| t.name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
