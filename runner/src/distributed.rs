pub mod local;

/*
 * Pull based execution: instead of handing the whole batch to a scheduler, every
 * job file becomes a task on a master. Workers pull tasks from the master, the
 * submitting side only sees the master's queue draining.
 *
 * The master is a capability, `LocalMaster` runs the tasks itself, remote masters
 * only have to implement `TaskMaster`.
 */

use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;

pub type TaskId = u64;

#[derive(Error, Debug)]
pub enum MasterError {
    #[error("Failed to start task {tag}")]
    Spawn {
        tag: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to wait for a task")]
    Io(#[from] io::Error),
}

/// A single command handed to a master
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub command: String,
    // human readable handle, reported back on completion
    pub tag: String,
    // file receiving stdout and stderr of the command
    pub output: Option<PathBuf>,
}

impl Task {
    pub fn new(command: impl Into<String>) -> Self {
        let command = command.into();

        Self {
            tag: command.clone(),
            command,
            output: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_output(mut self, output: PathBuf) -> Self {
        self.output = Some(output);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTask {
    pub id: TaskId,
    pub tag: String,
    // exit code, -1 if the task was killed by a signal
    pub return_status: i32,
}

/// Worker and task counters as reported by a master
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MasterStats {
    pub workers_init: usize,
    pub workers_ready: usize,
    pub workers_busy: usize,
    pub tasks_running: usize,
    pub tasks_waiting: usize,
    pub tasks_complete: usize,
}

pub trait TaskMaster {
    fn name(&self) -> &str;

    /// enqueue a task, it runs once a worker claims it
    fn submit(&mut self, task: Task) -> Result<TaskId, MasterError>;

    /// Wait at most `timeout` for the next task to complete.
    ///
    /// `Ok(None)` means nothing completed in time, unfinished tasks stay queued.
    fn wait(&mut self, timeout: Duration) -> Result<Option<CompletedTask>, MasterError>;

    /// true once no task is queued or in flight
    fn is_empty(&self) -> bool;

    fn stats(&self) -> MasterStats;

    /// withdraw every queued task and abort the ones in flight
    fn cancel_all(&mut self) -> Result<Vec<Task>, MasterError>;
}
