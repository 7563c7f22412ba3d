use super::{CompletedTask, MasterError, MasterStats, Task, TaskId, TaskMaster};
use crate::config::MasterConfig;
use std::{
    collections::VecDeque,
    fs::File,
    process::{Child, Command, Stdio},
    time::Duration,
};
use tracing::{debug, error, info, warn};
use wait_timeout::ChildExt;

#[derive(Debug)]
struct InFlight {
    id: TaskId,
    task: Task,
    child: Child,
}

/// In-process master with a single embedded worker.
///
/// Tasks are claimed first come first served, each one runs through the configured
/// shell while `wait` is blocked on it. A task outliving the timeout stays in flight
/// and is picked up again by the next `wait`.
#[derive(Debug)]
pub struct LocalMaster {
    config: MasterConfig,
    queue: VecDeque<(TaskId, Task)>,
    in_flight: Option<InFlight>,
    next_id: TaskId,
    completed: usize,
}

impl LocalMaster {
    pub fn new(config: MasterConfig) -> Self {
        info!(name = %config.name, shell = ?config.shell, "Starting local task master");

        Self {
            config,
            queue: VecDeque::new(),
            in_flight: None,
            next_id: 1,
            completed: 0,
        }
    }

    fn spawn(&self, task: &Task) -> Result<Child, MasterError> {
        let mut command = Command::new(&self.config.shell);
        command.arg("-c").arg(&task.command).stdin(Stdio::null());

        match &task.output {
            Some(path) => {
                let stdout = File::create(path)?;
                let stderr = stdout.try_clone()?;
                command.stdout(stdout).stderr(stderr);
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        command.spawn().map_err(|source| MasterError::Spawn {
            tag: task.tag.clone(),
            source,
        })
    }

    /// hand the next queued task to the worker if it is idle
    fn claim(&mut self) -> Result<(), MasterError> {
        if self.in_flight.is_some() {
            return Ok(());
        }

        if let Some((id, task)) = self.queue.pop_front() {
            debug!(id = id, tag = %task.tag, "Worker claimed task");
            let child = self.spawn(&task)?;
            self.in_flight = Some(InFlight { id, task, child });
        }

        Ok(())
    }
}

impl TaskMaster for LocalMaster {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn submit(&mut self, task: Task) -> Result<TaskId, MasterError> {
        let id = self.next_id;
        self.next_id += 1;

        debug!(id = id, tag = %task.tag, command = %task.command, "Queued task");
        self.queue.push_back((id, task));

        Ok(id)
    }

    fn wait(&mut self, timeout: Duration) -> Result<Option<CompletedTask>, MasterError> {
        self.claim()?;

        let Some(in_flight) = self.in_flight.as_mut() else {
            return Ok(None);
        };

        match in_flight.child.wait_timeout(timeout)? {
            Some(status) => {
                let id = in_flight.id;
                let tag = in_flight.task.tag.clone();
                self.in_flight = None;
                self.completed += 1;

                Ok(Some(CompletedTask {
                    id,
                    tag,
                    return_status: status.code().unwrap_or(-1),
                }))
            }
            None => Ok(None),
        }
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_none()
    }

    fn stats(&self) -> MasterStats {
        let busy = usize::from(self.in_flight.is_some());

        MasterStats {
            workers_init: 0,
            workers_ready: 1 - busy,
            workers_busy: busy,
            tasks_running: busy,
            tasks_waiting: self.queue.len(),
            tasks_complete: self.completed,
        }
    }

    fn cancel_all(&mut self) -> Result<Vec<Task>, MasterError> {
        let mut cancelled = Vec::with_capacity(self.queue.len() + 1);

        if let Some(mut in_flight) = self.in_flight.take() {
            warn!(id = in_flight.id, tag = %in_flight.task.tag, "Killing running task");
            in_flight.child.kill()?;
            in_flight.child.wait()?;
            cancelled.push(in_flight.task);
        }

        cancelled.extend(self.queue.drain(..).map(|(_, task)| task));

        Ok(cancelled)
    }
}

impl Drop for LocalMaster {
    fn drop(&mut self) {
        if let Some(in_flight) = self.in_flight.as_mut() {
            match in_flight.child.kill().and_then(|_| in_flight.child.wait()) {
                Ok(_) => debug!(tag = %in_flight.task.tag, "Killed task on shutdown"),
                Err(error) => error!(error = ?error, "Failed to kill task on shutdown"),
            }
        }
    }
}
