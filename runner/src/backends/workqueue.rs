use super::{Backend, BackendError};
use crate::{
    config::{SubmitOptions, WaitOptions},
    distributed::{Task, TaskMaster},
    jobs::{shell_quote, JobFile},
    workarea::Workarea,
};
use tracing::{debug, info, instrument};

/// Generates the same job files as the SGE backend, but runs them as tasks on a
/// [`TaskMaster`] so that any number of workers can pull them.
#[derive(Debug)]
pub struct WorkQueueBackend<M> {
    workarea: Workarea,
    master: M,
    // job files of the last submission, reused by `resubmit`
    jobfiles: Vec<JobFile>,
    // submit options of the last submission
    options: SubmitOptions,
    success: bool,
}

impl<M: TaskMaster> WorkQueueBackend<M> {
    pub fn new(workarea: Workarea, master: M) -> Self {
        Self {
            workarea,
            master,
            jobfiles: Vec::new(),
            options: SubmitOptions::default(),
            success: true,
        }
    }

    pub fn master(&self) -> &M {
        &self.master
    }

    /// true if every task completed so far exited with status 0
    pub fn succeeded(&self) -> bool {
        self.success
    }

    /// task running `jobfile` from inside the workarea
    pub fn create_task(&self, jobfile: &JobFile) -> Task {
        let job = jobfile.file_name();
        let command = format!(
            "cd {};./{job}",
            shell_quote(&self.workarea.path().to_string_lossy())
        );

        info!("Task Command: {command}");

        Task::new(command)
            .with_output(self.workarea.join(&format!("{job}.out")))
            .with_tag(job)
    }

    fn enqueue(&mut self) -> Result<(), BackendError> {
        let last = self.options.last_index(self.jobfiles.len())?;
        let tasks = self
            .jobfiles
            .iter()
            .filter(|jobfile| self.options.selects(jobfile.index, last))
            .map(|jobfile| self.create_task(jobfile))
            .collect::<Vec<_>>();

        for task in tasks {
            info!("Submitting {}", task.tag);
            self.master.submit(task)?;
        }

        Ok(())
    }
}

impl<M: TaskMaster> Backend for WorkQueueBackend<M> {
    type JobId = ();

    fn workarea(&self) -> &Workarea {
        &self.workarea
    }

    #[instrument(skip(self, jobfiles), fields(jobs = jobfiles.len(), master = self.master.name()))]
    fn submit_jobs(
        &mut self,
        jobfiles: Vec<JobFile>,
        options: &SubmitOptions,
    ) -> Result<(), BackendError> {
        if !options.retry {
            if jobfiles.is_empty() {
                return Err(BackendError::EmptyBatch);
            }
            options.last_index(jobfiles.len())?;

            self.jobfiles = jobfiles;
            self.options = options.clone();
        } else if self.jobfiles.is_empty() {
            return Err(BackendError::NotPrepared);
        }

        self.success = true;
        self.enqueue()
    }

    #[instrument(skip(self))]
    fn wait(&mut self, options: &WaitOptions) -> Result<(), BackendError> {
        let sleeptime = options.poll_interval.as_duration();
        let mut tries = 0;

        while !self.master.is_empty() {
            let task = self.master.wait(sleeptime)?;

            let stats = self.master.stats();
            debug!(
                init = stats.workers_init,
                ready = stats.workers_ready,
                busy = stats.workers_busy,
                running = stats.tasks_running,
                waiting = stats.tasks_waiting,
                complete = stats.tasks_complete,
                "Task master statistics"
            );

            // only a full interval without progress counts as a try
            match task {
                Some(task) => {
                    info!("Job {} finished with {}", task.tag, task.return_status);
                    self.success = self.success && task.return_status == 0;
                    continue;
                }
                None => tries += 1,
            }

            if let Some(max_tries) = options.max_tries {
                if tries >= max_tries && !self.master.is_empty() {
                    return Err(BackendError::Timeout { max_tries });
                }
            }
        }

        Ok(())
    }

    fn is_running(&self) -> Result<bool, BackendError> {
        Ok(!self.master.is_empty())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        if self.master.is_empty() {
            return Ok(());
        }

        let cancelled = self.master.cancel_all()?;
        info!("Cancelled {} tasks", cancelled.len());

        Ok(())
    }

    fn resubmit(&mut self) -> Result<(), BackendError> {
        self.submit_jobs(Vec::new(), &SubmitOptions::retry())
    }
}

#[cfg(test)]
#[path = "workqueue_test.rs"]
mod workqueue_test;
