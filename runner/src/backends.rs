pub mod sge;
pub mod workqueue;

use crate::{
    config::{BackendKind, BatchConfig, ConfigErrors, SubmitOptions, WaitOptions},
    distributed::{local::LocalMaster, MasterError},
    jobs::JobFile,
    workarea::{Environment, Workarea},
};
use std::{io, path::Path};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigErrors),
    #[error("I/O failure")]
    Io(#[from] io::Error),
    #[error("Cannot find job id in: {output}")]
    Submission { output: String },
    #[error("Timeout: exceeded max tries: {max_tries}")]
    Timeout { max_tries: u32 },
    #[error("Job {job_id} is still running, results are not available yet")]
    StillRunning { job_id: u64 },
    #[error("Refusing to submit an empty batch")]
    EmptyBatch,
    #[error("Nothing to resubmit, no jobs were prepared")]
    NotPrepared,
    #[error("Task master failed")]
    Master(#[from] MasterError),
}

/// Contract every execution backend implements.
///
/// `submit` is the usual entry point, it runs `setup`, writes the job files and
/// hands them to `submit_jobs`.
pub trait Backend {
    /// external handle of one submission
    type JobId;

    fn workarea(&self) -> &Workarea;

    /// prepare the workarea, always the first step of a submission
    fn setup(&self) -> Result<(), BackendError> {
        self.workarea().setup()
    }

    /// hand already generated job files to the execution substrate
    fn submit_jobs(
        &mut self,
        jobfiles: Vec<JobFile>,
        options: &SubmitOptions,
    ) -> Result<Self::JobId, BackendError>;

    fn submit<I>(&mut self, commands: I, options: &SubmitOptions) -> Result<Self::JobId, BackendError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        Self: Sized,
    {
        self.setup()?;

        let mut jobfiles = Vec::new();
        for jobfile in self.workarea().create_jobs(commands) {
            let jobfile = jobfile?;
            info!("Creating job: {}", jobfile.path.display());
            jobfiles.push(jobfile);
        }

        self.submit_jobs(jobfiles, options)
    }

    /// block until the submitted work finished or `max_tries` checks were spent
    fn wait(&mut self, options: &WaitOptions) -> Result<(), BackendError>;

    fn is_running(&self) -> Result<bool, BackendError>;

    /// cancel outstanding work, a no-op when nothing runs
    fn stop(&mut self) -> Result<(), BackendError>;

    /// run the previously generated job files again
    fn resubmit(&mut self) -> Result<Self::JobId, BackendError>;
}

/// All available backends, selected by `BatchConfig::backend`
#[derive(Debug)]
pub enum Backends {
    Sge(sge::SgeBackend),
    WorkQueue(workqueue::WorkQueueBackend<LocalMaster>),
}

impl Backends {
    pub fn load(config: &BatchConfig) -> Result<Self, ConfigErrors> {
        let environment = config
            .environment
            .as_ref()
            .map(Environment::load)
            .transpose()?;
        let workarea = Workarea::new(
            config.backend.name(),
            config.workarea.as_deref(),
            config.overwrite,
            environment,
        )?;

        match config.backend {
            BackendKind::Sge => Ok(Self::Sge(sge::SgeBackend::load(workarea, &config.sge)?)),
            BackendKind::WorkQueue => Ok(Self::WorkQueue(workqueue::WorkQueueBackend::new(
                workarea,
                LocalMaster::new(config.master.clone()),
            ))),
        }
    }

    pub fn workarea(&self) -> &Path {
        match self {
            Self::Sge(backend) => backend.workarea().path(),
            Self::WorkQueue(backend) => backend.workarea().path(),
        }
    }

    /// submit `commands`, returns the scheduler job id if the backend has one
    pub fn submit<I>(&mut self, commands: I, options: &SubmitOptions) -> Result<Option<u64>, BackendError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        match self {
            Self::Sge(backend) => backend.submit(commands, options).map(Some),
            Self::WorkQueue(backend) => backend.submit(commands, options).map(|_| None),
        }
    }

    pub fn wait(&mut self, options: &WaitOptions) -> Result<(), BackendError> {
        match self {
            Self::Sge(backend) => backend.wait(options),
            Self::WorkQueue(backend) => backend.wait(options),
        }
    }

    pub fn is_running(&self) -> Result<bool, BackendError> {
        match self {
            Self::Sge(backend) => backend.is_running(),
            Self::WorkQueue(backend) => backend.is_running(),
        }
    }

    pub fn stop(&mut self) -> Result<(), BackendError> {
        match self {
            Self::Sge(backend) => backend.stop(),
            Self::WorkQueue(backend) => backend.stop(),
        }
    }

    pub fn resubmit(&mut self) -> Result<Option<u64>, BackendError> {
        match self {
            Self::Sge(backend) => backend.resubmit().map(Some),
            Self::WorkQueue(backend) => backend.resubmit().map(|_| None),
        }
    }
}
