use super::{Backend, BackendError};
use crate::{
    config::{ConfigErrors, SgeConfig, SubmitOptions, WaitOptions},
    jobs::{shell_quote, JobFile, JOB_PREFIX, JOB_SUFFIX},
    workarea::{chmod, Workarea},
};
use globset::{GlobBuilder, GlobMatcher};
use ignore::{DirEntry, WalkBuilder};
use itertools::{Either, Itertools};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader},
    iter,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::Duration,
};
use tracing::{debug, error, info, instrument, warn};

/// script run by the scheduler for every array task
pub const WORKER: &str = "worker.sh";
/// script invoking the array submission tool
pub const SUBMITTER: &str = "submit.sh";

static DEFAULT_JOB_ID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<jid>\d+)").expect("default job id pattern is valid")
});

/// Lifecycle of the batch tracked by an [`SgeBackend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Running(u64),
    /// a kill was issued, the scheduler may still list the job
    Stopped(u64),
    Finished,
}

/// bookkeeping of a single `wait` call
#[derive(Debug)]
struct PollState {
    tries: u32,
    sleeptime: Duration,
    job_id: u64,
}

/// Grid engine backend: array submission through `qsub`, polling through `qstat`
#[derive(Debug)]
pub struct SgeBackend {
    workarea: Workarea,
    job_id_regex: Regex,
    task_id_var: String,
    submit_command: String,
    status_command: String,
    kill_command: String,

    state: BatchState,
    // every job id ever obtained, in submission order
    job_ids: Vec<u64>,

    worker: PathBuf,
    submitter: PathBuf,
}

impl SgeBackend {
    /// backend with the stock grid engine tools
    pub fn new(workarea: Workarea) -> Self {
        let defaults = SgeConfig::default();

        Self::build(workarea, DEFAULT_JOB_ID_REGEX.clone(), &defaults)
    }

    pub fn load(workarea: Workarea, config: &SgeConfig) -> Result<Self, ConfigErrors> {
        let regex = Regex::new(&config.id_pattern)?;

        Ok(Self::build(workarea, regex, config))
    }

    fn build(workarea: Workarea, job_id_regex: Regex, config: &SgeConfig) -> Self {
        Self {
            worker: workarea.join(WORKER),
            submitter: workarea.join(SUBMITTER),
            workarea,
            job_id_regex,
            task_id_var: config.task_id_var.clone(),
            submit_command: config.submit_command.clone(),
            status_command: config.status_command.clone(),
            kill_command: config.kill_command.clone(),
            state: BatchState::Idle,
            job_ids: Vec::new(),
        }
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn job_ids(&self) -> &[u64] {
        &self.job_ids
    }

    /// job id that has not been observed finished yet
    pub fn running_job_id(&self) -> Option<u64> {
        match self.state {
            BatchState::Running(job_id) | BatchState::Stopped(job_id) => Some(job_id),
            BatchState::Idle | BatchState::Finished => None,
        }
    }

    pub fn worker(&self) -> &Path {
        &self.worker
    }

    pub fn submitter(&self) -> &Path {
        &self.submitter
    }

    /// ask the scheduler whether `job_id` is still known, `qstat -j` exits 0 while it is
    pub fn is_job_running(&self, job_id: u64) -> Result<bool, BackendError> {
        let status = Command::new(&self.status_command)
            .arg("-j")
            .arg(job_id.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;

        Ok(status.success())
    }

    fn worker_script(&self) -> String {
        format!(
            "#!/usr/bin/env bash\ncd {}\n./{JOB_PREFIX}${{{}}}{JOB_SUFFIX}\n",
            shell_quote(&self.workarea.path().to_string_lossy()),
            self.task_id_var
        )
    }

    fn submitter_script(&self, last: usize, options: &SubmitOptions) -> String {
        let range = format!("-t {}-{last}:{}", options.begin, options.step);
        let command = iter::once(shell_quote(&self.submit_command))
            .chain(options.extra_args.iter().cloned())
            .chain([range, WORKER.to_string()])
            .join(" ");

        format!("#!/usr/bin/env bash\n{command}\n")
    }

    /// write the worker and submitter scripts for `jobfiles`
    pub fn prepare_scripts(
        &self,
        jobfiles: &[JobFile],
        options: &SubmitOptions,
    ) -> Result<&Path, BackendError> {
        let last = options.last_index(jobfiles.len())?;

        info!("Writing worker: {}", self.worker.display());
        fs::write(&self.worker, self.worker_script())?;
        chmod(&self.worker, 0o755)?;

        info!("Writing submitter: {}", self.submitter.display());
        fs::write(
            &self.submitter,
            self.submitter_script(last, options),
        )?;
        chmod(&self.submitter, 0o755)?;

        Ok(&self.submitter)
    }

    /// extract the scheduler job id from the submission tool output
    pub fn parse_job_id(&self, output: &str) -> Result<u64, BackendError> {
        let matched = self.job_id_regex.captures(output).and_then(|captures| {
            captures
                .name("jid")
                .or_else(|| captures.get(1))
                .or_else(|| captures.get(0))
                .map(|capture| capture.as_str())
        });

        match matched.map(str::parse::<u64>) {
            Some(Ok(job_id)) => Ok(job_id),
            _ => Err(BackendError::Submission {
                output: output.to_string(),
            }),
        }
    }

    fn run_submitter(&self) -> Result<u64, BackendError> {
        let output = Command::new("bash")
            .arg(SUBMITTER)
            .current_dir(self.workarea.path())
            .output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(status = ?output.status, "Submission failed: {stderr}");

            return Err(BackendError::Submission {
                output: format!("{stdout}{stderr}"),
            });
        }

        debug!(output = %stdout, "Submission output");
        self.parse_job_id(&stdout)
    }

    /// matches `worker.sh.o<id>.<task>` and `worker.sh.e<id>.<task>` of exactly `job_id`
    fn result_matcher(job_id: u64) -> Result<GlobMatcher, ConfigErrors> {
        Ok(GlobBuilder::new(&format!("{WORKER}.[oe]{job_id}.*"))
            .literal_separator(true)
            .build()?
            .compile_matcher())
    }

    /// Lazily list the output files the scheduler wrote for every submission so far.
    ///
    /// Files are yielded per job id in submission order, within one job id in
    /// directory order. Fails while a job is still tracked as running.
    pub fn iglob_results(&self) -> Result<impl Iterator<Item = PathBuf>, BackendError> {
        if let Some(job_id) = self.running_job_id() {
            return Err(BackendError::StillRunning { job_id });
        }

        let matchers = self
            .job_ids
            .iter()
            .map(|&job_id| -> Result<_, ConfigErrors> {
                Ok((job_id, Self::result_matcher(job_id)?))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let root = self.workarea.path().to_path_buf();

        Ok(matchers
            .into_iter()
            .flat_map(move |(job_id, matcher)| {
                debug!("Globbing for: {}/{WORKER}.[oe]{job_id}.*", root.display());
                glob_files(&root, matcher)
            }))
    }

    /// every line of every result file, in file order
    pub fn result_lines(&self) -> Result<impl Iterator<Item = io::Result<String>>, BackendError> {
        Ok(self
            .iglob_results()?
            .flat_map(|path| match File::open(&path) {
                Ok(file) => Either::Left(BufReader::new(file).lines()),
                Err(error) => {
                    error!(path = ?path, "Failed to open result file: {error}");
                    Either::Right(iter::once(Err(error)))
                }
            }))
    }
}

fn glob_files(root: &Path, matcher: GlobMatcher) -> impl Iterator<Item = PathBuf> {
    WalkBuilder::new(root)
        .standard_filters(false)
        .max_depth(Some(1))
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!("Failed to scan workarea for results: {error}");
                None
            }
        })
        .filter(|entry| entry.depth() == 1 && entry.file_type().map_or(false, |kind| kind.is_file()))
        .filter(move |entry| matcher.is_match(entry.file_name()))
        .map(DirEntry::into_path)
}

impl Backend for SgeBackend {
    type JobId = u64;

    fn workarea(&self) -> &Workarea {
        &self.workarea
    }

    #[instrument(skip(self, jobfiles), fields(jobs = jobfiles.len()))]
    fn submit_jobs(
        &mut self,
        jobfiles: Vec<JobFile>,
        options: &SubmitOptions,
    ) -> Result<u64, BackendError> {
        if !options.retry {
            if jobfiles.is_empty() {
                return Err(BackendError::EmptyBatch);
            }
            self.prepare_scripts(&jobfiles, options)?;
        } else if !self.submitter.is_file() {
            return Err(BackendError::NotPrepared);
        }

        let job_id = self.run_submitter()?;
        info!(job_id = job_id, "Submitted SGE job");

        self.state = BatchState::Running(job_id);
        self.job_ids.push(job_id);

        Ok(job_id)
    }

    #[instrument(skip(self))]
    fn wait(&mut self, options: &WaitOptions) -> Result<(), BackendError> {
        let Some(job_id) = self.running_job_id() else {
            debug!("No SGE job tracked, nothing to wait for");
            return Ok(());
        };

        let mut poll = PollState {
            tries: 0,
            sleeptime: options.poll_interval.as_duration(),
            job_id,
        };

        info!(
            "Checking SGE job id: {} polling every {} for {} attempts",
            poll.job_id,
            options.poll_interval,
            options
                .max_tries
                .map_or_else(|| String::from("unlimited"), |tries| tries.to_string())
        );

        loop {
            let finished = !self.is_job_running(poll.job_id)?;
            info!("[{}] Is job finished?: {finished}", poll.tries);

            if finished {
                self.state = BatchState::Finished;
                return Ok(());
            }

            poll.tries += 1;
            if let Some(max_tries) = options.max_tries {
                if poll.tries >= max_tries {
                    return Err(BackendError::Timeout { max_tries });
                }
            }

            thread::sleep(poll.sleeptime);
        }
    }

    fn is_running(&self) -> Result<bool, BackendError> {
        match self.running_job_id() {
            Some(job_id) => self.is_job_running(job_id),
            None => Ok(false),
        }
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        let Some(job_id) = self.running_job_id() else {
            return Ok(());
        };

        if self.is_job_running(job_id)? {
            info!(job_id = job_id, "Killing SGE job");

            let status = Command::new(&self.kill_command)
                .arg(job_id.to_string())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()?;

            if !status.success() {
                warn!(job_id = job_id, status = ?status, "Kill command reported a failure");
            }

            self.state = BatchState::Stopped(job_id);
        }

        Ok(())
    }

    fn resubmit(&mut self) -> Result<u64, BackendError> {
        self.submit_jobs(Vec::new(), &SubmitOptions::retry())
    }
}

#[cfg(test)]
#[path = "sge_test.rs"]
mod sge_test;
