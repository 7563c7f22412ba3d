use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    fs,
    io::Error,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error};

// check if a path points to an existing file
pub fn check_file(path: &Path) -> Result<(), ConfigErrors> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Workarea {0} already exists")]
    WorkareaExists(PathBuf),
    #[error("Unknown time units: {0}")]
    UnknownTimeUnit(String),
    #[error("Invalid duration '{0}', expected <integer><s|m|h|d|w>")]
    InvalidDuration(String),
    #[error("Invalid job range: {0}")]
    InvalidRange(String),
    #[error("Job id pattern is invalid")]
    InvalidPattern(#[from] regex::Error),
    #[error("Result glob is invalid")]
    InvalidGlob(#[from] globset::Error),
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Failed to read configuration")]
    Io(#[from] Error),
    #[error("Failed to deserialize configuration")]
    Deserialize(#[from] serde_yaml::Error),
}

/// Parse `<integer><unit>` into seconds, where unit is one of s, m, h, d, w
pub fn parse_time_units(duration: &str) -> Result<u64, ConfigErrors> {
    let duration = duration.trim();
    let unit = duration
        .chars()
        .last()
        .ok_or_else(|| ConfigErrors::InvalidDuration(duration.to_string()))?;
    let magnitude = &duration[..duration.len() - unit.len_utf8()];

    let multiplier = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 60 * 60 * 24,
        'w' => 60 * 60 * 24 * 7,
        // a bare number has no unit at all, report it as such
        digit if digit.is_ascii_digit() => {
            return Err(ConfigErrors::InvalidDuration(duration.to_string()))
        }
        _ => return Err(ConfigErrors::UnknownTimeUnit(unit.to_string())),
    };

    let magnitude: u64 = magnitude
        .parse()
        .map_err(|_| ConfigErrors::InvalidDuration(duration.to_string()))?;

    magnitude
        .checked_mul(multiplier)
        .ok_or_else(|| ConfigErrors::InvalidDuration(duration.to_string()))
}

/// Interval between two status checks, written as `<integer><unit>`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PollInterval {
    raw: String,
    seconds: u64,
}

impl PollInterval {
    pub fn seconds(&self) -> u64 {
        self.seconds
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.seconds)
    }
}

impl Default for PollInterval {
    fn default() -> Self {
        Self {
            raw: String::from("1m"),
            seconds: 60,
        }
    }
}

impl FromStr for PollInterval {
    type Err = ConfigErrors;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            seconds: parse_time_units(value)?,
            raw: value.trim().to_string(),
        })
    }
}

impl TryFrom<String> for PollInterval {
    type Error = ConfigErrors;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PollInterval> for String {
    fn from(interval: PollInterval) -> Self {
        interval.raw
    }
}

impl Display for PollInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Options for a single `submit` call
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SubmitOptions {
    // first array index to submit, 1-based
    #[serde(default = "default_one")]
    pub begin: usize,
    // last array index to submit, defaults to the number of job files
    #[serde(default)]
    pub end: Option<usize>,
    #[serde(default = "default_one")]
    pub step: usize,
    // free-form arguments passed to the submission tool
    #[serde(default)]
    pub extra_args: Vec<String>,
    // reuse the previously written worker/submitter scripts
    #[serde(default)]
    pub retry: bool,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            begin: 1,
            end: None,
            step: 1,
            extra_args: Vec::new(),
            retry: false,
        }
    }
}

impl SubmitOptions {
    pub fn retry() -> Self {
        Self {
            retry: true,
            ..Self::default()
        }
    }

    /// reject ranges no submission can use, indices are 1-based
    pub fn validate(&self) -> Result<(), ConfigErrors> {
        if self.begin == 0 {
            return Err(ConfigErrors::InvalidRange(String::from(
                "begin must be at least 1",
            )));
        }
        if self.step == 0 {
            return Err(ConfigErrors::InvalidRange(String::from(
                "step must be at least 1",
            )));
        }

        Ok(())
    }

    /// Last index selected out of `jobs` job files, `end` is capped at `jobs`
    pub fn last_index(&self, jobs: usize) -> Result<usize, ConfigErrors> {
        self.validate()?;

        let last = self.end.map_or(jobs, |end| end.min(jobs));
        if self.begin > last {
            return Err(ConfigErrors::InvalidRange(format!(
                "begin {} is past the last job {last}",
                self.begin
            )));
        }

        Ok(last)
    }

    /// true if the job with the given index lies in `begin..=last` on a `step` boundary
    pub fn selects(&self, index: usize, last: usize) -> bool {
        index >= self.begin && index <= last && (index - self.begin) % self.step.max(1) == 0
    }
}

/// Options for a single `wait` call
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WaitOptions {
    #[serde(default)]
    pub poll_interval: PollInterval,
    // absent means wait forever
    #[serde(default)]
    pub max_tries: Option<u32>,
}

impl WaitOptions {
    pub fn new(poll_interval: &str, max_tries: Option<u32>) -> Result<Self, ConfigErrors> {
        Ok(Self {
            poll_interval: poll_interval.parse()?,
            max_tries,
        })
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    // wrapper executed as `<wrapper> <script> <command>`
    pub wrapper: PathBuf,
    pub script: PathBuf,
}

/// Grid engine tooling, see `backends::sge`
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SgeConfig {
    #[serde(default = "default_id_pattern")]
    pub id_pattern: String,
    #[serde(default = "default_task_id_var")]
    pub task_id_var: String,
    #[serde(default = "default_submit_command")]
    pub submit_command: String,
    #[serde(default = "default_status_command")]
    pub status_command: String,
    #[serde(default = "default_kill_command")]
    pub kill_command: String,
}

impl Default for SgeConfig {
    fn default() -> Self {
        Self {
            id_pattern: default_id_pattern(),
            task_id_var: default_task_id_var(),
            submit_command: default_submit_command(),
            status_command: default_status_command(),
            kill_command: default_kill_command(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MasterConfig {
    #[serde(default = "default_master_name")]
    pub name: String,
    // shell used to run task commands
    #[serde(default = "default_shell")]
    pub shell: PathBuf,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            name: default_master_name(),
            shell: default_shell(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sge,
    WorkQueue,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sge => "SGE",
            Self::WorkQueue => "SGEWorkQueue",
        }
    }
}

/// Top level configuration as read by the command line entry point
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    // selected backend, see Backends::load
    pub backend: BackendKind,
    // defaults to $PWD/workarea_<backend>-<random id>
    #[serde(default)]
    pub workarea: Option<PathBuf>,
    #[serde(default, alias = "overwrite_workarea")]
    pub overwrite: bool,
    #[serde(default)]
    pub environment: Option<EnvironmentConfig>,

    #[serde(default)]
    pub sge: SgeConfig,
    #[serde(default, alias = "workqueue")]
    pub master: MasterConfig,

    #[serde(default)]
    pub submit: SubmitOptions,
    #[serde(default)]
    pub wait: WaitOptions,
}

impl BatchConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        check_file(path)?;
        debug!(path = ?path, "Loading batch configuration");

        let content = fs::read_to_string(path)?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigErrors> {
        match serde_yaml::from_str::<Self>(content) {
            Ok(config) => {
                config.submit.validate()?;
                Ok(config)
            }
            Err(error) => {
                error!(error = ?error, "Failed to deserialize batch configuration: {error}");

                Err(ConfigErrors::Deserialize(error))
            }
        }
    }
}

fn default_one() -> usize {
    1
}

fn default_id_pattern() -> String {
    String::from(r"(?P<jid>\d+)")
}

fn default_task_id_var() -> String {
    String::from("SGE_TASK_ID")
}

fn default_submit_command() -> String {
    String::from("qsub")
}

fn default_status_command() -> String {
    String::from("qstat")
}

fn default_kill_command() -> String {
    String::from("qdel")
}

fn default_master_name() -> String {
    String::from("bs.sge.wq")
}

fn default_shell() -> PathBuf {
    PathBuf::from("/bin/sh")
}
