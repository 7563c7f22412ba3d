use crate::{
    backends::BackendError,
    config::{ConfigErrors, EnvironmentConfig},
    jobs::JobGenerator,
};
use nix::sys::stat::{fchmodat, FchmodatFlags, Mode};
use rand::Rng;
use std::{
    borrow::Cow,
    env, fmt, fs, io,
    ops::RangeInclusive,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// canonical name of the environment wrapper inside the workarea
pub const WITHENV: &str = "with-env";
/// canonical name of the environment script inside the workarea
pub const GOODENV: &str = "env.sh";

const WORKAREA_RANGE: RangeInclusive<u32> = 0..=9999;

/// set the permission bits of `path`, following symlinks
pub(crate) fn chmod(path: &Path, mode: u32) -> io::Result<()> {
    fchmodat(
        None,
        path,
        Mode::from_bits_truncate(mode),
        FchmodatFlags::FollowSymlink,
    )
    .map_err(io::Error::from)
}

/// make `path` absolute against the current directory, expanding a leading `~/`
fn absolute(path: &Path) -> Result<PathBuf, ConfigErrors> {
    let expanded = match (path.strip_prefix("~"), env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    };

    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(env::current_dir()?.join(expanded))
    }
}

/// Random suffix separating default workareas of concurrently created backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkareaIdentity(u32);

impl WorkareaIdentity {
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen_range(WORKAREA_RANGE))
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkareaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wrapper + environment script pair every job command is run through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    wrapper: PathBuf,
    script: PathBuf,
}

impl Environment {
    pub fn new(wrapper: &Path, script: &Path) -> Result<Self, ConfigErrors> {
        Ok(Self {
            wrapper: absolute(wrapper)?,
            script: absolute(script)?,
        })
    }

    pub fn load(config: &EnvironmentConfig) -> Result<Self, ConfigErrors> {
        Self::new(&config.wrapper, &config.script)
    }

    pub fn wrapper(&self) -> &Path {
        &self.wrapper
    }

    pub fn script(&self) -> &Path {
        &self.script
    }
}

/// The directory holding every artifact of one batch.
///
/// Construction has no side effects, the directory is only touched by
/// [`Workarea::setup`] and the job generator.
#[derive(Debug, Clone)]
pub struct Workarea {
    path: PathBuf,
    overwrite: bool,
    environment: Option<Environment>,
    identity: WorkareaIdentity,
}

impl Workarea {
    /// `backend` names the default directory `workarea_<backend>-<id>` when no path is given
    pub fn new(
        backend: &str,
        path: Option<&Path>,
        overwrite: bool,
        environment: Option<Environment>,
    ) -> Result<Self, ConfigErrors> {
        let identity = WorkareaIdentity::generate();
        let path = match path {
            Some(path) => absolute(path)?,
            None => absolute(Path::new(&format!("workarea_{backend}-{identity}")))?,
        };

        Ok(Self {
            path,
            overwrite,
            environment,
            identity,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identity(&self) -> WorkareaIdentity {
        self.identity
    }

    pub fn environment(&self) -> Option<&Environment> {
        self.environment.as_ref()
    }

    /// path of a file named `name` inside the workarea
    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Create the workarea (or reuse it if overwriting is allowed) and stage the environment
    pub fn setup(&self) -> Result<(), BackendError> {
        if !self.path.exists() {
            info!("Creating workarea: {}", self.path.display());
            fs::create_dir_all(&self.path)?;
        } else if !self.overwrite {
            return Err(ConfigErrors::WorkareaExists(self.path.clone()).into());
        }

        info!("Setting up workarea: {}", self.path.display());
        // drwxrwxrwx
        chmod(&self.path, 0o777)?;

        if let Some(environment) = &self.environment {
            info!("Adding environment script: {}", environment.script.display());

            let withenv = self.join(WITHENV);
            fs::copy(&environment.wrapper, &withenv)?;
            chmod(&withenv, 0o755)?;
            fs::copy(&environment.script, self.join(GOODENV))?;

            debug!(wrapper = ?withenv, "Staged environment wrapper");
        }

        Ok(())
    }

    /// rewrite `command` to run inside the configured environment, if any
    pub fn wrap_command<'a>(&self, command: &'a str) -> Cow<'a, str> {
        match self.environment {
            Some(_) => Cow::Owned(format!("./{WITHENV} {GOODENV} {command}")),
            None => Cow::Borrowed(command),
        }
    }

    /// lazily write one job file per command, see [`JobGenerator`]
    pub fn create_jobs<I>(&self, commands: I) -> JobGenerator<'_, I::IntoIter>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        JobGenerator::new(self, commands.into_iter())
    }
}

#[cfg(test)]
#[path = "workarea_test.rs"]
mod workarea_test;
