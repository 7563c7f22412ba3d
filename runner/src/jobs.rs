use crate::workarea::{chmod, Workarea};
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    iter::Enumerate,
    path::{Path, PathBuf},
};
use tracing::debug;

pub const JOB_PREFIX: &str = "job_";
pub const JOB_SUFFIX: &str = ".sh";
pub const DONE_SUFFIX: &str = ".done";

/// deterministic file name of the job with the given 1-based index
pub fn job_file_name(index: usize) -> String {
    format!("{JOB_PREFIX}{index}{JOB_SUFFIX}")
}

/// quote `value` for a POSIX shell
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFile {
    pub index: usize,
    pub path: PathBuf,
}

impl JobFile {
    pub fn file_name(&self) -> String {
        job_file_name(self.index)
    }

    /// marker created once the job finished successfully
    pub fn done_marker(&self) -> PathBuf {
        let mut marker = self.path.clone().into_os_string();
        marker.push(DONE_SUFFIX);

        PathBuf::from(marker)
    }

    pub fn is_done(&self) -> bool {
        self.done_marker().is_file()
    }
}

/// Shell text written before the command: skip the job if it already succeeded
pub fn job_preamble(jobfile: &Path) -> String {
    format!(
        r#"#!/usr/bin/env bash

myname={}
done=$myname{DONE_SUFFIX}

if [ -f "$done" ]; then
    echo "$myname already successfully ran"
    exit 0
fi
"#,
        shell_quote(&jobfile.to_string_lossy())
    )
}

/// Shell text written after the command: mark the job done on success only and
/// exit with the status of the command
pub fn job_conclusion() -> &'static str {
    r#"ecode=$?

if [ $ecode -eq 0 ]; then
    echo DONE
    touch "$done"
fi

exit $ecode
"#
}

/// Lazy job file writer, every call to `next` writes exactly one executable job file.
///
/// A failed write ends the batch, callers must not submit a partially generated batch.
#[derive(Debug)]
pub struct JobGenerator<'a, I> {
    workarea: &'a Workarea,
    commands: Enumerate<I>,
}

impl<'a, I> JobGenerator<'a, I>
where
    I: Iterator,
    I::Item: AsRef<str>,
{
    pub fn new(workarea: &'a Workarea, commands: I) -> Self {
        Self {
            workarea,
            commands: commands.enumerate(),
        }
    }

    fn write_job(&self, index: usize, command: &str) -> io::Result<JobFile> {
        let path = self.workarea.join(&job_file_name(index));
        let command = self.workarea.wrap_command(command);

        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "{}", job_preamble(&path))?;
        writeln!(writer, "{command}")?;
        writeln!(writer, "{}", job_conclusion())?;
        writer.flush()?;
        drop(writer);

        // -rwxr-xr-x
        chmod(&path, 0o755)?;
        debug!(index = index, path = ?path, "Wrote job file");

        Ok(JobFile { index, path })
    }
}

impl<I> Iterator for JobGenerator<'_, I>
where
    I: Iterator,
    I::Item: AsRef<str>,
{
    type Item = io::Result<JobFile>;

    fn next(&mut self) -> Option<Self::Item> {
        let (position, command) = self.commands.next()?;

        Some(self.write_job(position + 1, command.as_ref()))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.commands.size_hint()
    }
}

#[cfg(test)]
#[path = "jobs_test.rs"]
mod jobs_test;
