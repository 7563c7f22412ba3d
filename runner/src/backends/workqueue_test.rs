use super::*;
use crate::{
    config::{ConfigErrors, MasterConfig},
    distributed::local::LocalMaster,
};
use std::{fs, path::Path};
use tempfile::TempDir;

fn backend(dir: &TempDir) -> WorkQueueBackend<LocalMaster> {
    let workarea = Workarea::new("SGEWorkQueue", Some(&dir.path().join("wa")), false, None).unwrap();

    WorkQueueBackend::new(workarea, LocalMaster::new(MasterConfig::default()))
}

fn wait_options(poll_interval: &str, max_tries: Option<u32>) -> WaitOptions {
    WaitOptions::new(poll_interval, max_tries).unwrap()
}

fn output(workarea: &Path, job: usize) -> String {
    fs::read_to_string(workarea.join(format!("job_{job}.sh.out"))).unwrap()
}

#[test]
fn runs_every_job_as_a_task() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = backend(&dir);

    backend
        .submit(["echo a", "echo b"], &SubmitOptions::default())
        .unwrap();
    assert!(backend.is_running().unwrap());
    assert_eq!(backend.master().stats().tasks_waiting, 2);

    backend.wait(&wait_options("1s", None)).unwrap();

    let workarea = backend.workarea().path().to_path_buf();
    assert!(!backend.is_running().unwrap());
    assert!(backend.succeeded());
    assert_eq!(backend.master().stats().tasks_complete, 2);
    assert_eq!(output(&workarea, 1), "a\nDONE\n");
    assert_eq!(output(&workarea, 2), "b\nDONE\n");
    assert!(workarea.join("job_1.sh.done").is_file());
    assert!(workarea.join("job_2.sh.done").is_file());
}

#[test]
fn one_failure_fails_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = backend(&dir);

    backend
        .submit(["true", "exit 4", "true"], &SubmitOptions::default())
        .unwrap();
    backend.wait(&wait_options("1s", None)).unwrap();

    let workarea = backend.workarea().path();
    assert!(!backend.succeeded());
    assert!(workarea.join("job_1.sh.done").is_file());
    assert!(!workarea.join("job_2.sh.done").exists());
    assert!(workarea.join("job_3.sh.done").is_file());
}

#[test]
fn resubmit_skips_finished_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = backend(&dir);

    backend
        .submit(["echo a", "test -f ready"], &SubmitOptions::default())
        .unwrap();
    backend.wait(&wait_options("1s", None)).unwrap();
    assert!(!backend.succeeded());

    let workarea = backend.workarea().path().to_path_buf();
    fs::write(workarea.join("ready"), "").unwrap();
    backend.resubmit().unwrap();
    backend.wait(&wait_options("1s", None)).unwrap();

    assert!(backend.succeeded());
    assert!(output(&workarea, 1).contains("already successfully ran"));
    assert!(workarea.join("job_2.sh.done").is_file());
}

#[test]
fn resubmit_needs_a_prepared_batch() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = backend(&dir);

    assert!(matches!(backend.resubmit(), Err(BackendError::NotPrepared)));
}

#[test]
fn submits_only_the_selected_range() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = backend(&dir);
    let options = SubmitOptions {
        begin: 2,
        ..SubmitOptions::default()
    };

    backend
        .submit(["echo a", "echo b", "echo c"], &options)
        .unwrap();
    backend.wait(&wait_options("1s", None)).unwrap();

    let workarea = backend.workarea().path();
    assert_eq!(backend.master().stats().tasks_complete, 2);
    assert!(!workarea.join("job_1.sh.done").exists());
    assert!(workarea.join("job_2.sh.done").is_file());
    assert!(workarea.join("job_3.sh.done").is_file());
}

#[test]
fn wait_times_out_and_stop_cancels() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = backend(&dir);

    backend
        .submit(["sleep 30", "echo never"], &SubmitOptions::default())
        .unwrap();

    match backend.wait(&wait_options("0s", Some(3))) {
        Err(BackendError::Timeout { max_tries }) => assert_eq!(max_tries, 3),
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(backend.is_running().unwrap());

    backend.stop().unwrap();

    assert!(!backend.is_running().unwrap());
    assert!(!backend.workarea().join("job_2.sh.out").exists());
    // stopping twice is harmless
    backend.stop().unwrap();
}

#[test]
fn create_task_runs_from_the_workarea() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend(&dir);
    let jobfile = JobFile {
        index: 7,
        path: backend.workarea().join("job_7.sh"),
    };

    let task = backend.create_task(&jobfile);

    assert_eq!(task.tag, "job_7.sh");
    assert_eq!(
        task.command,
        format!("cd '{}';./job_7.sh", backend.workarea().path().display())
    );
    assert_eq!(task.output, Some(backend.workarea().join("job_7.sh.out")));
}

#[test]
fn failing_command_fails_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = backend(&dir);

    backend.submit(["false"], &SubmitOptions::default()).unwrap();
    backend.wait(&wait_options("1s", None)).unwrap();

    let workarea = backend.workarea().path();
    assert!(!backend.succeeded());
    assert!(!workarea.join("job_1.sh.done").exists());
}

#[test]
fn completed_tasks_do_not_spend_tries() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = backend(&dir);

    backend
        .submit(["true", "true", "true", "true", "true"], &SubmitOptions::default())
        .unwrap();
    backend.wait(&wait_options("1m", Some(3))).unwrap();

    assert!(backend.succeeded());
    assert!(!backend.is_running().unwrap());
    assert_eq!(backend.master().stats().tasks_complete, 5);
}

#[test]
fn range_end_is_capped_at_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = backend(&dir);
    let options = SubmitOptions {
        end: Some(4_000_000_000),
        ..SubmitOptions::default()
    };

    backend
        .submit(["echo a", "echo b", "echo c"], &options)
        .unwrap();
    backend.wait(&wait_options("1s", None)).unwrap();

    assert_eq!(backend.master().stats().tasks_complete, 3);
}

#[test]
fn unusable_ranges_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = backend(&dir);
    let options = SubmitOptions {
        step: 0,
        ..SubmitOptions::default()
    };

    assert!(matches!(
        backend.submit(["echo a"], &options),
        Err(BackendError::Config(ConfigErrors::InvalidRange(_)))
    ));
    assert!(!backend.is_running().unwrap());
}
