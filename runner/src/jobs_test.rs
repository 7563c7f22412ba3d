use super::*;
use crate::workarea::Environment;
use std::{fs, os::unix::fs::PermissionsExt, process::Command};
use tempfile::TempDir;

fn workarea(dir: &TempDir) -> Workarea {
    let workarea = Workarea::new("SGE", Some(&dir.path().join("wa1")), false, None).unwrap();
    workarea.setup().unwrap();
    workarea
}

fn run(jobfile: &JobFile) -> (bool, String) {
    let output = Command::new("bash")
        .arg(&jobfile.path)
        .current_dir(jobfile.path.parent().unwrap())
        .output()
        .unwrap();

    (
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).into_owned(),
    )
}

#[test]
fn one_job_file_per_command_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let workarea = workarea(&dir);

    let jobfiles = workarea
        .create_jobs(["echo a", "echo b", "echo c"])
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    assert_eq!(
        jobfiles.iter().map(|job| job.index).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    for (jobfile, command) in jobfiles.iter().zip(["echo a", "echo b", "echo c"]) {
        assert_eq!(jobfile.path, workarea.path().join(job_file_name(jobfile.index)));

        let content = fs::read_to_string(&jobfile.path).unwrap();
        assert!(content.starts_with("#!/usr/bin/env bash\n"));
        assert!(content.contains(&format!("myname='{}'", jobfile.path.display())));
        assert!(content.contains("if [ -f \"$done\" ]; then"));
        assert!(content.contains(&format!("\n{command}\n")));
        assert!(content.contains("touch \"$done\""));
        assert!(content.ends_with("exit $ecode\n\n"));

        let mode = fs::metadata(&jobfile.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}

#[test]
fn generation_is_lazy() {
    let dir = tempfile::tempdir().unwrap();
    let workarea = workarea(&dir);

    let mut jobs = workarea.create_jobs(vec!["echo a".to_string(), "echo b".to_string()]);
    let first = jobs.next().unwrap().unwrap();

    assert_eq!(first.file_name(), "job_1.sh");
    assert!(first.path.is_file());
    assert!(!workarea.join("job_2.sh").exists());
}

#[test]
fn successful_job_leaves_done_marker() {
    let dir = tempfile::tempdir().unwrap();
    let workarea = workarea(&dir);
    let jobfile = workarea.create_jobs(["echo a"]).next().unwrap().unwrap();

    let (success, stdout) = run(&jobfile);

    assert!(success);
    assert_eq!(stdout, "a\nDONE\n");
    assert!(jobfile.is_done());
    assert_eq!(
        jobfile.done_marker(),
        workarea.path().join("job_1.sh.done")
    );
}

#[test]
fn failed_job_leaves_no_marker() {
    let dir = tempfile::tempdir().unwrap();
    let workarea = workarea(&dir);
    let jobfile = workarea.create_jobs(["false"]).next().unwrap().unwrap();

    let (success, stdout) = run(&jobfile);

    assert!(!success);
    assert!(stdout.is_empty());
    assert!(!jobfile.is_done());
}

#[test]
fn done_job_is_not_run_again() {
    let dir = tempfile::tempdir().unwrap();
    let workarea = workarea(&dir);
    let jobfile = workarea
        .create_jobs(["touch payload-ran"])
        .next()
        .unwrap()
        .unwrap();
    fs::write(jobfile.done_marker(), "").unwrap();

    let (success, stdout) = run(&jobfile);

    assert!(success);
    assert!(stdout.contains("already successfully ran"));
    assert!(!workarea.join("payload-ran").exists());
}

#[test]
fn commands_run_inside_environment() {
    let scripts = tempfile::tempdir().unwrap();
    let wrapper = scripts.path().join("wrapper");
    let script = scripts.path().join("environment");
    fs::write(&wrapper, "#!/usr/bin/env bash\nsource \"./$1\"\nshift\nexec \"$@\"\n").unwrap();
    fs::write(&script, "export GREETING=hello\n").unwrap();

    let dir = tempfile::tempdir().unwrap();
    let workarea = Workarea::new(
        "SGE",
        Some(&dir.path().join("wa")),
        false,
        Some(Environment::new(&wrapper, &script).unwrap()),
    )
    .unwrap();
    workarea.setup().unwrap();

    let jobfile = workarea
        .create_jobs(["bash -c 'echo $GREETING'"])
        .next()
        .unwrap()
        .unwrap();
    let content = fs::read_to_string(&jobfile.path).unwrap();
    assert!(content.contains("\n./with-env env.sh bash -c 'echo $GREETING'\n"));

    let (success, stdout) = run(&jobfile);
    assert!(success);
    assert_eq!(stdout, "hello\nDONE\n");
}

#[test]
fn write_failures_propagate() {
    let dir = tempfile::tempdir().unwrap();
    // never set up, the directory does not exist
    let workarea = Workarea::new("SGE", Some(&dir.path().join("missing")), false, None).unwrap();

    assert!(workarea.create_jobs(["echo a"]).next().unwrap().is_err());
}

#[test]
fn quotes_paths_for_the_shell() {
    assert_eq!(shell_quote("/tmp/wa"), "'/tmp/wa'");
    assert_eq!(shell_quote("it's"), r"'it'\''s'");
}
