// Run a shell command that produces data for `add --command`, with a wall-clock limit.

use anyhow::{bail, Result};
use std::io;
use std::time::Duration;
use subprocess::{Exec, ExitStatus, Redirection};

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Run `command` under `sh -c` and return its stdout.  It is an error for the command to time out,
/// to write to stderr, or to exit with a nonzero status.

pub fn run_with_timeout(command: &str, timeout_seconds: u64) -> Result<String> {
    tracing::debug!("Running `{command}` with a limit of {timeout_seconds}s");
    let mut p = Exec::shell(command)
        .stdout(Redirection::Pipe)
        .stderr(Redirection::Pipe)
        .popen()?;

    // The pipes must be drained while we wait for the child, or a child with a lot of output will
    // block on a full pipe and never exit.  Reading with a time limit does both.
    let mut comm = p
        .communicate_start(None)
        .limit_time(Duration::new(timeout_seconds, 0));
    let mut output = String::new();
    let failure = loop {
        match comm.read_string() {
            Ok((Some(stdout), Some(stderr))) => {
                if !stderr.is_empty() {
                    break Some(format!("Command wrote to stderr: {}", stderr.trim_end()));
                }
                if stdout.is_empty() {
                    break None;
                }
                output += &stdout;
            }
            Ok(_) => break Some("Command output could not be read".to_string()),
            Err(e) => {
                if e.error.kind() == io::ErrorKind::TimedOut {
                    if let Err(e) = p.terminate() {
                        tracing::warn!("Could not terminate `{command}`: {e}");
                    }
                    break Some(format!("Command timed out after {timeout_seconds}s"));
                }
                break Some(format!("Command failed: {}", e.error));
            }
        }
    };

    let status = p.wait()?;
    if let Some(msg) = failure {
        bail!("{msg}");
    }
    match status {
        ExitStatus::Exited(0) => Ok(output),
        s => bail!("Command exited with status {s:?}"),
    }
}

#[test]
fn test_run_with_timeout() {
    assert_eq!(run_with_timeout("echo hi", 5).unwrap(), "hi\n");
    let e = run_with_timeout("sleep 5", 1).err().unwrap();
    assert!(e.to_string().contains("timed out"));
    assert!(run_with_timeout("exit 3", 5).is_err());
    assert!(run_with_timeout("echo oops 1>&2", 5).is_err());
}
