use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Errors from spawning or supervising a command-run process
/// (SPEC_FULL.md §4.D, §7).
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn process: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("process exceeded its deadline after {0:?}")]
    Timeout(Duration),
}

/// Which stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One line of output observed from a running process, handed to the
/// log streamer as it arrives.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub content: String,
}

pub type LineCallback = dyn Fn(OutputLine) + Send + Sync;

/// Outcome of a completed supervised process run.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit_code: Option<i32>,
    pub interrupted: bool,
}

/// Cooperative cancellation flag shared between the supervisor loop and
/// whoever calls `pause_task`/`delete_task` on the coordinator.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self { flag: Arc::new(AtomicBool::new(false)) }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// How long to wait after SIGTERM before escalating to a hard kill.
const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Runs a single shell command to completion under cooperative cancellation
/// and an optional wall-clock deadline, generalizing the reference's
/// `AgentProcess`/`wait_with_capture` from a fixed CLI invocation to an
/// arbitrary shell string (SPEC_FULL.md §4.D: commands are user-configured
/// shell strings, not a fixed binary + args).
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Run `command` via the platform shell in `cwd` with the given
    /// environment variables, polling for completion, cancellation, and an
    /// optional deadline. `on_line` is invoked from a background reader
    /// thread for every line read off stdout/stderr.
    pub fn run(
        command: &str,
        cwd: &std::path::Path,
        env: &[(String, String)],
        cancel: &CancelToken,
        deadline: Option<Duration>,
        on_line: Option<Arc<LineCallback>>,
    ) -> Result<ProcessOutcome, ProcessError> {
        Self::run_with_shell(command, Self::default_shell(), Self::default_shell_arg(), cwd, env, cancel, deadline, on_line)
    }

    /// Same as `run`, but spawns via the operator-configured shell
    /// (`runner.shell`/`runner.shell_arg` in the config document) instead of
    /// the hardcoded platform default.
    #[allow(clippy::too_many_arguments)]
    pub fn run_with_shell(
        command: &str,
        shell: &str,
        shell_arg: &str,
        cwd: &std::path::Path,
        env: &[(String, String)],
        cancel: &CancelToken,
        deadline: Option<Duration>,
        on_line: Option<Arc<LineCallback>>,
    ) -> Result<ProcessOutcome, ProcessError> {
        let mut cmd = Command::new(shell);
        cmd.arg(shell_arg).arg(command);
        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_cb = on_line.clone();
        let stdout_handle = stdout.map(|out| {
            thread::spawn(move || read_lines(out, StreamKind::Stdout, stdout_cb))
        });

        let stderr_cb = on_line;
        let stderr_handle = stderr.map(|err| {
            thread::spawn(move || read_lines(err, StreamKind::Stderr, stderr_cb))
        });

        let started = Instant::now();
        let deadline_at = deadline.map(|d| started + d);

        loop {
            if cancel.is_cancelled() {
                terminate(&mut child, pid);
                join_readers(stdout_handle, stderr_handle);
                return Ok(ProcessOutcome { exit_code: None, interrupted: true });
            }

            if let Some(deadline_at) = deadline_at {
                if Instant::now() >= deadline_at {
                    terminate(&mut child, pid);
                    join_readers(stdout_handle, stderr_handle);
                    return Err(ProcessError::Timeout(deadline.unwrap()));
                }
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    join_readers(stdout_handle, stderr_handle);
                    return Ok(ProcessOutcome { exit_code: status.code(), interrupted: false });
                }
                Ok(None) => thread::sleep(Duration::from_millis(100)),
                Err(e) => return Err(ProcessError::SpawnFailed(e)),
            }
        }
    }

    #[cfg(unix)]
    fn default_shell() -> &'static str {
        "/bin/bash"
    }

    #[cfg(unix)]
    fn default_shell_arg() -> &'static str {
        "-lc"
    }

    #[cfg(windows)]
    fn default_shell() -> &'static str {
        "cmd.exe"
    }

    #[cfg(windows)]
    fn default_shell_arg() -> &'static str {
        "/C"
    }
}

fn join_readers(
    stdout_handle: Option<thread::JoinHandle<()>>,
    stderr_handle: Option<thread::JoinHandle<()>>,
) {
    if let Some(h) = stdout_handle {
        let _ = h.join();
    }
    if let Some(h) = stderr_handle {
        let _ = h.join();
    }
}

/// Ask the process to exit gracefully, escalating to a hard kill if it
/// hasn't within `GRACE_PERIOD`. On non-Unix platforms there is no signal to
/// send so this always hard-kills immediately.
fn terminate(child: &mut Child, pid: u32) {
    #[cfg(unix)]
    {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        let deadline = Instant::now() + GRACE_PERIOD;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => thread::sleep(Duration::from_millis(100)),
                Err(_) => break,
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn read_lines<R: std::io::Read>(reader: R, stream: StreamKind, on_line: Option<Arc<LineCallback>>) {
    let reader = BufReader::new(reader);
    for line in reader.lines() {
        match line {
            Ok(content) => {
                if let Some(cb) = &on_line {
                    cb(OutputLine { stream, content });
                }
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn run_captures_stdout_lines() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let lines_clone = lines.clone();
        let cancel = CancelToken::new();

        let outcome = ProcessSupervisor::run(
            "echo hello && echo world",
            &std::env::temp_dir(),
            &[],
            &cancel,
            Some(Duration::from_secs(5)),
            Some(Arc::new(move |line: OutputLine| {
                lines_clone.lock().unwrap().push(line.content);
            })),
        )
        .unwrap();

        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.interrupted);
        let captured = lines.lock().unwrap();
        assert_eq!(captured.as_slice(), &["hello".to_string(), "world".to_string()]);
    }

    #[test]
    fn run_reports_nonzero_exit_code() {
        let cancel = CancelToken::new();
        let outcome = ProcessSupervisor::run(
            "exit 3",
            &std::env::temp_dir(),
            &[],
            &cancel,
            Some(Duration::from_secs(5)),
            None,
        )
        .unwrap();

        assert_eq!(outcome.exit_code, Some(3));
    }

    #[test]
    fn run_honors_cancellation() {
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcome = ProcessSupervisor::run(
            "sleep 30",
            &std::env::temp_dir(),
            &[],
            &cancel,
            Some(Duration::from_secs(60)),
            None,
        )
        .unwrap();

        assert!(outcome.interrupted);
        assert_eq!(outcome.exit_code, None);
    }

    #[test]
    fn run_passes_environment_variables() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let lines_clone = lines.clone();
        let cancel = CancelToken::new();

        ProcessSupervisor::run(
            "echo $QA_TEST_VAR",
            &std::env::temp_dir(),
            &[("QA_TEST_VAR".to_string(), "present".to_string())],
            &cancel,
            Some(Duration::from_secs(5)),
            Some(Arc::new(move |line: OutputLine| {
                lines_clone.lock().unwrap().push(line.content);
            })),
        )
        .unwrap();

        assert_eq!(lines.lock().unwrap().as_slice(), &["present".to_string()]);
    }
}
