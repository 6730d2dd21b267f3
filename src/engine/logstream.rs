use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::engine::process::{OutputLine, StreamKind};

const MAX_LINE_LEN: usize = 320;

static CSI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap());
static OSC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\].*?(\x07|\x1b\\)").unwrap());

/// Strip ANSI CSI (`\x1b[...<letter>`) and OSC (`\x1b]...BEL|ST`) escape
/// sequences from a line. Anything else (raw text, unicode) passes through
/// untouched.
pub fn strip_ansi(line: &str) -> String {
    let no_osc = OSC_RE.replace_all(line, "");
    CSI_RE.replace_all(&no_osc, "").into_owned()
}

/// Clip a line to `MAX_LINE_LEN` characters, appending `...` if truncated.
/// Applied after stripping so disk and bus payloads are always identical,
/// keeping the on-disk file authoritative.
pub fn clip(line: &str) -> String {
    let char_count = line.chars().count();
    if char_count <= MAX_LINE_LEN {
        return line.to_string();
    }
    let clipped: String = line.chars().take(MAX_LINE_LEN).collect();
    format!("{clipped}...")
}

/// One sanitized line ready to be written to disk and published to the bus.
#[derive(Debug, Clone)]
pub struct SanitizedLine {
    pub stream: StreamKind,
    pub content: String,
}

/// Apply the streamer's transform (strip then clip) to a raw captured line.
pub fn sanitize(line: OutputLine) -> SanitizedLine {
    let stripped = strip_ansi(&line.content);
    SanitizedLine { stream: line.stream, content: clip(&stripped) }
}

/// Returns the stdout/stderr log paths for a given task/run, rooted under
/// `<data-root>/logs/<task-id>/<run-id>.{out,err}` (SPEC_FULL.md §4.C).
pub fn run_log_paths(data_root: &Path, task_id: &str, run_id: &str) -> (PathBuf, PathBuf) {
    let dir = data_root.join("logs").join(task_id);
    (dir.join(format!("{run_id}.out")), dir.join(format!("{run_id}.err")))
}

/// Holds the two append-only file handles for a run's lifetime. Opened once
/// per run and held by the caller for as long as the process is alive,
/// mirroring the reference's one-thread-per-stream ownership shape.
pub struct RunLogFiles {
    pub stdout: File,
    pub stderr: File,
}

impl RunLogFiles {
    pub fn open(data_root: &Path, task_id: &str, run_id: &str) -> std::io::Result<Self> {
        let (stdout_path, stderr_path) = run_log_paths(data_root, task_id, run_id);
        if let Some(parent) = stdout_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stdout = OpenOptions::new().create(true).append(true).open(&stdout_path)?;
        let stderr = OpenOptions::new().create(true).append(true).open(&stderr_path)?;
        Ok(Self { stdout, stderr })
    }

    /// Append a sanitized line to the matching stream's file.
    pub fn write_line(&mut self, line: &SanitizedLine) -> std::io::Result<()> {
        let file = match line.stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        };
        writeln!(file, "{}", line.content)
    }
}

/// Publishes a sanitized line as a `log_chunk` bus event. Kept as a small
/// free function rather than a method on `EventBus` so the log streamer
/// doesn't need to know the envelope shape beyond what it publishes.
pub fn publish_log_chunk(
    bus: &crate::engine::bus::EventBus,
    task_id: &str,
    run_id: &str,
    phase: &str,
    line: &SanitizedLine,
) {
    bus.publish(crate::engine::bus::Envelope::LogChunk {
        task_id: task_id.to_string(),
        run_id: run_id.to_string(),
        phase: phase.to_string(),
        stream: match line.stream {
            StreamKind::Stdout => "stdout".to_string(),
            StreamKind::Stderr => "stderr".to_string(),
        },
        line: line.content.clone(),
    });
}

/// Builds a callback suitable for `ProcessSupervisor::run`'s `on_line`
/// argument: sanitizes, writes to disk, and publishes to the bus. `files`
/// is behind a `Mutex` because stdout/stderr are read on two separate
/// reader threads that may call this concurrently.
pub fn make_line_sink(
    bus: Arc<crate::engine::bus::EventBus>,
    files: Arc<std::sync::Mutex<RunLogFiles>>,
    task_id: String,
    run_id: String,
    phase: String,
) -> Arc<dyn Fn(OutputLine) + Send + Sync> {
    Arc::new(move |raw: OutputLine| {
        let sanitized = sanitize(raw);
        if let Ok(mut files) = files.lock() {
            let _ = files.write_line(&sanitized);
        }
        publish_log_chunk(&bus, &task_id, &run_id, &phase, &sanitized);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_ansi_removes_csi_sequences() {
        let input = "\x1b[31mred text\x1b[0m plain";
        assert_eq!(strip_ansi(input), "red text plain");
    }

    #[test]
    fn strip_ansi_removes_osc_sequences() {
        let input = "\x1b]0;window title\x07visible text";
        assert_eq!(strip_ansi(input), "visible text");
    }

    #[test]
    fn clip_truncates_long_lines() {
        let long_line = "a".repeat(400);
        let clipped = clip(&long_line);
        assert_eq!(clipped.chars().count(), MAX_LINE_LEN + 3);
        assert!(clipped.ends_with("..."));
    }

    #[test]
    fn clip_leaves_short_lines_untouched() {
        assert_eq!(clip("short line"), "short line");
    }

    #[test]
    fn sanitize_strips_then_clips() {
        let ansi_prefix = "\x1b[32m".to_string();
        let body = "x".repeat(400);
        let raw = OutputLine { stream: StreamKind::Stdout, content: format!("{ansi_prefix}{body}") };
        let sanitized = sanitize(raw);
        assert!(sanitized.content.ends_with("..."));
        assert_eq!(sanitized.content.chars().count(), MAX_LINE_LEN + 3);
    }

    #[test]
    fn run_log_paths_are_scoped_by_task_and_run() {
        let root = Path::new("/tmp/data-root");
        let (out, err) = run_log_paths(root, "task-1", "run-1");
        assert_eq!(out, root.join("logs/task-1/run-1.out"));
        assert_eq!(err, root.join("logs/task-1/run-1.err"));
    }

    #[test]
    fn run_log_files_append_across_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut files = RunLogFiles::open(tmp.path(), "task-1", "run-1").unwrap();

        files
            .write_line(&SanitizedLine { stream: StreamKind::Stdout, content: "first".to_string() })
            .unwrap();
        files
            .write_line(&SanitizedLine { stream: StreamKind::Stdout, content: "second".to_string() })
            .unwrap();

        let (out_path, _) = run_log_paths(tmp.path(), "task-1", "run-1");
        let contents = std::fs::read_to_string(out_path).unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }
}
