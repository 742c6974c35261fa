use std::cell::Cell;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Shorten `s` to at most `max` characters, marking the cut with `...`.
pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Keep the first `max` characters of a captured log, without a marker.
pub fn truncate_log(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandRunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.map(|s| s.success()).unwrap_or(false)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    /// stdout followed by stderr, the way a terminal would have shown them.
    pub fn combined_output(&self) -> String {
        let mut combined = String::with_capacity(self.stdout.len() + self.stderr.len());
        combined.push_str(&self.stdout);
        combined.push_str(&self.stderr);
        combined
    }
}

/// How long to wait for the output pipes once the command is gone.
const PIPE_GRACE: Duration = Duration::from_millis(500);

/// Run `command` to completion or until `timeout` elapses, capturing both
/// streams. On unix the command leads its own process group, and a timeout
/// kills the whole group, so grandchildren cannot keep it alive. Output
/// readers are waited on for a bounded time only.
pub fn run_command_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<CommandRunResult, String> {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("Failed to start command: {}", e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Failed to capture stderr".to_string())?;

    let stdout_reader = PipeReader::spawn(stdout);
    let stderr_reader = PipeReader::spawn(stderr);

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    kill_tree(&mut child);
                    match child.wait() {
                        Ok(status) => break Some(status),
                        Err(_) => break None,
                    }
                }
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                kill_tree(&mut child);
                let _ = child.wait();
                return Err(format!("Failed to wait for command: {}", e));
            }
        }
    };

    // A background grandchild can hold the pipes open after the command
    // exits. Give it until the timeout, then take down what is left.
    let remaining = if timed_out {
        Duration::ZERO
    } else {
        timeout
            .saturating_sub(start.elapsed())
            .min(Duration::from_secs(24 * 60 * 60))
    };
    let deadline = Instant::now() + remaining + PIPE_GRACE;
    let mut drained = stdout_reader.wait_until(deadline) & stderr_reader.wait_until(deadline);
    if !drained && !timed_out {
        timed_out = true;
        kill_group(child.id());
        let grace = Instant::now() + PIPE_GRACE;
        drained = stdout_reader.wait_until(grace) & stderr_reader.wait_until(grace);
    }
    if !drained {
        tracing::warn!(pid = child.id(), "command output still open after kill; keeping partial output");
    }

    Ok(CommandRunResult {
        status,
        stdout: stdout_reader.contents(),
        stderr: stderr_reader.contents(),
        timed_out,
    })
}

/// Collects a pipe on a thread; the buffer stays readable if the thread
/// never finishes.
struct PipeReader {
    buf: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Receiver<()>,
    finished: Cell<bool>,
}

impl PipeReader {
    fn spawn<R: Read + Send + 'static>(stream: R) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let (tx, done) = mpsc::channel();
        let sink = Arc::clone(&buf);
        thread::spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => match sink.lock() {
                        Ok(mut out) => out.extend_from_slice(&chunk[..n]),
                        Err(_) => break,
                    },
                }
            }
            let _ = tx.send(());
        });
        Self {
            buf,
            done,
            finished: Cell::new(false),
        }
    }

    /// Whether the pipe reached EOF before `deadline`.
    fn wait_until(&self, deadline: Instant) -> bool {
        if self.finished.get() {
            return true;
        }
        let wait = deadline.saturating_duration_since(Instant::now());
        let finished = !matches!(
            self.done.recv_timeout(wait),
            Err(mpsc::RecvTimeoutError::Timeout)
        );
        self.finished.set(finished);
        finished
    }

    fn contents(&self) -> String {
        self.buf
            .lock()
            .map(|out| String::from_utf8_lossy(&out).to_string())
            .unwrap_or_default()
    }
}

fn kill_tree(child: &mut Child) {
    kill_group(child.id());
    let _ = child.kill();
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
fn kill_group(pid: u32) {
    let status = Command::new("kill")
        .args(["-KILL", "--", &format!("-{pid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(err) = status {
        tracing::warn!(pid, error = %err, "failed to invoke kill for process group");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

/// Resolve a repo-relative path under `repo_root`, refusing absolute paths and
/// anything that would escape the root. The file itself need not exist.
pub fn resolve_repo_path_allow_new(repo_root: &Path, candidate: &Path) -> Result<PathBuf, String> {
    if candidate.as_os_str().is_empty() {
        return Err("Path is empty".to_string());
    }
    if candidate.is_absolute() {
        return Err(format!(
            "Absolute paths are not allowed: {}",
            candidate.display()
        ));
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(format!(
            "Parent traversal is not allowed: {}",
            candidate.display()
        ));
    }

    let root = repo_root
        .canonicalize()
        .map_err(|e| format!("Failed to resolve repo root: {}", e))?;
    let joined = root.join(candidate);
    let parent = joined
        .parent()
        .ok_or_else(|| format!("Invalid path: {}", candidate.display()))?;
    let parent_canon = canonicalize_existing_parent(parent)?;

    if !parent_canon.starts_with(&root) {
        return Err(format!("Path escapes repository: {}", candidate.display()));
    }

    Ok(joined)
}

fn canonicalize_existing_parent(path: &Path) -> Result<PathBuf, String> {
    let mut current = path.to_path_buf();
    while !current.exists() {
        if !current.pop() {
            return Err("Path has no existing parent".to_string());
        }
    }
    current
        .canonicalize()
        .map_err(|e| format!("Failed to resolve path {}: {}", current.display(), e))
}

/// Compute a stable hash of file contents (FNV-1a 64-bit).
pub fn hash_bytes(content: &[u8]) -> String {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in content {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    format!("{:016x}", hash)
}

pub fn hash_str(content: &str) -> String {
    hash_bytes(content.as_bytes())
}
