//! Bounded subprocess execution with timeout and structured results.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::CommandError;

/// Hard cap on captured bytes per stream; beyond this output is truncated
/// and [`CommandResult::stdout_truncated`]/`stderr_truncated` is set.
const MAX_CAPTURED_BYTES: usize = 1024 * 1024;

/// Grace period after a graceful terminate before forced kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Environment variables forwarded to the child process, mirroring the
/// appliance's bounded service-principal environment.
const ALLOWED_ENV_VARS: &[&str] = &["HOME", "PATH", "LANG", "TZ"];

/// Structured result of a single subprocess invocation.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_sec: f64,
    pub timed_out: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl CommandResult {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs subprocesses under a bounded environment with a hard timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandRunner;

impl CommandRunner {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Run `argv` (argv[0] is the program), waiting up to `timeout`.
    ///
    /// `stdin` is written and closed before reading output. The child's
    /// environment is cleared and re-populated from [`ALLOWED_ENV_VARS`]
    /// only.
    pub fn run(
        &self,
        argv: &[String],
        timeout: Duration,
        stdin: Option<&[u8]>,
    ) -> Result<CommandResult, CommandError> {
        let [program, rest @ ..] = argv else {
            return Err(CommandError::SpawnFailed {
                argv0: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(rest);
        cmd.env_clear();
        for var in ALLOWED_ENV_VARS {
            if let Ok(value) = std::env::var(var) {
                cmd.env(var, value);
            }
        }
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| CommandError::SpawnFailed {
            argv0: program.clone(),
            source,
        })?;

        if let Some(input) = stdin {
            use std::io::Write;
            if let Some(mut child_stdin) = child.stdin.take() {
                let _ = child_stdin.write_all(input);
            }
        }

        let exit_status = wait_with_timeout(&mut child, timeout)?;
        let duration_sec = start.elapsed().as_secs_f64();

        let (stdout, stdout_truncated) = read_capped(child.stdout.take());
        let (stderr, stderr_truncated) = read_capped(child.stderr.take());

        match exit_status {
            Some(status) => Ok(CommandResult {
                exit_code: status.code(),
                stdout,
                stderr,
                duration_sec,
                timed_out: false,
                stdout_truncated,
                stderr_truncated,
            }),
            None => Ok(CommandResult {
                exit_code: None,
                stdout,
                stderr,
                duration_sec,
                timed_out: true,
                stdout_truncated,
                stderr_truncated,
            }),
        }
    }
}

/// Poll `child` until it exits or `timeout` elapses; on timeout, terminate
/// gracefully and force-kill after [`KILL_GRACE`].
fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> Result<Option<std::process::ExitStatus>, CommandError> {
    let start = Instant::now();
    let poll_interval = Duration::from_millis(50);

    loop {
        if let Some(status) = child.try_wait().map_err(|source| CommandError::SpawnFailed {
            argv0: String::new(),
            source,
        })? {
            return Ok(Some(status));
        }
        if start.elapsed() >= timeout {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    // Timeout: request termination, then escalate to a forced kill.
    request_terminate(child);
    let kill_deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < kill_deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(None); // still reported as timed_out, it never met the deadline
        }
        std::thread::sleep(poll_interval);
    }
    let _ = child.kill();
    let _ = child.wait();
    Ok(None)
}

#[cfg(unix)]
fn request_terminate(child: &Child) {
    // SAFETY: `child.id()` is a PID we own; SIGTERM has no further
    // preconditions.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn request_terminate(child: &mut Child) {
    let _ = child.kill();
}

fn read_capped(stream: Option<impl Read>) -> (String, bool) {
    let Some(mut stream) = stream else {
        return (String::new(), false);
    };
    let mut buf = Vec::with_capacity(4096);
    let mut truncated = false;
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() + n > MAX_CAPTURED_BYTES {
                    let remaining = MAX_CAPTURED_BYTES.saturating_sub(buf.len());
                    buf.extend_from_slice(&chunk[..remaining.min(n)]);
                    truncated = true;
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(_) => break,
        }
    }
    (String::from_utf8_lossy(&buf).into_owned(), truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_successful_command() {
        let runner = CommandRunner::new();
        let result = runner
            .run(&["true".to_string()], Duration::from_secs(5), None)
            .unwrap();
        assert!(result.succeeded());
        assert!(!result.timed_out);
    }

    #[test]
    fn captures_failure_exit_code() {
        let runner = CommandRunner::new();
        let result = runner
            .run(
                &["sh".to_string(), "-c".to_string(), "exit 7".to_string()],
                Duration::from_secs(5),
                None,
            )
            .unwrap();
        assert_eq!(result.exit_code, Some(7));
        assert!(!result.succeeded());
    }

    #[test]
    fn times_out_long_running_command() {
        let runner = CommandRunner::new();
        let result = runner
            .run(
                &["sleep".to_string(), "5".to_string()],
                Duration::from_millis(100),
                None,
            )
            .unwrap();
        assert!(result.timed_out);
    }

    #[test]
    fn captures_stdout() {
        let runner = CommandRunner::new();
        let result = runner
            .run(
                &["echo".to_string(), "hello".to_string()],
                Duration::from_secs(5),
                None,
            )
            .unwrap();
        assert_eq!(result.stdout.trim(), "hello");
    }
}
