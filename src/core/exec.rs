//! Shell command execution with bounded wall-clock time.

use crate::core::error::FuzzyflowError;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// Per-call timeout for `shell` steps.
pub const SHELL_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-attempt timeout for `boolean` steps.
pub const BOOLEAN_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-sample timeout for shell-backed metrics.
pub const METRIC_TIMEOUT: Duration = Duration::from_secs(15);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Trimmed stdout, a newline, then trimmed stderr.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout.trim(), self.stderr.trim())
    }
}

/// Runs a command line through a shell interpreter.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &str, timeout: Option<Duration>)
    -> Result<CommandOutput, FuzzyflowError>;

    /// Whether `command` can be resolved before running it.
    fn resolves(&self, command: &str) -> bool {
        command_exists(command)
    }
}

/// `sh -c` runner used outside of tests.
///
/// The shell runs in its own process group. On timeout the whole group is
/// killed, so background jobs holding the output pipes cannot outlive the
/// deadline.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, FuzzyflowError> {
        let mut shell = Command::new("sh");
        shell
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            shell.process_group(0);
        }
        let mut child = shell.spawn()?;

        let (tx, rx) = mpsc::channel();
        drain(child.stdout.take(), Stream::Stdout, tx.clone());
        drain(child.stderr.take(), Stream::Stderr, tx);

        let deadline = timeout.map(|limit| Instant::now() + limit);
        let collected = wait_for_status(&mut child, deadline)
            .and_then(|status| collect_streams(&rx, deadline).map(|streams| (status, streams)));

        match collected {
            Ok((status, (stdout, stderr))) => Ok(CommandOutput {
                stdout,
                stderr,
                exit_code: status.code(),
            }),
            Err(Waited::Io(err)) => {
                terminate(&mut child);
                Err(err.into())
            }
            Err(Waited::Expired) => {
                terminate(&mut child);
                Err(FuzzyflowError::Timeout {
                    command: command.to_string(),
                    seconds: timeout.map(|limit| limit.as_secs()).unwrap_or_default(),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

enum Waited {
    Expired,
    Io(std::io::Error),
}

fn wait_for_status(child: &mut Child, deadline: Option<Instant>) -> Result<ExitStatus, Waited> {
    let Some(deadline) = deadline else {
        return child.wait().map_err(Waited::Io);
    };
    loop {
        if let Some(status) = child.try_wait().map_err(Waited::Io)? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            return Err(Waited::Expired);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Both pipes must reach EOF before the deadline; a background job that
/// inherited them keeps them open.
fn collect_streams(
    rx: &Receiver<(Stream, String)>,
    deadline: Option<Instant>,
) -> Result<(String, String), Waited> {
    let mut stdout = String::new();
    let mut stderr = String::new();
    for _ in 0..2 {
        let received = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(left) {
                    Ok(item) => Some(item),
                    Err(RecvTimeoutError::Timeout) => return Err(Waited::Expired),
                    Err(RecvTimeoutError::Disconnected) => None,
                }
            }
            None => rx.recv().ok(),
        };
        match received {
            Some((Stream::Stdout, text)) => stdout = text,
            Some((Stream::Stderr, text)) => stderr = text,
            None => break,
        }
    }
    Ok((stdout, stderr))
}

fn drain<R: Read + Send + 'static>(
    pipe: Option<R>,
    stream: Stream,
    tx: mpsc::Sender<(Stream, String)>,
) {
    if let Some(mut reader) = pipe {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            let _ = tx.send((stream, String::from_utf8_lossy(&buf).to_string()));
        });
    }
}

/// Kills the shell's process group, then the shell itself.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .arg("-KILL")
            .arg("--")
            .arg(format!("-{}", child.id()))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// True when the first word of `command` resolves to an executable on `PATH`.
pub fn command_exists(command: &str) -> bool {
    match command.split_whitespace().next() {
        Some(first) => which::which(first).is_ok(),
        None => false,
    }
}
