use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use lockstep_core::{ControllerError, ControllerResult};

/// Transcript bytes buffered per command before the session gives up.
pub const MAX_TRANSCRIPT_BYTES: usize = 8 * 1024 * 1024;

const STOP_GRACE: Duration = Duration::from_millis(500);

/// How to launch one debugger session.
#[derive(Clone, Debug, Default)]
pub struct SessionSpec {
    pub debugger: String,
    pub debugger_args: Vec<String>,
    /// Debuggee command line.
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub start_address: u32,
    /// 0 waits forever.
    pub command_timeout_ms: u64,
}

/// Recognises the prompt on the last, unterminated line of output.
pub type PromptMatcher = fn(&str) -> bool;

enum ReaderEvent {
    Bytes(Vec<u8>),
    Closed,
}

/// A line-oriented debugger REPL driven over pipes.
///
/// stderr is folded into stdout so error messages arrive before the prompt that
/// follows them.
pub struct ReplSession {
    label: &'static str,
    child: Child,
    stdin: Option<ChildStdin>,
    rx: mpsc::Receiver<ReaderEvent>,
    pending: Vec<u8>,
    is_prompt: PromptMatcher,
    quit: &'static str,
    timeout_ms: u64,
    closed: bool,
}

impl ReplSession {
    pub fn spawn(
        label: &'static str,
        args: &[String],
        spec: &SessionSpec,
        is_prompt: PromptMatcher,
        quit: &'static str,
    ) -> ControllerResult<Self> {
        let mut cmd = Command::new(&spec.debugger);
        cmd.args(args);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&spec.env);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            cmd.stderr(Stdio::inherit());
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 && libc::setpgid(0, 0) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::dup2(1, 2) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        #[cfg(not(unix))]
        {
            cmd.stderr(Stdio::null());
        }

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take();
        let Some(stdout) = child.stdout.take() else {
            hard_kill_pid_and_group(child.id());
            return Err(ControllerError::transcript("spawn", "debugger has no stdout pipe"));
        };

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("lockstep-{label}-reader"))
            .spawn(move || reader_loop(stdout, tx))?;

        tracing::debug!(side = label, pid = child.id(), debugger = %spec.debugger, "debugger spawned");

        Ok(Self {
            label,
            child,
            stdin,
            rx,
            pending: Vec::new(),
            is_prompt,
            quit,
            timeout_ms: spec.command_timeout_ms,
            closed: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Output up to the next prompt, prompt line excluded. `command` only
    /// labels errors.
    pub fn read_until_prompt(&mut self, command: &str) -> ControllerResult<String> {
        let deadline = match self.timeout_ms {
            0 => None,
            ms => Some(Instant::now() + Duration::from_millis(ms)),
        };

        loop {
            if let Some(out) = self.take_through_prompt() {
                tracing::trace!(target: "lockstep::transcript", side = self.label, %command, output = %out);
                return Ok(out);
            }
            if self.closed {
                let tail = String::from_utf8_lossy(&self.pending).trim().to_string();
                return Err(ControllerError::Exited {
                    detail: Some(if tail.is_empty() {
                        format!("{} session ended", self.label)
                    } else {
                        format!("{} session ended: {tail}", self.label)
                    }),
                });
            }
            if self.pending.len() > MAX_TRANSCRIPT_BYTES {
                return Err(ControllerError::transcript(
                    command,
                    format!("output exceeded {MAX_TRANSCRIPT_BYTES} bytes without a prompt"),
                ));
            }

            let event = match deadline {
                None => self.rx.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected),
                Some(at) => self.rx.recv_timeout(at.saturating_duration_since(Instant::now())),
            };
            match event {
                Ok(ReaderEvent::Bytes(b)) => self.pending.extend_from_slice(&b),
                Ok(ReaderEvent::Closed) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    self.closed = true;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(ControllerError::NoResponse {
                        command: command.to_string(),
                        timeout_ms: self.timeout_ms,
                    });
                }
            }
        }
    }

    pub fn write_line(&mut self, line: &str) -> ControllerResult<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(ControllerError::Exited {
                detail: Some(format!("{} stdin closed", self.label)),
            });
        };
        stdin.write_all(line.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()?;
        Ok(())
    }

    pub fn run_command(&mut self, line: &str) -> ControllerResult<String> {
        tracing::debug!(target: "lockstep::transcript", side = self.label, command = line, "debugger command");
        self.write_line(line)?;
        self.read_until_prompt(line)
    }

    fn take_through_prompt(&mut self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.pending);
        let line_start = text.rfind('\n').map_or(0, |i| i + 1);
        if !(self.is_prompt)(&text[line_start..]) {
            return None;
        }
        let out = text[..line_start].to_string();
        self.pending.clear();
        Some(out)
    }
}

impl Drop for ReplSession {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.write_line(self.quit);
        }
        self.stdin = None;

        if wait_for_exit(&mut self.child, STOP_GRACE) {
            return;
        }
        terminate_pid_and_group(self.child.id());
        if wait_for_exit(&mut self.child, STOP_GRACE) {
            return;
        }
        tracing::warn!(side = self.label, pid = self.child.id(), "debugger ignored SIGTERM; killing");
        hard_kill_pid_and_group(self.child.id());
        let _ = self.child.wait();
    }
}

fn reader_loop<R: Read>(mut reader: R, tx: mpsc::Sender<ReaderEvent>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(ReaderEvent::Bytes(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
        }
    }
    let _ = tx.send(ReaderEvent::Closed);
}

fn wait_for_exit(child: &mut Child, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Ok(None) => return false,
            Err(_) => return true,
        }
    }
}

fn terminate_pid_and_group(pid: u32) {
    signal_pid_and_group(pid, Signal::Term);
}

pub fn hard_kill_pid_and_group(pid: u32) {
    signal_pid_and_group(pid, Signal::Kill);
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

fn signal_pid_and_group(pid: u32, sig: Signal) {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return;
        };
        let sig = match sig {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        unsafe {
            let _ = libc::kill(-pid, sig);
            let _ = libc::kill(pid, sig);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, sig);
    }
}
