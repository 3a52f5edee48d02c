use std::{
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
    },
};

use crate::{
    error::ProcessError,
    event::{Event, SessionId},
    process_log::OutputStream,
};

pub mod proxy;

pub struct SpawnRequest {
    pub program: PathBuf,
    pub arguments: Vec<String>,
    pub environment: Vec<(String, String)>,
}

impl SpawnRequest {
    pub fn new(program: &Path, arguments: &[&str]) -> Self {
        Self {
            program: program.to_path_buf(),
            arguments: arguments.iter().map(|argument| argument.to_string()).collect(),
            environment: Vec::new(),
        }
    }

    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for argument in &self.arguments {
            line.push(' ');
            line.push_str(argument);
        }
        line
    }
}

/// Launches the client and reports its output and exit through `events`,
/// each tagged with `session`. The exit event is posted exactly once and
/// after every output line.
pub trait ProcessRunner: Send + Sync {
    fn spawn(
        &self,
        request: &SpawnRequest,
        session: SessionId,
        events: Sender<Event>,
    ) -> Result<Box<dyn ProcessHandle>, ProcessError>;
}

pub trait ProcessHandle: Send {
    fn id(&self) -> Option<u32>;

    fn interrupt(&mut self) -> bool;

    fn terminate(&mut self) -> bool;

    fn is_alive(&self) -> bool;
}

pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn spawn(
        &self,
        request: &SpawnRequest,
        session: SessionId,
        events: Sender<Event>,
    ) -> Result<Box<dyn ProcessHandle>, ProcessError> {
        log::info!("[connect] spawning: {}", request.command_line());

        let mut child = Command::new(&request.program)
            .args(&request.arguments)
            .envs(request.environment.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| {
                if error.kind() == std::io::ErrorKind::NotFound {
                    ProcessError::NotFound(request.program.clone())
                } else {
                    ProcessError::LaunchFailed {
                        program: request.program.display().to_string(),
                        reason: error.to_string(),
                    }
                }
            })?;

        let process_id = child.id();
        log::info!("[connect] child started (pid={process_id}, session={session})");

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(start_line_reader(
                stdout,
                OutputStream::Stdout,
                session,
                events.clone(),
            ));
        } else {
            log::warn!("[log_reader] no stdout pipe from child");
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(start_line_reader(
                stderr,
                OutputStream::Stderr,
                session,
                events.clone(),
            ));
        } else {
            log::warn!("[log_reader] no stderr pipe from child");
        }

        let alive = Arc::new(AtomicBool::new(true));
        let waiter_alive = alive.clone();
        std::thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) => {
                    log::info!("[supervisor] child pid={process_id} exited: {status}");
                    status.code()
                }
                Err(error) => {
                    log::warn!("[supervisor] child wait error for pid={process_id}: {error}");
                    None
                }
            };
            waiter_alive.store(false, Ordering::SeqCst);
            for reader in readers {
                let _ = reader.join();
            }
            let _ = events.send(Event::ProcessExited { session, code });
        });

        Ok(Box::new(ChildHandle { process_id, alive }))
    }
}

fn start_line_reader(
    pipe: impl Read + Send + 'static,
    stream: OutputStream,
    session: SessionId,
    events: Sender<Event>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let reader = BufReader::new(pipe);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if events
                        .send(Event::ProcessOutput {
                            session,
                            stream,
                            line,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(error) => {
                    log::trace!("[child {}] reader ended: {error}", stream.label());
                    break;
                }
            }
        }
    })
}

pub struct ChildHandle {
    process_id: u32,
    alive: Arc<AtomicBool>,
}

impl ProcessHandle for ChildHandle {
    fn id(&self) -> Option<u32> {
        Some(self.process_id)
    }

    fn interrupt(&mut self) -> bool {
        if !self.is_alive() {
            return false;
        }
        let sent = send_interrupt(self.process_id);
        if sent {
            log::info!("[terminate] sent interrupt to pid={}", self.process_id);
        } else {
            log::warn!("[terminate] interrupt failed for pid={}", self.process_id);
        }
        sent
    }

    fn terminate(&mut self) -> bool {
        if !self.is_alive() {
            return false;
        }
        let sent = send_kill(self.process_id);
        if sent {
            log::warn!("[terminate] force-killed pid={}", self.process_id);
        } else {
            log::warn!("[terminate] kill failed for pid={}", self.process_id);
        }
        sent
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[cfg(unix)]
fn send_interrupt(process_id: u32) -> bool {
    run_silent("kill", &["-INT", &process_id.to_string()])
}

#[cfg(unix)]
fn send_kill(process_id: u32) -> bool {
    run_silent("kill", &["-KILL", &process_id.to_string()])
}

#[cfg(windows)]
fn send_interrupt(process_id: u32) -> bool {
    run_silent("taskkill", &["/PID", &process_id.to_string()])
}

#[cfg(windows)]
fn send_kill(process_id: u32) -> bool {
    run_silent("taskkill", &["/F", "/PID", &process_id.to_string()])
}

/// Runs a short command to completion. Returns success and the combined,
/// trimmed stdout and stderr.
pub fn run_silent_with_output(program: &str, arguments: &[&str]) -> (bool, String) {
    log::debug!("[cmd] {} {}", program, arguments.join(" "));
    match Command::new(program)
        .args(arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
    {
        Ok(output) => {
            let success = output.status.success();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if !success {
                log::debug!(
                    "[cmd] FAILED (exit {}): {} {}\n  stdout: {}\n  stderr: {}",
                    output.status.code().unwrap_or(-1),
                    program,
                    arguments.join(" "),
                    stdout,
                    stderr,
                );
            } else {
                log::trace!(
                    "[cmd] OK: {} {} → stdout={}",
                    program,
                    arguments.join(" "),
                    stdout,
                );
            }
            let combined = match (stdout.is_empty(), stderr.is_empty()) {
                (_, true) => stdout,
                (true, false) => stderr,
                (false, false) => format!("{stdout}\n{stderr}"),
            };
            (success, combined)
        }
        Err(error) => {
            log::debug!("[cmd] spawn error for {}: {}", program, error);
            (false, error.to_string())
        }
    }
}

pub fn run_silent(program: &str, arguments: &[&str]) -> bool {
    run_silent_with_output(program, arguments).0
}

pub fn which(binary: &str) -> Option<PathBuf> {
    let (success, output) = run_silent_with_output("which", &[binary]);
    let path = output.lines().next()?.trim();
    (success && !path.is_empty()).then(|| PathBuf::from(path))
}
