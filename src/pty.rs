//! Owns a child process attached to a PTY master, and the blocking
//! read/write/resize/terminate operations on top of it.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tracing::{info, warn};

use crate::error::PtyError;

/// Default terminal size used when the browser hasn't sent a RESIZE yet.
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// A spawned child process bridged to a PTY master. `writer`/`child` are
/// wrapped so they can be shared with the blocking reader/writer tasks.
pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    pub pid: u32,
}

impl PtyHandle {
    /// Allocates a PTY and spawns `argv`, exec'ing it directly if its first
    /// element is a readable/executable file, falling back to `/bin/sh -c`
    /// otherwise (preserves single-argument command-line ergonomics).
    pub fn spawn(
        argv: &[String],
        initial_size: Option<(u16, u16)>,
    ) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let (cols, rows) = initial_size.unwrap_or((DEFAULT_COLS, DEFAULT_ROWS));
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Alloc(e.to_string()))?;

        let mut cmd = build_command(argv);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        let pid = child.process_id().unwrap_or(0);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        if cols > 0 && rows > 0 {
            if let Err(e) = pair.master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            }) {
                warn!("initial pty resize failed: {e}");
            }
        }

        info!(pid, "started child process");

        Ok(Self {
            master: pair.master,
            writer: Arc::new(Mutex::new(writer)),
            child: Arc::new(Mutex::new(child)),
            pid,
        })
    }

    pub fn try_clone_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.master
            .try_clone_reader()
            .map_err(|e| PtyError::Read(e.to_string()))
    }

    /// Writes `data` to the PTY master; a short write is treated as fatal,
    /// matching the original's "short write to pty" close condition.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let mut writer = self.writer.lock().unwrap();
        let written = writer
            .write(data)
            .map_err(|e| PtyError::Read(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| PtyError::Read(e.to_string()))?;
        if written < data.len() {
            return Err(PtyError::ShortWrite {
                written,
                requested: data.len(),
            });
        }
        Ok(())
    }

    /// Best-effort ioctl; failure is reported but not fatal to the session.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Resize(e.to_string()))
    }

    /// Sends `signal` to the child, then reaps it, retrying on interrupt
    /// until a final status is obtained.
    pub fn terminate(&self, signal: nix::sys::signal::Signal) {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        if self.pid > 0 {
            if let Err(e) = kill(Pid::from_raw(self.pid as i32), signal) {
                warn!(pid = self.pid, "kill failed: {e}");
            }
        }

        let mut child = self.child.lock().unwrap();
        loop {
            match child.wait() {
                Ok(status) => {
                    log_exit_status(self.pid, &status);
                    break;
                }
                Err(e) if is_interrupted(&e) => continue,
                Err(e) => {
                    warn!(pid = self.pid, "waitpid-equivalent failed: {e}");
                    break;
                }
            }
        }
    }
}

fn is_interrupted(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::Interrupted
}

fn log_exit_status(pid: u32, status: &portable_pty::ExitStatus) {
    if status.success() {
        info!(pid, "process exited normally");
    } else {
        info!(pid, code = ?status.exit_code(), "process exited with non-zero status");
    }
}

fn build_command(argv: &[String]) -> CommandBuilder {
    let program = &argv[0];
    let is_executable_file = std::fs::metadata(program)
        .map(|m| m.is_file())
        .unwrap_or(false)
        && nix::unistd::access(program.as_str(), nix::unistd::AccessFlags::X_OK).is_ok();

    if is_executable_file {
        let mut cmd = CommandBuilder::new(program);
        cmd.args(&argv[1..]);
        cmd
    } else {
        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.arg("-c");
        cmd.arg(program);
        cmd
    }
}
