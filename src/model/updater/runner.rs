use std::{
    io::{self, Read},
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
    time::Duration,
};

use log::*;
use thiserror::Error;
use wait_timeout::ChildExt;

const SPAWN_RETRIES: usize = 3;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(50);

fn exit_reason(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "killed by signal".to_string(),
    }
}

#[derive(Error, Debug)]
pub enum UpdateToolError {
    #[error("update tool {0} not found")]
    NotFound(PathBuf),
    #[error("update tool spawn failed: {0}")]
    Spawn(io::Error),
    #[error("update tool {}: {output}", exit_reason(.code))]
    Exit { code: Option<i32>, output: String },
    #[error("update tool timed out after {0:?}")]
    Timeout(Duration),
    #[error("update tool io error: {0}")]
    Io(#[from] io::Error),
}

/// Runs the external definition updater (freshclam compatible arguments).
///
/// Success is decided by exit status alone; captured output only feeds
/// diagnostics.
#[derive(Debug, Clone)]
pub struct UpdateRunner {
    tool: PathBuf,
    config_file: Option<PathBuf>,
    timeout: Duration,
}

impl UpdateRunner {
    pub fn new(tool: &Path, config_file: Option<&Path>, timeout: Duration) -> Self {
        Self {
            tool: tool.to_path_buf(),
            config_file: config_file.map(Path::to_path_buf),
            timeout,
        }
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }

    /// Returns the combined output on a zero exit status.
    pub fn run(&self, db_path: &Path) -> Result<String, UpdateToolError> {
        let mut cmd = Command::new(&self.tool);
        cmd.arg(format!("--datadir={}", db_path.display()));
        if let Some(config_file) = &self.config_file {
            cmd.arg(format!("--config-file={}", config_file.display()));
        }
        // own process group, so a timeout also takes down anything it forked
        cmd.process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!("[Updater] exec {:?}", cmd);

        let mut child = self.spawn(&mut cmd)?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                kill_group(&mut child);
                child.wait()?;
                // grandchildren that left the group may still hold the
                // pipes; their drain threads are left to finish alone
                drop((stdout, stderr));
                return Err(UpdateToolError::Timeout(self.timeout));
            }
        };
        let output = join_output(stdout, stderr);
        if status.success() {
            return Ok(output);
        }
        Err(UpdateToolError::Exit {
            code: status.code(),
            output,
        })
    }

    fn spawn(&self, cmd: &mut Command) -> Result<Child, UpdateToolError> {
        let mut attempt = 0;
        loop {
            match cmd.spawn() {
                Ok(child) => return Ok(child),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(UpdateToolError::NotFound(self.tool.clone()))
                }
                // the tool binary is being replaced right now
                Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_RETRIES => {
                    attempt += 1;
                    thread::sleep(SPAWN_RETRY_DELAY);
                }
                Err(e) => return Err(UpdateToolError::Spawn(e)),
            }
        }
    }
}

fn kill_group(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        let _ = child.kill();
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<thread::JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_output(
    stdout: Option<thread::JoinHandle<Vec<u8>>>,
    stderr: Option<thread::JoinHandle<Vec<u8>>>,
) -> String {
    let collect = |h: Option<thread::JoinHandle<Vec<u8>>>| {
        h.and_then(|h| h.join().ok())
            .map(|buf| String::from_utf8_lossy(&buf).trim().to_string())
            .unwrap_or_default()
    };
    let (out, err) = (collect(stdout), collect(stderr));
    match (out.is_empty(), err.is_empty()) {
        (true, _) => err,
        (_, true) => out,
        _ => format!("{}\n{}", out, err),
    }
}
