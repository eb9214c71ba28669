use crate::error::ItemError;
use crate::util;

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

const STDERR_TAIL_LINES: usize = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Inputs and destination of one stream-copy merge.
#[derive(Debug, Clone)]
pub struct RemuxJob {
    pub video: PathBuf,
    pub audio: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug)]
pub enum RemuxExit {
    Exited(ExitStatus),
    LaunchFailed(std::io::Error),
    TimedOut(Duration),
}

/// What happened to one remux child, plus its captured stderr.
#[derive(Debug)]
pub struct RemuxReport {
    pub exit: RemuxExit,
    pub stderr: Vec<String>,
}

impl RemuxReport {
    pub fn success(&self) -> bool {
        matches!(&self.exit, RemuxExit::Exited(status) if status.success())
    }

    pub fn stderr_tail(&self) -> String {
        if self.stderr.is_empty() {
            "<no ffmpeg stderr>".to_string()
        } else {
            self.stderr.join(" | ")
        }
    }

    pub fn into_result(self, binary: &Path) -> Result<(), ItemError> {
        let stderr = self.stderr_tail();
        match self.exit {
            RemuxExit::Exited(status) if status.success() => Ok(()),
            RemuxExit::Exited(status) => Err(ItemError::Remux {
                status: status.to_string(),
                stderr,
            }),
            RemuxExit::LaunchFailed(source) => Err(ItemError::Launch {
                binary: binary.to_path_buf(),
                source,
            }),
            RemuxExit::TimedOut(after) => Err(ItemError::TimedOut {
                secs: after.as_secs(),
                stderr,
            }),
        }
    }
}

/// Blocking remux capability. Implementations must be usable from several
/// worker threads at once.
pub trait Remuxer: Send + Sync {
    fn binary(&self) -> &Path;
    fn remux(&self, job: &RemuxJob) -> RemuxReport;
}

#[derive(Debug, Clone)]
pub struct FfmpegRemuxer {
    binary: PathBuf,
    timeout: Option<Duration>,
}

impl FfmpegRemuxer {
    pub fn new(binary: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        Self {
            binary: binary.into(),
            timeout: timeout.filter(|t| !t.is_zero()),
        }
    }

    fn wait(&self, child: &mut Child) -> std::io::Result<RemuxExit> {
        let Some(limit) = self.timeout else {
            return child.wait().map(RemuxExit::Exited);
        };

        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(RemuxExit::Exited(status));
            }
            if started.elapsed() >= limit {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(RemuxExit::TimedOut(limit));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Remuxer for FfmpegRemuxer {
    fn binary(&self) -> &Path {
        &self.binary
    }

    fn remux(&self, job: &RemuxJob) -> RemuxReport {
        let spawned = util::command(&self.binary)
            .arg("-hide_banner")
            .arg("-nostdin")
            .arg("-y")
            .arg("-i")
            .arg(&job.video)
            .arg("-i")
            .arg(&job.audio)
            .arg("-c:v")
            .arg("copy")
            .arg("-c:a")
            .arg("copy")
            .arg("-loglevel")
            .arg("error")
            .arg(&job.output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                return RemuxReport {
                    exit: RemuxExit::LaunchFailed(err),
                    stderr: vec![],
                }
            }
        };
        debug!(pid = child.id(), output = %job.output.display(), "ffmpeg started");

        let stderr_handle = child.stderr.take().map(spawn_stderr_collector);
        let exit = match self.wait(&mut child) {
            Ok(exit) => exit,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                RemuxExit::LaunchFailed(err)
            }
        };
        let stderr = stderr_handle
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        RemuxReport { exit, stderr }
    }
}

/// Keeps the last `STDERR_TAIL_LINES` non-empty lines of ffmpeg's stderr.
/// Lines are decoded lossily; the pipe is drained to EOF so the child never
/// blocks or dies on a closed stderr.
fn spawn_stderr_collector(stderr: impl Read + Send + 'static) -> JoinHandle<Vec<String>> {
    std::thread::spawn(move || {
        let mut lines = VecDeque::new();
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => push_tail(&mut lines, &String::from_utf8_lossy(&buf)),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    push_tail(&mut lines, &format!("<stderr read error: {}>", err));
                    let _ = io::copy(&mut reader, &mut io::sink());
                    break;
                }
            }
        }

        lines.into_iter().collect::<Vec<_>>()
    })
}

fn push_tail(lines: &mut VecDeque<String>, line: &str) {
    let cleaned = line.trim();
    if cleaned.is_empty() {
        return;
    }
    lines.push_back(cleaned.to_string());
    if lines.len() > STDERR_TAIL_LINES {
        lines.pop_front();
    }
}
