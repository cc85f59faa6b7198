//! External encoder boundary.
//!
//! The worker hands an [`EncodeJob`] to an [`Encoder`] on the blocking pool
//! and only learns success or an [`EncodeFailure`]. [`FfmpegEncoder`] is the
//! production implementation; tests substitute their own.

use std::env;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RenderConfig;
use crate::job::Scene;

const FILE_KEY_MAX_PREFIX_CHARS: usize = 48;
const FILE_KEY_HASH_CHARS: usize = 12;
const ARTIFACT_EXTENSION: &str = "mp4";

/// Tracing target for encoder stderr lines.
pub const ENCODER_STDERR_TARGET: &str = "encoder_stderr";

/// Filesystem locations owned by one job inside the work directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub text: PathBuf,
    pub output: PathBuf,
}

impl JobPaths {
    pub fn for_job(work_dir: &Path, job_id: &str) -> Self {
        let key = file_key(job_id);
        Self {
            text: work_dir.join(format!("text_{key}.txt")),
            output: work_dir.join(format!("output_{key}.{ARTIFACT_EXTENSION}")),
        }
    }
}

/// Filesystem-safe, deterministic name fragment for a client-supplied id.
/// The hash suffix keeps ids that sanitize to the same prefix apart.
pub fn file_key(job_id: &str) -> String {
    let prefix: String = job_id
        .chars()
        .take(FILE_KEY_MAX_PREFIX_CHARS)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = format!("{:x}", Sha256::digest(job_id.as_bytes()));
    format!("{prefix}-{}", &digest[..FILE_KEY_HASH_CHARS])
}

#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub job_id: String,
    pub scenes: Vec<Scene>,
    pub paths: JobPaths,
}

#[derive(Debug, Error)]
pub enum EncodeFailure {
    #[error("failed to prepare overlay text {}: {source}", .path.display())]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to launch encoder '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },
    #[error("encoder I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("encoder exited with {status}: {diagnostics}")]
    Exit { status: String, diagnostics: String },
    #[error("encoder reported success but produced no output at {}", .0.display())]
    MissingOutput(PathBuf),
    #[error("encoder task aborted: {0}")]
    Aborted(String),
}

pub trait Encoder: Send + Sync + 'static {
    /// Runs to completion on the calling thread. On success the artifact
    /// exists at `job.paths.output`.
    fn encode(&self, job: &EncodeJob) -> Result<(), EncodeFailure>;
}

/// Keeps only the trailing `max_chars` characters of everything written.
#[derive(Debug, Clone)]
pub struct DiagnosticTail {
    buf: String,
    max_chars: usize,
    truncated: bool,
}

impl DiagnosticTail {
    pub fn new(max_chars: usize) -> Self {
        Self {
            buf: String::new(),
            max_chars,
            truncated: false,
        }
    }

    pub fn push_line(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
        self.trim_front();
    }

    pub fn was_truncated(&self) -> bool {
        self.truncated
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn into_string(self) -> String {
        self.buf.trim_end().to_string()
    }

    fn trim_front(&mut self) {
        let len = self.buf.chars().count();
        if len <= self.max_chars {
            return;
        }
        let excess = len - self.max_chars;
        let cut = self
            .buf
            .char_indices()
            .nth(excess)
            .map_or(self.buf.len(), |(idx, _)| idx);
        self.buf.drain(..cut);
        self.truncated = true;
    }
}

/// Trailing `max_chars` characters of `text`.
pub fn bounded_diagnostic(text: &str, max_chars: usize) -> String {
    let mut tail = DiagnosticTail::new(max_chars);
    tail.buf.push_str(text);
    tail.trim_front();
    tail.buf
}

pub struct FfmpegEncoder {
    config: RenderConfig,
}

impl FfmpegEncoder {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }

    pub fn build_args(&self, job: &EncodeJob) -> Vec<String> {
        let cfg = &self.config;
        let source = format!(
            "color=c={}:s={}x{}:d={}",
            cfg.background_color, cfg.width, cfg.height, cfg.duration_secs
        );
        let drawtext = format!(
            "drawtext=textfile={}:expansion=none:fontcolor={}:fontsize={}:x=(w-text_w)/2:y=(h-text_h)/2:line_spacing=10",
            escape_filter_value(&job.paths.text.to_string_lossy()),
            cfg.font_color,
            cfg.font_size
        );

        vec![
            "-y".to_string(),
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            source,
            "-vf".to_string(),
            drawtext,
            "-c:v".to_string(),
            cfg.video_codec.clone(),
            "-pix_fmt".to_string(),
            cfg.pixel_format.clone(),
            job.paths.output.to_string_lossy().into_owned(),
        ]
    }

    fn run_process(&self, job: &EncodeJob) -> Result<(), EncodeFailure> {
        let args = self.build_args(job);
        debug!(
            job_id = %job.job_id,
            cmd = %format!("{} {}", self.config.encoder_binary, args.join(" ")),
            "launching encoder"
        );

        let mut child = encoder_command(&self.config.encoder_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EncodeFailure::Spawn {
                binary: self.config.encoder_binary.clone(),
                source,
            })?;

        let mut tail = DiagnosticTail::new(self.config.diagnostic_tail_chars);
        if let Some(stderr) = child.stderr.take() {
            let mut reader = BufReader::new(stderr);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&raw);
                        let line = line.trim_end();
                        if !line.is_empty() {
                            debug!(target: ENCODER_STDERR_TARGET, job_id = %job.job_id, "{}", line);
                            tail.push_line(line);
                        }
                    }
                    Err(e) => {
                        debug!(target: ENCODER_STDERR_TARGET, job_id = %job.job_id, "read error: {}", e);
                        break;
                    }
                }
            }
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(EncodeFailure::Exit {
                status: status.to_string(),
                diagnostics: tail.into_string(),
            });
        }

        if !job.paths.output.is_file() {
            return Err(EncodeFailure::MissingOutput(job.paths.output.clone()));
        }

        Ok(())
    }
}

impl Encoder for FfmpegEncoder {
    fn encode(&self, job: &EncodeJob) -> Result<(), EncodeFailure> {
        write_overlay_text(&job.paths.text, &job.scenes).map_err(|source| {
            EncodeFailure::Prepare {
                path: job.paths.text.clone(),
                source,
            }
        })?;

        let result = self.run_process(job);

        if let Err(e) = fs::remove_file(&job.paths.text) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(job_id = %job.job_id, path = %job.paths.text.display(), error = %e, "failed to remove overlay text");
            }
        }

        result
    }
}

/// One `Scene N: text` line per scene, numbered from 1.
pub fn overlay_text(scenes: &[Scene]) -> String {
    scenes
        .iter()
        .enumerate()
        .map(|(i, scene)| format!("Scene {}: {}", i + 1, scene.onscreen_text))
        .collect::<Vec<_>>()
        .join("\n")
}

fn write_overlay_text(path: &Path, scenes: &[Scene]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, overlay_text(scenes))
}

fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | ':' | '\'' | ',' | ';' | '[' | ']') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Bare names are looked up next to the executable first, so a bundled
/// encoder wins over the one on PATH.
fn encoder_command(binary: &str) -> Command {
    if Path::new(binary).components().count() == 1 {
        if let Some(path) = find_binary_in_dirs(binary, &candidate_bin_dirs()) {
            return Command::new(path);
        }
    }
    Command::new(binary)
}

fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_bin = cwd.join("bin");
        if !dirs.contains(&cwd_bin) {
            dirs.push(cwd_bin);
        }
    }
    dirs
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let name = if cfg!(windows) {
        format!("{binary}.exe")
    } else {
        binary.to_string()
    };
    dirs.iter().map(|dir| dir.join(&name)).find(|p| p.is_file())
}
