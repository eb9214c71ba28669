use std::path::PathBuf;
use thiserror::Error;

/// Conditions that stop the run before any cache unit is touched.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("ffmpeg not found: place it next to the executable or add it to PATH")]
    FfmpegNotFound,

    #[error("configured ffmpeg does not exist: {}", .0.display())]
    FfmpegMissingAt(PathBuf),

    #[error("no input directory given")]
    EmptyRoot,

    #[error("input path is not an existing directory: {}", .0.display())]
    InvalidRoot(PathBuf),

    #[error("could not create an output directory (tried {})", join_paths(.0))]
    OutputDir(Vec<PathBuf>),
}

/// Per-item failures. Every variant is converted into a counted outcome by
/// the batch loop; none of them stop the run.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("cannot read manifest {}: {source}", path.display())]
    ReadManifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed manifest {}: {source}", path.display())]
    ParseManifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to launch {}: {source}", binary.display())]
    Launch {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ffmpeg exited with {status}: {stderr}")]
    Remux { status: String, stderr: String },

    #[error("ffmpeg timed out after {secs}s: {stderr}")]
    TimedOut { secs: u64, stderr: String },

    #[error("worker panicked while processing {}", .0.display())]
    Panicked(PathBuf),
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
