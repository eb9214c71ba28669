use crate::error::SetupError;

use anyhow::{bail, Context, Result};
use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

pub const OUTPUT_DIR_NAME: &str = "MergedVideos";

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

pub fn ffmpeg_file_name() -> String {
    format!("ffmpeg{}", env::consts::EXE_SUFFIX)
}

/// Directory holding the running executable, falling back to the cwd.
pub fn exe_dir() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Local directory first, then every entry of `PATH`.
pub fn locate_ffmpeg(local_dir: &Path, path_var: Option<&OsStr>) -> Result<PathBuf, SetupError> {
    let name = ffmpeg_file_name();

    let local = local_dir.join(&name);
    if local.is_file() {
        debug!(path = %local.display(), "using ffmpeg next to the executable");
        return Ok(local);
    }

    if let Some(path_var) = path_var {
        for dir in env::split_paths(path_var) {
            let candidate = dir.join(&name);
            if candidate.is_file() {
                debug!(path = %candidate.display(), "using ffmpeg from PATH");
                return Ok(candidate);
            }
        }
    }

    Err(SetupError::FfmpegNotFound)
}

/// An explicit `--ffmpeg` wins over discovery but must exist.
pub fn resolve_ffmpeg(explicit: Option<&Path>) -> Result<PathBuf, SetupError> {
    match explicit {
        Some(p) if p.is_file() => Ok(p.to_path_buf()),
        Some(p) => Err(SetupError::FfmpegMissingAt(p.to_path_buf())),
        None => locate_ffmpeg(&exe_dir(), env::var_os("PATH").as_deref()),
    }
}

/// Runs `ffmpeg -version` and returns its first line.
pub fn probe_ffmpeg(ffmpeg: &Path) -> Result<String> {
    let out = command(ffmpeg)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed to run {} -version", ffmpeg.display()))?;
    if !out.status.success() {
        bail!(
            "{} exists but returned {} on -version",
            ffmpeg.display(),
            out.status
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string())
}

/// `Command` that does not pop a console window on Windows.
pub fn command(program: impl AsRef<OsStr>) -> Command {
    #[allow(unused_mut)]
    let mut cmd = Command::new(program);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Drops whitespace and the quotes shells add around dragged-in paths.
pub fn clean_input_path(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| c == '"' || c == '\'')
        .trim()
        .to_string()
}

pub fn validate_root(raw: &str) -> Result<PathBuf, SetupError> {
    let cleaned = clean_input_path(raw);
    if cleaned.is_empty() {
        return Err(SetupError::EmptyRoot);
    }
    let root = PathBuf::from(cleaned);
    if !root.is_dir() {
        return Err(SetupError::InvalidRoot(root));
    }
    Ok(root)
}

pub fn folder_basename(p: &Path) -> String {
    p.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "root".to_string())
}

/// Preferred output directory for `root`: a sibling `MergedVideos`.
pub fn default_output_dir(root: &Path) -> Option<PathBuf> {
    let abs = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    abs.parent().map(|p| p.join(OUTPUT_DIR_NAME))
}

/// Creates the first usable directory out of `preferred` then `fallback`.
pub fn prepare_output_dir(
    preferred: Option<PathBuf>,
    fallback: PathBuf,
) -> Result<PathBuf, SetupError> {
    let mut tried = vec![];
    for candidate in preferred.into_iter().chain(std::iter::once(fallback)) {
        match std::fs::create_dir_all(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) => {
                warn!(
                    dir = %candidate.display(),
                    error = %err,
                    "cannot create output directory, trying next location"
                );
                tried.push(candidate);
            }
        }
    }
    Err(SetupError::OutputDir(tried))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn strips_surrounding_quotes() {
        assert_eq!(clean_input_path("\"C:\\cache dir\\download\""), "C:\\cache dir\\download");
        assert_eq!(clean_input_path("  '/tmp/a b'  "), "/tmp/a b");
        assert_eq!(clean_input_path("/plain"), "/plain");
        assert_eq!(clean_input_path("\"\""), "");
    }

    #[test]
    fn validate_root_rejects_missing_and_empty() {
        assert!(matches!(validate_root("  "), Err(SetupError::EmptyRoot)));
        let tmp = TempDir::new().expect("tempdir");
        let missing = tmp.path().join("missing");
        assert!(matches!(
            validate_root(&missing.to_string_lossy()),
            Err(SetupError::InvalidRoot(_))
        ));
        let quoted = format!("\"{}\"", tmp.path().display());
        assert_eq!(validate_root(&quoted).expect("valid"), tmp.path());
    }

    #[test]
    fn local_ffmpeg_wins_over_path() {
        let tmp = TempDir::new().expect("tempdir");
        let local = tmp.path().join("local");
        let on_path = tmp.path().join("bin");
        fs::create_dir_all(&local).expect("mkdir");
        fs::create_dir_all(&on_path).expect("mkdir");
        fs::write(on_path.join(ffmpeg_file_name()), b"").expect("write");

        let path_var = env::join_paths([on_path.clone()]).expect("join paths");
        let found = locate_ffmpeg(&local, Some(path_var.as_os_str())).expect("found on PATH");
        assert_eq!(found, on_path.join(ffmpeg_file_name()));

        fs::write(local.join(ffmpeg_file_name()), b"").expect("write");
        let found = locate_ffmpeg(&local, Some(path_var.as_os_str())).expect("found locally");
        assert_eq!(found, local.join(ffmpeg_file_name()));
    }

    #[test]
    fn missing_ffmpeg_is_setup_error() {
        let tmp = TempDir::new().expect("tempdir");
        assert!(matches!(
            locate_ffmpeg(tmp.path(), None),
            Err(SetupError::FfmpegNotFound)
        ));
        assert!(matches!(
            resolve_ffmpeg(Some(&tmp.path().join("nope"))),
            Err(SetupError::FfmpegMissingAt(_))
        ));
    }

    #[test]
    fn output_dir_falls_back_when_preferred_fails() {
        let tmp = TempDir::new().expect("tempdir");
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, b"file, not dir").expect("write");

        let preferred = blocker.join(OUTPUT_DIR_NAME);
        let fallback = tmp.path().join("fallback").join(OUTPUT_DIR_NAME);
        let chosen = prepare_output_dir(Some(preferred), fallback.clone()).expect("fallback");
        assert_eq!(chosen, fallback);
        assert!(fallback.is_dir());
    }

    #[test]
    fn default_output_dir_is_sibling_of_root() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("download");
        fs::create_dir_all(&root).expect("mkdir");
        let out = default_output_dir(&root).expect("has parent");
        assert_eq!(out.file_name().unwrap(), OUTPUT_DIR_NAME);
        assert_eq!(
            out.parent().unwrap(),
            fs::canonicalize(tmp.path()).expect("canonical")
        );
    }
}
