use crate::error::ItemError;
use crate::manifest::{CacheManifest, MANIFEST_FILE_NAME};
use crate::title::TitleSource;
use crate::util;

use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const VIDEO_STREAM_NAME: &str = "video.m4s";
pub const AUDIO_STREAM_NAME: &str = "audio.m4s";

/// One manifest together with whatever stream files were found under it.
#[derive(Debug, Clone)]
pub struct CacheUnit {
    pub manifest_path: PathBuf,
    pub title: TitleSource,
    pub video: Option<PathBuf>,
    pub audio: Option<PathBuf>,
}

/// Both streams of a complete unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPair {
    pub video: PathBuf,
    pub audio: PathBuf,
}

impl CacheUnit {
    pub fn unit_dir(&self) -> &Path {
        self.manifest_path.parent().unwrap_or(Path::new("."))
    }

    pub fn stream_pair(&self) -> Option<StreamPair> {
        match (&self.video, &self.audio) {
            (Some(video), Some(audio)) => Some(StreamPair {
                video: video.clone(),
                audio: audio.clone(),
            }),
            _ => None,
        }
    }

    /// Names of the stream files that were not found.
    pub fn missing_streams(&self) -> Vec<&'static str> {
        let mut missing = vec![];
        if self.video.is_none() {
            missing.push(VIDEO_STREAM_NAME);
        }
        if self.audio.is_none() {
            missing.push(AUDIO_STREAM_NAME);
        }
        missing
    }
}

/// Lazily yields every manifest file beneath `root`, at any depth.
pub fn discover_manifests(root: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(err) => {
                warn!(error = %err, "skipping unreadable entry during manifest scan");
                None
            }
        })
        .filter(|e| e.file_type().is_file() && e.file_name() == MANIFEST_FILE_NAME)
        .map(|e| e.into_path())
}

/// Parse one manifest, resolve its title and look for its stream pair.
pub fn match_manifest(manifest_path: &Path) -> Result<CacheUnit, ItemError> {
    let manifest = CacheManifest::read(manifest_path)?;
    let unit_dir = manifest_path.parent().unwrap_or(Path::new("."));
    let title = TitleSource::resolve(&manifest, &util::folder_basename(unit_dir));
    let (video, audio) = locate_streams(unit_dir);

    debug!(
        manifest = %manifest_path.display(),
        title = %title,
        video = video.is_some(),
        audio = audio.is_some(),
        "matched cache unit"
    );

    Ok(CacheUnit {
        manifest_path: manifest_path.to_path_buf(),
        title,
        video,
        audio,
    })
}

/// Searches `unit_dir` and all its descendants for the two stream base
/// names. The first hit in sorted walk order wins.
pub fn locate_streams(unit_dir: &Path) -> (Option<PathBuf>, Option<PathBuf>) {
    let mut video = None;
    let mut audio = None;

    for entry in WalkDir::new(unit_dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name();
        if video.is_none() && name == VIDEO_STREAM_NAME {
            video = Some(entry.path().to_path_buf());
        } else if audio.is_none() && name == AUDIO_STREAM_NAME {
            audio = Some(entry.path().to_path_buf());
        }
        if video.is_some() && audio.is_some() {
            break;
        }
    }

    (video, audio)
}

/// A manifest path paired with its match result.
pub type ScanItem = (PathBuf, Result<CacheUnit, ItemError>);

/// Discovery and matching composed into one lazy sequence.
pub fn scan(root: &Path) -> impl Iterator<Item = ScanItem> {
    discover_manifests(root).map(|path| {
        let matched = match_manifest(&path);
        (path, matched)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(path: &Path, contents: &[u8]) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write file");
    }

    #[test]
    fn finds_manifests_at_any_depth() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path();
        touch(&root.join("a/entry.json"), b"{}");
        touch(&root.join("b/c_1/entry.json"), b"{}");
        touch(&root.join("x/y/z/w/entry.json"), b"{}");
        touch(&root.join("x/entry.json.bak"), b"{}");
        fs::create_dir_all(root.join("d/entry.json")).expect("dir named like manifest");

        let found = discover_manifests(root).collect::<Vec<_>>();
        assert_eq!(found.len(), 3, "{found:?}");
        assert!(found.iter().all(|p| p.file_name().unwrap() == MANIFEST_FILE_NAME));
    }

    #[test]
    fn locates_streams_in_nested_layout() {
        let tmp = TempDir::new().expect("tempdir");
        let unit = tmp.path().join("a");
        touch(&unit.join("entry.json"), br#"{"title":"Show","page_data":{"part":"Ep1"}}"#);
        touch(&unit.join("m/deep/video.m4s"), b"v");
        touch(&unit.join("m/audio.m4s"), b"a");
        touch(&unit.join("m/index.json"), b"{}");

        let matched = match_manifest(&unit.join("entry.json")).expect("match");
        assert_eq!(matched.title, TitleSource::Part("Ep1".into()));
        let pair = matched.stream_pair().expect("complete unit");
        assert!(pair.video.ends_with("m/deep/video.m4s"));
        assert!(pair.audio.ends_with("m/audio.m4s"));
        assert!(matched.missing_streams().is_empty());
    }

    #[test]
    fn incomplete_unit_reports_missing_stream() {
        let tmp = TempDir::new().expect("tempdir");
        let unit = tmp.path().join("solo");
        touch(&unit.join("entry.json"), br#"{"title":"Solo"}"#);
        touch(&unit.join("80/video.m4s"), b"v");

        let matched = match_manifest(&unit.join("entry.json")).expect("match");
        assert!(matched.stream_pair().is_none());
        assert_eq!(matched.missing_streams(), vec![AUDIO_STREAM_NAME]);
    }

    #[test]
    fn fallback_title_uses_unit_directory_name() {
        let tmp = TempDir::new().expect("tempdir");
        let unit = tmp.path().join("c_98765");
        touch(&unit.join("entry.json"), br#"{"avid":1}"#);

        let matched = match_manifest(&unit.join("entry.json")).expect("match");
        assert_eq!(matched.title, TitleSource::Fallback("untitled_c_98765".into()));
    }

    #[test]
    fn scan_keeps_going_after_malformed_manifest() {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path();
        touch(&root.join("1/entry.json"), b"{not json");
        touch(&root.join("2/entry.json"), br#"{"title":"Two"}"#);

        let items = scan(root).collect::<Vec<_>>();
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0].1, Err(ItemError::ParseManifest { .. })));
        let second = items[1].1.as_ref().expect("second manifest parses");
        assert_eq!(second.title, TitleSource::Title("Two".into()));
    }
}
