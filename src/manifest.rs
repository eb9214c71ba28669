use crate::error::ItemError;
use serde::Deserialize;
use std::path::Path;

/// Fixed name of the file that marks the root of one cache unit.
pub const MANIFEST_FILE_NAME: &str = "entry.json";

/// Metadata for one cached video item. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheManifest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub page_data: Option<PageData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageData {
    #[serde(default)]
    pub part: Option<String>,
}

impl CacheManifest {
    pub fn part(&self) -> Option<&str> {
        self.page_data.as_ref().and_then(|p| p.part.as_deref())
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn from_slice(path: &Path, bytes: &[u8]) -> Result<Self, ItemError> {
        serde_json::from_slice(bytes).map_err(|source| ItemError::ParseManifest {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn read(path: &Path) -> Result<Self, ItemError> {
        let bytes = std::fs::read(path).map_err(|source| ItemError::ReadManifest {
            path: path.to_path_buf(),
            source,
        })?;
        // Some exporters write a UTF-8 BOM.
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes);
        Self::from_slice(path, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn parse(json: &str) -> Result<CacheManifest, ItemError> {
        CacheManifest::from_slice(&PathBuf::from("entry.json"), json.as_bytes())
    }

    #[test]
    fn reads_title_and_nested_part() {
        let m = parse(r#"{"title":"Show","page_data":{"part":"Ep1","cid":42},"avid":1}"#)
            .expect("valid manifest");
        assert_eq!(m.title(), Some("Show"));
        assert_eq!(m.part(), Some("Ep1"));
    }

    #[test]
    fn missing_fields_are_absent() {
        let m = parse("{}").expect("empty object is valid");
        assert!(m.title().is_none());
        assert!(m.part().is_none());

        let m = parse(r#"{"page_data":null,"title":null}"#).expect("nulls are valid");
        assert!(m.title().is_none());
        assert!(m.part().is_none());
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = parse(r#"{"title": "#).unwrap_err();
        assert!(matches!(err, ItemError::ParseManifest { .. }));
        assert!(err.to_string().contains("entry.json"));
    }

    #[test]
    fn read_strips_bom() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let path = tmp.path().join(MANIFEST_FILE_NAME);
        let mut bytes = b"\xEF\xBB\xBF".to_vec();
        bytes.extend_from_slice(br#"{"title":"Bom"}"#);
        std::fs::write(&path, bytes).expect("write manifest");

        let m = CacheManifest::read(&path).expect("bom manifest parses");
        assert_eq!(m.title(), Some("Bom"));
    }

    #[test]
    fn read_missing_file_is_read_error() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let err = CacheManifest::read(&tmp.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ItemError::ReadManifest { .. }));
    }
}
