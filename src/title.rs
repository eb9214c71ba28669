use crate::manifest::CacheManifest;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

const FALLBACK_PREFIX: &str = "untitled_";
const PLACEHOLDER: &str = "_";

// Portable forbidden set: < > : " / \ | ? * and C0 controls.
static FORBIDDEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([<>:"/\\|?*\x00-\x1F]*\.+$)|([<>:"/\\|?*\x00-\x1F]+)"#)
        .expect("valid forbidden-char pattern")
});

/// Which manifest rule produced the title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleSource {
    Part(String),
    Title(String),
    Fallback(String),
}

impl TitleSource {
    /// First non-empty of per-part title, top-level title, then a
    /// fallback built from `fallback_id`.
    pub fn resolve(manifest: &CacheManifest, fallback_id: &str) -> Self {
        if let Some(part) = non_empty(manifest.part()) {
            return TitleSource::Part(part.to_string());
        }
        if let Some(title) = non_empty(manifest.title()) {
            return TitleSource::Title(title.to_string());
        }
        TitleSource::Fallback(format!("{}{}", FALLBACK_PREFIX, fallback_id.trim()))
    }

    pub fn raw(&self) -> &str {
        match self {
            TitleSource::Part(s) | TitleSource::Title(s) | TitleSource::Fallback(s) => s,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TitleSource::Part(_) => "part",
            TitleSource::Title(_) => "title",
            TitleSource::Fallback(_) => "fallback",
        }
    }

    /// Filesystem-safe base name, without extension.
    pub fn file_stem(&self) -> String {
        sanitize(self.raw())
    }
}

impl fmt::Display for TitleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.raw(), self.kind())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// Replace forbidden characters with `_`. A forbidden run that ends in
/// trailing dots collapses into one `_`, so no name ends with a dot.
pub fn sanitize(name: &str) -> String {
    FORBIDDEN
        .replace_all(name.trim(), PLACEHOLDER)
        .into_owned()
}
