//! Grounded in `hyperlight-js::script::Script` — an immutable handler
//! script plus the base path needed to resolve relative module imports.
//! localflare scripts hold a worker's fetch-handler source, not a single
//! guest function body.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use localflare_common::Result;

/// A worker's JavaScript source, with enough metadata to resolve relative
/// module imports.
#[derive(Debug, Clone)]
pub struct Script {
    content: Arc<str>,
    base_path: Option<PathBuf>,
}

impl Script {
    pub fn from_content(content: impl Into<String>) -> Self {
        Self {
            content: Arc::from(content.into()),
            base_path: None,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            localflare_common::LocalflareError::Internal(format!(
                "failed to read script from '{}': {e}",
                path.display()
            ))
        })?;
        let base_path = path.parent().map(|p| p.to_path_buf());
        Ok(Self {
            content: Arc::from(content),
            base_path,
        })
    }

    pub fn with_virtual_base(mut self, path: impl AsRef<str>) -> Self {
        self.base_path = Some(PathBuf::from(path.as_ref()));
        self
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn base_path(&self) -> Option<&Path> {
        self.base_path.as_deref()
    }
}

impl From<String> for Script {
    fn from(content: String) -> Self {
        Self::from_content(content)
    }
}

impl From<&str> for Script {
    fn from(content: &str) -> Self {
        Self::from_content(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_base_is_used_for_resolution() {
        let script = Script::from_content("export default {}").with_virtual_base("/workers/a");
        assert_eq!(script.base_path(), Some(Path::new("/workers/a")));
    }

    #[test]
    fn from_content_has_no_base_path() {
        let script = Script::from_content("export default {}");
        assert!(script.base_path().is_none());
    }
}
