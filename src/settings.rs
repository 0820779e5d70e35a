//! Daemon settings file, one JSON document under the config root.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const SETTINGS_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub allowed_directories: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_directory: Option<PathBuf>,
    #[serde(default)]
    pub auto_cleanup_orphans: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_sessions: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_app: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            allowed_directories: Vec::new(),
            default_directory: None,
            auto_cleanup_orphans: false,
            max_concurrent_sessions: None,
            terminal_app: None,
        }
    }
}

impl Settings {
    /// Load settings from disk. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let body = match std::fs::read_to_string(path) {
            Ok(body) => body,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed reading settings file {}", path.display()));
            }
        };
        serde_json::from_str(&body)
            .with_context(|| format!("failed parsing settings file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_vec_pretty(self)?;
        let dir = path
            .parent()
            .with_context(|| format!("settings path has no parent: {}", path.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed creating temp file in {}", dir.display()))?;
        std::io::Write::write_all(&mut tmp, &body)
            .context("failed writing to temp settings file")?;
        tmp.persist(path)
            .with_context(|| format!("failed persisting settings file to {}", path.display()))?;
        Ok(())
    }

    /// Whether `dir` is acceptable as a session working directory.
    /// An empty allowlist places no restriction.
    pub fn directory_allowed(&self, dir: &Path) -> bool {
        if self.allowed_directories.is_empty() {
            return true;
        }
        self.allowed_directories
            .iter()
            .any(|allowed| dir.starts_with(allowed))
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::{Settings, SETTINGS_VERSION};

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings::load(&tmp.path().join("settings.json")).unwrap();
        assert_eq!(settings.version, SETTINGS_VERSION);
        assert!(settings.allowed_directories.is_empty());
        assert!(!settings.auto_cleanup_orphans);
    }

    #[test]
    fn disk_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.json");
        let settings = Settings {
            allowed_directories: vec![PathBuf::from("/work")],
            default_directory: Some(PathBuf::from("/work/app")),
            auto_cleanup_orphans: true,
            max_concurrent_sessions: Some(4),
            terminal_app: Some("iTerm2".into()),
            ..Default::default()
        };
        settings.save(&path).unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("\"allowedDirectories\""));
        assert!(body.contains("\"autoCleanupOrphans\""));

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.max_concurrent_sessions, Some(4));
        assert_eq!(loaded.terminal_app.as_deref(), Some("iTerm2"));
    }

    #[test]
    fn directory_allowlist() {
        let settings = Settings {
            allowed_directories: vec![PathBuf::from("/work")],
            ..Default::default()
        };
        assert!(settings.directory_allowed(Path::new("/work/project")));
        assert!(!settings.directory_allowed(Path::new("/home/other")));

        let open = Settings::default();
        assert!(open.directory_allowed(Path::new("/anywhere")));
    }
}
