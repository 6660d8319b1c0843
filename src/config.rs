//! Configuration records describing the remotes to sync with
//!
//! There is no global configuration singleton: callers load a [`Config`] once
//! and hand it (or single [`BackendConfig`]s) to the facade, the sync engine
//! and the dispatcher.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CbError, CbResult};

fn default_true() -> bool {
    true
}

/// One configured remote
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Stable identifier within the configuration; also keys the credential
    /// lookups and the per-backend cache folder
    pub name: String,

    /// Selects the provider family in the registry ("caldav", "rest", "markdown", ...)
    #[serde(rename = "type")]
    pub type_tag: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    // CalDAV-family fields
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    /// Full URL; may embed credentials (deprecated, kept for old configurations)
    #[serde(default)]
    pub url: Option<String>,

    // REST-family fields
    #[serde(default)]
    pub token: Option<String>,

    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure_tls: bool,
    #[serde(default)]
    pub suppress_insecure_tls_warning: bool,

    /// Allow plain HTTP (only honored for whitelisted ports)
    #[serde(default)]
    pub allow_http: bool,
    #[serde(default)]
    pub suppress_allow_http_warning: bool,

    // Markdown-family fields
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub fallback_files: Vec<PathBuf>,
    #[serde(default)]
    pub auto_commit: bool,
}

impl BackendConfig {
    pub fn new<N: ToString, T: ToString>(name: N, type_tag: T) -> Self {
        Self {
            name: name.to_string(),
            type_tag: type_tag.to_string(),
            enabled: true,
            host: None,
            username: None,
            url: None,
            token: None,
            insecure_tls: false,
            suppress_insecure_tls_warning: false,
            allow_http: false,
            suppress_allow_http_warning: false,
            file: None,
            fallback_files: Vec::new(),
            auto_commit: false,
        }
    }
}

/// The whole configuration file
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Where per-backend caches live; defaults to the platform cache directory
    #[serde(default)]
    pub cache_root: Option<PathBuf>,

    /// Where dispatcher invocations write their log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    // Plain values must stay above the table array for TOML serialization
    #[serde(default, rename = "backend")]
    pub backends: Vec<BackendConfig>,
}

impl Config {
    pub fn load(path: &Path) -> CbResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| CbError::Storage {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text)
            .map_err(|err| CbError::invalid_input(format!("bad configuration {:?}: {}", path, err)))
    }

    pub fn save(&self, path: &Path) -> CbResult<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|err| CbError::invalid_input(format!("unserializable configuration: {}", err)))?;
        std::fs::write(path, text).map_err(|source| CbError::Storage {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.name == name)
    }

    pub fn enabled_backends(&self) -> impl Iterator<Item = &BackendConfig> {
        self.backends.iter().filter(|b| b.enabled)
    }

    /// The root under which every backend gets its own cache folder
    pub fn cache_root(&self) -> PathBuf {
        self.cache_root.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("org", "corkboard", "corkboard")
                .map(|dirs| dirs.cache_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".corkboard-cache"))
        })
    }

    /// The cache folder of one backend. Backend names are user input, so they
    /// are sanitized before touching the filesystem.
    pub fn cache_folder_for(&self, backend_name: &str) -> PathBuf {
        self.cache_root()
            .join(sanitize_filename::sanitize(backend_name))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("org", "corkboard", "corkboard")
                .map(|dirs| dirs.data_dir().join("logs"))
                .unwrap_or_else(|| std::env::temp_dir().join("corkboard-logs"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        cache_root = "/tmp/corkboard-test-cache"

        [[backend]]
        name = "home"
        type = "caldav"
        host = "cloud.example.org"
        username = "john"

        [[backend]]
        name = "work"
        type = "rest"
        enabled = false
        url = "https://tasks.example.com/api/v1"

        [[backend]]
        name = "notes"
        type = "markdown"
        file = "TODO.md"
        fallback_files = ["docs/TODO.md"]
        auto_commit = true
    "#;

    #[test]
    fn parses_and_filters_backends() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.backends.len(), 3);

        let enabled: Vec<&str> = config
            .enabled_backends()
            .map(|b| b.name.as_str())
            .collect();
        assert_eq!(enabled, vec!["home", "notes"]);

        let home = config.backend("home").unwrap();
        assert_eq!(home.type_tag, "caldav");
        assert!(!home.allow_http);

        let notes = config.backend("notes").unwrap();
        assert!(notes.auto_commit);
        assert_eq!(notes.fallback_files, vec![PathBuf::from("docs/TODO.md")]);
    }

    #[test]
    fn cache_folders_are_per_backend_and_sanitized() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let folder = config.cache_folder_for("week/end");
        assert!(folder.starts_with("/tmp/corkboard-test-cache"));
        assert!(!folder.to_string_lossy().contains("week/end"));
    }

    #[test]
    fn roundtrips_through_toml() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let text = toml::to_string_pretty(&config).unwrap();
        let again: Config = toml::from_str(&text).unwrap();
        assert_eq!(config, again);
    }
}
