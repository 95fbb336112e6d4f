use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// Version tag used when neither config nor environment sets one.
pub const DEFAULT_VERSION: &str = "flor-3d-te-amo-v1.2";

/// Assets pre-cached at install, relative to the scope.
pub const DEFAULT_ASSETS: &[&str] = &[
  "./",
  "./index.html",
  "https://cdnjs.cloudflare.com/ajax/libs/normalize/8.0.1/normalize.min.css",
  "Juanes - Es Por Ti (Official Music Video).mp3",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Cache generation; bump to invalidate every previously cached bucket
  pub version: String,
  /// Base URL the agent controls; relative asset paths resolve against it
  pub scope: String,
  /// Static asset list
  pub assets: Vec<String>,
  /// Document served to navigations when offline
  pub root_document: String,
  /// Path suffix selecting the audio policy
  pub audio_extension: String,
  /// Body of the offline 503 for non-navigation requests
  pub offline_message: String,
  /// SQLite database path (defaults to the user data directory)
  pub database: Option<PathBuf>,
  /// Write logs to this file instead of stderr
  pub log_file: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      version: DEFAULT_VERSION.to_string(),
      scope: "http://localhost:8080/".to_string(),
      assets: DEFAULT_ASSETS.iter().map(|s| s.to_string()).collect(),
      root_document: "./index.html".to_string(),
      audio_extension: ".mp3".to_string(),
      offline_message: "Sin conexión".to_string(),
      database: None,
      log_file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./asset-agent.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/asset-agent/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
  /// `ASSET_AGENT_VERSION` overrides the version tag.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(version) = std::env::var("ASSET_AGENT_VERSION") {
      config.version = version;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("asset-agent.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("asset-agent").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse a YAML document. Missing fields take their defaults.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.version.trim().is_empty() {
      return Err(eyre!("Version tag must not be empty"));
    }
    self.resolve_assets()?;
    self.root_document_url()?;
    Ok(())
  }

  /// The scope as a URL.
  pub fn scope_url(&self) -> Result<Url> {
    Url::parse(&self.scope).map_err(|e| eyre!("Invalid scope URL '{}': {}", self.scope, e))
  }

  /// Resolve a path or URL against the scope.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    self
      .scope_url()?
      .join(target)
      .map_err(|e| eyre!("Invalid URL '{}': {}", target, e))
  }

  /// Static asset list as absolute URLs, in order.
  pub fn resolve_assets(&self) -> Result<Vec<Url>> {
    self.assets.iter().map(|a| self.resolve(a)).collect()
  }

  pub fn root_document_url(&self) -> Result<Url> {
    self.resolve(&self.root_document)
  }

  /// Database path, falling back to the user data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(p) => Ok(p.clone()),
      None => crate::cache::SqliteStorage::default_path(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.version, DEFAULT_VERSION);
    assert_eq!(config.assets.len(), 4);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_parse_partial_yaml() {
    let config = Config::parse("version: site-v2\nscope: https://example.com/app/\n").unwrap();
    assert_eq!(config.version, "site-v2");
    assert_eq!(config.audio_extension, ".mp3");
    assert_eq!(
      config.root_document_url().unwrap().as_str(),
      "https://example.com/app/index.html"
    );
  }

  #[test]
  fn test_resolve_assets() {
    let config = Config::default();
    let urls = config.resolve_assets().unwrap();
    assert_eq!(urls[0].as_str(), "http://localhost:8080/");
    assert_eq!(urls[1].as_str(), "http://localhost:8080/index.html");
    assert_eq!(urls[2].host_str(), Some("cdnjs.cloudflare.com"));
    assert!(urls[3].path().ends_with(".mp3"));
  }

  #[test]
  fn test_invalid_scope_is_rejected() {
    let config = Config::parse("scope: not a url\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_empty_version_is_rejected() {
    let config = Config::parse("version: ''\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    let result = Config::load(Some(Path::new("/nonexistent/asset-agent.yaml")));
    assert!(result.is_err());
  }
}
