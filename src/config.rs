use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// When set, clone destinations resolve relative to this directory instead
/// of the server's working directory.
pub const PARENT_DIR_ENV: &str = "GALLERY_PARENT_DIR";

/// One catalog entry. The git URL can carry anything git digests (including
/// an embedded PAT), which is why views are built from an allow-list and
/// never from this struct directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExhibitConfig {
  pub git: String,
  pub title: String,
  #[serde(default)]
  pub description: Option<String>,
  /// User-facing URL to open, also used for icon derivation.
  #[serde(default)]
  pub homepage: Option<String>,
  /// Path to an svg/png, or any URL; derived from the homepage when absent.
  #[serde(default)]
  pub icon: Option<String>,
  /// Username or application name, required for private repositories.
  #[serde(default)]
  pub account: Option<String>,
  /// Personal access token, required for private repositories.
  #[serde(default)]
  pub token: Option<String>,
  #[serde(default)]
  pub branch: Option<String>,
  #[serde(default)]
  pub depth: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GalleryConfig {
  /// Display name of the gallery.
  pub title: String,
  /// Directory into which exhibits are cloned.
  pub destination: String,
  /// Bounded wait for sync admission and the credential scope.
  pub lock_timeout_secs: u64,
  pub exhibits: Vec<ExhibitConfig>,
}

impl Default for GalleryConfig {
  fn default() -> Self {
    Self {
      title: "Gallery".to_string(),
      destination: "gallery".to_string(),
      lock_timeout_secs: 5,
      exhibits: Vec::new(),
    }
  }
}

impl GalleryConfig {
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let raw = std::fs::read_to_string(path)
      .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
  }

  /// Directory all exhibits are cloned under, honoring the parent-directory
  /// override from the environment.
  pub fn destination_dir(&self) -> PathBuf {
    match std::env::var(PARENT_DIR_ENV) {
      Ok(parent) if !parent.trim().is_empty() => PathBuf::from(parent).join(&self.destination),
      _ => PathBuf::from(&self.destination),
    }
  }
}
