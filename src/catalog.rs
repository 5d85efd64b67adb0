use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use time::format_description::well_known::Rfc3339;

use crate::config::{ExhibitConfig, GalleryConfig};
use crate::git;
use crate::model::{ExhibitId, ExhibitView};

pub const API_VERSION: &str = "1.0";

/// The read-only exhibit catalog plus a small mutable cache of
/// updates-available answers, refreshed off the request path.
pub struct Catalog {
  config: GalleryConfig,
  destination: PathBuf,
  updates: DashMap<ExhibitId, bool>,
  scope_timeout: Duration,
}

impl Catalog {
  pub fn new(config: GalleryConfig) -> Self {
    let destination = config.destination_dir();
    let scope_timeout = Duration::from_secs(config.lock_timeout_secs);
    Self {
      config,
      destination,
      updates: DashMap::new(),
      scope_timeout,
    }
  }

  pub fn title(&self) -> &str {
    &self.config.title
  }

  pub fn get(&self, id: ExhibitId) -> Option<&ExhibitConfig> {
    self.config.exhibits.get(id)
  }

  /// Where this exhibit lives (or will live) on disk.
  pub fn local_path(&self, exhibit: &ExhibitConfig) -> PathBuf {
    self.destination.join(git::extract_repository_name(&exhibit.git))
  }

  /// Build the client-facing views. Each call also kicks off a background
  /// freshness check per cloned exhibit; the answer lands in the cache for
  /// the next listing rather than delaying this one.
  pub fn views(self: &Arc<Self>) -> Vec<ExhibitView> {
    self
      .config
      .exhibits
      .iter()
      .enumerate()
      .map(|(id, exhibit)| self.view(id, exhibit))
      .collect()
  }

  fn view(self: &Arc<Self>, id: ExhibitId, exhibit: &ExhibitConfig) -> ExhibitView {
    let local_path = self.local_path(exhibit);
    let is_cloned = local_path.exists();

    let last_updated = if is_cloned {
      git::last_updated(&local_path).and_then(|stamp| stamp.format(&Rfc3339).ok())
    } else {
      None
    };
    let updates_available = if is_cloned {
      self.spawn_update_check(id, local_path.clone(), exhibit);
      self.updates.get(&id).map(|cached| *cached)
    } else {
      None
    };

    ExhibitView {
      id,
      title: exhibit.title.clone(),
      description: exhibit.description.clone(),
      homepage: exhibit.homepage.clone(),
      icon: self.icon_for(exhibit),
      local_path: local_path.display().to_string(),
      is_cloned,
      last_updated,
      updates_available,
    }
  }

  /// Configured icon, or the opengraph card for github-hosted exhibits.
  fn icon_for(&self, exhibit: &ExhibitConfig) -> Option<String> {
    if let Some(icon) = &exhibit.icon {
      return Some(icon.clone());
    }
    let homepage = exhibit.homepage.as_deref()?;
    let parsed = url::Url::parse(homepage).ok()?;
    if parsed.scheme() != "https" || parsed.host_str() != Some("github.com") {
      return None;
    }
    let owner = git::extract_repository_owner(homepage);
    let name = git::extract_repository_name(&exhibit.git);
    if owner.is_empty() || name.is_empty() {
      return None;
    }
    Some(format!("https://opengraph.githubassets.com/1/{owner}/{name}"))
  }

  fn spawn_update_check(self: &Arc<Self>, id: ExhibitId, path: PathBuf, exhibit: &ExhibitConfig) {
    let catalog = Arc::clone(self);
    let account = exhibit.account.clone();
    let token = exhibit.token.clone();
    tokio::task::spawn_blocking(move || {
      let behind = git::has_updates(&path, account.as_deref(), token.as_deref(), catalog.scope_timeout);
      catalog.updates.insert(id, behind);
    });
  }
}
