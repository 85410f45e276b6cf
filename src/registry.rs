//! Immutable partition registry and sync task configuration.
//!
//! Built once at startup from [`Config`] and passed by reference into every
//! component. Nothing here is mutated after construction; concurrent reads
//! are always safe.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use url::Url;

use crate::config::Config;
use crate::outbox::StoreName;

/// Logical cache regions, each independently versioned and bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKind {
  /// Precached app shell (install-time)
  Shell,
  /// Style sheets, scripts, fonts
  Static,
  /// Image assets
  Images,
  /// Navigations and other pages
  Dynamic,
  /// API and analytics responses
  Api,
  /// Offline fallback page and assets (install-time)
  Offline,
}

impl PartitionKind {
  pub const ALL: [PartitionKind; 6] = [
    PartitionKind::Shell,
    PartitionKind::Static,
    PartitionKind::Images,
    PartitionKind::Dynamic,
    PartitionKind::Api,
    PartitionKind::Offline,
  ];

  fn slug(self) -> &'static str {
    match self {
      PartitionKind::Shell => "shell",
      PartitionKind::Static => "static",
      PartitionKind::Images => "images",
      PartitionKind::Dynamic => "dynamic",
      PartitionKind::Api => "api",
      PartitionKind::Offline => "offline",
    }
  }

  fn default_max_entries(self) -> usize {
    match self {
      PartitionKind::Shell => 32,
      PartitionKind::Static => 96,
      PartitionKind::Images => 64,
      PartitionKind::Dynamic => 48,
      PartitionKind::Api => 32,
      PartitionKind::Offline => 8,
    }
  }

  fn default_max_age(self) -> Option<Duration> {
    match self {
      PartitionKind::Static => Some(Duration::days(30)),
      PartitionKind::Images => Some(Duration::days(14)),
      PartitionKind::Dynamic => Some(Duration::days(3)),
      PartitionKind::Api => Some(Duration::minutes(5)),
      // Shell and offline entries live until version rollover
      PartitionKind::Shell | PartitionKind::Offline => None,
    }
  }
}

/// A named, versioned cache partition with its bounds.
#[derive(Debug, Clone)]
pub struct Partition {
  pub kind: PartitionKind,
  /// Versioned cache name, e.g. "shelf-static-v2"
  pub name: String,
  /// Entry count after eviction never exceeds this
  pub max_entries: usize,
  /// Entries older than this are evicted; None means unbounded
  pub max_age: Option<Duration>,
}

/// Static configuration for one background sync task.
///
/// Read-only at runtime; the retry bounds are enforced by the host adapter,
/// not the coordinator.
#[derive(Debug, Clone)]
pub struct SyncTask {
  pub tag: String,
  pub store: StoreName,
  /// Upstream path items are POSTed to
  pub endpoint: String,
  pub max_retries: u32,
  pub retry_delay: std::time::Duration,
}

/// Read-only worker configuration.
#[derive(Debug, Clone)]
pub struct Registry {
  pub version: String,
  /// Origin the gateway fronts; relative asset paths resolve against it
  pub origin: Url,
  partitions: Vec<Partition>,
  pub shell_assets: Vec<Url>,
  pub offline_page: Url,
  /// Offline page plus any extra fallback assets
  pub offline_assets: Vec<Url>,
  /// Cross-origin hosts whose responses may be stored
  pub allowed_origins: Vec<String>,
  pub sync_tasks: Vec<SyncTask>,
}

impl Registry {
  pub fn from_config(config: &Config) -> Result<Self> {
    let origin = Url::parse(&config.upstream)
      .map_err(|e| eyre!("Invalid upstream origin {}: {}", config.upstream, e))?;

    let partitions = PartitionKind::ALL
      .iter()
      .map(|&kind| Partition {
        kind,
        name: format!("shelf-{}-{}", kind.slug(), config.version),
        max_entries: kind.default_max_entries(),
        max_age: kind.default_max_age(),
      })
      .collect();

    let shell_assets = config
      .shell_assets
      .iter()
      .map(|p| {
        origin
          .join(p)
          .map_err(|e| eyre!("Invalid shell asset path {}: {}", p, e))
      })
      .collect::<Result<Vec<_>>>()?;

    let offline_page = origin
      .join(&config.offline_page)
      .map_err(|e| eyre!("Invalid offline page path {}: {}", config.offline_page, e))?;

    let mut offline_assets = vec![offline_page.clone()];
    for p in &config.offline_assets {
      offline_assets.push(
        origin
          .join(p)
          .map_err(|e| eyre!("Invalid offline asset path {}: {}", p, e))?,
      );
    }

    let sync_tasks = vec![
      SyncTask {
        tag: "analytics-sync".to_string(),
        store: StoreName::Analytics,
        endpoint: config.analytics_endpoint.clone(),
        max_retries: 3,
        retry_delay: std::time::Duration::from_secs(60),
      },
      SyncTask {
        tag: "contact-form-sync".to_string(),
        store: StoreName::Forms,
        endpoint: config.forms_endpoint.clone(),
        max_retries: 5,
        retry_delay: std::time::Duration::from_secs(120),
      },
    ];

    Ok(Self {
      version: config.version.clone(),
      origin,
      partitions,
      shell_assets,
      offline_page,
      offline_assets,
      allowed_origins: config.allowed_origins.clone(),
      sync_tasks,
    })
  }

  pub fn partition(&self, kind: PartitionKind) -> &Partition {
    // ALL covers every kind, so the lookup cannot miss
    self
      .partitions
      .iter()
      .find(|p| p.kind == kind)
      .unwrap_or(&self.partitions[0])
  }

  pub fn partitions(&self) -> &[Partition] {
    &self.partitions
  }

  pub fn sync_task(&self, tag: &str) -> Option<&SyncTask> {
    self.sync_tasks.iter().find(|t| t.tag == tag)
  }

  /// Whether `url` exactly matches a precached app-shell asset.
  pub fn is_shell_asset(&self, url: &Url) -> bool {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    self.shell_assets.iter().any(|a| *a == normalized)
  }

  pub fn same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }

  /// Whether a cross-origin host is on the storage allow-list.
  pub fn allows_origin(&self, url: &Url) -> bool {
    url
      .host_str()
      .map(|h| self.allowed_origins.iter().any(|a| a == h))
      .unwrap_or(false)
  }
}

#[cfg(test)]
pub(crate) fn test_registry(version: &str) -> Registry {
  Registry::from_config(&Config::for_tests(version)).unwrap()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partition_names_carry_version() {
    let registry = test_registry("v3");
    assert_eq!(registry.partition(PartitionKind::Static).name, "shelf-static-v3");
    assert_eq!(registry.partition(PartitionKind::Shell).name, "shelf-shell-v3");
    assert_eq!(registry.partitions().len(), 6);
  }

  #[test]
  fn test_shell_asset_match_ignores_fragment() {
    let registry = test_registry("v1");
    let url = Url::parse("https://app.example/index.html#top").unwrap();
    assert!(registry.is_shell_asset(&url));
    let other = Url::parse("https://app.example/other.html").unwrap();
    assert!(!registry.is_shell_asset(&other));
  }

  #[test]
  fn test_sync_task_lookup() {
    let registry = test_registry("v1");
    let task = registry.sync_task("analytics-sync").unwrap();
    assert_eq!(task.store, StoreName::Analytics);
    assert_eq!(task.endpoint, "/api/analytics");
    assert!(registry.sync_task("bogus-sync").is_none());
  }

  #[test]
  fn test_origin_checks() {
    let registry = test_registry("v1");
    let same = Url::parse("https://app.example/api/data").unwrap();
    assert!(registry.same_origin(&same));
    let font = Url::parse("https://fonts.gstatic.com/s/roboto.woff2").unwrap();
    assert!(!registry.same_origin(&font));
    assert!(registry.allows_origin(&font));
    let rogue = Url::parse("https://tracker.example/pixel.gif").unwrap();
    assert!(!registry.allows_origin(&rogue));
  }

  #[test]
  fn test_offline_assets_include_page() {
    let registry = test_registry("v1");
    assert!(registry.offline_assets.contains(&registry.offline_page));
    assert_eq!(registry.offline_assets.len(), 2);
  }
}
