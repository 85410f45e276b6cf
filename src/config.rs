use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the gateway fronts, e.g. "https://app.example.com"
  pub upstream: String,
  /// Address the gateway listens on
  #[serde(default = "default_listen")]
  pub listen: SocketAddr,
  /// Cache version; bumping it rolls every partition over on activation
  #[serde(default = "default_version")]
  pub version: String,
  /// App-shell paths precached during install
  #[serde(default = "default_shell_assets")]
  pub shell_assets: Vec<String>,
  /// Page served to navigations when both network and cache come up empty
  #[serde(default = "default_offline_page")]
  pub offline_page: String,
  /// Extra assets precached alongside the offline page
  #[serde(default)]
  pub offline_assets: Vec<String>,
  /// Cross-origin hosts whose responses may be stored
  #[serde(default = "default_allowed_origins")]
  pub allowed_origins: Vec<String>,
  /// Endpoint drained by the analytics sync task
  #[serde(default = "default_analytics_endpoint")]
  pub analytics_endpoint: String,
  /// Endpoint drained by the contact-form sync task
  #[serde(default = "default_forms_endpoint")]
  pub forms_endpoint: String,
  /// Minutes between periodic cache-cleanup passes
  #[serde(default = "default_cleanup_interval")]
  pub cleanup_interval_mins: u64,
}

fn default_listen() -> SocketAddr {
  ([127, 0, 0, 1], 8787).into()
}

fn default_version() -> String {
  "v1".to_string()
}

fn default_shell_assets() -> Vec<String> {
  ["/", "/index.html", "/manifest.json"]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_offline_page() -> String {
  "/offline.html".to_string()
}

fn default_allowed_origins() -> Vec<String> {
  [
    "fonts.googleapis.com",
    "fonts.gstatic.com",
    "cdnjs.cloudflare.com",
    "cdn.jsdelivr.net",
  ]
  .iter()
  .map(|s| s.to_string())
  .collect()
}

fn default_analytics_endpoint() -> String {
  "/api/analytics".to_string()
}

fn default_forms_endpoint() -> String {
  "/api/contact".to_string()
}

fn default_cleanup_interval() -> u64 {
  60
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shelf.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shelf/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/shelf/config.yaml\n\
                 See shelf.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shelf.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shelf").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }
}

/// Directory holding the cache and outbox databases plus logs.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("shelf"))
}

#[cfg(test)]
impl Config {
  pub(crate) fn for_tests(version: &str) -> Self {
    Config {
      upstream: "https://app.example".to_string(),
      listen: default_listen(),
      version: version.to_string(),
      shell_assets: default_shell_assets(),
      offline_page: default_offline_page(),
      offline_assets: vec!["/icons/offline.svg".to_string()],
      allowed_origins: default_allowed_origins(),
      analytics_endpoint: default_analytics_endpoint(),
      forms_endpoint: default_forms_endpoint(),
      cleanup_interval_mins: default_cleanup_interval(),
    }
  }
}
