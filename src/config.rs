use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::resource::ResourceOptions;

/// Environment variable holding the API token.
pub const TOKEN_ENV: &str = "RESCACHE_API_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub client: ClientConfig,
  /// Route name (`<namespace>:<name>-<endpoint>`) to path template
  #[serde(default)]
  pub routes: BTreeMap<String, String>,
  #[serde(default)]
  pub resources: Vec<ResourceOptions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
  /// Base URL every route path is joined onto
  pub base_url: String,
  /// Extra headers sent with every request
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
}

impl ClientConfig {
  /// Get the API token from the environment, if set.
  pub fn api_token() -> Option<String> {
    std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty())
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rescache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rescache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    match explicit_path {
      Some(p) if !p.exists() => Err(eyre!("Config file not found: {}", p.display())),
      Some(p) => Self::load_from_path(p),
      None => {
        let path = Self::find_config_file().ok_or_else(|| {
          eyre!(
            "No configuration file found. Create ./rescache.yaml or ~/.config/rescache/config.yaml \
             with a `client.base_url`, a `routes` table and a `resources` list"
          )
        })?;
        Self::load_from_path(&path)
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("rescache.yaml");
    let user = dirs::config_dir().map(|dir| dir.join("rescache").join("config.yaml"));
    std::iter::once(local).chain(user).find(|path| path.exists())
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Cannot read rescache config {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid rescache config {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Options of a configured resource by name.
  pub fn resource(&self, name: &str) -> Option<&ResourceOptions> {
    self.resources.iter().find(|r| r.name == name)
  }
}
