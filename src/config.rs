use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use serde_yaml;
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "outsourcer")]
#[command(about = "Serves a site with its custom CSS as an external stylesheet", long_about = None)]
pub struct Cli {
    #[arg(short = 'c', long = "config")]
    pub config_path: Option<String>,
}

pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".outsourcer")
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.yaml")
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct App {
    database: String,
    port: i32,
    #[serde(default)]
    pub turso_url: Option<String>,
    #[serde(default)]
    pub turso_auth_token: Option<String>,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_seconds: u64,
}

fn default_sync_interval() -> u64 {
    60
}

impl App {
    pub fn get_db(&self) -> &str {
        return &self.database;
    }

    pub fn get_port(&self) -> i32 {
        return self.port;
    }
}

/// How the site builds and parses its URLs.
#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Permalinks {
    /// Query-string URLs only, rewrite rules are never consulted.
    Plain,
    #[default]
    Pretty,
    /// Pretty URLs behind an `index.php/` segment.
    Index,
}

impl Permalinks {
    pub fn using_rewrite_rules(&self) -> bool {
        !matches!(self, Permalinks::Plain)
    }

    pub fn using_index_permalinks(&self) -> bool {
        matches!(self, Permalinks::Index)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Site {
    pub url: String,
    pub theme: String,
    #[serde(default = "default_host_version")]
    pub host_version: String,
    #[serde(default)]
    pub permalinks: Permalinks,
    #[serde(default = "default_trailing_slash")]
    pub trailing_slash: bool,
}

fn default_host_version() -> String {
    crate::site::HOST_VERSION.to_string()
}

fn default_trailing_slash() -> bool {
    true
}

impl Site {
    /// Site URL without a trailing slash.
    pub fn home_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    /// Path component of the site URL, e.g. `/blog` for `http://example.com/blog`.
    pub fn base_path(&self) -> &str {
        let home = self.home_url();
        let after_scheme = home.find("://").map(|i| &home[i + 3..]).unwrap_or(home);
        match after_scheme.find('/') {
            Some(i) => &after_scheme[i..],
            None => "",
        }
    }
}

impl Default for Site {
    fn default() -> Self {
        Site {
            url: "http://localhost:8080".to_string(),
            theme: "twentyseventeen".to_string(),
            host_version: default_host_version(),
            permalinks: Permalinks::default(),
            trailing_slash: default_trailing_slash(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Plugin {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for Plugin {
    fn default() -> Self {
        Plugin { enabled: true }
    }
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub site: Site,
    #[serde(default)]
    pub plugin: Plugin,
}

impl Config {
    pub fn new(path: &str) -> Result<Self> {
        let cfg = Config::load_config(path)?;
        Ok(cfg)
    }

    pub fn from_yaml(yaml_str: &str) -> Result<Self> {
        let yaml_with_env = Config::substitute_env_vars(yaml_str)?;
        let config: Config = serde_yaml::from_str(&yaml_with_env)?;
        Ok(config)
    }

    fn load_config(path: &str) -> Result<Config> {
        let yaml_str = fs::read_to_string(path)?;
        Config::from_yaml(&yaml_str)
    }

    fn substitute_env_vars(yaml_str: &str) -> Result<String> {
        let mut result = yaml_str.to_string();
        let mut offset = 0;

        while let Some(start) = result[offset..].find("${") {
            let actual_start = offset + start;
            if let Some(end) = result[actual_start..].find("}") {
                let var_name = &result[actual_start + 2..actual_start + end];

                // ${VAR:-default}
                let env_value = if let Some(default_start) = var_name.find(":-") {
                    let actual_var = &var_name[..default_start];
                    let default_val = &var_name[default_start + 2..];
                    env::var(actual_var).unwrap_or_else(|_| default_val.to_string())
                } else {
                    env::var(var_name).unwrap_or_else(|_| {
                        tracing::warn!(var = %var_name, "environment variable not found");
                        String::new()
                    })
                };

                result.replace_range(actual_start..actual_start + end + 1, &env_value);
                offset = actual_start + env_value.len();
            } else {
                break;
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitutes_defaults() {
        let yaml = r#"
app:
  database: ${OUTSOURCER_TEST_UNSET_DB:-site.db}
  port: 8080
site:
  url: http://example.com/blog/
  theme: mytheme
  permalinks: index
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert_eq!(cfg.app.get_db(), "site.db");
        assert_eq!(cfg.app.get_port(), 8080);
        assert_eq!(cfg.site.permalinks, Permalinks::Index);
        assert!(cfg.site.trailing_slash);
        assert!(cfg.plugin.enabled);
    }

    #[test]
    fn test_site_paths() {
        let mut site = Site::default();
        site.url = "http://example.com/blog/".to_string();
        assert_eq!(site.home_url(), "http://example.com/blog");
        assert_eq!(site.base_path(), "/blog");

        site.url = "https://example.com".to_string();
        assert_eq!(site.base_path(), "");
    }
}
