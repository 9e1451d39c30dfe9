//! Mount configuration and the server-side config document.
//!
//! Settings resolve in three layers: built-in defaults, then the enlistment's
//! `.gvfs/config.dat` key=value file, then `GVFS_*` environment variables.
//! The server config JSON comes from `GET /gvfs/config` and is deserialized
//! as-is.

use std::{collections::HashMap, fs, path::Path};

use serde::{Deserialize, Serialize};

/// Tunables for one mounted enlistment.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MountConfig {
    /// HTTP attempts per request, first try included.
    pub max_attempts: u32,
    /// Per-attempt HTTP timeout.
    pub timeout_seconds: u64,
    /// How long the object cache waits to coalesce misses into one batch.
    pub batch_window_ms: u64,
    /// Backoff before re-reading a freshly written status cache.
    pub status_cache_backoff_ms: u64,
    /// Preferred cache server; falls back to the origin object endpoint.
    pub cache_server_url: Option<String>,
    /// Passed to `multi-pack-index repack --batch-size=`.
    pub repack_batch_size: String,
    /// Suppresses anything interactive (set on build agents).
    pub unattended: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            timeout_seconds: 30,
            batch_window_ms: 50,
            status_cache_backoff_ms: 2000,
            cache_server_url: None,
            repack_batch_size: "2g".to_string(),
            unattended: false,
        }
    }
}

impl MountConfig {
    /// Resolve configuration: defaults, then `config.dat`, then environment.
    pub fn load(config_dat: &Path) -> MountConfig {
        let mut config = MountConfig::default();
        if let Ok(contents) = fs::read_to_string(config_dat) {
            config.apply_pairs(parse_dat(&contents));
        }
        let env: HashMap<String, String> = std::env::vars()
            .filter_map(|(k, v)| {
                k.strip_prefix("GVFS_")
                    .map(|key| (key.to_ascii_lowercase(), v))
            })
            .collect();
        config.apply_pairs(env);
        config
    }

    fn apply_pairs(&mut self, pairs: HashMap<String, String>) {
        for (key, value) in pairs {
            match key.as_str() {
                "max_attempts" | "maxretries" => {
                    if let Ok(v) = value.parse() {
                        self.max_attempts = v;
                    }
                }
                "timeout_seconds" | "timeoutseconds" => {
                    if let Ok(v) = value.parse() {
                        self.timeout_seconds = v;
                    }
                }
                "batch_window_ms" => {
                    if let Ok(v) = value.parse() {
                        self.batch_window_ms = v;
                    }
                }
                "status_cache_backoff_ms" | "statuscachebackoffms" => {
                    if let Ok(v) = value.parse() {
                        self.status_cache_backoff_ms = v;
                    }
                }
                "cache_server" | "cacheserverurl" => {
                    if !value.is_empty() {
                        self.cache_server_url = Some(value);
                    }
                }
                "repack_batch_size" => self.repack_batch_size = value,
                "unattended" => self.unattended = value == "1" || value == "true",
                _ => {}
            }
        }
    }
}

/// Parse the `.dat` key=value format: one pair per line, `#` comments,
/// whitespace-trimmed keys and values.
pub fn parse_dat(contents: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            out.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().to_string(),
            );
        }
    }
    out
}

/// Serialize pairs back into the `.dat` format with stable ordering.
pub fn write_dat(pairs: &HashMap<String, String>) -> String {
    let mut keys: Vec<_> = pairs.keys().collect();
    keys.sort();
    let mut out = String::new();
    for key in keys {
        out.push_str(key);
        out.push('=');
        out.push_str(&pairs[key]);
        out.push('\n');
    }
    out
}

/// One cache server advertised by `/gvfs/config`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CacheServerInfo {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub global_default: bool,
}

/// The document served by `GET /gvfs/config`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default)]
    pub allowed_gvfs_client_versions: Vec<String>,
    #[serde(default)]
    pub cache_servers: Vec<CacheServerInfo>,
}

impl ServerConfig {
    /// The cache server the service marks as default, if any.
    pub fn default_cache_server(&self) -> Option<&CacheServerInfo> {
        self.cache_servers
            .iter()
            .find(|server| server.global_default)
            .or_else(|| self.cache_servers.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Values in config.dat override the defaults; junk lines are skipped.
    #[test]
    fn test_load_from_dat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.dat");
        fs::write(
            &path,
            "# mount tuning\nmax_attempts = 3\ntimeout_seconds=10\ncache_server=https://cache.example.com\nbogus line without equals\nunattended=1\n",
        )
        .unwrap();
        let config = MountConfig::load(&path);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.timeout_seconds, 10);
        assert_eq!(
            config.cache_server_url.as_deref(),
            Some("https://cache.example.com")
        );
        assert!(config.unattended);
        // Untouched keys keep their defaults.
        assert_eq!(config.batch_window_ms, 50);
    }

    /// A missing file yields pure defaults.
    #[test]
    fn test_defaults_without_file() {
        let config = MountConfig::load(Path::new("/nonexistent/config.dat"));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.repack_batch_size, "2g");
        assert!(config.cache_server_url.is_none());
    }

    /// The dat format round-trips through write_dat/parse_dat.
    #[test]
    fn test_dat_round_trip() {
        let mut pairs = HashMap::new();
        pairs.insert("enlistment_id".to_string(), "abc-123".to_string());
        pairs.insert("layout_version".to_string(), "16".to_string());
        let text = write_dat(&pairs);
        assert_eq!(parse_dat(&text), pairs);
    }

    /// The server document deserializes from the wire shape.
    #[test]
    fn test_server_config_json() {
        let json = r#"{
            "allowedGvfsClientVersions": ["0.1", "1.0"],
            "cacheServers": [
                {"url": "https://east.example.com/gvfs", "name": "east", "globalDefault": false},
                {"url": "https://west.example.com/gvfs", "name": "west", "globalDefault": true}
            ]
        }"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cache_servers.len(), 2);
        assert_eq!(config.default_cache_server().unwrap().name, "west");

        let empty: ServerConfig = serde_json::from_str("{}").unwrap();
        assert!(empty.default_cache_server().is_none());
    }
}
