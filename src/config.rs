//! Layered runtime configuration.
//!
//! Precedence: defaults < `planroom.toml` < `PLANROOM_*` environment
//! variables < command-line flags (applied by the CLI layer). Provider API
//! keys stay in their own conventional variables (`OPENAI_API_KEY`,
//! `ANTHROPIC_API_KEY`) and are read by the engine, not here.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PlanroomError, Result};
use crate::providers::Provider;

/// Default TOML config filename, looked up in the working directory.
pub const CONFIG_FILE: &str = "planroom.toml";

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP service binds.
    pub port: u16,
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Agent pipeline backend.
    pub provider: Provider,
    /// Model override; provider default when None.
    pub model: Option<String>,
    /// Base URL the client/console modes talk to.
    pub server_url: String,
    /// Synchronizer polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Sessions idle longer than this are swept inactive.
    pub session_idle_secs: i64,
    /// How often the server-side sweeper runs.
    pub sweep_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 8000,
            db_path: PathBuf::from("planroom.sqlite"),
            provider: Provider::Openai,
            model: None,
            server_url: "http://localhost:8000".to_string(),
            poll_interval_ms: 500,
            session_idle_secs: 1_800,
            sweep_interval_secs: 300,
        }
    }
}

/// Optional-field mirror of [`Config`] for the TOML file.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    port: Option<u16>,
    db_path: Option<PathBuf>,
    provider: Option<String>,
    model: Option<String>,
    server_url: Option<String>,
    poll_interval_ms: Option<u64>,
    session_idle_secs: Option<i64>,
    sweep_interval_secs: Option<u64>,
}

impl Config {
    /// Load configuration: defaults, then `planroom.toml` if present, then
    /// the process environment.
    pub fn load() -> Result<Self> {
        let mut cfg = Config::default();
        if Path::new(CONFIG_FILE).exists() {
            cfg.apply_file(Path::new(CONFIG_FILE))?;
        }
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    /// Merge a TOML file into this config.
    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)?;
        let file: FileConfig = toml::from_str(&raw)
            .map_err(|e| PlanroomError::Config(format!("{}: {}", path.display(), e)))?;
        if let Some(port) = file.port {
            self.port = port;
        }
        if let Some(db_path) = file.db_path {
            self.db_path = db_path;
        }
        if let Some(provider) = file.provider {
            self.provider = Provider::from_str_loose(&provider).map_err(PlanroomError::Config)?;
        }
        if file.model.is_some() {
            self.model = file.model;
        }
        if let Some(server_url) = file.server_url {
            self.server_url = server_url;
        }
        if let Some(ms) = file.poll_interval_ms {
            self.poll_interval_ms = ms;
        }
        if let Some(secs) = file.session_idle_secs {
            self.session_idle_secs = secs;
        }
        if let Some(secs) = file.sweep_interval_secs {
            self.sweep_interval_secs = secs;
        }
        Ok(())
    }

    /// Merge `PLANROOM_*` overrides via a lookup function (the process
    /// environment in production, a map in tests).
    pub fn apply_overrides<F>(&mut self, get: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = get("PLANROOM_PORT") {
            self.port = v
                .parse()
                .map_err(|_| PlanroomError::Config(format!("PLANROOM_PORT: invalid port {v:?}")))?;
        }
        if let Some(v) = get("PLANROOM_DB") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("PLANROOM_PROVIDER") {
            self.provider = Provider::from_str_loose(&v).map_err(PlanroomError::Config)?;
        }
        if let Some(v) = get("PLANROOM_MODEL") {
            self.model = Some(v);
        }
        if let Some(v) = get("PLANROOM_SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = get("PLANROOM_POLL_INTERVAL_MS") {
            self.poll_interval_ms = v.parse().map_err(|_| {
                PlanroomError::Config(format!("PLANROOM_POLL_INTERVAL_MS: invalid value {v:?}"))
            })?;
        }
        if let Some(v) = get("PLANROOM_SESSION_IDLE_SECS") {
            self.session_idle_secs = v.parse().map_err(|_| {
                PlanroomError::Config(format!("PLANROOM_SESSION_IDLE_SECS: invalid value {v:?}"))
            })?;
        }
        // Mock toggle: any truthy value switches the pipeline offline.
        if let Some(v) = get("PLANROOM_MOCK") {
            if v == "1" || v.eq_ignore_ascii_case("true") {
                self.provider = Provider::Mock;
            }
        }
        Ok(())
    }

    /// Model to use, falling back to the provider default.
    pub fn resolved_model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.poll_interval_ms, 500);
        assert_eq!(cfg.session_idle_secs, 1_800);
        assert_eq!(cfg.provider, Provider::Openai);
        assert_eq!(cfg.server_url, "http://localhost:8000");
    }

    #[test]
    fn test_env_overrides_apply() {
        let mut cfg = Config::default();
        cfg.apply_overrides(overrides(&[
            ("PLANROOM_PORT", "9100"),
            ("PLANROOM_DB", "/tmp/x.sqlite"),
            ("PLANROOM_PROVIDER", "anthropic"),
            ("PLANROOM_POLL_INTERVAL_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/x.sqlite"));
        assert_eq!(cfg.provider, Provider::Anthropic);
        assert_eq!(cfg.poll_interval_ms, 250);
    }

    #[test]
    fn test_mock_toggle_wins_over_provider() {
        let mut cfg = Config::default();
        cfg.apply_overrides(overrides(&[
            ("PLANROOM_PROVIDER", "openai"),
            ("PLANROOM_MOCK", "1"),
        ]))
        .unwrap();
        assert_eq!(cfg.provider, Provider::Mock);
    }

    #[test]
    fn test_mock_toggle_accepts_true() {
        let mut cfg = Config::default();
        cfg.apply_overrides(overrides(&[("PLANROOM_MOCK", "TRUE")])).unwrap();
        assert_eq!(cfg.provider, Provider::Mock);
    }

    #[test]
    fn test_invalid_port_is_config_error() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_overrides(overrides(&[("PLANROOM_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(matches!(err, PlanroomError::Config(_)));
    }

    #[test]
    fn test_invalid_provider_is_config_error() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_overrides(overrides(&[("PLANROOM_PROVIDER", "watson")]))
            .unwrap_err();
        assert!(matches!(err, PlanroomError::Config(_)));
    }

    #[test]
    fn test_apply_file_merges_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("planroom.toml");
        std::fs::write(
            &path,
            "port = 8080\nprovider = \"mock\"\npoll_interval_ms = 1000\n",
        )
        .unwrap();
        let mut cfg = Config::default();
        cfg.apply_file(&path).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.provider, Provider::Mock);
        assert_eq!(cfg.poll_interval_ms, 1000);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.session_idle_secs, 1_800);
    }

    #[test]
    fn test_apply_file_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "port = [[[").unwrap();
        let mut cfg = Config::default();
        assert!(matches!(
            cfg.apply_file(&path).unwrap_err(),
            PlanroomError::Config(_)
        ));
    }

    #[test]
    fn test_resolved_model_falls_back_to_provider_default() {
        let cfg = Config::default();
        assert_eq!(cfg.resolved_model(), "gpt-4o");
        let cfg = Config {
            model: Some("gpt-4o-mini".to_string()),
            ..Config::default()
        };
        assert_eq!(cfg.resolved_model(), "gpt-4o-mini");
    }
}
