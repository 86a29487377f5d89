//! Typed, persisted user configuration.
//!
//! The config lives at `<agent-home>/agent.config.json` as 2-space JSON.
//! Every field has a serde default so older files keep loading after new
//! fields are added. Writes are atomic (temp file + rename). When the env
//! bridge is enabled, a project-root `.env` is loaded once and `AGENT_*` /
//! `<PROV>_*` variables override the persisted values for this process.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::AgentErr;
use crate::error::Result;

pub const LOCAL_PROVIDER: &str = "local";

const CONFIG_FILENAME: &str = "agent.config.json";

/// Resolve the per-user agent home directory: `$AGENT_HOME` when set,
/// otherwise the platform config dir (Roaming on Windows, Application
/// Support on macOS, XDG config on Linux) plus `pilot`.
pub fn agent_home() -> PathBuf {
    if let Ok(home) = std::env::var("AGENT_HOME")
        && !home.trim().is_empty()
    {
        return PathBuf::from(home);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pilot")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPolicy {
    #[default]
    Ask,
    Always,
    Never,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_output_tokens: Option<u64>,
    /// Context window used by the auto-compact threshold.
    pub context_window: u64,
    pub stream: bool,
    pub stream_print: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/v1".to_string(),
            model: "qwen2.5-coder".to_string(),
            temperature: None,
            top_p: None,
            max_output_tokens: None,
            context_window: 32_768,
            stream: true,
            stream_print: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Flags {
    pub planning_mode: bool,
    pub fast_mode: bool,
    pub mission_mode: bool,
    pub voice_mode: bool,
    pub see_project_mode: bool,
    pub newline_support: bool,
    pub web_browsing_allowed: bool,
    pub auto_reload_session: bool,
    pub env_bridge_enabled: bool,
    pub command_log_enabled: bool,
    pub strict_edit_requires_full_access: bool,
    pub stream: bool,
    pub stream_print: bool,
    pub mcp_enabled: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            planning_mode: false,
            fast_mode: false,
            mission_mode: false,
            voice_mode: false,
            see_project_mode: false,
            newline_support: true,
            web_browsing_allowed: true,
            auto_reload_session: true,
            env_bridge_enabled: true,
            command_log_enabled: true,
            strict_edit_requires_full_access: false,
            stream: true,
            stream_print: true,
            mcp_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Policies {
    pub run_policy: RunPolicy,
    pub effort_level: Option<String>,
    pub reasoning_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Numerics {
    pub stream_timeout_ms: u64,
    pub stream_retry_count: u32,
    pub stream_render_fps: u32,
    /// 0 means unlimited.
    pub command_timeout_ms: u64,
    /// Total token budget for a session; 0 disables the gate.
    pub max_budget: u64,
    pub auto_compact_threshold_pct: u8,
    pub auto_compact_keep_recent_turns: usize,
    pub mission_max_steps: u64,
    pub mission_idle_limit: u32,
}

impl Default for Numerics {
    fn default() -> Self {
        Self {
            stream_timeout_ms: 120_000,
            stream_retry_count: 2,
            stream_render_fps: 12,
            command_timeout_ms: 60_000,
            max_budget: 0,
            auto_compact_threshold_pct: 80,
            auto_compact_keep_recent_turns: 8,
            mission_max_steps: 5_000,
            mission_idle_limit: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigShape {
    pub active_provider: String,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub flags: Flags,
    pub policies: Policies,
    pub numerics: Numerics,
    pub theme: String,
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
    /// Shell command invoked by the lint tool; empty disables linting.
    pub lint_command: String,
}

impl Default for ConfigShape {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(LOCAL_PROVIDER.to_string(), ProviderConfig::default());
        Self {
            active_provider: LOCAL_PROVIDER.to_string(),
            providers,
            flags: Flags::default(),
            policies: Policies::default(),
            numerics: Numerics::default(),
            theme: "dark".to_string(),
            mcp_servers: BTreeMap::new(),
            lint_command: String::new(),
        }
    }
}

impl ConfigShape {
    /// Load from `<home>/agent.config.json`, falling back to defaults when
    /// the file is missing. A file that exists but fails to parse is an
    /// error so a typo does not silently reset the configuration.
    pub fn load(home: &Path) -> Result<Self> {
        let path = home.join(CONFIG_FILENAME);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let mut config: ConfigShape = serde_json::from_str(&text)
            .map_err(|e| AgentErr::Config(format!("invalid {}: {e}", path.display())))?;
        config.ensure_active_provider();
        Ok(config)
    }

    /// Atomically persist as 2-space JSON. Endpoint hosts that are IP
    /// literals are rewritten to `localhost` first.
    pub fn save(&mut self, home: &Path) -> Result<()> {
        self.ensure_active_provider();
        for provider in self.providers.values_mut() {
            provider.endpoint = rewrite_ip_endpoint(&provider.endpoint);
        }

        std::fs::create_dir_all(home)?;
        let path = home.join(CONFIG_FILENAME);
        let text = serde_json::to_string_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(home)?;
        tmp.write_all(text.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.persist(&path).map_err(|e| AgentErr::Io(e.error))?;
        Ok(())
    }

    /// `active_provider` must always name a configured provider; fall back
    /// to the designated local provider otherwise.
    fn ensure_active_provider(&mut self) {
        if !self.providers.contains_key(&self.active_provider) {
            self.providers
                .entry(LOCAL_PROVIDER.to_string())
                .or_default();
            self.active_provider = LOCAL_PROVIDER.to_string();
        }
    }

    pub fn active(&self) -> &ProviderConfig {
        // ensure_active_provider keeps this key present.
        self.providers
            .get(&self.active_provider)
            .unwrap_or_else(|| {
                static FALLBACK: std::sync::OnceLock<ProviderConfig> = std::sync::OnceLock::new();
                FALLBACK.get_or_init(ProviderConfig::default)
            })
    }

    /// Read `.env` from the working directory (once) and apply `AGENT_*`
    /// plus per-provider `<PROV>_MODEL` / `<PROV>_ENDPOINT` overrides.
    pub fn apply_env_overrides(&mut self) {
        if !self.flags.env_bridge_enabled {
            return;
        }
        // Missing .env is fine; only this process' environment is touched.
        let _ = dotenvy::from_path(Path::new(".env"));

        if let Some(provider) = env_string("AGENT_PROVIDER") {
            self.active_provider = provider;
            self.ensure_active_provider();
        }
        if let Some(value) = env_parse::<u64>("AGENT_MAX_BUDGET") {
            self.numerics.max_budget = value;
        }
        if let Some(policy) = env_string("AGENT_RUN_POLICY") {
            match policy.to_ascii_lowercase().as_str() {
                "ask" => self.policies.run_policy = RunPolicy::Ask,
                "always" => self.policies.run_policy = RunPolicy::Always,
                "never" => self.policies.run_policy = RunPolicy::Never,
                other => tracing::warn!("ignoring unknown AGENT_RUN_POLICY `{other}`"),
            }
        }
        if let Some(value) = env_parse::<u64>("AGENT_STREAM_TIMEOUT_MS") {
            self.numerics.stream_timeout_ms = value;
        }
        if let Some(value) = env_parse::<u32>("AGENT_STREAM_RETRY_COUNT") {
            self.numerics.stream_retry_count = value;
        }
        if let Some(value) = env_parse::<u32>("AGENT_STREAM_RENDER_FPS") {
            self.numerics.stream_render_fps = value;
        }
        if let Some(value) = env_parse::<u64>("AGENT_COMMAND_TIMEOUT_MS") {
            self.numerics.command_timeout_ms = value;
        }
        if let Some(value) = env_bool("AGENT_COMMAND_LOG_ENABLED") {
            self.flags.command_log_enabled = value;
        }
        if let Some(value) = env_bool("AGENT_STRICT_EDIT_REQUIRES_FULL_ACCESS") {
            self.flags.strict_edit_requires_full_access = value;
        }

        let names: Vec<String> = self.providers.keys().cloned().collect();
        for name in names {
            let prefix = name.to_ascii_uppercase().replace('-', "_");
            if let Some(model) = env_string(&format!("{prefix}_MODEL"))
                && let Some(provider) = self.providers.get_mut(&name)
            {
                provider.model = model;
            }
            if let Some(endpoint) = env_string(&format!("{prefix}_ENDPOINT"))
                && let Some(provider) = self.providers.get_mut(&name)
            {
                provider.endpoint = endpoint;
            }
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// `http://127.0.0.1:8080/v1` and friends persist as `localhost` so configs
/// stay portable across machines and container restarts.
fn rewrite_ip_endpoint(endpoint: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(endpoint) else {
        return endpoint.to_string();
    };
    let is_ip = matches!(
        parsed.host(),
        Some(url::Host::Ipv4(_)) | Some(url::Host::Ipv6(_))
    );
    if is_ip && parsed.set_host(Some("localhost")).is_ok() {
        let mut text = parsed.to_string();
        // Url prints a trailing slash for an empty path; keep the original shape.
        if !endpoint.ends_with('/') && text.ends_with('/') {
            text.pop();
        }
        return text;
    }
    endpoint.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_include_the_local_provider() {
        let config = ConfigShape::default();
        assert_eq!(config.active_provider, LOCAL_PROVIDER);
        assert!(config.providers.contains_key(LOCAL_PROVIDER));
    }

    #[test]
    fn unknown_active_provider_falls_back_to_local() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = ConfigShape::default();
        config.active_provider = "gone".to_string();
        config.save(dir.path()).expect("save");

        let loaded = ConfigShape::load(dir.path()).expect("load");
        assert_eq!(loaded.active_provider, LOCAL_PROVIDER);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = ConfigShape::default();
        config.numerics.max_budget = 123_456;
        config.theme = "light".to_string();
        config.save(dir.path()).expect("save");

        let loaded = ConfigShape::load(dir.path()).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn ip_endpoints_are_rewritten_to_localhost_on_save() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = ConfigShape::default();
        if let Some(provider) = config.providers.get_mut(LOCAL_PROVIDER) {
            provider.endpoint = "http://192.168.1.20:11434/v1".to_string();
        }
        config.save(dir.path()).expect("save");
        assert_eq!(config.active().endpoint, "http://localhost:11434/v1");
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ConfigShape::load(dir.path()).expect("load");
        assert_eq!(config, ConfigShape::default());
    }
}
