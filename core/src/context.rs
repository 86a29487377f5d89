//! Process-wide runtime state, passed explicitly instead of living in
//! globals: configuration, secrets, the session store, the event bus, the
//! access grant, the applier with its undo stack, and the user-interaction
//! handle.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;

use pilot_protocol::EventPhase;
use pilot_protocol::EventStatus;
use pilot_protocol::ExecutionEvent;

use crate::access::AccessMode;
use crate::access::PathDecision;
use crate::access::SessionAccessGrant;
use crate::client::HttpProvider;
use crate::command_runner::CommandRunner;
use crate::config::ConfigShape;
use crate::config::LOCAL_PROVIDER;
use crate::diff_log::DiffLog;
use crate::error::AgentErr;
use crate::error::Result;
use crate::event_bus::EventBus;
use crate::interact::GrantChoice;
use crate::interact::UserInteraction;
use crate::provider::ModelProvider;
use crate::secrets::SecretStore;
use crate::session::SessionStore;
use crate::tools::terminal::TerminalRegistry;

const DEFAULT_SESSION: &str = "default";

/// Result of an access check over a set of paths.
#[derive(Debug, Default)]
pub struct AccessOutcome {
    pub allowed: Vec<PathBuf>,
    pub denied: Vec<PathBuf>,
}

impl AccessOutcome {
    pub fn all_allowed(&self) -> bool {
        self.denied.is_empty()
    }
}

pub struct RuntimeContext {
    pub home: PathBuf,
    pub cwd: PathBuf,
    pub config: RwLock<ConfigShape>,
    pub secrets: RwLock<SecretStore>,
    pub bus: Arc<EventBus>,
    pub access: tokio::sync::Mutex<SessionAccessGrant>,
    pub applier: tokio::sync::Mutex<pilot_apply::Applier>,
    pub diff_log: DiffLog,
    pub runner: CommandRunner,
    pub sessions: SessionStore,
    pub terminals: TerminalRegistry,
    pub interaction: Arc<dyn UserInteraction>,
    pub http: reqwest::Client,
    session_name: RwLock<String>,
}

impl RuntimeContext {
    /// Load persisted state from `home` and assemble the context. Applies
    /// env-bridge overrides when the flag is on.
    pub fn new(home: &Path, interaction: Arc<dyn UserInteraction>) -> Result<Self> {
        let mut config = ConfigShape::load(home)?;
        config.apply_env_overrides();
        let mut secrets = SecretStore::load(home)?;
        if config.flags.env_bridge_enabled {
            secrets.apply_env_overrides(config.providers.keys().map(String::as_str));
        }

        let sessions = SessionStore::new(home);
        let session_name = sessions
            .active_session_name()
            .filter(|_| config.flags.auto_reload_session)
            .unwrap_or_else(|| DEFAULT_SESSION.to_string());

        let bus = Arc::new(EventBus::new());
        Ok(Self {
            home: home.to_path_buf(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            config: RwLock::new(config),
            secrets: RwLock::new(secrets),
            runner: CommandRunner::new(Arc::clone(&bus), home),
            diff_log: DiffLog::new(home),
            bus,
            access: tokio::sync::Mutex::new(SessionAccessGrant::default()),
            applier: tokio::sync::Mutex::new(pilot_apply::Applier::new()),
            sessions,
            terminals: TerminalRegistry::new(),
            interaction,
            http: crate::tools::web::search_client(),
            session_name: RwLock::new(session_name),
        })
    }

    pub fn session_name(&self) -> String {
        self.session_name
            .read()
            .map(|name| name.clone())
            .unwrap_or_else(|_| DEFAULT_SESSION.to_string())
    }

    pub fn set_session_name(&self, name: &str) -> Result<()> {
        if let Ok(mut slot) = self.session_name.write() {
            *slot = name.to_string();
        }
        self.sessions.set_active(name)
    }

    /// Snapshot of the current configuration.
    pub fn config_snapshot(&self) -> ConfigShape {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn update_config<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut ConfigShape),
    {
        let mut config = self
            .config
            .write()
            .map_err(|_| AgentErr::Config("config lock poisoned".to_string()))?;
        mutate(&mut config);
        config.save(&self.home)
    }

    /// Build the active provider adapter from config + secrets.
    pub fn provider(&self) -> Result<Arc<dyn ModelProvider>> {
        let config = self.config_snapshot();
        let name = config.active_provider.clone();
        let provider_config = config
            .providers
            .get(&name)
            .cloned()
            .ok_or_else(|| AgentErr::UnknownProvider(name.clone()))?;
        let api_key = self
            .secrets
            .read()
            .ok()
            .and_then(|s| s.get(&name).map(str::to_string));
        if api_key.is_none() && name != LOCAL_PROVIDER {
            return Err(AgentErr::MissingApiKey(name));
        }
        Ok(Arc::new(HttpProvider::new(name, provider_config, api_key)))
    }

    /// Consult (and, on first use, establish) the access grant for `paths`.
    /// Newly denied paths and pre-existing denylist entries come back in
    /// `denied`; an error event is emitted for each.
    pub async fn ensure_session_access_for_paths(
        &self,
        paths: &[PathBuf],
        reason: &str,
    ) -> Result<AccessOutcome> {
        let mut grant = self.access.lock().await;

        if grant.mode() == AccessMode::Unknown && !paths.is_empty() {
            let choice = self
                .interaction
                .choose_grant(&format!(
                    "The agent needs file access ({reason}). Grant full access, approve paths selectively, or refuse?"
                ))
                .await?;
            match choice {
                GrantChoice::Full => grant.set_full(),
                GrantChoice::Selective => grant.set_selective(),
                GrantChoice::Refused => {
                    let mut outcome = AccessOutcome::default();
                    for path in paths {
                        self.emit_denied(path);
                        outcome.denied.push(path.clone());
                    }
                    return Ok(outcome);
                }
            }
        }

        let mut outcome = AccessOutcome::default();
        for path in paths {
            match grant.decision(path) {
                PathDecision::Allowed => outcome.allowed.push(path.clone()),
                PathDecision::Denied => {
                    self.emit_denied(path);
                    outcome.denied.push(path.clone());
                }
                PathDecision::NeedsApproval => {
                    let approved = self
                        .interaction
                        .confirm(&format!("Allow access to {} ({reason})?", path.display()))
                        .await?;
                    if approved {
                        grant.allow(path);
                        outcome.allowed.push(path.clone());
                    } else {
                        grant.deny(path);
                        self.emit_denied(path);
                        outcome.denied.push(path.clone());
                    }
                }
                PathDecision::NeedsGrant => {
                    // Unreachable after the prompt above; treat as denied.
                    self.emit_denied(path);
                    outcome.denied.push(path.clone());
                }
            }
        }
        Ok(outcome)
    }

    fn emit_denied(&self, path: &Path) {
        self.bus.emit(
            ExecutionEvent::new(
                EventPhase::Error,
                EventStatus::End,
                format!("File access denied by session policy: {}", path.display()),
            )
            .with_file(path.to_string_lossy()),
        );
    }
}
