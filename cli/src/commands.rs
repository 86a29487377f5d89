//! The slash-command registry with closest-match suggestions.

use std::sync::Arc;

use pilot_core::CommandDispatch;
use pilot_core::CommandRegistry;
use pilot_core::RuntimeContext;

const COMMANDS: &[(&str, &str)] = &[
    ("/help", "list available commands"),
    ("/config", "show the active configuration"),
    ("/provider", "show or switch the active provider"),
    ("/session", "show or switch the current session"),
    ("/sessions", "list saved sessions"),
    ("/access", "show the file access grant"),
    ("/undo", "undo the last applied edit batch"),
    ("/history", "show recent execution events"),
    ("/quit", "exit the agent"),
];

pub struct Registry {
    ctx: Arc<RuntimeContext>,
}

impl Registry {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self { ctx }
    }

    fn help(&self) -> String {
        let mut out = String::from("Commands:\n");
        for (name, description) in COMMANDS {
            out.push_str(&format!("  {name:<10} {description}\n"));
        }
        out
    }

    fn show_config(&self) -> String {
        let config = self.ctx.config_snapshot();
        let provider = config.active();
        format!(
            "provider: {} ({} @ {})\nrun_policy: {:?}  planning: {}  mission: {}  stream: {}\ncommand_timeout_ms: {}  max_budget: {}",
            config.active_provider,
            provider.model,
            provider.endpoint,
            config.policies.run_policy,
            config.flags.planning_mode,
            config.flags.mission_mode,
            config.flags.stream,
            config.numerics.command_timeout_ms,
            config.numerics.max_budget,
        )
    }

    fn switch_provider(&self, name: &str) -> String {
        let known = self
            .ctx
            .config_snapshot()
            .providers
            .contains_key(name);
        if !known {
            return format!("No provider named `{name}` is configured.");
        }
        match self.ctx.update_config(|config| {
            config.active_provider = name.to_string();
        }) {
            Ok(()) => format!("Active provider is now `{name}`."),
            Err(err) => format!("Failed to switch provider: {err}"),
        }
    }

    fn session_info(&self, argument: Option<&str>) -> String {
        match argument {
            Some(name) => match self.ctx.set_session_name(name) {
                Ok(()) => format!("Switched to session `{name}`."),
                Err(err) => format!("Failed to switch session: {err}"),
            },
            None => format!("Current session: {}", self.ctx.session_name()),
        }
    }

    fn access_info(&self) -> String {
        match self.ctx.access.try_lock() {
            Ok(grant) => {
                let denied: Vec<&str> = grant.denylist().collect();
                let allowed: Vec<&str> = grant.allowlist().collect();
                format!(
                    "mode: {:?}\nallowed: {}\ndenied: {}",
                    grant.mode(),
                    if allowed.is_empty() { "(none)".to_string() } else { allowed.join(", ") },
                    if denied.is_empty() { "(none)".to_string() } else { denied.join(", ") },
                )
            }
            Err(_) => "Access grant is busy; try again.".to_string(),
        }
    }

    fn undo(&self) -> String {
        match self.ctx.applier.try_lock() {
            Ok(mut applier) => {
                if applier.undo_last_apply() {
                    "Last apply batch reverted.".to_string()
                } else {
                    "Nothing to undo.".to_string()
                }
            }
            Err(_) => "Applier is busy; try again.".to_string(),
        }
    }

    fn history(&self) -> String {
        let events = self.ctx.bus.history();
        let recent = events.iter().rev().take(20).collect::<Vec<_>>();
        let mut out = String::new();
        for event in recent.into_iter().rev() {
            out.push_str(&format!(
                "{} [{:?}/{:?}] {}\n",
                event.timestamp.format("%H:%M:%S"),
                event.phase,
                event.status,
                event.message
            ));
        }
        if out.is_empty() {
            out.push_str("No events yet.");
        }
        out
    }
}

impl CommandRegistry for Registry {
    fn dispatch(&self, line: &str) -> CommandDispatch {
        let mut parts = line.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let argument = parts.next();

        let output = match name {
            "/help" => self.help(),
            "/config" => self.show_config(),
            "/provider" => match argument {
                Some(provider) => self.switch_provider(provider),
                None => format!("Active provider: {}", self.ctx.config_snapshot().active_provider),
            },
            "/session" => self.session_info(argument),
            "/sessions" => {
                let names = self.ctx.sessions.list();
                if names.is_empty() {
                    "No saved sessions.".to_string()
                } else {
                    names.join("\n")
                }
            }
            "/access" => self.access_info(),
            "/undo" => self.undo(),
            "/history" => self.history(),
            "/quit" | "/exit" => "quit".to_string(),
            _ => {
                return CommandDispatch::Unknown {
                    suggestion: closest_command(name),
                };
            }
        };
        CommandDispatch::Handled(output)
    }
}

/// Closest known command by edit distance, if it is close enough to be a
/// plausible typo.
pub fn closest_command(input: &str) -> Option<String> {
    COMMANDS
        .iter()
        .map(|(name, _)| (*name, levenshtein(input, name)))
        .filter(|(name, distance)| *distance <= name.len() / 2)
        .min_by_key(|(_, distance)| *distance)
        .map(|(name, _)| name.to_string())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn distance_basics() {
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("abc", "abc"), 0);
        assert_eq!(levenshtein("abc", "abd"), 1);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }

    #[test]
    fn near_misses_get_a_suggestion() {
        assert_eq!(closest_command("/hlep").as_deref(), Some("/help"));
        assert_eq!(closest_command("/sesion").as_deref(), Some("/session"));
        assert_eq!(closest_command("/zzzzzzzzz"), None);
    }
}
