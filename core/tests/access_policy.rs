use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use pilot_core::GrantChoice;
use pilot_core::Result;
use pilot_core::RuntimeContext;
use pilot_core::UserInteraction;
use pilot_protocol::EventPhase;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

/// Scripted interaction: fixed grant choice, per-path approvals by suffix.
struct Scripted {
    grant: GrantChoice,
    approve_suffixes: Vec<&'static str>,
    notices: Mutex<Vec<String>>,
}

#[async_trait]
impl UserInteraction for Scripted {
    async fn ask(&self, _question: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn confirm(&self, prompt: &str) -> Result<bool> {
        Ok(self.approve_suffixes.iter().any(|s| prompt.contains(s)))
    }

    async fn choose_grant(&self, _prompt: &str) -> Result<GrantChoice> {
        Ok(self.grant)
    }

    fn notify(&self, message: &str) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(message.to_string());
        }
    }
}

fn context(home: &TempDir, interaction: Scripted) -> RuntimeContext {
    RuntimeContext::new(home.path(), Arc::new(interaction)).expect("context")
}

#[tokio::test]
async fn full_grant_allows_everything() {
    let home = TempDir::new().expect("tempdir");
    let ctx = context(
        &home,
        Scripted {
            grant: GrantChoice::Full,
            approve_suffixes: vec![],
            notices: Mutex::new(Vec::new()),
        },
    );

    let paths = vec![PathBuf::from("/proj/a.rs"), PathBuf::from("/proj/b.rs")];
    let outcome = ctx
        .ensure_session_access_for_paths(&paths, "test")
        .await
        .expect("outcome");
    assert_eq!(outcome.allowed.len(), 2);
    assert!(outcome.denied.is_empty());
}

#[tokio::test]
async fn selective_grant_denies_unapproved_paths_and_emits_events() {
    let home = TempDir::new().expect("tempdir");
    let ctx = context(
        &home,
        Scripted {
            grant: GrantChoice::Selective,
            approve_suffixes: vec!["allowed.rs"],
            notices: Mutex::new(Vec::new()),
        },
    );

    let paths = vec![
        PathBuf::from("/proj/allowed.rs"),
        PathBuf::from("/proj/secret.key"),
    ];
    let outcome = ctx
        .ensure_session_access_for_paths(&paths, "apply file edits")
        .await
        .expect("outcome");

    assert_eq!(outcome.allowed, vec![PathBuf::from("/proj/allowed.rs")]);
    assert_eq!(outcome.denied, vec![PathBuf::from("/proj/secret.key")]);

    let history = ctx.bus.history();
    let denial = history
        .iter()
        .find(|e| e.phase == EventPhase::Error)
        .expect("denial event");
    assert!(denial.message.contains("secret.key"));
    assert!(denial.message.contains("denied by session policy"));
}

#[tokio::test]
async fn denied_paths_stay_denied_without_reprompting() {
    let home = TempDir::new().expect("tempdir");
    let ctx = context(
        &home,
        Scripted {
            grant: GrantChoice::Selective,
            approve_suffixes: vec![],
            notices: Mutex::new(Vec::new()),
        },
    );

    let paths = vec![PathBuf::from("/proj/secret.key")];
    let first = ctx
        .ensure_session_access_for_paths(&paths, "edit")
        .await
        .expect("outcome");
    assert_eq!(first.denied.len(), 1);

    // Second request hits the denylist directly.
    let second = ctx
        .ensure_session_access_for_paths(&paths, "edit")
        .await
        .expect("outcome");
    assert_eq!(second.denied.len(), 1);
    assert!(second.allowed.is_empty());
}

#[tokio::test]
async fn refused_grant_denies_without_recording_a_mode() {
    let home = TempDir::new().expect("tempdir");
    let ctx = context(
        &home,
        Scripted {
            grant: GrantChoice::Refused,
            approve_suffixes: vec![],
            notices: Mutex::new(Vec::new()),
        },
    );

    let paths = vec![PathBuf::from("/proj/x.rs")];
    let outcome = ctx
        .ensure_session_access_for_paths(&paths, "edit")
        .await
        .expect("outcome");
    assert!(outcome.allowed.is_empty());
    assert_eq!(outcome.denied.len(), 1);

    // The grant was not persisted as a mode; the next request asks again.
    let grant = ctx.access.lock().await;
    assert_eq!(grant.mode(), pilot_core::access::AccessMode::Unknown);
}
