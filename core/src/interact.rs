//! The seam between the core and whatever front-end is driving it.
//! Clarifications, approvals and notices block the turn until answered.

use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantChoice {
    Full,
    Selective,
    Refused,
}

#[async_trait]
pub trait UserInteraction: Send + Sync {
    /// Ask a free-form question and block for the answer.
    async fn ask(&self, question: &str) -> Result<String>;

    /// Yes/no approval.
    async fn confirm(&self, prompt: &str) -> Result<bool>;

    /// First-use file access grant decision.
    async fn choose_grant(&self, prompt: &str) -> Result<GrantChoice>;

    /// Non-blocking notice (warnings, errors, status lines).
    fn notify(&self, message: &str);
}

/// Auto-approving interaction for `--yes` and mission contexts: questions
/// get empty answers, approvals succeed, the grant is full.
pub struct AutoApprove;

#[async_trait]
impl UserInteraction for AutoApprove {
    async fn ask(&self, _question: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn confirm(&self, _prompt: &str) -> Result<bool> {
        Ok(true)
    }

    async fn choose_grant(&self, _prompt: &str) -> Result<GrantChoice> {
        Ok(GrantChoice::Full)
    }

    fn notify(&self, message: &str) {
        tracing::info!("{message}");
    }
}
