//! The provider adapter contract. Per-provider HTTP details live behind
//! [`ModelProvider`]; the orchestrator only sees text, usage numbers,
//! optional thinking output and an opaque continuation state.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl ProviderUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub text: String,
    pub usage: ProviderUsage,
    pub thinking: Option<String>,
    /// Opaque continuation handle (e.g. cached prompt context) to store in
    /// session metadata.
    pub provider_state: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub ok: bool,
    pub message: String,
}

pub struct ProviderCallOptions<'a> {
    pub stream: bool,
    /// Invoked synchronously per raw chunk while streaming.
    pub on_chunk: Option<&'a (dyn Fn(&str) + Send + Sync)>,
    /// Warm continuation tokens from a previous turn, if any.
    pub continuation: Option<Value>,
}

impl Default for ProviderCallOptions<'_> {
    fn default() -> Self {
        Self {
            stream: false,
            on_chunk: None,
            continuation: None,
        }
    }
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// Context window in tokens, used by the auto-compact gate.
    fn context_window(&self) -> u64;

    async fn call(
        &self,
        system: &str,
        task: &str,
        options: ProviderCallOptions<'_>,
    ) -> Result<ProviderResponse>;

    async fn validate(&self) -> ValidationReport;
}
