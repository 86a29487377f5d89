//! OpenAI-compatible chat-completions adapter over SSE.
//!
//! This one implementation serves both remote endpoints and the designated
//! local provider (an OpenAI-compatible localhost server); they differ only
//! in endpoint, model and whether an API key is present.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::trace;

use crate::config::ProviderConfig;
use crate::error::AgentErr;
use crate::error::Result;
use crate::provider::ModelProvider;
use crate::provider::ProviderCallOptions;
use crate::provider::ProviderResponse;
use crate::provider::ProviderUsage;
use crate::provider::ValidationReport;

pub struct HttpProvider {
    name: String,
    config: ProviderConfig,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(name: impl Into<String>, config: ProviderConfig, api_key: Option<String>) -> Self {
        Self {
            name: name.into(),
            config,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn request(&self, url: &str, payload: &Value) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url).json(payload);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    fn payload(&self, system: &str, task: &str, options: &ProviderCallOptions<'_>) -> Value {
        let mut payload = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": task},
            ],
            "stream": options.stream,
        });
        if let Some(temperature) = self.config.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(top_p) = self.config.top_p {
            payload["top_p"] = json!(top_p);
        }
        if let Some(max_tokens) = self.config.max_output_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if let Some(continuation) = &options.continuation {
            // Servers that cache prompt context accept it back verbatim;
            // others ignore the extra key.
            payload["context"] = continuation.clone();
        }
        payload
    }

    async fn call_streaming(
        &self,
        payload: &Value,
        on_chunk: Option<&(dyn Fn(&str) + Send + Sync)>,
    ) -> Result<ProviderResponse> {
        let url = self.url("chat/completions");
        debug!("POST {url} (stream)");
        let response = self.request(&url, payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentErr::Provider(format!("{status}: {body}")));
        }

        let mut stream = response.bytes_stream().eventsource();
        let mut out = ProviderResponse::default();

        while let Some(event) = stream.next().await {
            let event =
                event.map_err(|e| AgentErr::Stream(format!("SSE transport error: {e}"), None))?;
            if event.data.trim() == "[DONE]" {
                break;
            }
            let chunk: Value = match serde_json::from_str(&event.data) {
                Ok(value) => value,
                Err(_) => continue,
            };
            trace!("SSE chunk: {chunk:?}");

            if let Some(delta) = chunk
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
            {
                out.text.push_str(delta);
                if let Some(cb) = on_chunk {
                    cb(delta);
                }
            }
            if let Some(thinking) = chunk
                .pointer("/choices/0/delta/reasoning_content")
                .and_then(Value::as_str)
            {
                out.thinking
                    .get_or_insert_with(String::new)
                    .push_str(thinking);
            }
            read_usage(&chunk, &mut out.usage);
            if let Some(state) = chunk.get("context") {
                out.provider_state = Some(state.clone());
            }
        }

        if out.text.is_empty() && out.thinking.is_none() {
            return Err(AgentErr::Stream(
                "stream ended without any content".to_string(),
                None,
            ));
        }
        Ok(out)
    }

    async fn call_blocking(&self, payload: &Value) -> Result<ProviderResponse> {
        let url = self.url("chat/completions");
        debug!("POST {url}");
        let response = self.request(&url, payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentErr::Provider(format!("{status}: {body}")));
        }

        let body: Value = response.json().await?;
        let mut out = ProviderResponse {
            text: body
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            thinking: body
                .pointer("/choices/0/message/reasoning_content")
                .and_then(Value::as_str)
                .map(str::to_string),
            ..ProviderResponse::default()
        };
        read_usage(&body, &mut out.usage);
        if let Some(state) = body.get("context") {
            out.provider_state = Some(state.clone());
        }
        if out.text.is_empty() {
            return Err(AgentErr::Provider("empty completion".to_string()));
        }
        Ok(out)
    }
}

fn read_usage(value: &Value, usage: &mut ProviderUsage) {
    if let Some(tokens) = value.pointer("/usage/prompt_tokens").and_then(Value::as_u64) {
        usage.input_tokens = tokens;
    }
    if let Some(tokens) = value
        .pointer("/usage/completion_tokens")
        .and_then(Value::as_u64)
    {
        usage.output_tokens = tokens;
    }
}

#[async_trait]
impl ModelProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn context_window(&self) -> u64 {
        self.config.context_window
    }

    async fn call(
        &self,
        system: &str,
        task: &str,
        options: ProviderCallOptions<'_>,
    ) -> Result<ProviderResponse> {
        let payload = self.payload(system, task, &options);
        if options.stream {
            self.call_streaming(&payload, options.on_chunk).await
        } else {
            self.call_blocking(&payload).await
        }
    }

    async fn validate(&self) -> ValidationReport {
        let url = self.url("models");
        let mut builder = self.client.get(&url);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        match builder.send().await {
            Ok(response) if response.status().is_success() => ValidationReport {
                ok: true,
                message: format!("{} reachable at {}", self.name, self.config.endpoint),
            },
            Ok(response) => ValidationReport {
                ok: false,
                message: format!("{} returned {}", self.config.endpoint, response.status()),
            },
            Err(err) => ValidationReport {
                ok: false,
                message: format!("{} unreachable: {err}", self.config.endpoint),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn provider() -> HttpProvider {
        HttpProvider::new("local", ProviderConfig::default(), None)
    }

    #[test]
    fn payload_carries_generation_parameters() {
        let mut config = ProviderConfig::default();
        config.temperature = Some(0.2);
        config.max_output_tokens = Some(2048);
        let provider = HttpProvider::new("test", config, Some("key".to_string()));

        let payload = provider.payload("sys", "task", &ProviderCallOptions::default());
        assert_eq!(payload["model"], "qwen2.5-coder");
        assert_eq!(payload["temperature"], 0.2);
        assert_eq!(payload["max_tokens"], 2048);
        assert_eq!(payload["stream"], false);
        assert_eq!(payload["messages"][0]["role"], "system");
    }

    #[test]
    fn continuation_rides_in_the_payload() {
        let options = ProviderCallOptions {
            stream: true,
            on_chunk: None,
            continuation: Some(json!([1, 2, 3])),
        };
        let payload = provider().payload("s", "t", &options);
        assert_eq!(payload["context"], json!([1, 2, 3]));
        assert_eq!(payload["stream"], true);
    }

    #[test]
    fn usage_is_read_from_either_shape() {
        let mut usage = ProviderUsage::default();
        read_usage(
            &json!({"usage": {"prompt_tokens": 10, "completion_tokens": 5}}),
            &mut usage,
        );
        assert_eq!(usage.total(), 15);
    }

    #[test]
    fn endpoint_join_tolerates_trailing_slash() {
        let mut config = ProviderConfig::default();
        config.endpoint = "http://localhost:1234/v1/".to_string();
        let provider = HttpProvider::new("x", config, None);
        assert_eq!(provider.url("models"), "http://localhost:1234/v1/models");
    }
}
