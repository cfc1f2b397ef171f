use anyhow::{Context, Result};
use async_trait::async_trait;
use binsight_policy::{extract_json_object, Advisory, AdvisoryError, AdvisoryRequest};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ReplyMessage>,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Non-success status from the upstream, kept apart from transport errors.
#[derive(Debug, thiserror::Error)]
#[error("upstream status {0}")]
struct UpstreamStatus(u16);

/// Call an OpenAI-compatible chat completions endpoint with a single user
/// message and return the text of the first choice.
pub async fn call_chat_completions(
    client: &Client,
    url: &str,
    api_key: Option<&str>,
    model: &str,
    prompt: &str,
) -> Result<String> {
    let request = ChatCompletionRequest {
        model,
        messages: [ChatMessage {
            role: "user",
            content: prompt,
        }],
        temperature: 0.0,
    };

    let mut builder = client.post(url).json(&request);
    if let Some(key) = api_key {
        builder = builder.bearer_auth(key);
    }
    let response = builder
        .send()
        .await
        .with_context(|| format!("POST {url}"))?;

    if !response.status().is_success() {
        return Err(UpstreamStatus(response.status().as_u16()).into());
    }

    let parsed: ChatCompletionResponse = response
        .json()
        .await
        .context("parse upstream json response")?;
    let reply = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .unwrap_or_default();

    Ok(reply)
}

/// [`Advisory`] backed by a hosted chat model.
pub struct ChatAdvisory {
    client: Client,
    url: String,
    api_key: Option<String>,
    model: String,
}

impl ChatAdvisory {
    pub fn new(client: Client, url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            client,
            url,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl Advisory for ChatAdvisory {
    fn model(&self) -> &str {
        &self.model
    }

    async fn propose(&self, request: &AdvisoryRequest) -> std::result::Result<Value, AdvisoryError> {
        let prompt = request.prompt();
        let reply = call_chat_completions(
            &self.client,
            &self.url,
            self.api_key.as_deref(),
            &self.model,
            &prompt,
        )
        .await
        .map_err(|err| match err.downcast_ref::<UpstreamStatus>() {
            Some(UpstreamStatus(code)) => AdvisoryError::Status(*code),
            None => AdvisoryError::from(err),
        })?;
        extract_json_object(&reply)
    }
}
