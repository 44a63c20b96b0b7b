//! OpenAI-compatible `/chat/completions` backend (DeepSeek by default)

use super::{Completion, ModelBackend};
use crate::error::PipelineError;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::error;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";

pub struct ChatCompletionsBackend {
    name: String,
    client: Client,
    api_key: String,
    base_url: String,
    temperature: f32,
}

impl ChatCompletionsBackend {
    pub fn new(name: &str, api_key: String, base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            name: name.to_string(),
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            temperature: 0.3,
        })
    }
}

#[async_trait]
impl ModelBackend for ChatCompletionsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, model: &str, system: &str, user: &str) -> Result<Completion> {
        if self.api_key.is_empty() {
            return Err(PipelineError::Provider(format!(
                "{} API key not configured",
                self.name
            )));
        }

        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.temperature,
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(backend = %self.name, model = model, status = %status, "Chat completion error: {}", error_text);
            return Err(PipelineError::Provider(format!(
                "{} API error ({}): {}",
                self.name, status, error_text
            )));
        }

        let chat: ChatResponse = response.json().await?;
        into_completion(chat)
    }
}

fn into_completion(response: ChatResponse) -> Result<Completion> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::Provider("No choices in chat completion".to_string()))?;

    let usage = response.usage.unwrap_or_default();
    Ok(Completion {
        text: choice.message.content.unwrap_or_default(),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    })
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let request = ChatRequest {
            model: "deepseek-chat",
            messages: vec![ChatMessage {
                role: "user",
                content: "你好",
            }],
            temperature: 0.3,
            stream: false,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], "deepseek-chat");
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["stream"], false);
    }

    #[test]
    fn test_response_parsing() {
        let body = r###"{
            "id": "x",
            "model": "deepseek-chat",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "## 市场概况"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"###;
        let completion = into_completion(serde_json::from_str(body).unwrap()).unwrap();
        assert_eq!(completion.text, "## 市场概况");
        assert_eq!(completion.total_tokens, Some(15));
    }

    #[test]
    fn test_no_choices_is_error() {
        let response: ChatResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(into_completion(response).is_err());
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let backend = ChatCompletionsBackend::new("local", "k".to_string(), "http://localhost:8000/v1/").unwrap();
        assert_eq!(backend.base_url, "http://localhost:8000/v1");
        assert_eq!(backend.name(), "local");
    }
}
