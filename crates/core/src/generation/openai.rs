use super::{TextGenerator, SYSTEM_INSTRUCTION};
use crate::error::GenerationError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// OpenAI-compatible `POST /v1/chat/completions`.
pub struct OpenAiGenerator {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: String,
    temperature: f32,
}

impl OpenAiGenerator {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, GenerationError> {
        let base = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))?;
        Ok(Self {
            client: Client::new(),
            endpoint: base.join("v1/chat/completions")?,
            model: model.into(),
            api_key: api_key.into(),
            temperature: 0.3,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn request<'a>(&'a self, prompt: &'a str) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_INSTRUCTION,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.temperature,
        }
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        debug!(model = %self.model, prompt_chars = prompt.len(), "openai chat completion");

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&self.request(prompt))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorResponse>(&body)
                .map(|error| error.error.message)
                .unwrap_or(body);
            return Err(GenerationError::BackendResponse {
                backend: "openai".to_string(),
                details: format!("{status}: {detail}"),
            });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| GenerationError::BackendResponse {
                backend: "openai".to_string(),
                details: "response had no choices".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_carries_system_and_user_messages() {
        let generator = OpenAiGenerator::new("https://api.openai.com", "gpt-3.5-turbo", "sk-test")
            .expect("valid url")
            .with_temperature(0.1);
        let json = serde_json::to_value(generator.request("What color is the sky?"))
            .expect("serializable");

        assert_eq!(generator.endpoint.as_str(), "https://api.openai.com/v1/chat/completions");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "What color is the sky?");
        assert!((json["temperature"].as_f64().unwrap_or_default() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn choice_content_is_extracted() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"Blue."}}]}"#,
        )
        .expect("valid payload");
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("Blue."));
    }
}
