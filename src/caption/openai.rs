use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::json;

use super::{CaptionService, clean_caption};

/// Default OpenAI API base URL.
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

pub struct OpenAiCaptioner {
    api_key: String,
    model: String,
    api_base: String,
    max_tokens: u32,
    client: Client,
}

impl OpenAiCaptioner {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            api_base: DEFAULT_API_BASE.to_string(),
            max_tokens: 300,
            client: Client::new(),
        }
    }

    /// Send requests to an OpenAI-compatible endpoint other than api.openai.com.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn request_body(&self, image_base64: &str, mime_type: &str, prompt: &str) -> serde_json::Value {
        json!({
            "model": self.model,
            "messages": [
                {
                    "role": "user",
                    "content": [
                        {
                            "type": "text",
                            "text": prompt
                        },
                        {
                            "type": "image_url",
                            "image_url": {
                                "url": format!("data:{mime_type};base64,{image_base64}")
                            }
                        }
                    ]
                }
            ],
            "max_tokens": self.max_tokens
        })
    }
}

#[async_trait::async_trait]
impl CaptionService for OpenAiCaptioner {
    fn name(&self) -> &str {
        "OpenAI"
    }

    async fn caption(&self, image_base64: &str, mime_type: &str, prompt: &str) -> Result<String> {
        let body = self.request_body(image_base64, mime_type, prompt);

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .context("OpenAI request failed")?;

        let status = resp.status();
        let text = resp.text().await.context("Failed to read OpenAI response")?;

        if !status.is_success() {
            anyhow::bail!("OpenAI API error ({}): {}", status, text);
        }

        let json: serde_json::Value =
            serde_json::from_str(&text).context("Failed to parse OpenAI response JSON")?;

        clean_caption(json["choices"][0]["message"]["content"].as_str())
    }
}
