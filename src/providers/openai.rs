use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{Value, json};

use super::{ImageProvider, TitleProvider, describe_request};
use crate::config::OpenAiConfig;
use crate::runs::ChatMessage;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const MAX_TITLE_CHARS: usize = 60;
const COVER_SIZE: &str = "1536x1024";
const COVER_QUALITY: &str = "medium";

const TITLE_INSTRUCTIONS: &str = "You name browser games. Reply with a short, catchy title of 2 to 5 words for the game described. Reply with the title only, no quotes or punctuation around it.";

/// Title and cover generation against the OpenAI HTTP API.
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    title_model: String,
    image_model: String,
}

impl OpenAiClient {
    pub fn new(
        http: reqwest::Client,
        api_key: impl Into<String>,
        title_model: impl Into<String>,
        image_model: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            title_model: title_model.into(),
            image_model: image_model.into(),
        }
    }

    /// `None` when no API key is configured.
    pub fn from_config(http: reqwest::Client, config: &OpenAiConfig) -> Option<Self> {
        let api_key = config.api_key.as_deref()?;
        Some(Self::new(
            http,
            api_key,
            &config.title_model,
            &config.image_model,
        ))
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}/{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to call OpenAI {path}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI {path} returned {status}: {body}");
        }

        response
            .json()
            .await
            .with_context(|| format!("failed to parse OpenAI {path} response"))
    }
}

#[async_trait]
impl TitleProvider for OpenAiClient {
    async fn generate_title(&self, prompt: &str, chat_context: &[ChatMessage]) -> Result<String> {
        let body = json!({
            "model": self.title_model,
            "messages": [
                { "role": "system", "content": TITLE_INSTRUCTIONS },
                { "role": "user", "content": describe_request(prompt, chat_context) },
            ],
        });
        let response = self.post_json("chat/completions", &body).await?;
        let raw = response["choices"][0]["message"]["content"]
            .as_str()
            .context("OpenAI chat response has no message content")?;
        let title = clean_title(raw).context("OpenAI returned an empty title")?;
        tracing::info!(%title, "generated game title");
        Ok(title)
    }
}

#[async_trait]
impl ImageProvider for OpenAiClient {
    async fn generate_cover_image(
        &self,
        prompt: &str,
        chat_context: &[ChatMessage],
        output: &Path,
    ) -> Result<PathBuf> {
        let body = json!({
            "model": self.image_model,
            "prompt": cover_prompt(prompt, chat_context),
            "size": COVER_SIZE,
            "quality": COVER_QUALITY,
            "n": 1,
        });
        let response = self.post_json("images/generations", &body).await?;
        let encoded = response["data"][0]["b64_json"]
            .as_str()
            .context("OpenAI image response has no b64_json payload")?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .context("failed to decode cover image")?;

        let tmp = output.with_extension("png.tmp");
        std::fs::write(&tmp, &bytes)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, output)
            .with_context(|| format!("failed to move cover image into {}", output.display()))?;

        tracing::info!(path = %output.display(), bytes = bytes.len(), "saved cover image");
        Ok(output.to_path_buf())
    }
}

fn cover_prompt(prompt: &str, chat_context: &[ChatMessage]) -> String {
    format!(
        "Key art for a browser video game, wide landscape composition, vivid colors, no text or logos.\n\nGame description:\n{}",
        describe_request(prompt, chat_context)
    )
}

/// First line, surrounding quotes stripped, whitespace collapsed, capped at
/// `MAX_TITLE_CHARS`.
pub fn clean_title(raw: &str) -> Option<String> {
    const QUOTES: &[char] = &['"', '\'', '`', '\u{201c}', '\u{201d}', '\u{2018}', '\u{2019}'];

    let line = raw.trim().lines().next().unwrap_or_default();
    let line = line.trim().trim_matches(QUOTES).trim();
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
    let title: String = collapsed.chars().take(MAX_TITLE_CHARS).collect();
    let title = title.trim().to_string();
    (!title.is_empty()).then_some(title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};

    async fn mock_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(base_url: &str) -> OpenAiClient {
        OpenAiClient::new(reqwest::Client::new(), "sk-test", "title-model", "image-model")
            .with_base_url(base_url)
    }

    #[test]
    fn test_clean_title() {
        assert_eq!(clean_title("\"Neon Racer\"").as_deref(), Some("Neon Racer"));
        assert_eq!(clean_title("  \u{201c}Star  Hopper\u{201d}\nextra").as_deref(), Some("Star Hopper"));
        assert_eq!(clean_title("''"), None);
        assert_eq!(clean_title(&"x".repeat(100)).unwrap().chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn test_from_config_requires_key() {
        let mut config = OpenAiConfig {
            api_key: None,
            title_model: "t".into(),
            image_model: "i".into(),
        };
        assert!(OpenAiClient::from_config(reqwest::Client::new(), &config).is_none());
        config.api_key = Some("sk".into());
        assert!(OpenAiClient::from_config(reqwest::Client::new(), &config).is_some());
    }

    #[test]
    fn test_describe_request_keeps_recent_context() {
        let ctx: Vec<ChatMessage> = (0..10)
            .map(|i| ChatMessage {
                role: crate::runs::ChatRole::User,
                content: format!("m{i}"),
            })
            .collect();
        let text = describe_request("  make it red ", &ctx);
        assert!(text.starts_with("user: m4"));
        assert!(text.ends_with("user: make it red"));
    }

    #[tokio::test]
    async fn test_generate_title() {
        let router = Router::new().route(
            "/chat/completions",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["model"], "title-model");
                Json(json!({"choices": [{"message": {"content": "\"Turbo Drift\""}}]}))
            }),
        );
        let base = mock_server(router).await;
        let title = client(&base).generate_title("racing game", &[]).await.unwrap();
        assert_eq!(title, "Turbo Drift");
    }

    #[tokio::test]
    async fn test_generate_cover_image() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"\x89PNG fake");
        let router = Router::new().route(
            "/images/generations",
            post(move |Json(body): Json<Value>| {
                let encoded = encoded.clone();
                async move {
                    assert_eq!(body["size"], COVER_SIZE);
                    assert_eq!(body["quality"], COVER_QUALITY);
                    Json(json!({"data": [{"b64_json": encoded}]}))
                }
            }),
        );
        let base = mock_server(router).await;
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path().join("card.png");

        let written = client(&base)
            .generate_cover_image("racing game", &[], &output)
            .await
            .unwrap();
        assert_eq!(written, output);
        assert_eq!(std::fs::read(&output).unwrap(), b"\x89PNG fake");
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async { (hyper::StatusCode::UNAUTHORIZED, "bad key") }),
        );
        let base = mock_server(router).await;
        let err = client(&base).generate_title("x", &[]).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("401"), "{msg}");
        assert!(msg.contains("bad key"), "{msg}");
    }
}
