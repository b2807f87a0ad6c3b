//! Captioning oracle.
//!
//! The pipeline only sees [`CaptionOracle`]. [`OllamaCaptioner`] implements it
//! against an Ollama-compatible `/api/generate` endpoint with a vision model
//! (llava, bakllava, moondream, ...).

use std::io::Cursor;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CaptionerSettings;
use crate::download::DecodedImage;

/// Prompt sent when neither the batch nor the settings supply one.
pub const FALLBACK_PROMPT: &str = "Describe this image in one short sentence.";

#[derive(Debug, thiserror::Error)]
pub enum CaptionError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("image encoding failed: {0}")]
    Encode(String),
    #[error("captioning timed out")]
    Timeout,
}

/// Turns a decoded image (and an optional prompt) into one caption.
#[async_trait]
pub trait CaptionOracle: Send + Sync {
    async fn caption(
        &self,
        image: &DecodedImage,
        prompt: Option<&str>,
    ) -> Result<String, CaptionError>;
}

pub struct OllamaCaptioner {
    config: CaptionerSettings,
    client: Client,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaCaptioner {
    pub fn new(config: CaptionerSettings) -> Result<Self, CaptionError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| CaptionError::Connection(e.to_string()))?;

        Ok(Self { config, client })
    }
}

#[async_trait]
impl CaptionOracle for OllamaCaptioner {
    async fn caption(
        &self,
        image: &DecodedImage,
        prompt: Option<&str>,
    ) -> Result<String, CaptionError> {
        let prompt = prompt.unwrap_or(FALLBACK_PROMPT);
        let encoded = encode_png_base64(image)?;

        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            images: vec![encoded],
            stream: false,
            options: GenerateOptions {
                temperature: self.config.temperature,
                num_predict: self.config.max_tokens,
            },
        };

        let url = format!("{}/api/generate", self.config.endpoint.trim_end_matches('/'));
        debug!(model = %self.config.model, "requesting caption");

        let resp = self.client.post(&url).json(&request).send().await.map_err(|e| {
            if e.is_timeout() {
                CaptionError::Timeout
            } else {
                CaptionError::Connection(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CaptionError::Api(format!("HTTP {}: {}", status, body)));
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| CaptionError::Parse(e.to_string()))?;

        let caption = parsed.response.trim().to_string();
        if caption.is_empty() {
            return Err(CaptionError::Parse("Empty caption response".to_string()));
        }

        info!(caption = %caption, "caption generated");
        Ok(caption)
    }
}

fn encode_png_base64(image: &DecodedImage) -> Result<String, CaptionError> {
    let mut buf = Vec::new();
    image
        .pixels()
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| CaptionError::Encode(e.to_string()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(buf))
}
