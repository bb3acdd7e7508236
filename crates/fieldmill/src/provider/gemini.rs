//! Gemini `generateContent` client.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use log::{debug, info};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;
use crate::error::ProviderError;

use super::{parse_extraction, Extraction, InferenceProvider};

/// Maximum length of an error body kept in messages.
const MAX_ERROR_BODY_LENGTH: usize = 200;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_MIME_TYPE: &str = "application/pdf";

fn sanitize_error_body(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY_LENGTH) {
        Some((idx, _)) => format!("{}... (truncated)", &body[..idx]),
        None => body.to_string(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    seed: i64,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

impl GenerateContentResponse {
    /// Concatenated text of the first candidate.
    fn text(&self) -> Option<String> {
        let content = self.candidates.first()?.content.as_ref()?;
        let text: String = content
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Inference provider backed by the Gemini REST API.
///
/// Documents are sent inline, base64-encoded, together with the
/// instructions; documents above the inline limit are rejected.
pub struct GeminiProvider {
    client: Client,
    api_key: SecretString,
    endpoint: String,
    seed: i64,
    inline_limit: u64,
    bare_fields: Vec<String>,
}

impl GeminiProvider {
    /// `bare_fields` are the fields the model may answer with a plain
    /// string rather than a `{value, justification}` object.
    pub fn new(
        config: &ProviderConfig,
        api_key: SecretString,
        bare_fields: Vec<String>,
    ) -> Result<Self, ProviderError> {
        if api_key.expose_secret().trim().is_empty() {
            return Err(ProviderError::MissingApiKey);
        }
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            endpoint: format!(
                "{}/models/{}:generateContent",
                config.base_url.trim_end_matches('/'),
                config.model
            ),
            seed: config.seed,
            inline_limit: config.inline_size_limit_mb.saturating_mul(1024 * 1024),
            bare_fields,
        })
    }

    fn build_request(&self, document: &Path, bytes: &[u8], instructions: &str) -> GenerateContentRequest {
        let mime_type = mime_guess::from_path(document)
            .first_raw()
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string();

        GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![
                    Part {
                        inline_data: Some(InlineData {
                            mime_type,
                            data: base64::engine::general_purpose::STANDARD.encode(bytes),
                        }),
                        ..Default::default()
                    },
                    Part {
                        text: Some(instructions.to_string()),
                        ..Default::default()
                    },
                ],
            }],
            generation_config: GenerationConfig { seed: self.seed },
        }
    }

    async fn read_document(&self, document: &Path) -> Result<Vec<u8>, ProviderError> {
        let read_error = |source| ProviderError::ReadDocument {
            path: document.to_path_buf(),
            source,
        };
        let size = tokio::fs::metadata(document).await.map_err(read_error)?.len();
        if size > self.inline_limit {
            return Err(ProviderError::DocumentTooLarge {
                path: document.to_path_buf(),
                size,
                limit: self.inline_limit,
            });
        }
        tokio::fs::read(document).await.map_err(read_error)
    }
}

#[async_trait]
impl InferenceProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn process(
        &self,
        document: &Path,
        instructions: &str,
    ) -> Result<Vec<Extraction>, ProviderError> {
        let bytes = self.read_document(document).await?;
        let request = self.build_request(document, &bytes, instructions);

        info!(
            "Sending {} ({} bytes) to {}",
            crate::checkpoint::record::source_file_name(document),
            bytes.len(),
            self.endpoint
        );
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: sanitize_error_body(&body),
            });
        }

        let body: GenerateContentResponse = response.json().await?;
        let text = body.text().ok_or(ProviderError::EmptyResponse)?;
        debug!("Raw model response: {}", sanitize_error_body(&text));

        Ok(vec![parse_extraction(&text, &self.bare_fields)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config() -> ProviderConfig {
        ProviderConfig {
            inline_size_limit_mb: 1,
            ..ProviderConfig::default()
        }
    }

    fn provider() -> GeminiProvider {
        GeminiProvider::new(&config(), SecretString::from("test-key"), vec![]).unwrap()
    }

    #[test]
    fn test_rejects_blank_api_key() {
        let result = GeminiProvider::new(&config(), SecretString::from("  "), vec![]);
        assert!(matches!(result, Err(ProviderError::MissingApiKey)));
    }

    #[test]
    fn test_endpoint() {
        let provider = provider();
        assert!(provider
            .endpoint
            .ends_with(&format!("/models/{}:generateContent", config().model)));
    }

    #[test]
    fn test_request_shape() {
        let provider = provider();
        let request = provider.build_request(Path::new("/in/report.pdf"), b"%PDF", "extract");
        let json = serde_json::to_value(&request).unwrap();

        let parts = &json["contents"][0]["parts"];
        assert_eq!(parts[0]["inlineData"]["mimeType"], "application/pdf");
        assert_eq!(parts[0]["inlineData"]["data"], "JVBERg==");
        assert_eq!(parts[1]["text"], "extract");
        assert_eq!(json["generationConfig"]["seed"], config().seed);
    }

    #[test]
    fn test_mime_type_guessed_from_extension() {
        let provider = provider();
        let request = provider.build_request(Path::new("scan.png"), b"", "x");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["inlineData"]["mimeType"], "image/png");
    }

    #[test]
    fn test_response_text() {
        let body: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"{\"a\":"},{"text":"{}}"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(body.text().as_deref(), Some("{\"a\":{}}"));

        let empty: GenerateContentResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert!(empty.text().is_none());
    }

    #[test]
    fn test_sanitize_error_body() {
        let long = "x".repeat(500);
        let sanitized = sanitize_error_body(&long);
        assert!(sanitized.ends_with("... (truncated)"));
        assert_eq!(sanitize_error_body("short"), "short");
    }

    #[tokio::test]
    async fn test_document_too_large_is_rejected_before_upload() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; 1024 * 1024 + 1]).unwrap();

        let err = provider().process(file.path(), "x").await.unwrap_err();
        assert!(matches!(err, ProviderError::DocumentTooLarge { .. }));
    }

    #[test]
    fn test_huge_inline_limit_saturates() {
        let config = ProviderConfig {
            inline_size_limit_mb: u64::MAX / 1024,
            ..ProviderConfig::default()
        };
        let provider =
            GeminiProvider::new(&config, SecretString::from("test-key"), vec![]).unwrap();
        assert_eq!(provider.inline_limit, u64::MAX);
    }

    #[tokio::test]
    async fn test_missing_document() {
        let err = provider()
            .process(Path::new("/definitely/not/here.pdf"), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ReadDocument { .. }));
    }
}
