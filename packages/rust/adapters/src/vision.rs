//! Multi-pass OCR over an OpenAI-compatible chat completions endpoint.
//!
//! Each page image is sent as a base64 data URL. The first pass transcribes
//! with context; later passes re-read the words the previous pass flagged as
//! uncertain, first word by word and then letter by letter. Passes stop early
//! once nothing is left unclear.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use folio_core::stages::{OcrEngine, OcrOutput, ProcessingStats};
use folio_shared::{FolioError, OcrConfig, Result};

use crate::{USER_AGENT, mime_for_path};

const PASS_NAMES: [&str; 3] = ["contextual", "word_level", "letter_level"];
const TEMPERATURE: f32 = 0.1;
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Error bodies are truncated to this many characters in messages.
const MAX_ERROR_BODY: usize = 300;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ChatContent>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ChatContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: u64,
}

/// What each pass is asked to return.
#[derive(Debug, Default, Deserialize)]
struct PassJson {
    #[serde(default)]
    transcription: String,
    #[serde(default)]
    unclear_sections: Vec<String>,
    #[serde(default)]
    processing_stats: Option<ProcessingStats>,
    #[serde(default)]
    confidence_level: Option<String>,
}

/// One pass's parsed answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassResult {
    pub transcription: String,
    pub unclear_sections: Vec<String>,
    pub processing_stats: Option<ProcessingStats>,
    pub confidence_level: Option<String>,
}

/// Parse a pass answer. JSON (optionally inside a code fence) is preferred;
/// anything else is taken verbatim as the transcription.
pub fn parse_pass_response(content: &str) -> PassResult {
    let trimmed = content.trim();
    let body = strip_code_fence(trimmed);

    match serde_json::from_str::<PassJson>(body) {
        Ok(parsed) => PassResult {
            transcription: parsed.transcription.trim().to_string(),
            unclear_sections: parsed
                .unclear_sections
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            processing_stats: parsed.processing_stats,
            confidence_level: parsed.confidence_level,
        },
        Err(e) => {
            debug!(error = %e, "pass answer is not JSON, using raw text");
            PassResult {
                transcription: trimmed.to_string(),
                ..PassResult::default()
            }
        }
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn confidence_score(level: &str) -> Option<f64> {
    match level.to_ascii_lowercase().as_str() {
        "high" => Some(0.9),
        "medium" => Some(0.7),
        "low" => Some(0.4),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

const ANSWER_FORMAT: &str = r#"Answer with JSON only:
{"transcription": "...", "unclear_sections": ["..."], "processing_stats": {"total_words": 0, "normal_transcription": 0, "context_logic_transcription": 0, "unable_to_transcribe": 0}, "confidence_level": "high|medium|low"}"#;

fn pass_prompt(pass: usize, previous: Option<&PassResult>) -> String {
    let name = PASS_NAMES[pass.min(PASS_NAMES.len() - 1)];
    let instructions = match name {
        "contextual" => {
            "Transcribe all handwritten and printed text on this manuscript page. \
             Preserve line breaks and original spelling. Use surrounding context to \
             resolve hard words. List every word you are not sure about in unclear_sections."
        }
        "word_level" => {
            "Re-read this page word by word. Focus on the uncertain words listed below \
             and correct them where the image allows. Keep everything else unchanged."
        }
        _ => {
            "Re-read the remaining uncertain words letter by letter. Correct them only \
             when the letters are legible; otherwise leave them in unclear_sections."
        }
    };

    let mut prompt = format!("PASS: {name}\n{instructions}\n");
    if let Some(prev) = previous {
        prompt.push_str("\nPrevious transcription:\n");
        prompt.push_str(&prev.transcription);
        prompt.push_str("\n\nUncertain words:\n");
        prompt.push_str(&prev.unclear_sections.join(", "));
        prompt.push('\n');
    }
    prompt.push('\n');
    prompt.push_str(ANSWER_FORMAT);
    prompt
}

// ---------------------------------------------------------------------------
// VisionOcr
// ---------------------------------------------------------------------------

/// Vision-model OCR engine.
pub struct VisionOcr {
    client: Client,
    url: String,
    api_key: String,
    model: String,
    passes: usize,
    max_tokens: u32,
}

impl VisionOcr {
    pub fn new(config: &OcrConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| FolioError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: format!("{}/chat/completions", config.endpoint.trim_end_matches('/')),
            api_key: api_key.into(),
            model: config.model.clone(),
            passes: (config.passes as usize).clamp(1, PASS_NAMES.len()),
            max_tokens: config.max_tokens,
        })
    }

    /// Send one completion request; returns the answer text and tokens used.
    async fn complete(&self, prompt: String, data_url: &str) -> Result<(String, u64)> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ChatContent::Text { text: prompt },
                    ChatContent::ImageUrl {
                        image_url: ImageUrl {
                            url: data_url.to_string(),
                        },
                    },
                ],
            }],
            max_tokens: self.max_tokens,
            temperature: TEMPERATURE,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| FolioError::Network(format!("vision request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(match status.as_u16() {
                401 | 403 => FolioError::config(format!("API key rejected (HTTP {status})")),
                429 => FolioError::Ocr(format!("HTTP 429 rate limited: {body}")),
                code => FolioError::Ocr(format!("vision endpoint returned HTTP {code}: {body}")),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| FolioError::Ocr(format!("malformed completion response: {e}")))?;

        let tokens = parsed.usage.map(|u| u.total_tokens).unwrap_or(0);
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| FolioError::Ocr("completion returned no content".into()))?;

        Ok((content, tokens))
    }
}

#[async_trait]
impl OcrEngine for VisionOcr {
    #[instrument(skip_all, fields(image = %image_path.display(), model = %self.model))]
    async fn transcribe(&self, image_path: &Path) -> Result<OcrOutput> {
        let bytes = tokio::fs::read(image_path)
            .await
            .map_err(|e| FolioError::io(image_path, e))?;
        let mime = match mime_for_path(image_path) {
            mime if mime.starts_with("image/") => mime,
            _ => "image/jpeg",
        };
        let data_url = format!(
            "data:{mime};base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&bytes)
        );

        let mut tokens_used = 0u64;
        let mut passes = 0u32;
        let mut current: Option<PassResult> = None;

        for pass in 0..self.passes {
            let prompt = pass_prompt(pass, current.as_ref());
            let (content, tokens) = self.complete(prompt, &data_url).await?;
            tokens_used += tokens;
            passes += 1;

            let mut result = parse_pass_response(&content);
            if result.transcription.is_empty() {
                // A refinement pass that returns nothing keeps the earlier text.
                if let Some(prev) = &current {
                    warn!(pass = PASS_NAMES[pass], "pass returned no text, keeping previous");
                    result.transcription = prev.transcription.clone();
                }
            }
            debug!(
                pass = PASS_NAMES[pass],
                unclear = result.unclear_sections.len(),
                tokens,
                "ocr pass complete"
            );

            let settled = result.unclear_sections.is_empty();
            current = Some(result);
            if settled {
                break;
            }
        }

        let result = current.unwrap_or_default();
        if result.transcription.trim().is_empty() {
            return Err(FolioError::Ocr("empty transcription".into()));
        }

        info!(
            passes,
            tokens_used,
            unclear = result.unclear_sections.len(),
            "page transcribed"
        );

        Ok(OcrOutput {
            quality_score: result.confidence_level.as_deref().and_then(confidence_score),
            transcription: result.transcription,
            unclear_sections: result.unclear_sections,
            processing_stats: result.processing_stats,
            passes,
            tokens_used,
            model: Some(self.model.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::error_handler::categorize;
    use folio_shared::ErrorCategory;
    use std::path::PathBuf;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn image() -> PathBuf {
        let path =
            std::env::temp_dir().join(format!("folio-vision-test-{}.png", uuid::Uuid::now_v7()));
        std::fs::write(&path, b"\x89PNG fake").unwrap();
        path
    }

    fn engine(server: &MockServer, passes: u32) -> VisionOcr {
        let config = OcrConfig {
            endpoint: format!("{}/v1/", server.uri()),
            passes,
            ..OcrConfig::default()
        };
        VisionOcr::new(&config, "sk-test").unwrap()
    }

    fn completion(content: &str, tokens: u64) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"total_tokens": tokens}
        }))
    }

    #[test]
    fn parses_fenced_json() {
        let raw = "```json\n{\"transcription\": \" Dear Sir \", \"unclear_sections\": [\"Sir\", \" \"], \"confidence_level\": \"medium\"}\n```";
        let result = parse_pass_response(raw);
        assert_eq!(result.transcription, "Dear Sir");
        assert_eq!(result.unclear_sections, ["Sir"]);
        assert_eq!(result.confidence_level.as_deref(), Some("medium"));
    }

    #[test]
    fn non_json_answer_is_taken_verbatim() {
        let result = parse_pass_response("  Just the text of the page.\n");
        assert_eq!(result.transcription, "Just the text of the page.");
        assert!(result.unclear_sections.is_empty());
        assert!(result.processing_stats.is_none());
    }

    #[test]
    fn later_prompts_carry_previous_pass() {
        let prev = PassResult {
            transcription: "the baron wrote".into(),
            unclear_sections: vec!["baron".into()],
            ..PassResult::default()
        };
        let prompt = pass_prompt(1, Some(&prev));
        assert!(prompt.starts_with("PASS: word_level"));
        assert!(prompt.contains("the baron wrote"));
        assert!(prompt.contains("Uncertain words:\nbaron"));
        assert!(pass_prompt(0, None).starts_with("PASS: contextual"));
    }

    #[tokio::test]
    async fn single_pass_sends_data_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_string_contains("data:image/png;base64,"))
            .respond_with(completion(
                r#"{"transcription": "Querido amigo", "unclear_sections": [], "processing_stats": {"total_words": 2, "normal_transcription": 2}, "confidence_level": "high"}"#,
                120,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let img = image();
        let out = engine(&server, 3).transcribe(&img).await.unwrap();

        assert_eq!(out.transcription, "Querido amigo");
        assert_eq!(out.passes, 1);
        assert_eq!(out.tokens_used, 120);
        assert_eq!(out.quality_score, Some(0.9));
        assert_eq!(out.processing_stats.unwrap().total_words, Some(2));
        let _ = std::fs::remove_file(img);
    }

    #[tokio::test]
    async fn refinement_passes_run_until_settled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("PASS: contextual"))
            .respond_with(completion(
                r#"{"transcription": "Mi qerido amigo", "unclear_sections": ["qerido"]}"#,
                100,
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("PASS: word_level"))
            .respond_with(completion(
                r#"{"transcription": "Mi querido amigo", "unclear_sections": []}"#,
                80,
            ))
            .mount(&server)
            .await;

        let img = image();
        let out = engine(&server, 3).transcribe(&img).await.unwrap();

        assert_eq!(out.transcription, "Mi querido amigo");
        assert_eq!(out.passes, 2);
        assert_eq!(out.tokens_used, 180);
        assert!(out.unclear_sections.is_empty());
        let _ = std::fs::remove_file(img);
    }

    #[tokio::test]
    async fn rejected_key_is_authentication() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let img = image();
        let err = engine(&server, 1).transcribe(&img).await.unwrap_err();
        assert_eq!(categorize(&err), ErrorCategory::Authentication);
        let _ = std::fs::remove_file(img);
    }

    #[tokio::test]
    async fn throttled_request_is_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let img = image();
        let err = engine(&server, 1).transcribe(&img).await.unwrap_err();
        assert_eq!(categorize(&err), ErrorCategory::RateLimit);
        let _ = std::fs::remove_file(img);
    }

    #[tokio::test]
    async fn empty_transcription_is_an_ocr_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(completion(r#"{"transcription": "", "unclear_sections": []}"#, 5))
            .mount(&server)
            .await;

        let img = image();
        let err = engine(&server, 2).transcribe(&img).await.unwrap_err();
        assert!(matches!(err, FolioError::Ocr(_)));
        let _ = std::fs::remove_file(img);
    }
}
