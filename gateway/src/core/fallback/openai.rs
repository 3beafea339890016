//! REST client for chat completions, speech synthesis and transcription.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{
    CompletionRequest, FallbackError, FallbackResult, SpeechSynthesizer, SynthesizedSpeech,
    TextCompleter, Transcriber, read_success_body,
};

/// The `pcm` speech format is 24kHz 16-bit mono.
const TTS_PCM_SAMPLE_RATE: u32 = 24000;

/// Settings for [`OpenAIRestClient`].
#[derive(Debug, Clone)]
pub struct RestClientConfig {
    /// API base, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    pub api_key: String,
    pub chat_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub stt_model: String,
    /// System prompt for chat completions
    pub instructions: Option<String>,
    pub timeout: Duration,
}

/// One HTTP client serving all three fallback collaborator roles.
#[derive(Debug, Clone)]
pub struct OpenAIRestClient {
    http: Client,
    config: RestClientConfig,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl OpenAIRestClient {
    pub fn new(config: RestClientConfig) -> FallbackResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| FallbackError::Configuration(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn ensure_key(&self) -> FallbackResult<()> {
        if self.config.api_key.is_empty() {
            return Err(FallbackError::Configuration("API key is required".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TextCompleter for OpenAIRestClient {
    async fn complete(&self, request: &CompletionRequest) -> FallbackResult<String> {
        self.ensure_key()?;

        let mut messages = Vec::with_capacity(2);
        if let Some(instructions) = &self.config.instructions {
            messages.push(json!({"role": "system", "content": instructions}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let body = json!({
            "model": self.config.chat_model,
            "messages": messages,
            "user": request.user_id,
        });

        let response = self
            .http
            .post(self.url("chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| FallbackError::Network(format!("Request failed: {e}")))?;

        let bytes = read_success_body(response).await?;
        let parsed: ChatCompletionResponse = serde_json::from_slice(&bytes)
            .map_err(|e| FallbackError::InvalidResponse(format!("Failed to parse response: {e}")))?;

        let text = parsed
            .choices
            .into_iter()
            .find_map(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(FallbackError::InvalidResponse("completion had no content".into()));
        }

        debug!(chars = text.len(), "Fallback completion ready");
        Ok(text)
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAIRestClient {
    async fn synthesize(&self, text: &str) -> FallbackResult<SynthesizedSpeech> {
        self.ensure_key()?;

        let body = json!({
            "model": self.config.tts_model,
            "input": text,
            "voice": self.config.tts_voice,
            "response_format": "pcm",
        });

        let response = self
            .http
            .post(self.url("audio/speech"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| FallbackError::Network(format!("Request failed: {e}")))?;

        let pcm = read_success_body(response).await?.to_vec();
        if pcm.is_empty() {
            return Err(FallbackError::InvalidResponse("speech synthesis returned no audio".into()));
        }

        Ok(SynthesizedSpeech {
            pcm,
            sample_rate: TTS_PCM_SAMPLE_RATE,
        })
    }
}

#[async_trait]
impl Transcriber for OpenAIRestClient {
    async fn transcribe(&self, wav: Vec<u8>) -> FallbackResult<String> {
        self.ensure_key()?;

        let file_part = Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| FallbackError::Configuration(format!("Invalid MIME type: {e}")))?;

        let form = Form::new()
            .part("file", file_part)
            .text("model", self.config.stt_model.clone())
            .text("response_format", "json");

        let response = self
            .http
            .post(self.url("audio/transcriptions"))
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| FallbackError::Network(format!("Request failed: {e}")))?;

        let bytes = read_success_body(response).await?;
        let parsed: TranscriptionResponse = serde_json::from_slice(&bytes)
            .map_err(|e| FallbackError::InvalidResponse(format!("Failed to parse response: {e}")))?;

        Ok(parsed.text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: String) -> OpenAIRestClient {
        OpenAIRestClient::new(RestClientConfig {
            base_url,
            api_key: "sk-test".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            stt_model: "whisper-1".to_string(),
            instructions: Some("Answer briefly.".to_string()),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn request(prompt: &str) -> CompletionRequest {
        CompletionRequest {
            user_id: "u1".to_string(),
            thread_id: None,
            prompt: prompt.to_string(),
        }
    }

    #[tokio::test]
    async fn test_chat_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-4o-mini",
                "messages": [
                    {"role": "system", "content": "Answer briefly."},
                    {"role": "user", "content": "What time is it?"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": " Noon. "}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let text = client(server.uri()).complete(&request("What time is it?")).await.unwrap();
        assert_eq!(text, "Noon.");
    }

    #[tokio::test]
    async fn test_chat_error_body_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Incorrect API key", "type": "invalid_request_error"}
            })))
            .mount(&server)
            .await;

        let err = client(server.uri()).complete(&request("hi")).await.unwrap_err();
        match err {
            FallbackError::AuthenticationFailed(msg) => assert!(msg.contains("Incorrect API key")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_completion_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let err = client(server.uri()).complete(&request("hi")).await.unwrap_err();
        assert!(matches!(err, FallbackError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_speech_returns_raw_pcm() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/audio/speech"))
            .and(body_partial_json(json!({"response_format": "pcm", "voice": "alloy"})))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 0, 2, 0]))
            .mount(&server)
            .await;

        let speech = client(server.uri()).synthesize("Hello").await.unwrap();
        assert_eq!(speech.pcm, vec![1, 0, 2, 0]);
        assert_eq!(speech.sample_rate, 24000);
    }

    #[tokio::test]
    async fn test_transcription_uploads_multipart() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/audio/transcriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": " bonjour "})))
            .expect(1)
            .mount(&server)
            .await;

        let wav = crate::core::audio::pcm16_to_container(&[0i16; 160], 24000, 1).unwrap();
        let text = client(server.uri()).transcribe(wav).await.unwrap();
        assert_eq!(text, "bonjour");

        let received = server.received_requests().await.unwrap();
        let content_type = received[0].headers.get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.starts_with("multipart/form-data"));
    }

    #[tokio::test]
    async fn test_missing_key_fails_fast() {
        let mut c = client("http://127.0.0.1:1".to_string());
        c.config.api_key.clear();
        let err = c.synthesize("hi").await.unwrap_err();
        assert!(matches!(err, FallbackError::Configuration(_)));
    }
}
