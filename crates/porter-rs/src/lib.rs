//! OpenAI-compatible chat bridge onto the Porter driver-call API.
//!
//! `porter-rs` accepts OpenAI-style chat-completion requests, maps the
//! caller's `relay:`-prefixed model id to the backend id, forwards the call
//! to the platform's single `/drivers/call` endpoint, and reshapes the
//! reply (or streamed chunks) back into the OpenAI wire format. The caller
//! always sees their own model id echoed back — the backend never learns
//! the prefix, and the caller never learns the stripped id.
//!
//! # Getting started
//!
//! ```ignore
//! use porter_rs::{ChatMessage, GenerationParams, PorterClient, TokenFile};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), String> {
//!     let client = PorterClient::new(TokenFile::new("/etc/porter/token"))?;
//!
//!     let messages = vec![
//!         ChatMessage::system("You are terse."),
//!         ChatMessage::user("Say hi."),
//!     ];
//!     let completion = client
//!         .chat("relay:gpt-5", &messages, &GenerationParams::default())
//!         .await?;
//!     println!("{}", completion.choices[0]["message"]["content"]);
//!     Ok(())
//! }
//! ```
//!
//! Streaming works the same way through
//! [`chat_stream`](PorterClient::chat_stream), which returns a lazy
//! [`ChunkStream`](streaming::ChunkStream); dropping it stops all further
//! transport reads.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`retry`] | Bounded retry with doubling backoff and error classification |
//! | [`streaming`] | Byte-to-line reassembly and chunk translation |
//! | [`token`] | Bearer-token sources, file-backed with mtime caching |
//! | [`catalog`] | `relay:` model-id mapping |

pub mod catalog;
pub mod retry;
pub mod streaming;
pub mod token;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, trace};

pub use catalog::{DEFAULT_MODEL, MODEL_PREFIX, backend_model};
pub use retry::RetryConfig;
pub use streaming::{ChunkStream, chunks_from_bytes, chunks_from_response};
pub use token::{TokenFile, TokenSource};

// ── Constants ──────────────────────────────────────────────────────

/// Default API origin for driver calls.
pub const DEFAULT_BASE_URL: &str = "https://api.porter.dev";

/// Driver-call endpoint, relative to the API origin.
const CALL_PATH: &str = "/drivers/call";

/// Interface every chat-completion driver implements.
pub const CHAT_INTERFACE: &str = "porter-chat-completion";

/// Default driver service handling relayed chat completions.
pub const DEFAULT_SERVICE: &str = "relay";

// ── Request types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in an OpenAI-style conversation, passed through to the
/// backend verbatim.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Generation parameters forwarded only when the caller set them.
///
/// An unset field never appears in the argument bag — absence propagates as
/// absence, so the backend's own defaults apply.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct GenerationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// JSON body of a driver call: addressing triple plus the argument bag.
///
/// Built fresh for every call and never mutated after send.
#[derive(Serialize, Debug)]
pub struct DriverCall {
    pub interface: String,
    pub service: String,
    pub method: String,
    pub args: Value,
}

// ── Response types ─────────────────────────────────────────────────

/// The `{success, result|error}` wrapper non-stream driver replies arrive in.
#[derive(Deserialize, Debug)]
pub struct DriverReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
}

/// A full chat completion in the OpenAI wire shape.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: u64,
    /// The caller's original (prefixed) model id, echoed back.
    pub model: String,
    /// Choice objects, verbatim when the backend provided them.
    pub choices: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
}

/// One incremental unit of a streamed completion.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    /// The caller's original (prefixed) model id, echoed back.
    pub model: String,
    /// Delta-carrying choice objects, verbatim; empty when omitted.
    pub choices: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for the Porter driver-call endpoint.
pub struct PorterClient {
    pub(crate) client: reqwest::Client,
    pub(crate) base_url: String,
    pub(crate) service: String,
    pub(crate) retry: RetryConfig,
    pub(crate) timeout: Duration,
    pub(crate) tokens: Arc<dyn TokenSource>,
}

impl PorterClient {
    /// Create a client against [`DEFAULT_BASE_URL`] with default retry
    /// behavior and a 120-second timeout on non-streaming exchanges.
    pub fn new(tokens: impl TokenSource + 'static) -> Result<Self, String> {
        // No client-wide timeout: reqwest counts it until the body is fully
        // read, which would cut long-lived streams short. The non-streaming
        // path applies `self.timeout` per request instead.
        let client = reqwest::Client::builder()
            .user_agent("porter-bridge/0.2")
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            service: DEFAULT_SERVICE.to_string(),
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(120),
            tokens: Arc::new(tokens),
        })
    }

    /// Point the client at a different API origin.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Address a different driver service.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Override retry behavior for non-streaming calls.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override the per-request timeout on non-streaming exchanges.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a chat completion and wait for the full response.
    ///
    /// Fails fast — before any network I/O — when the token source has
    /// nothing to give. The exchange itself runs under the retry
    /// orchestrator.
    pub async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<ChatCompletion, String> {
        let token = self.bearer_token()?;
        let call = self.build_call(model, messages, params, false);
        debug!(
            "Driver call: model={model} -> {}, messages={}, service={}",
            catalog::backend_model(model),
            messages.len(),
            self.service,
        );
        trace!(
            "Call payload size: {} bytes",
            serde_json::to_string(&call).map_or(0, |s| s.len())
        );

        let reply = retry::retry_call(&self.retry, || self.dispatch(&call, &token)).await?;
        completion_from_reply(reply, model)
    }

    pub(crate) fn bearer_token(&self) -> Result<String, String> {
        self.tokens
            .token()
            .ok_or_else(|| "no authentication token available".to_string())
    }

    pub(crate) fn call_url(&self) -> String {
        format!("{}{CALL_PATH}", self.base_url.trim_end_matches('/'))
    }

    /// Assemble a fresh driver-call envelope.
    pub(crate) fn build_call(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &GenerationParams,
        stream: bool,
    ) -> DriverCall {
        let mut args = serde_json::Map::new();
        args.insert(
            "model".into(),
            Value::String(catalog::backend_model(model).to_string()),
        );
        args.insert(
            "messages".into(),
            serde_json::to_value(messages).unwrap_or_else(|_| Value::Array(Vec::new())),
        );
        args.insert("stream".into(), Value::Bool(stream));
        // Only params the caller actually set are serialized.
        if let Ok(Value::Object(extra)) = serde_json::to_value(params) {
            args.extend(extra);
        }

        DriverCall {
            interface: CHAT_INTERFACE.to_string(),
            service: self.service.clone(),
            method: "complete".to_string(),
            args: Value::Object(args),
        }
    }

    /// Perform one driver-call exchange.
    ///
    /// Error strings embed the HTTP status when there is one, which is what
    /// the retry classification keys on.
    pub(crate) async fn dispatch(
        &self,
        call: &DriverCall,
        token: &str,
    ) -> Result<DriverReply, String> {
        let start = Instant::now();
        let response = self
            .client
            .post(self.call_url())
            .timeout(self.timeout)
            .header("Authorization", format!("Bearer {token}"))
            .json(call)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?;
        debug!(
            "Driver reply: HTTP {status} in {:.1}s ({} bytes)",
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(format!("driver call HTTP {status}: {text}"));
        }
        serde_json::from_str(&text).map_err(|e| format!("failed to parse driver reply: {e}"))
    }
}

// ── Reply translation ──────────────────────────────────────────────

/// Unwrap a driver reply and translate its result.
///
/// `success=false` and a null/missing result are both hard failures — a
/// failure is never reported as a successful empty completion.
fn completion_from_reply(reply: DriverReply, model: &str) -> Result<ChatCompletion, String> {
    if !reply.success {
        let detail = reply
            .error
            .unwrap_or_else(|| "unspecified driver error".to_string());
        return Err(match reply.error_code {
            Some(code) => format!("driver reported failure ({code}): {detail}"),
            None => format!("driver reported failure: {detail}"),
        });
    }
    match reply.result {
        Some(result) if !result.is_null() => completion_from_result(result, model),
        _ => Err("driver reported success with an empty result".to_string()),
    }
}

/// Rewrite an opaque driver result into the OpenAI completion shape.
///
/// A `choices` array is used verbatim. Otherwise a single choice is
/// synthesized from the flat `content` field or, failing that, the nested
/// `message.content` field — in that fixed order. The returned `model` is
/// always the caller's original id.
fn completion_from_result(result: Value, model: &str) -> Result<ChatCompletion, String> {
    let choices = match result.get("choices").and_then(Value::as_array) {
        Some(choices) => choices.clone(),
        None => vec![synthesize_choice(&result)?],
    };
    let id = result
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(new_completion_id);
    let created = result
        .get("created")
        .and_then(Value::as_u64)
        .unwrap_or_else(unix_timestamp);
    let usage = result.get("usage").filter(|u| !u.is_null()).cloned();

    Ok(ChatCompletion {
        id,
        object: "chat.completion".to_string(),
        created,
        model: model.to_string(),
        choices,
        usage,
    })
}

/// Build the single choice for replies carrying bare content instead of a
/// `choices` array.
fn synthesize_choice(result: &Value) -> Result<Value, String> {
    let content = result
        .get("content")
        .and_then(Value::as_str)
        .or_else(|| {
            result
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
        })
        .ok_or_else(|| "driver result carries no recognizable completion content".to_string())?;
    let finish_reason = result
        .get("finish_reason")
        .and_then(Value::as_str)
        .unwrap_or("stop");

    Ok(json!({
        "index": 0,
        "message": {"role": "assistant", "content": content},
        "finish_reason": finish_reason,
    }))
}

// ── Identifiers ────────────────────────────────────────────────────

/// Generate an identifier for responses the backend left unlabelled.
pub(crate) fn new_completion_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    // Counter keeps ids unique for sub-nanosecond calls.
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("chatcmpl-{ts:x}{count:04x}")
}

/// Seconds since the Unix epoch, for `created` fields.
pub(crate) fn unix_timestamp() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> PorterClient {
        PorterClient::new(|| Some("tok".to_string())).unwrap()
    }

    #[test]
    fn message_constructors() {
        let sys = ChatMessage::system("be terse");
        assert_eq!(sys.role, MessageRole::System);
        assert_eq!(sys.content, "be terse");

        let user = ChatMessage::user("hi");
        assert_eq!(user.role, MessageRole::User);

        let assistant = ChatMessage::assistant("hello");
        assert_eq!(assistant.role, MessageRole::Assistant);
    }

    #[test]
    fn unset_params_serialize_to_nothing() {
        let empty = serde_json::to_value(GenerationParams::default()).unwrap();
        assert_eq!(empty, json!({}));

        let partial = serde_json::to_value(GenerationParams {
            temperature: Some(0.2),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(partial, json!({"temperature": 0.2}));
    }

    #[test]
    fn build_call_maps_model_and_forwards_only_set_params() {
        let client = test_client();
        let messages = vec![ChatMessage::user("hi")];
        let params = GenerationParams {
            max_tokens: Some(256),
            ..Default::default()
        };
        let call = client.build_call("relay:gpt-5", &messages, &params, false);

        assert_eq!(call.interface, CHAT_INTERFACE);
        assert_eq!(call.service, DEFAULT_SERVICE);
        assert_eq!(call.method, "complete");
        assert_eq!(call.args["model"], json!("gpt-5"));
        assert_eq!(call.args["stream"], json!(false));
        assert_eq!(call.args["max_tokens"], json!(256));
        assert!(call.args.get("temperature").is_none());
        assert!(call.args.get("top_p").is_none());
        assert_eq!(call.args["messages"][0]["content"], json!("hi"));
    }

    #[test]
    fn call_url_tolerates_trailing_slash() {
        let client = test_client().with_base_url("https://example.test/");
        assert_eq!(client.call_url(), "https://example.test/drivers/call");
    }

    #[tokio::test]
    async fn missing_token_fails_before_any_network() {
        // An unroutable origin: reaching the network would fail differently.
        let client = PorterClient::new(|| None::<String>)
            .unwrap()
            .with_base_url("http://127.0.0.1:1");
        let err = client
            .chat("relay:gpt-5", &[ChatMessage::user("hi")], &GenerationParams::default())
            .await
            .unwrap_err();
        assert_eq!(err, "no authentication token available");
    }

    #[test]
    fn flat_content_synthesizes_single_choice() {
        let reply = DriverReply {
            success: true,
            result: Some(json!({"content": "hi"})),
            error: None,
            error_code: None,
        };
        let completion = completion_from_reply(reply, "relay:gpt-5").unwrap();

        assert_eq!(completion.choices.len(), 1);
        assert_eq!(completion.choices[0]["message"]["content"], json!("hi"));
        assert_eq!(completion.choices[0]["finish_reason"], json!("stop"));
        assert_eq!(completion.model, "relay:gpt-5");
        assert_eq!(completion.object, "chat.completion");
        assert!(completion.id.starts_with("chatcmpl-"));
        assert!(completion.created > 0);
    }

    #[test]
    fn nested_message_content_is_second_priority() {
        let result = json!({"message": {"content": "nested"}});
        let completion = completion_from_result(result, "relay:gpt-5").unwrap();
        assert_eq!(
            completion.choices[0]["message"]["content"],
            json!("nested")
        );

        // Flat content wins when both shapes are present.
        let both = json!({"content": "flat", "message": {"content": "nested"}});
        let completion = completion_from_result(both, "relay:gpt-5").unwrap();
        assert_eq!(completion.choices[0]["message"]["content"], json!("flat"));
    }

    #[test]
    fn backend_choices_pass_through_verbatim() {
        let result = json!({
            "id": "cmpl-9",
            "created": 1700000000,
            "choices": [
                {"index": 0, "message": {"role": "assistant", "content": "a"}, "finish_reason": "length"},
                {"index": 1, "message": {"role": "assistant", "content": "b"}, "finish_reason": "stop"},
            ],
            "usage": {"total_tokens": 12},
        });
        let completion = completion_from_result(result.clone(), "relay:gpt-5").unwrap();

        assert_eq!(completion.id, "cmpl-9");
        assert_eq!(completion.created, 1700000000);
        assert_eq!(completion.choices.len(), 2);
        assert_eq!(completion.choices, result["choices"].as_array().unwrap().clone());
        assert_eq!(completion.usage, Some(json!({"total_tokens": 12})));
        // The backend id never leaks into the response.
        assert_eq!(completion.model, "relay:gpt-5");
    }

    #[test]
    fn driver_failure_carries_error_text() {
        let reply = DriverReply {
            success: false,
            result: None,
            error: Some("boom".to_string()),
            error_code: Some("rate_limit".to_string()),
        };
        let err = completion_from_reply(reply, "relay:gpt-5").unwrap_err();
        assert!(err.contains("boom"));
        assert!(err.contains("rate_limit"));
    }

    #[test]
    fn empty_success_is_a_hard_failure() {
        let null_result = DriverReply {
            success: true,
            result: Some(Value::Null),
            error: None,
            error_code: None,
        };
        assert!(completion_from_reply(null_result, "relay:gpt-5").is_err());

        let missing_result = DriverReply {
            success: true,
            result: None,
            error: None,
            error_code: None,
        };
        assert!(completion_from_reply(missing_result, "relay:gpt-5").is_err());
    }

    #[test]
    fn unrecognizable_result_is_a_hard_failure() {
        let err = completion_from_result(json!({"weird": true}), "relay:gpt-5").unwrap_err();
        assert!(err.contains("no recognizable completion content"));
    }

    #[test]
    fn completion_ids_unique() {
        let a = new_completion_id();
        let b = new_completion_id();
        assert_ne!(a, b);
        assert!(a.starts_with("chatcmpl-"));
    }
}
