//! Wire messages for the worker protocol
//!
//! Line-framed JSON-RPC 2.0: each frame is a single JSON object on its
//! own line. Workers answer requests by echoing the request `id` and
//! push unsolicited notifications (no `id`) for stream events,
//! heartbeats and adaptive feedback.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{GantryError, Result};

/// Methods the control plane invokes on a worker
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const RUNTIME_INFO: &str = "runtime.info";
    pub const SHUTDOWN: &str = "shutdown";
    pub const LOAD_MODEL: &str = "load_model";
    pub const UNLOAD_MODEL: &str = "unload_model";
    pub const TOKENIZE: &str = "tokenize";
    pub const BATCH_TOKENIZE: &str = "batch_tokenize";
    pub const CHECK_DRAFT: &str = "check_draft";
    pub const BATCH_CHECK_DRAFT: &str = "batch_check_draft";
    pub const GENERATE: &str = "generate";
    pub const BATCH_GENERATE: &str = "batch_generate";
    pub const ADAPTIVE_UPDATE: &str = "adaptive.update";
}

/// Notification methods emitted by a worker
pub mod notifications {
    pub const STREAM_CHUNK: &str = "stream.chunk";
    pub const STREAM_STATS: &str = "stream.stats";
    pub const STREAM_COMPLETED: &str = "stream.completed";
    pub const STREAM_ERROR: &str = "stream.error";
    pub const WORKER_HEARTBEAT: &str = "worker.heartbeat";
    pub const ADAPTIVE_RECOMMENDATION: &str = "adaptive.batch_size_recommendation";
}

/// Outgoing JSON-RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Incoming JSON-RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

/// Notification frame: a request without an `id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

impl Notification {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }

    /// Stream id carried in the params, if any
    pub fn stream_id(&self) -> Option<&str> {
        self.params.get("stream_id").and_then(Value::as_str)
    }
}

/// A parsed incoming frame
#[derive(Debug, Clone)]
pub enum Frame {
    Response(Response),
    Notification(Notification),
}

/// Parse one wire line into a frame.
///
/// The `id` field decides: present means response, absent means
/// notification. Anything else is a protocol violation.
pub fn parse_frame(line: &str) -> Result<Frame> {
    let value: Value = serde_json::from_str(line)?;
    let obj = value
        .as_object()
        .ok_or_else(|| GantryError::Runtime("frame is not a JSON object".to_string()))?;

    if obj.contains_key("id") {
        let response: Response = serde_json::from_value(value)?;
        Ok(Frame::Response(response))
    } else if obj.contains_key("method") {
        let notification: Notification = serde_json::from_value(value)?;
        Ok(Frame::Notification(notification))
    } else {
        Err(GantryError::Runtime(
            "frame has neither id nor method".to_string(),
        ))
    }
}

// ============================================================================
// Typed method payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadModelParams {
    pub model_id: String,
    pub draft: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadModelResult {
    pub state: String,
    pub context_length: u32,
    #[serde(default)]
    pub parameter_count: Option<u64>,
    #[serde(default)]
    pub dtype: Option<String>,
    #[serde(default)]
    pub is_vision_model: bool,
    #[serde(default)]
    pub tokenizer_type: Option<String>,
    #[serde(default)]
    pub memory_usage: Option<u64>,
    /// Where the worker actually loaded from; used to backfill the
    /// artifact cache after a miss.
    #[serde(default)]
    pub cached_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnloadModelParams {
    pub model_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizeParams {
    pub model_id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_special_tokens: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizeResult {
    pub tokens: Vec<u32>,
    #[serde(default)]
    pub token_strings: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckDraftParams {
    pub primary_id: String,
    pub draft_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceEstimate {
    pub expected_speedup: f64,
    pub size_ratio: f64,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftDetails {
    pub primary_model: String,
    pub draft_model: String,
    pub performance_estimate: PerformanceEstimate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftCompatibility {
    pub compatible: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub details: DraftDetails,
}

/// Structured-output guidance passed through to the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guidance {
    pub mode: GuidanceMode,
    pub schema: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidanceMode {
    JsonSchema,
    Xml,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateParams {
    pub stream_id: String,
    pub model_id: String,
    pub prompt: String,
    pub streaming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_token_ids: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<Guidance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_model: Option<String>,
}

/// Batched RPC envelope: `{ requests: [...] }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEnvelope {
    pub requests: Vec<Value>,
}

/// One positional result inside a batch response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Batch response: `{ results: [...] }`, index-aligned with the request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResults {
    pub results: Vec<BatchItem>,
}

// ============================================================================
// Notification payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunkPayload {
    pub stream_id: String,
    pub token: String,
    #[serde(default)]
    pub logprob: Option<f64>,
    #[serde(default)]
    pub token_id: Option<u32>,
    #[serde(default)]
    pub is_final: Option<bool>,
    #[serde(default)]
    pub cumulative_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStatsPayload {
    pub stream_id: String,
    pub tokens_generated: u64,
    pub tokens_per_second: f64,
    pub time_to_first_token: f64,
    pub total_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamCompletedPayload {
    pub stream_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamErrorPayload {
    pub stream_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub worker_id: String,
    #[serde(default)]
    pub active_requests: u32,
    #[serde(default)]
    pub memory_usage: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveRecommendation {
    pub recommended_size: usize,
    pub current_size: usize,
    #[serde(default)]
    pub ema_latency: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Averages reported to the worker's adaptive component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveUpdateParams {
    pub avg_latency_ms: f64,
    pub avg_batch_size: f64,
    pub sample_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_response_frame() {
        let line = r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#;
        match parse_frame(line).unwrap() {
            Frame::Response(r) => {
                assert_eq!(r.id, 7);
                assert!(r.error.is_none());
            }
            Frame::Notification(_) => panic!("expected response"),
        }
    }

    #[test]
    fn test_parse_notification_frame() {
        let line = r#"{"jsonrpc":"2.0","method":"stream.chunk","params":{"stream_id":"s1","token":"hi"}}"#;
        match parse_frame(line).unwrap() {
            Frame::Notification(n) => {
                assert_eq!(n.method, notifications::STREAM_CHUNK);
                assert_eq!(n.stream_id(), Some("s1"));
            }
            Frame::Response(_) => panic!("expected notification"),
        }
    }

    #[test]
    fn test_parse_garbage_rejected() {
        assert!(parse_frame("not json").is_err());
        assert!(parse_frame("42").is_err());
        assert!(parse_frame(r#"{"jsonrpc":"2.0"}"#).is_err());
    }

    #[test]
    fn test_generate_params_omit_absent_options() {
        let params = GenerateParams {
            stream_id: "s1".to_string(),
            model_id: "m".to_string(),
            prompt: "hello".to_string(),
            streaming: true,
            max_tokens: Some(16),
            temperature: None,
            top_p: None,
            top_k: None,
            presence_penalty: None,
            frequency_penalty: None,
            repetition_penalty: None,
            stop_sequences: None,
            stop_token_ids: None,
            seed: None,
            guidance: None,
            draft_model: None,
        };
        let wire = serde_json::to_value(&params).unwrap();
        assert_eq!(wire["max_tokens"], json!(16));
        assert!(wire.get("temperature").is_none());
        assert!(wire.get("guidance").is_none());
    }

    #[test]
    fn test_batch_results_roundtrip() {
        let raw = json!({
            "results": [
                {"success": true, "result": {"tokens": [1, 2]}},
                {"success": false, "error": "unknown model"}
            ]
        });
        let parsed: BatchResults = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.results.len(), 2);
        assert!(parsed.results[0].success);
        assert_eq!(parsed.results[1].error.as_deref(), Some("unknown model"));
    }
}
