use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::settings::{EffectiveSettings, ModelParams};
use crate::thread::{Message, Role, ToolCallRequest};

#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<Value>,
    pub params: ModelParams,
}

impl ModelRequest {
    pub fn new(settings: &EffectiveSettings, messages: Vec<Message>, tools: Vec<Value>) -> Self {
        Self {
            model: settings.model.clone(),
            system_prompt: settings.system_prompt.clone(),
            messages,
            tools,
            params: settings.model_params.clone(),
        }
    }
}

/// One item of a streamed model reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    TextDelta(String),
    ToolCall(ToolCallRequest),
}

pub type ModelStream = Pin<Box<dyn Stream<Item = anyhow::Result<ModelEvent>> + Send>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Text deltas arrive as they are produced; tool calls once fully assembled.
    async fn stream(&self, req: ModelRequest) -> anyhow::Result<ModelStream>;
}

#[derive(Clone)]
pub struct OpenAICompatible {
    pub base_url: String,
    pub api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAICompatible {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self { base_url: base_url.into(), api_key, client: reqwest::Client::new() }
    }

    pub fn from_env() -> Self {
        let base_url = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        Self::new(base_url, api_key)
    }
}

#[derive(Debug, Serialize)]
struct OaiChatRequest<'a> {
    model: &'a str,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "no_tools")] tools: &'a [Value],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")] temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")] max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")] top_p: Option<f32>,
}

fn no_tools(tools: &&[Value]) -> bool {
    tools.is_empty()
}

fn to_wire_message(msg: &Message) -> Value {
    match msg.role {
        Role::User => json!({"role": "user", "content": msg.content}),
        Role::Assistant if msg.tool_calls.is_empty() => json!({"role": "assistant", "content": msg.content}),
        Role::Assistant => {
            let calls: Vec<Value> = msg.tool_calls.iter().map(|c| json!({
                "id": c.id,
                "type": "function",
                "function": {"name": c.name, "arguments": c.arguments.to_string()},
            })).collect();
            let content = if msg.content.is_empty() { Value::Null } else { Value::String(msg.content.clone()) };
            json!({"role": "assistant", "content": content, "tool_calls": calls})
        }
        Role::Tool => {
            let call_id = msg.tool_result.as_ref().map(|r| r.call_id.clone()).unwrap_or_default();
            json!({"role": "tool", "tool_call_id": call_id, "content": msg.content})
        }
    }
}

fn to_wire_messages(req: &ModelRequest) -> Vec<Value> {
    let mut out = Vec::with_capacity(req.messages.len() + 1);
    if let Some(system) = &req.system_prompt {
        out.push(json!({"role": "system", "content": system}));
    }
    out.extend(req.messages.iter().map(to_wire_message));
    out
}

#[async_trait]
impl LanguageModel for OpenAICompatible {
    async fn stream(&self, req: ModelRequest) -> anyhow::Result<ModelStream> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = OaiChatRequest {
            model: &req.model,
            messages: to_wire_messages(&req),
            tools: &req.tools,
            stream: true,
            temperature: req.params.temperature,
            max_tokens: req.params.max_tokens,
            top_p: req.params.top_p,
        };
        let mut rb = self.client.post(url).json(&body);
        if let Some(key) = &self.api_key {
            rb = rb.bearer_auth(key);
        }
        debug!(model = %req.model, messages = req.messages.len(), "model request");
        let resp = rb.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            anyhow::bail!("model call failed: {} {}", status, detail.trim());
        }

        let mut bytes = Box::pin(resp.bytes_stream());
        let stream = async_stream::try_stream! {
            let mut decoder = SseDecoder::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(anyhow::Error::from)?;
                for ev in decoder.push(&chunk)? {
                    yield ev;
                }
                if decoder.is_done() {
                    break;
                }
            }
            if !decoder.is_done() {
                Err::<(), anyhow::Error>(anyhow::anyhow!("model stream ended before [DONE]"))?;
            }
            for ev in decoder.finish() {
                yield ev;
            }
        };
        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incremental decoder for `text/event-stream` chat completion chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    calls: BTreeMap<u64, PartialCall>,
    done: bool,
}

#[derive(Debug, Deserialize)]
struct OaiChunk {
    #[serde(default)]
    choices: Vec<OaiChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct OaiChunkChoice {
    #[serde(default)]
    delta: OaiDelta,
}

#[derive(Debug, Default, Deserialize)]
struct OaiDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OaiToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct OaiToolCallDelta {
    #[serde(default)]
    index: u64,
    id: Option<String>,
    function: Option<OaiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OaiFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

impl SseDecoder {
    pub fn is_done(&self) -> bool { self.done }

    /// Feeds raw bytes; returns the text deltas completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> anyhow::Result<Vec<ModelEvent>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.handle_line(line.trim(), &mut out)?;
        }
        Ok(out)
    }

    /// Flushes the assembled tool calls in index order.
    pub fn finish(&mut self) -> Vec<ModelEvent> {
        let calls = std::mem::take(&mut self.calls);
        calls
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| {
                let arguments = if c.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&c.arguments).unwrap_or_else(|e| {
                        warn!(tool = %c.name, error = %e, "unparseable tool arguments");
                        Value::String(c.arguments.clone())
                    })
                };
                let id = if c.id.is_empty() { format!("call_{}", Uuid::new_v4().simple()) } else { c.id };
                ModelEvent::ToolCall(ToolCallRequest { id, name: c.name, arguments })
            })
            .collect()
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<ModelEvent>) -> anyhow::Result<()> {
        let Some(data) = line.strip_prefix("data:") else { return Ok(()) };
        let data = data.trim();
        if data.is_empty() || self.done {
            return Ok(());
        }
        if data == "[DONE]" {
            self.done = true;
            return Ok(());
        }
        let v: Value = serde_json::from_str(data)?;
        if let Some(err) = v.get("error") {
            anyhow::bail!("model stream error: {}", err);
        }
        let chunk: OaiChunk = serde_json::from_value(v)?;
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    out.push(ModelEvent::TextDelta(text));
                }
            }
            for tc in choice.delta.tool_calls {
                let entry = self.calls.entry(tc.index).or_default();
                if let Some(id) = tc.id {
                    entry.id = id;
                }
                if let Some(f) = tc.function {
                    if let Some(name) = f.name {
                        entry.name.push_str(&name);
                    }
                    if let Some(args) = f.arguments {
                        entry.arguments.push_str(&args);
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelSelector;

impl ModelSelector {
    pub fn select(model_override: Option<String>, global_default: Option<String>) -> Option<String> {
        model_override.or(global_default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ToolOutcome;
    use axum::{Router, routing::post};

    #[test]
    fn decoder_handles_split_lines_and_tool_deltas() {
        let mut d = SseDecoder::default();
        let mut events = d.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel").unwrap();
        assert!(events.is_empty());
        events.extend(d.push(b"lo\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"function\":{\"name\":\"calculator\",\"arguments\":\"{\\\"first_num\\\":\"}}]}}]}\n").unwrap());
        events.extend(d.push(b"data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"6}\"}}]}}]}\n: keep-alive\ndata: [DONE]\n").unwrap());
        assert!(d.is_done());
        events.extend(d.finish());
        assert_eq!(events, vec![
            ModelEvent::TextDelta("Hello".into()),
            ModelEvent::ToolCall(ToolCallRequest { id: "call_a".into(), name: "calculator".into(), arguments: json!({"first_num": 6}) }),
        ]);
    }

    #[test]
    fn decoder_surfaces_provider_errors() {
        let mut d = SseDecoder::default();
        assert!(d.push(b"data: {\"error\":{\"message\":\"rate limited\"}}\n").is_err());
        assert!(SseDecoder::default().push(b"data: {not json\n").is_err());
    }

    #[test]
    fn wire_messages_carry_tool_identity() {
        let call = ToolCallRequest { id: "c1".into(), name: "search".into(), arguments: json!({"query": "rust"}) };
        let req = ModelRequest {
            system_prompt: Some("sys".into()),
            messages: vec![
                Message::user("hi"),
                Message::tool_request("", vec![call.clone()]),
                Message::tool_result(&call, ToolOutcome::Error("offline".into())),
            ],
            ..Default::default()
        };
        let wire = to_wire_messages(&req);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[2]["tool_calls"][0]["id"], "c1");
        assert_eq!(wire[2]["tool_calls"][0]["function"]["arguments"], "{\"query\":\"rust\"}");
        assert!(wire[2]["content"].is_null());
        assert_eq!(wire[3]["tool_call_id"], "c1");
        assert_eq!(wire[3]["content"], "{\"error\":\"offline\"}");
    }

    #[tokio::test]
    async fn streams_from_openai_compatible_endpoint() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"4\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"2\"}}]}\n\ndata: [DONE]\n\n";
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/v1/chat/completions", post(move || async move { body }))).await.unwrap();
        });

        let model = OpenAICompatible::new(format!("http://{}/v1/", addr), None);
        let mut s = model.stream(ModelRequest { model: "m".into(), messages: vec![Message::user("6*7")], ..Default::default() }).await.unwrap();
        let mut text = String::new();
        while let Some(ev) = s.next().await {
            if let ModelEvent::TextDelta(t) = ev.unwrap() {
                text.push_str(&t);
            }
        }
        assert_eq!(text, "42");
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"The capital of Fr\"}}]}\n\n";
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/chat/completions", post(move || async move { body }))).await.unwrap();
        });

        let model = OpenAICompatible::new(format!("http://{}", addr), None);
        let mut s = model.stream(ModelRequest { model: "m".into(), messages: vec![Message::user("capital of France?")], ..Default::default() }).await.unwrap();
        let mut events = Vec::new();
        while let Some(ev) = s.next().await {
            events.push(ev);
        }
        assert!(matches!(events.first(), Some(Ok(ModelEvent::TextDelta(t))) if t == "The capital of Fr"));
        let err = events.last().unwrap().as_ref().err().unwrap();
        assert!(err.to_string().contains("[DONE]"));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = Router::new().route("/chat/completions", post(|| async { (axum::http::StatusCode::UNAUTHORIZED, "bad key") }));
            axum::serve(listener, app).await.unwrap();
        });
        let model = OpenAICompatible::new(format!("http://{}", addr), Some("k".into()));
        let err = model.stream(ModelRequest::default()).await.err().unwrap();
        assert!(err.to_string().contains("401"));
    }

    #[test]
    fn selector_prefers_override() {
        assert_eq!(ModelSelector::select(Some("a".into()), Some("b".into())).as_deref(), Some("a"));
        assert_eq!(ModelSelector::select(None, Some("b".into())).as_deref(), Some("b"));
    }
}
