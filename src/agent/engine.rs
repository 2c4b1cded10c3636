use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::tools::{ToolContext, ToolRegistry};
use crate::models::{LanguageModel, ModelEvent, ModelRequest};
use crate::settings::{EffectiveSettings, GlobalConfigDefaults, RequestOverrides, resolve_effective_settings};
use crate::storage::ThreadStore;
use crate::thread::{Message, Role, ToolCallRequest, ToolOutcome};

const TURN_BUFFER: usize = 64;

/// What a submission reports while it runs. The stream always ends with `Done` or `Failed`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Fragment { text: String },
    Message { message: Message },
    Done { answer: String },
    Failed { error: String },
}

pub type TurnStream = ReceiverStream<TurnEvent>;

enum TurnState {
    ModelTurn,
    ToolTurn(Vec<ToolCallRequest>),
    Done(String),
}

struct TurnSink {
    tx: mpsc::Sender<TurnEvent>,
}

impl TurnSink {
    async fn emit(&self, ev: TurnEvent) {
        // The turn keeps persisting even if nobody is listening any more.
        if self.tx.send(ev).await.is_err() {
            debug!("turn receiver dropped");
        }
    }

    async fn message(&self, msg: &Message) {
        self.emit(TurnEvent::Message { message: msg.clone() }).await;
    }
}

/// Drives the respond / call-tools loop for one thread at a time.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn ThreadStore>,
    model: Arc<dyn LanguageModel>,
    tools: Arc<ToolRegistry>,
    defaults: Arc<GlobalConfigDefaults>,
    http: reqwest::Client,
    /// Held by a running turn until its final event is sent.
    turns: Arc<Mutex<()>>,
}

impl Engine {
    pub fn new(store: Arc<dyn ThreadStore>, model: Arc<dyn LanguageModel>, tools: ToolRegistry, defaults: GlobalConfigDefaults) -> Self {
        Self {
            store,
            model,
            tools: Arc::new(tools),
            defaults: Arc::new(defaults),
            http: reqwest::Client::new(),
            turns: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &Arc<dyn ThreadStore> {
        &self.store
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Starts a turn in the background and returns its event stream.
    ///
    /// Waits for any earlier turn to finish first. The turn runs to completion
    /// even if the returned stream is dropped.
    pub async fn submit(&self, thread_id: &str, text: &str, overrides: RequestOverrides) -> TurnStream {
        let settings = resolve_effective_settings(&self.defaults, &overrides);
        let (tx, rx) = mpsc::channel(TURN_BUFFER);
        let engine = self.clone();
        let thread_id = thread_id.to_string();
        let input = Message::user(text);
        let permit = self.turns.clone().lock_owned().await;
        tokio::spawn(async move {
            let _permit = permit;
            let sink = TurnSink { tx };
            match engine.run_turn(&thread_id, input, &settings, &sink).await {
                Ok(answer) => sink.emit(TurnEvent::Done { answer }).await,
                Err(e) => {
                    metrics::counter!("threadchat_turn_failures_total").increment(1);
                    warn!(thread_id = %thread_id, error = %e, "turn failed");
                    sink.emit(TurnEvent::Failed { error: format!("{e:#}") }).await;
                }
            }
        });
        ReceiverStream::new(rx)
    }

    async fn run_turn(&self, thread_id: &str, input: Message, settings: &EffectiveSettings, sink: &TurnSink) -> anyhow::Result<String> {
        // Requests left unanswered by an interrupted run are settled before new input lands.
        let pending = self.store.pending_tool_calls(thread_id).await?;
        if !pending.is_empty() {
            info!(thread_id, calls = pending.len(), "resuming interrupted tool turn");
            self.tool_turn(thread_id, pending, settings, sink).await?;
        }
        self.store.append(thread_id, &input).await?;
        sink.message(&input).await;

        let mut state = TurnState::ModelTurn;
        let mut steps: u32 = 0;
        loop {
            state = match state {
                TurnState::ModelTurn => {
                    if let Some(max) = settings.loop_policy.max_steps {
                        if steps >= max {
                            anyhow::bail!("stopped after {max} model turns without a final answer");
                        }
                    }
                    steps += 1;
                    self.model_turn(thread_id, settings, sink).await?
                }
                TurnState::ToolTurn(calls) => {
                    self.tool_turn(thread_id, calls, settings, sink).await?;
                    TurnState::ModelTurn
                }
                TurnState::Done(answer) => {
                    info!(thread_id, steps, "turn complete");
                    return Ok(answer);
                }
            };
        }
    }

    async fn model_turn(&self, thread_id: &str, settings: &EffectiveSettings, sink: &TurnSink) -> anyhow::Result<TurnState> {
        let history = self.store.load_history(thread_id).await?;
        let history = context_window(history, settings.loop_policy.max_history_messages);
        debug!(thread_id, messages = history.len(), "model turn");
        metrics::counter!("threadchat_model_turns_total").increment(1);

        let limit = settings.loop_policy.model_timeout_secs.map(Duration::from_secs);
        let req = ModelRequest::new(settings, history, self.tools.definitions());
        let mut stream = within(limit, "model", self.model.stream(req)).await??;

        let mut text = String::new();
        let mut calls = Vec::new();
        let mut seen = HashSet::new();
        while let Some(ev) = within(limit, "model", stream.next()).await? {
            match ev? {
                ModelEvent::TextDelta(t) => {
                    text.push_str(&t);
                    sink.emit(TurnEvent::Fragment { text: t }).await;
                }
                ModelEvent::ToolCall(mut call) => {
                    if !seen.insert(call.id.clone()) {
                        call.id = format!("call_{}", Uuid::new_v4().simple());
                    }
                    debug!(thread_id, tool = %call.name, call_id = %call.id, "tool requested");
                    calls.push(call);
                }
            }
        }

        if calls.is_empty() {
            let msg = Message::assistant(text.clone());
            self.store.append(thread_id, &msg).await?;
            sink.message(&msg).await;
            return Ok(TurnState::Done(text));
        }
        let msg = Message::tool_request(text, calls.clone());
        self.store.append(thread_id, &msg).await?;
        sink.message(&msg).await;
        Ok(TurnState::ToolTurn(calls))
    }

    async fn tool_turn(&self, thread_id: &str, calls: Vec<ToolCallRequest>, settings: &EffectiveSettings, sink: &TurnSink) -> anyhow::Result<()> {
        for call in &calls {
            let outcome = self.dispatch_tool(thread_id, call, settings).await;
            let status = if outcome.is_error() { "error" } else { "ok" };
            metrics::counter!("threadchat_tool_calls_total", "tool" => call.name.clone(), "status" => status).increment(1);
            let msg = Message::tool_result(call, outcome);
            self.store.append(thread_id, &msg).await?;
            sink.message(&msg).await;
        }
        Ok(())
    }

    /// Runs one call. Every failure becomes an error outcome for the model to read.
    pub async fn dispatch_tool(&self, thread_id: &str, call: &ToolCallRequest, settings: &EffectiveSettings) -> ToolOutcome {
        let Some(tool) = self.tools.get(&call.name) else {
            warn!(thread_id, tool = %call.name, "unknown tool requested");
            return ToolOutcome::Error(format!("unknown tool '{}'", call.name));
        };
        let ctx = ToolContext { thread_id, settings, http: &self.http };
        let limit = settings.loop_policy.tool_timeout_secs.map(Duration::from_secs);
        match within(limit, "tool", tool.run(ctx, call.arguments.clone())).await {
            Ok(Ok(payload)) => ToolOutcome::from_payload(payload),
            Ok(Err(e)) | Err(e) => {
                warn!(thread_id, tool = %call.name, error = %e, "tool failed");
                ToolOutcome::Error(e.to_string())
            }
        }
    }
}

async fn within<F: Future>(limit: Option<Duration>, what: &str, fut: F) -> anyhow::Result<F::Output> {
    match limit {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| anyhow::anyhow!("{what} did not respond within {}s", d.as_secs())),
        None => Ok(fut.await),
    }
}

/// Keeps the newest `limit` messages. A window that would open on tool results
/// is widened back to the assistant request that owns them.
pub fn context_window(mut history: Vec<Message>, limit: Option<usize>) -> Vec<Message> {
    let Some(limit) = limit else { return history };
    let limit = limit.max(1);
    if history.len() <= limit {
        return history;
    }
    let mut start = history.len() - limit;
    while start > 0 && history[start].role == Role::Tool {
        start -= 1;
    }
    history.split_off(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::Tool;
    use crate::settings::LoopPolicy;
    use crate::storage::SqliteThreadStore;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::tempdir;

    enum Script {
        Events(Vec<ModelEvent>),
        Fail(&'static str),
        FailMidStream(Vec<ModelEvent>),
    }

    struct ScriptedModel {
        script: Mutex<VecDeque<Script>>,
        seen: Mutex<Vec<ModelRequest>>,
    }

    impl ScriptedModel {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(script.into()), seen: Mutex::new(Vec::new()) })
        }
        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn stream(&self, req: ModelRequest) -> anyhow::Result<crate::models::ModelStream> {
            self.seen.lock().unwrap().push(req);
            let next = self.script.lock().unwrap().pop_front().unwrap_or(Script::Fail("script exhausted"));
            match next {
                Script::Events(evs) => Ok(Box::pin(futures::stream::iter(evs.into_iter().map(Ok::<ModelEvent, anyhow::Error>)))),
                Script::Fail(msg) => Err(anyhow::anyhow!(msg)),
                Script::FailMidStream(evs) => {
                    let items = evs.into_iter().map(Ok::<ModelEvent, anyhow::Error>).chain(std::iter::once(Err(anyhow::anyhow!("connection reset"))));
                    Ok(Box::pin(futures::stream::iter(items)))
                }
            }
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &'static str { "slow" }
        fn description(&self) -> &'static str { "never finishes in time" }
        fn parameters(&self) -> Value { json!({"type": "object"}) }
        async fn run(&self, _ctx: ToolContext<'_>, _args: Value) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!("late"))
        }
    }

    async fn setup(model: Arc<ScriptedModel>) -> (Engine, Arc<SqliteThreadStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}", db_path.to_string_lossy());
        let store = Arc::new(SqliteThreadStore::initialize(Some(url)).await.unwrap());
        let mut tools = ToolRegistry::with_default_tools();
        tools.register(Box::new(SlowTool));
        let engine = Engine::new(store.clone(), model, tools, GlobalConfigDefaults::default());
        (engine, store, dir)
    }

    async fn collect(stream: TurnStream) -> Vec<TurnEvent> {
        stream.collect().await
    }

    fn call(id: &str, name: &str, arguments: Value) -> ToolCallRequest {
        ToolCallRequest { id: id.into(), name: name.into(), arguments }
    }

    fn roles(history: &[Message]) -> Vec<Role> {
        history.iter().map(|m| m.role).collect()
    }

    #[tokio::test]
    async fn plain_answer_ends_after_one_model_turn() {
        let model = ScriptedModel::new(vec![Script::Events(vec![
            ModelEvent::TextDelta("Hel".into()),
            ModelEvent::TextDelta("lo".into()),
        ])]);
        let (engine, store, _dir) = setup(model.clone()).await;

        let events = collect(engine.submit("t", "hi", RequestOverrides::default()).await).await;
        let fragments: Vec<&str> = events.iter().filter_map(|e| match e {
            TurnEvent::Fragment { text } => Some(text.as_str()),
            _ => None,
        }).collect();
        assert_eq!(fragments, vec!["Hel", "lo"]);
        assert!(matches!(events.last(), Some(TurnEvent::Done { answer }) if answer == "Hello"));
        assert_eq!(model.calls(), 1);

        let history = store.load_history("t").await.unwrap();
        assert_eq!(roles(&history), vec![Role::User, Role::Assistant]);
        assert_eq!(history[1].content, "Hello");
        // the model saw the tool schema and the user message
        let seen = model.seen.lock().unwrap();
        assert!(seen[0].tools.iter().any(|d| d["function"]["name"] == "calculator"));
        assert_eq!(seen[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn one_tool_call_orders_transcript() {
        let model = ScriptedModel::new(vec![
            Script::Events(vec![ModelEvent::ToolCall(call("c1", "calculator", json!({"first_num": 6, "second_num": 7, "operation": "mul"})))]),
            Script::Events(vec![ModelEvent::TextDelta("It is 42.".into())]),
        ]);
        let (engine, store, _dir) = setup(model.clone()).await;

        let events = collect(engine.submit("t", "what is 6 times 7?", RequestOverrides::default()).await).await;
        assert!(matches!(events.last(), Some(TurnEvent::Done { answer }) if answer == "It is 42."));

        let history = store.load_history("t").await.unwrap();
        assert_eq!(roles(&history), vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(history[1].tool_calls[0].id, "c1");
        let result = history[2].tool_result.as_ref().unwrap();
        assert_eq!(result.call_id, "c1");
        assert_eq!(result.outcome, ToolOutcome::Success(json!({"result": 42.0})));

        // second model turn received the full history including the result
        let seen = model.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].messages.len(), 3);
        assert_eq!(seen[1].messages[2].role, Role::Tool);
    }

    #[tokio::test]
    async fn tool_failures_feed_back_as_error_results() {
        let model = ScriptedModel::new(vec![
            Script::Events(vec![
                ModelEvent::TextDelta("Let me check.".into()),
                ModelEvent::ToolCall(call("a", "calculator", json!({"first_num": "6", "second_num": "0", "operation": "div"}))),
                ModelEvent::ToolCall(call("b", "teleport", json!({}))),
                ModelEvent::ToolCall(call("b", "calculator", json!({"first_num": 1, "second_num": 1, "operation": "add"}))),
            ]),
            Script::Events(vec![ModelEvent::TextDelta("Cannot divide by zero.".into())]),
        ]);
        let (engine, store, _dir) = setup(model).await;
        let events = collect(engine.submit("t", "6/0?", RequestOverrides::default()).await).await;
        assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));

        let history = store.load_history("t").await.unwrap();
        assert_eq!(roles(&history), vec![Role::User, Role::Assistant, Role::Tool, Role::Tool, Role::Tool, Role::Assistant]);
        assert_eq!(history[1].content, "Let me check.");
        let outcomes: Vec<&ToolOutcome> = history[2..5].iter().map(|m| &m.tool_result.as_ref().unwrap().outcome).collect();
        assert_eq!(outcomes[0], &ToolOutcome::Error("Division by zero".into()));
        assert_eq!(outcomes[1], &ToolOutcome::Error("unknown tool 'teleport'".into()));
        assert_eq!(outcomes[2], &ToolOutcome::Success(json!({"result": 2.0})));
        // duplicate call ids from the model are made unique
        let ids: HashSet<&str> = history[1].tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert!(store.pending_tool_calls("t").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn model_failure_persists_no_partial_answer() {
        let model = ScriptedModel::new(vec![Script::FailMidStream(vec![ModelEvent::TextDelta("half an ans".into())])]);
        let (engine, store, _dir) = setup(model).await;
        let events = collect(engine.submit("t", "hello", RequestOverrides::default()).await).await;
        assert!(matches!(events.last(), Some(TurnEvent::Failed { error }) if error.contains("connection reset")));
        assert_eq!(roles(&store.load_history("t").await.unwrap()), vec![Role::User]);

        let model = ScriptedModel::new(vec![Script::Fail("provider down")]);
        let (engine, store, _dir) = setup(model).await;
        let events = collect(engine.submit("t", "hello", RequestOverrides::default()).await).await;
        assert!(matches!(events.last(), Some(TurnEvent::Failed { error }) if error.contains("provider down")));
        assert_eq!(store.load_history("t").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn step_limit_stops_after_tool_results_are_recorded() {
        let model = ScriptedModel::new(vec![
            Script::Events(vec![ModelEvent::ToolCall(call("c1", "calculator", json!({"first_num": 1, "second_num": 2, "operation": "add"})))]),
            Script::Events(vec![ModelEvent::TextDelta("never reached".into())]),
        ]);
        let (engine, store, _dir) = setup(model.clone()).await;
        let overrides = RequestOverrides { loop_policy: Some(LoopPolicy { max_steps: Some(1), ..Default::default() }), ..Default::default() };
        let events = collect(engine.submit("t", "1+2", overrides).await).await;
        assert!(matches!(events.last(), Some(TurnEvent::Failed { error }) if error.contains("stopped after 1")));
        assert_eq!(model.calls(), 1);
        assert_eq!(roles(&store.load_history("t").await.unwrap()), vec![Role::User, Role::Assistant, Role::Tool]);
    }

    #[tokio::test]
    async fn interrupted_tool_turn_resumes_before_new_input() {
        let model = ScriptedModel::new(vec![Script::Events(vec![ModelEvent::TextDelta("done".into())])]);
        let (engine, store, _dir) = setup(model).await;
        let c = call("c9", "calculator", json!({"first_num": 2, "second_num": 3, "operation": "mul"}));
        store.append("t", &Message::user("2*3?")).await.unwrap();
        store.append("t", &Message::tool_request("", vec![c])).await.unwrap();

        let events = collect(engine.submit("t", "still there?", RequestOverrides::default()).await).await;
        assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));
        let history = store.load_history("t").await.unwrap();
        assert_eq!(roles(&history), vec![Role::User, Role::Assistant, Role::Tool, Role::User, Role::Assistant]);
        assert_eq!(history[2].tool_result.as_ref().unwrap().outcome, ToolOutcome::Success(json!({"result": 6.0})));
        assert_eq!(history[3].content, "still there?");
    }

    #[tokio::test]
    async fn slow_tool_times_out_into_error_payload() {
        let model = ScriptedModel::new(vec![
            Script::Events(vec![ModelEvent::ToolCall(call("s", "slow", json!({})))]),
            Script::Events(vec![ModelEvent::TextDelta("gave up".into())]),
        ]);
        let (engine, store, _dir) = setup(model).await;
        let overrides = RequestOverrides { loop_policy: Some(LoopPolicy { tool_timeout_secs: Some(1), ..Default::default() }), ..Default::default() };
        let events = collect(engine.submit("t", "go", overrides).await).await;
        assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));
        let history = store.load_history("t").await.unwrap();
        assert_eq!(history[2].tool_result.as_ref().unwrap().outcome, ToolOutcome::Error("tool did not respond within 1s".into()));
    }

    #[test]
    fn context_window_keeps_results_with_their_request() {
        let c = call("c", "calculator", json!({}));
        let history = vec![
            Message::user("a"),
            Message::tool_request("", vec![c.clone()]),
            Message::tool_result(&c, ToolOutcome::Success(json!({"result": 1.0}))),
            Message::assistant("b"),
            Message::user("c"),
        ];
        assert_eq!(context_window(history.clone(), None).len(), 5);
        assert_eq!(context_window(history.clone(), Some(10)).len(), 5);
        let w = context_window(history.clone(), Some(3));
        assert_eq!(roles(&w), vec![Role::Assistant, Role::Tool, Role::Assistant, Role::User]);
        assert_eq!(w[0].tool_calls.len(), 1);
        let w = context_window(history.clone(), Some(4));
        assert_eq!(roles(&w), vec![Role::Assistant, Role::Tool, Role::Assistant, Role::User]);
        let w = context_window(history, Some(2));
        assert_eq!(roles(&w), vec![Role::Assistant, Role::User]);
    }

    #[test]
    fn context_window_ending_in_tool_results_keeps_the_request() {
        let (a, b) = (call("a", "calculator", json!({})), call("b", "search", json!({})));
        let history = vec![
            Message::user("q"),
            Message::tool_request("", vec![a.clone(), b.clone()]),
            Message::tool_result(&a, ToolOutcome::Success(json!({"result": 2.0}))),
            Message::tool_result(&b, ToolOutcome::Error("offline".into())),
        ];
        for limit in [Some(0), Some(1), Some(2)] {
            let w = context_window(history.clone(), limit);
            assert_eq!(roles(&w), vec![Role::Assistant, Role::Tool, Role::Tool], "limit {limit:?}");
        }
        let w = context_window(history, Some(3));
        assert_eq!(w.len(), 3);
        assert_eq!(w[0].role, Role::Assistant);
    }
}
