use std::collections::HashSet;

use futures::StreamExt;
use serde::Serialize;
use tracing::{info, warn};

use crate::agent::engine::{Engine, TurnEvent, TurnStream};
use crate::settings::RequestOverrides;
use crate::thread::{DisplayMessage, Message, Role, display_projection, generate_thread_id, thread_name};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ThreadSummary {
    pub id: String,
    pub name: String,
    pub current: bool,
}

/// Per-session state behind the chat UI: which thread is open and what it shows.
pub struct ChatController {
    engine: Engine,
    current: String,
    display: Vec<DisplayMessage>,
    known: Vec<String>,
    deleted: HashSet<String>,
}

impl ChatController {
    /// Starts on a fresh thread, seeding the known list from the store.
    pub async fn new(engine: Engine) -> Self {
        let known = match engine.store().list_thread_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "could not list threads");
                Vec::new()
            }
        };
        let mut c = Self { engine, current: String::new(), display: Vec::new(), known, deleted: HashSet::new() };
        c.new_chat();
        c
    }

    pub fn current_thread(&self) -> &str {
        &self.current
    }

    pub fn display(&self) -> &[DisplayMessage] {
        &self.display
    }

    pub fn tool_names(&self) -> Vec<&'static str> {
        self.engine.tools().names()
    }

    pub fn new_chat(&mut self) -> &str {
        let mut id = generate_thread_id();
        while self.known.contains(&id) || self.deleted.contains(&id) {
            id = generate_thread_id();
        }
        info!(thread_id = %id, "new chat");
        self.known.push(id.clone());
        self.current = id;
        self.display.clear();
        &self.current
    }

    pub async fn select_thread(&mut self, thread_id: &str) -> &[DisplayMessage] {
        let history = self.load(thread_id).await;
        if !self.known.iter().any(|t| t == thread_id) {
            self.known.push(thread_id.to_string());
        }
        self.current = thread_id.to_string();
        self.display = display_projection(&history);
        &self.display
    }

    /// On failure nothing changes: the thread stays listed and current.
    pub async fn delete_thread(&mut self, thread_id: &str) -> bool {
        if !self.engine.store().delete_thread(thread_id).await {
            return false;
        }
        self.known.retain(|t| t != thread_id);
        self.deleted.insert(thread_id.to_string());
        if self.current == thread_id {
            self.new_chat();
        }
        true
    }

    /// Store ids plus threads opened this session that have no messages yet.
    pub async fn list_thread_ids(&self) -> Vec<String> {
        let mut ids = match self.engine.store().list_thread_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "could not list threads");
                Vec::new()
            }
        };
        for id in &self.known {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids.retain(|id| !self.deleted.contains(id));
        ids
    }

    /// Newest-id-first listing; empty threads are hidden unless open.
    pub async fn sidebar(&self) -> Vec<ThreadSummary> {
        let mut ids = self.list_thread_ids().await;
        ids.sort_unstable_by(|a, b| b.cmp(a));
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let history = self.load(&id).await;
            let current = id == self.current;
            if history.is_empty() && !current {
                continue;
            }
            out.push(ThreadSummary { name: thread_name(&history), id, current });
        }
        out
    }

    /// Records the user entry and starts the turn. Call [`Self::finish_turn`] with the final event.
    pub async fn submit(&mut self, text: &str, overrides: RequestOverrides) -> TurnStream {
        self.display.push(DisplayMessage { role: Role::User, content: text.to_string() });
        self.engine.submit(&self.current, text, overrides).await
    }

    pub fn finish_turn(&mut self, event: &TurnEvent) {
        if let TurnEvent::Done { answer } = event {
            self.display.push(DisplayMessage { role: Role::Assistant, content: answer.clone() });
        }
    }

    /// Runs a whole submission, handing each fragment to `on_fragment` as it arrives.
    pub async fn submit_and_wait<F>(&mut self, text: &str, overrides: RequestOverrides, mut on_fragment: F) -> anyhow::Result<String>
    where
        F: FnMut(&str),
    {
        let mut stream = self.submit(text, overrides).await;
        while let Some(ev) = stream.next().await {
            match &ev {
                TurnEvent::Fragment { text } => on_fragment(text),
                TurnEvent::Message { .. } => {}
                TurnEvent::Done { answer } => {
                    let answer = answer.clone();
                    self.finish_turn(&ev);
                    return Ok(answer);
                }
                TurnEvent::Failed { error } => anyhow::bail!("{error}"),
            }
        }
        anyhow::bail!("turn ended without an answer")
    }

    async fn load(&self, thread_id: &str) -> Vec<Message> {
        match self.engine.store().load_history(thread_id).await {
            Ok(history) => history,
            Err(e) => {
                warn!(thread_id, error = %e, "could not load thread");
                Vec::new()
            }
        }
    }
}
