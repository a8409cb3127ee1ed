#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use creditbot_contracts::{ChatMessage, ComputeResult, ReportReference};
use creditbot_kernel::QueryClassifier;
use creditbot_runtime::{
    CollaboratorError, Collaborators, ComputeEngine, KvBackend, KvError, MemoryKv,
    MessageSource, Orchestrator, OrchestratorSettings, ReplySink, ReportResolver, StateBackends,
    StateStore,
};
use serde_json::json;

pub const STATE_KEY: &str = "processed_messages.json";
pub const BOT_USER: &str = "UBOT";
pub const OPERATOR: &str = "UOPS";

pub fn look(n: u32) -> String {
    format!("https://acme.looker.com/looks/{n}")
}

pub fn in_scope_query(n: u32) -> String {
    format!("SELECT SUM(cost) AS look_{n} FROM billing WHERE billable_items.friendly_name = 'Authy'")
}

pub fn out_of_scope_query(n: u32) -> String {
    format!("SELECT SUM(cost) AS look_{n} FROM billing WHERE product = 'Authy'")
}

pub fn message(id: &str, text: &str) -> ChatMessage {
    ChatMessage {
        id: id.to_string(),
        text: text.to_string(),
        author_id: Some("UREQ".to_string()),
        is_bot: false,
    }
}

pub fn message_with_looks(id: &str, looks: &[u32]) -> ChatMessage {
    let links: Vec<String> = looks.iter().map(|n| format!("<{}|look {n}>", look(*n))).collect();
    message(id, &format!("Credit request for ACME {}", links.join(" ")))
}

#[derive(Default)]
pub struct FakeSource {
    pub messages: Mutex<Vec<ChatMessage>>,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeSource {
    pub fn with(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages: Mutex::new(messages),
            ..Self::default()
        }
    }

    pub fn push(&self, message: ChatMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

#[async_trait]
impl MessageSource for FakeSource {
    async fn fetch_recent(&self, limit: usize) -> Result<Vec<ChatMessage>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::api("conversations.history", "ratelimited"));
        }
        let messages = self.messages.lock().unwrap();
        let skip = messages.len().saturating_sub(limit);
        Ok(messages[skip..].to_vec())
    }
}

#[derive(Default)]
pub struct RecordingReplies {
    pub replies: Mutex<Vec<(String, String)>>,
    pub directs: Mutex<Vec<(String, String)>>,
    pub fail_replies: AtomicBool,
}

impl RecordingReplies {
    pub fn replies(&self) -> Vec<(String, String)> {
        self.replies.lock().unwrap().clone()
    }

    pub fn directs(&self) -> Vec<(String, String)> {
        self.directs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplySink for RecordingReplies {
    async fn post_reply(&self, thread_id: &str, text: &str) -> Result<(), CollaboratorError> {
        if self.fail_replies.load(Ordering::SeqCst) {
            return Err(CollaboratorError::api("chat.postMessage", "not_in_channel"));
        }
        self.replies
            .lock()
            .unwrap()
            .push((thread_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_direct(&self, operator_id: &str, text: &str) -> Result<(), CollaboratorError> {
        self.directs
            .lock()
            .unwrap()
            .push((operator_id.to_string(), text.to_string()));
        Ok(())
    }
}

/// Maps report links to queries; unknown links fail to resolve.
#[derive(Default)]
pub struct MapResolver {
    pub queries: Mutex<HashMap<String, String>>,
    pub calls: AtomicUsize,
}

impl MapResolver {
    pub fn insert(&self, reference: String, query: String) {
        self.queries.lock().unwrap().insert(reference, query);
    }
}

#[async_trait]
impl ReportResolver for MapResolver {
    async fn resolve_query(&self, reference: &ReportReference) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries
            .lock()
            .unwrap()
            .get(reference.as_str())
            .cloned()
            .ok_or_else(|| CollaboratorError::api("looker look", "Not found"))
    }
}

/// Maps queries to amounts; unknown queries fail.
#[derive(Default)]
pub struct ScriptedEngine {
    pub amounts: Mutex<HashMap<String, f64>>,
    pub calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn insert(&self, query: String, amount: f64) {
        self.amounts.lock().unwrap().insert(query, amount);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeEngine for ScriptedEngine {
    async fn compute(&self, query: &str) -> Result<ComputeResult, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.amounts.lock().unwrap().get(query) {
            Some(amount) => Ok(ComputeResult {
                amount: *amount,
                trace: json!({"rows": 1}),
            }),
            None => Err(CollaboratorError::api("compute", "engine timeout")),
        }
    }
}

/// In-memory backend whose writes start failing once `puts_allowed` is spent.
#[derive(Default)]
pub struct FlakyKv {
    pub inner: MemoryKv,
    pub puts_allowed: AtomicUsize,
    pub puts: AtomicUsize,
    pub fail_gets: AtomicBool,
}

impl FlakyKv {
    pub fn allowing(puts_allowed: usize) -> Self {
        Self {
            puts_allowed: AtomicUsize::new(puts_allowed),
            ..Self::default()
        }
    }

    pub fn heal(&self) {
        self.puts_allowed.store(usize::MAX, Ordering::SeqCst);
    }
}

#[async_trait]
impl KvBackend for FlakyKv {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(KvError::Transport("connection refused".to_string()));
        }
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), KvError> {
        let attempt = self.puts.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.puts_allowed.load(Ordering::SeqCst) {
            return Err(KvError::Transport("connection reset".to_string()));
        }
        self.inner.put(key, bytes).await
    }
}

pub struct Harness {
    pub source: Arc<FakeSource>,
    pub replies: Arc<RecordingReplies>,
    pub resolver: Arc<MapResolver>,
    pub engine: Arc<ScriptedEngine>,
    pub backends: StateBackends,
}

impl Harness {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self::with_backends(
            messages,
            StateBackends {
                primary: Some(Arc::new(MemoryKv::new())),
                fallback: Some(Arc::new(MemoryKv::new())),
            },
        )
    }

    pub fn with_backends(messages: Vec<ChatMessage>, backends: StateBackends) -> Self {
        Self {
            source: Arc::new(FakeSource::with(messages)),
            replies: Arc::new(RecordingReplies::default()),
            resolver: Arc::new(MapResolver::default()),
            engine: Arc::new(ScriptedEngine::default()),
            backends,
        }
    }

    /// Registers look `n` as an in-scope report worth `amount`.
    pub fn priced_look(&self, n: u32, amount: f64) {
        self.resolver.insert(look(n), in_scope_query(n));
        self.engine.insert(in_scope_query(n), amount);
    }

    /// Registers look `n` as in scope but failing in the engine.
    pub fn failing_look(&self, n: u32) {
        self.resolver.insert(look(n), in_scope_query(n));
    }

    pub fn out_of_scope_look(&self, n: u32) {
        self.resolver.insert(look(n), out_of_scope_query(n));
    }

    pub fn settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            bot_name: "CreditBot".to_string(),
            bot_user_id: Some(BOT_USER.to_string()),
            operator_user_id: Some(OPERATOR.to_string()),
            bi_domain: "looker.com".to_string(),
            fetch_limit: 50,
            max_entries: 1000,
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(self.settings())
    }

    pub fn orchestrator_with(&self, settings: OrchestratorSettings) -> Orchestrator {
        Orchestrator::new(settings, classifier(), self.collaborators())
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            source: self.source.clone(),
            replies: self.replies.clone(),
            resolver: self.resolver.clone(),
            engine: self.engine.clone(),
        }
    }

    pub async fn store(&self) -> StateStore {
        StateStore::load(STATE_KEY, self.backends.clone()).await
    }
}

pub fn classifier() -> QueryClassifier {
    QueryClassifier::new(
        "authy",
        &[
            "billable_item_metadata_alex.product".to_string(),
            "billable_items.friendly_name".to_string(),
        ],
    )
}
