#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

use stream_chat_service::{
    AppConfig, AppState, BackendConfig, ChatMode, ChatSession, MemoryStore, ModelRegistry,
    ServiceError,
    model::{BackendKind, ImageFeatures, LogitsModel, ModelSource, Vocabulary},
    session::OutboundEvent,
};

/// Word-level vocabulary: `[UNK]`=0, `Hello`=1, `world`=2, `again`=3, `<eos>`=4.
pub const TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": { "type": "Whitespace" },
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": { "[UNK]": 0, "Hello": 1, "world": 2, "again": 3, "<eos>": 4 },
        "unk_token": "[UNK]"
    }
}"#;

pub const EOS_ID: u32 = 4;
const VOCAB_SIZE: usize = 5;

/// Deterministic model: the next word follows the last one in the cycle
/// Hello -> world -> again -> Hello. Anything else is followed by Hello.
pub struct ScriptedModel {
    calls: Arc<AtomicUsize>,
    longest_context: Arc<AtomicUsize>,
    step_delay: Duration,
    eos_after: Option<usize>,
    produced: usize,
}

impl LogitsModel for ScriptedModel {
    fn next_token_logits(
        &mut self,
        context: &[u32],
        _image: Option<&ImageFeatures>,
    ) -> Result<Vec<f32>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.longest_context
            .fetch_max(context.len(), Ordering::SeqCst);
        if !self.step_delay.is_zero() {
            thread::sleep(self.step_delay);
        }

        let next = if self.eos_after == Some(self.produced) {
            EOS_ID
        } else {
            match context.last() {
                Some(1) => 2,
                Some(2) => 3,
                _ => 1,
            }
        };
        self.produced += 1;

        let mut logits = vec![0.0; VOCAB_SIZE];
        logits[next as usize] = 5.0;
        Ok(logits)
    }

    fn encode_image(&mut self, path: &Path) -> Result<ImageFeatures, ServiceError> {
        if !path.exists() {
            return Err(ServiceError::not_found(path.display().to_string()));
        }
        Ok(ImageFeatures {
            shape: vec![1, 3, 2, 2],
            pixels: vec![0.5; 12],
        })
    }
}

/// In-memory [`ModelSource`] that counts how many models it built.
#[derive(Clone, Default)]
pub struct TestSource {
    pub loads: Arc<AtomicUsize>,
    pub calls: Arc<AtomicUsize>,
    pub longest_context: Arc<AtomicUsize>,
    pub fail: Arc<AtomicBool>,
    pub load_delay: Duration,
    pub step_delay: Duration,
    pub eos_after: Option<usize>,
}

impl TestSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slow_steps(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn slow_loads(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn eos_after(mut self, tokens: usize) -> Self {
        self.eos_after = Some(tokens);
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The most ids any forward pass was given.
    pub fn longest_context(&self) -> usize {
        self.longest_context.load(Ordering::SeqCst)
    }
}

impl ModelSource for TestSource {
    fn load_vocabulary(&self, _config: &BackendConfig) -> Result<Vocabulary, ServiceError> {
        Vocabulary::from_json(TOKENIZER_JSON)
    }

    fn load_model(&self, _config: &BackendConfig) -> Result<Box<dyn LogitsModel>, ServiceError> {
        if !self.load_delay.is_zero() {
            thread::sleep(self.load_delay);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ServiceError::Other("weights are corrupt".into()));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedModel {
            calls: Arc::clone(&self.calls),
            longest_context: Arc::clone(&self.longest_context),
            step_delay: self.step_delay,
            eos_after: self.eos_after,
            produced: 0,
        }))
    }
}

pub fn direct_config() -> BackendConfig {
    let mut config = BackendConfig::new(BackendKind::DirectDecoder, "models/tiny-gpt.ts");
    config.eos_token_id = Some(EOS_ID);
    config
}

pub fn test_backends() -> BTreeMap<String, BackendConfig> {
    let mut table = BTreeMap::new();
    table.insert("tiny-gpt".to_string(), direct_config());

    let mut chat = BackendConfig::new(BackendKind::CausalLm, "models/tiny-chat.ts");
    chat.eos_token = Some("<eos>".to_string());
    table.insert("tiny-chat".to_string(), chat);

    let mut vision = BackendConfig::new(BackendKind::Vision, "models/tiny-vision.ts");
    vision.eos_token = Some("<eos>".to_string());
    table.insert("tiny-vision".to_string(), vision);
    table
}

pub fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("chat-test-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

pub struct Harness {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub source: TestSource,
}

pub fn harness(source: TestSource) -> Harness {
    harness_with(source, |_| {})
}

pub fn harness_with(source: TestSource, configure: impl FnOnce(&mut AppConfig)) -> Harness {
    let mut config = AppConfig::with_backends(test_backends());
    config.uploads_dir = scratch_dir();
    configure(&mut config);
    let models = ModelRegistry::new(config.backends.clone(), Arc::new(source.clone()));
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(Arc::new(config), Arc::new(models), store.clone());
    Harness {
        state,
        store,
        source,
    }
}

pub struct Client {
    pub session_id: Uuid,
    pub inbound: mpsc::Sender<String>,
    pub events: mpsc::Receiver<OutboundEvent>,
    pub task: JoinHandle<()>,
}

/// Admits a session and queues `frames` before it starts running, so the
/// session sees them in order without racing the test.
pub fn connect(state: &AppState, backend_id: &str, mode: ChatMode, frames: &[&str]) -> Client {
    let (outbound_tx, events) = mpsc::channel(state.config.outbound_buffer);
    let (inbound, inbound_rx) = mpsc::channel(32);
    for frame in frames {
        inbound
            .try_send(frame.to_string())
            .expect("inbound buffer has room");
    }

    let session_id = state.sessions.admit(backend_id, outbound_tx);
    let session = ChatSession::new(state.clone(), session_id, backend_id, mode);
    let sessions = Arc::clone(&state.sessions);
    let task = tokio::spawn(async move {
        session.run(inbound_rx).await;
        sessions.remove(session_id);
    });

    Client {
        session_id,
        inbound,
        events,
        task,
    }
}

impl Client {
    pub async fn next_event(&mut self) -> OutboundEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("event within timeout")
            .expect("session still sending")
    }

    pub async fn send(&self, frame: &str) {
        self.inbound
            .send(frame.to_string())
            .await
            .expect("session still reading");
    }

    /// Reads events until the terminal one of the current generation,
    /// returning the forwarded tokens and the terminal event.
    pub async fn until_terminal(&mut self) -> (Vec<String>, OutboundEvent) {
        let mut tokens = Vec::new();
        loop {
            match self.next_event().await {
                OutboundEvent::Token { token } => tokens.push(token),
                OutboundEvent::Connected { .. } => {}
                terminal => return (tokens, terminal),
            }
        }
    }
}

pub fn finish_reason(event: &OutboundEvent) -> &str {
    match event {
        OutboundEvent::Complete { finish_reason, .. } => finish_reason,
        other => panic!("expected completion, got {other:?}"),
    }
}

pub fn error_text(event: &OutboundEvent) -> &str {
    match event {
        OutboundEvent::Error { error } => error,
        other => panic!("expected error, got {other:?}"),
    }
}
