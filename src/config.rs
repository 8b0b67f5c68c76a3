use std::{
    collections::BTreeMap,
    env, fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::model::{BackendKind, ChatTemplate};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub backends: BTreeMap<String, BackendConfig>,
    pub max_prompt_chars: usize,
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub top_k: Option<usize>,
    pub uploads_dir: PathBuf,
    pub preload: Vec<String>,
    pub cors_allow_origin: String,
    pub device: String,
    /// Events queued per socket before a client that stopped reading is dropped.
    pub outbound_buffer: usize,
}

/// One row of the static backend table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub model_path: PathBuf,
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,
    /// Hub identifier used to fetch the tokenizer when no local file exists.
    #[serde(default)]
    pub hub_id: Option<String>,
    #[serde(default)]
    pub chat_template: Option<ChatTemplate>,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default)]
    pub eos_token: Option<String>,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
    #[serde(default)]
    pub generation: GenerationDefaults,
    #[serde(default)]
    pub supports_vision: Option<bool>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationDefaults {
    #[serde(default)]
    pub max_new_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<usize>,
}

fn default_context_window() -> usize {
    1024
}

impl BackendConfig {
    pub fn new(kind: BackendKind, model_path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            model_path: model_path.into(),
            tokenizer_path: None,
            hub_id: None,
            chat_template: None,
            context_window: default_context_window(),
            eos_token: None,
            eos_token_id: None,
            generation: GenerationDefaults::default(),
            supports_vision: None,
            device: None,
            description: None,
        }
    }

    pub fn supports_vision(&self) -> bool {
        self.supports_vision
            .unwrap_or(matches!(self.kind, BackendKind::Vision))
    }

    pub fn template(&self) -> ChatTemplate {
        self.chat_template.unwrap_or(match self.kind {
            BackendKind::DirectDecoder => ChatTemplate::Plain,
            BackendKind::CausalLm => ChatTemplate::ChatMl,
            BackendKind::Vision => ChatTemplate::SmolVlm,
        })
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = lookup("SERVER_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080));

        let backends = match lookup("BACKENDS_PATH") {
            Some(path) => load_backend_table(Path::new(&path))?,
            None => default_backends(),
        };

        let max_prompt_chars = lookup("MAX_PROMPT_CHARS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(4000);
        let max_new_tokens = lookup("MAX_NEW_TOKENS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);
        let temperature = lookup("TEMPERATURE")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.7);
        let top_p = lookup("TOP_P")
            .and_then(|v| v.parse().ok())
            .or(Some(0.9));
        let top_k = lookup("TOP_K").and_then(|v| v.parse().ok());

        let uploads_dir =
            PathBuf::from(lookup("UPLOADS_DIR").unwrap_or_else(|| "uploads".to_string()));
        let preload = lookup("PRELOAD_BACKENDS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let cors_allow_origin = lookup("CORS_ALLOW_ORIGIN")
            .unwrap_or_else(|| "http://localhost:3000".to_string());
        let device = lookup("DEVICE").unwrap_or_else(|| "cpu".into());
        let outbound_buffer = lookup("OUTBOUND_BUFFER")
            .and_then(|v| v.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(256);

        Ok(Self {
            listen_addr,
            backends,
            max_prompt_chars,
            max_new_tokens,
            temperature,
            top_p,
            top_k,
            uploads_dir,
            preload,
            cors_allow_origin,
            device,
            outbound_buffer,
        })
    }

    /// Service defaults around an explicit backend table, for embedders that
    /// build the service by hand.
    pub fn with_backends(backends: BTreeMap<String, BackendConfig>) -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            backends,
            max_prompt_chars: 4000,
            max_new_tokens: 100,
            temperature: 0.7,
            top_p: Some(0.9),
            top_k: None,
            uploads_dir: PathBuf::from("uploads"),
            preload: Vec::new(),
            cors_allow_origin: "http://localhost:3000".to_string(),
            device: "cpu".to_string(),
            outbound_buffer: 256,
        }
    }
}

pub fn load_backend_table(path: &Path) -> anyhow::Result<BTreeMap<String, BackendConfig>> {
    let raw = fs::read_to_string(path)?;
    let table: BTreeMap<String, BackendConfig> = serde_json::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("invalid backend table {}: {e}", path.display()))?;
    if table.is_empty() {
        anyhow::bail!("backend table {} is empty", path.display());
    }
    Ok(table)
}

pub fn default_backends() -> BTreeMap<String, BackendConfig> {
    let mut table = BTreeMap::new();

    let mut custom = BackendConfig::new(BackendKind::DirectDecoder, "models/gpt2_small.ts");
    custom.tokenizer_path = Some(PathBuf::from("models/gpt2_tokenizer.json"));
    custom.hub_id = Some("gpt2".to_string());
    custom.generation = GenerationDefaults {
        max_new_tokens: Some(100),
        temperature: Some(0.7),
        top_p: Some(0.9),
        top_k: None,
    };
    table.insert("custom-gpt".to_string(), custom);

    let mut qwen = BackendConfig::new(BackendKind::CausalLm, "models/qwen2.5-0.5b-instruct.ts");
    qwen.hub_id = Some("Qwen/Qwen2.5-0.5B-Instruct".to_string());
    qwen.context_window = 4096;
    qwen.eos_token = Some("<|im_end|>".to_string());
    qwen.generation = GenerationDefaults {
        max_new_tokens: None,
        temperature: Some(0.7),
        top_p: Some(0.9),
        top_k: None,
    };
    table.insert("qwen-instruct".to_string(), qwen);

    let mut smol = BackendConfig::new(BackendKind::Vision, "models/smolvlm-256m-instruct.ts");
    smol.hub_id = Some("HuggingFaceTB/SmolVLM-256M-Instruct".to_string());
    smol.context_window = 2048;
    smol.eos_token = Some("<end_of_utterance>".to_string());
    smol.generation = GenerationDefaults {
        max_new_tokens: Some(30),
        temperature: Some(0.7),
        top_p: None,
        top_k: None,
    };
    smol.description =
        Some("A small vision-language model capable of understanding images".to_string());
    table.insert("smolvlm-256m-instruct".to_string(), smol);

    table
}
