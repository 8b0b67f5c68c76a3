use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::{sync::Mutex as AsyncMutex, task};
use tracing::{info, warn};

use crate::{
    config::{AppConfig, BackendConfig},
    error::ServiceError,
    model::{
        ArtifactSource, BackendInfo, GenerationBackend, ModelSource, backend::describe_config,
    },
};

type Slot = Arc<AsyncMutex<Option<Arc<GenerationBackend>>>>;

/// Process-wide cache of loaded backends, keyed by backend id.
///
/// Each id owns an async slot. Loading holds the slot for the whole load, so
/// concurrent callers for the same id wait for the first one and share its
/// instance. Different ids load independently.
pub struct ModelRegistry {
    configs: BTreeMap<String, BackendConfig>,
    source: Arc<dyn ModelSource>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ModelRegistry {
    pub fn new(configs: BTreeMap<String, BackendConfig>, source: Arc<dyn ModelSource>) -> Self {
        Self {
            configs,
            source,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let source = Arc::new(ArtifactSource::new(config.device.clone()));
        Self::new(config.backends.clone(), source)
    }

    fn config(&self, id: &str) -> Result<&BackendConfig, ServiceError> {
        self.configs
            .get(id)
            .ok_or_else(|| ServiceError::not_found(format!("Model {id} not registered")))
    }

    fn slot(&self, id: &str) -> Slot {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(id.to_string()).or_default())
    }

    fn existing_slot(&self, id: &str) -> Option<Slot> {
        self.slots.lock().get(id).cloned()
    }

    /// Returns the shared instance for `id`, loading it on first use.
    ///
    /// The load runs in its own task that owns the slot, so it still
    /// completes and is cached when the caller stops waiting.
    pub async fn get_or_load(&self, id: &str) -> Result<Arc<GenerationBackend>, ServiceError> {
        let config = self.config(id)?.clone();
        if let Some(backend) = self.loaded(id) {
            return Ok(backend);
        }
        let slot = self.slot(id);
        let source = Arc::clone(&self.source);
        tokio::spawn(load_into_slot(slot, id.to_string(), config, source))
            .await
            .map_err(|e| ServiceError::backend_load(id, format!("load task failed: {e}")))?
    }

    /// Releases a backend. Returns whether anything was loaded; unknown ids
    /// are a no-op.
    pub async fn unload(&self, id: &str) -> bool {
        let Some(slot) = self.existing_slot(id) else {
            return false;
        };
        let mut guard = slot.lock().await;
        match guard.take() {
            Some(backend) => {
                backend.unload();
                info!(backend_id = id, "backend unloaded");
                true
            }
            None => false,
        }
    }

    /// A backend that is mid-load counts as not loaded.
    pub fn is_loaded(&self, id: &str) -> bool {
        self.loaded(id).is_some()
    }

    fn loaded(&self, id: &str) -> Option<Arc<GenerationBackend>> {
        let slot = self.existing_slot(id)?;
        let guard = slot.try_lock().ok()?;
        guard.clone()
    }

    pub fn is_vision_capable(&self, id: &str) -> bool {
        if let Some(backend) = self.loaded(id) {
            return backend.supports_vision();
        }
        self.configs
            .get(id)
            .is_some_and(BackendConfig::supports_vision)
    }

    pub fn is_configured(&self, id: &str) -> bool {
        self.configs.contains_key(id)
    }

    pub fn list_backends(&self) -> Vec<BackendInfo> {
        self.configs
            .iter()
            .map(|(id, config)| match self.loaded(id) {
                Some(backend) => backend.describe(),
                None => describe_config(id, config, None),
            })
            .collect()
    }

    /// Loads the given backends up front. Failures are logged and skipped.
    pub async fn preload(&self, ids: &[String]) {
        for id in ids {
            if let Err(e) = self.get_or_load(id).await {
                warn!(backend_id = %id, error = %e, "preload failed");
            }
        }
    }
}

async fn load_into_slot(
    slot: Slot,
    id: String,
    config: BackendConfig,
    source: Arc<dyn ModelSource>,
) -> Result<Arc<GenerationBackend>, ServiceError> {
    let mut guard = slot.lock().await;
    if let Some(backend) = guard.as_ref() {
        return Ok(Arc::clone(backend));
    }

    info!(backend_id = %id, kind = config.kind.as_str(), "loading backend");
    let backend = Arc::new(GenerationBackend::from_config(id.clone(), config));
    let loading = Arc::clone(&backend);
    task::spawn_blocking(move || loading.load(source.as_ref()))
        .await
        .map_err(|e| ServiceError::backend_load(id.as_str(), format!("load task failed: {e}")))?
        .map_err(|e| {
            warn!(backend_id = %id, error = %e, "backend failed to load");
            match e {
                ServiceError::BackendLoad { .. } => e,
                other => ServiceError::backend_load(id.as_str(), other),
            }
        })?;

    *guard = Some(Arc::clone(&backend));
    info!(backend_id = %id, "backend ready");
    Ok(backend)
}
