//! The explicitly-constructed runtime threaded through request execution.

use std::{collections::HashMap, sync::Arc, time::Duration};

use dashmap::DashMap;
use files::{FileCollection, FileHandlerClient, FileStore, FileTransfer, MemoryStore, MemoryTransfer};
use llm::plugin::{Plugin, plugin_for};
use rate_limit::ModelDispatcher;
use tokio_util::sync::CancellationToken;

use crate::{PathwayRegistry, executor::PathwayOverride, progress::ProgressBus};

/// How long finished results are retained to coalesce near-duplicate
/// retries.
const RESULT_TTL: Duration = Duration::from_secs(60);

/// A model bound to its plugin and endpoint dispatcher.
pub struct ModelRuntime {
    pub name: String,
    pub config: config::ModelConfig,
    pub dispatcher: ModelDispatcher,
    pub plugin: Box<dyn Plugin>,
}

/// Shared state for request execution: configuration, compiled pathways,
/// model runtimes, the tokenizer cache, the progress bus and the file
/// substrate. No globals; tests construct a fresh runtime per case.
pub struct Runtime {
    config: config::Config,
    registry: PathwayRegistry,
    models: HashMap<String, Arc<ModelRuntime>>,
    tokenizer: Arc<chunker::Tokenizer>,
    bus: Arc<ProgressBus>,
    files: Arc<FileCollection>,
    /// Finished results by execution fingerprint.
    pub(crate) results: mini_moka::sync::Cache<u64, String>,
    /// In-flight leader request ids by execution fingerprint.
    pub(crate) inflight: DashMap<u64, String>,
    /// Cancellation tokens of running requests.
    pub(crate) cancellations: DashMap<String, CancellationToken>,
    /// Native execution overrides by pathway name.
    overrides: DashMap<String, Arc<dyn PathwayOverride>>,
}

impl Runtime {
    /// Build a runtime from configuration, selecting the file transfer from
    /// the configured media API.
    pub fn new(config: config::Config) -> anyhow::Result<Arc<Self>> {
        let transfer: Arc<dyn FileTransfer> = match &config.files.media_api_url {
            Some(url) => Arc::new(FileHandlerClient::new(url.clone())),
            None => Arc::new(MemoryTransfer::new()),
        };

        Self::with_store(config, Arc::new(MemoryStore::new()), transfer)
    }

    /// Build a runtime over explicit file collaborators; the seam tests and
    /// embedding hosts plug their stores into.
    pub fn with_store(
        config: config::Config,
        store: Arc<dyn FileStore>,
        transfer: Arc<dyn FileTransfer>,
    ) -> anyhow::Result<Arc<Self>> {
        let registry = PathwayRegistry::from_config(&config.pathways);

        let mut models = HashMap::with_capacity(config.models.len());

        for (name, model_config) in &config.models {
            models.insert(
                name.clone(),
                Arc::new(ModelRuntime {
                    name: name.clone(),
                    dispatcher: ModelDispatcher::new(model_config.endpoints.iter().cloned()),
                    plugin: plugin_for(model_config.provider),
                    config: model_config.clone(),
                }),
            );
        }

        let files = Arc::new(FileCollection::new(store, transfer, config.files.encryption_key.clone()));

        Ok(Arc::new(Self {
            registry,
            models,
            tokenizer: Arc::new(chunker::Tokenizer::new()?),
            bus: Arc::new(ProgressBus::new()),
            files,
            results: mini_moka::sync::Cache::builder().time_to_live(RESULT_TTL).build(),
            inflight: DashMap::new(),
            cancellations: DashMap::new(),
            overrides: DashMap::new(),
            config,
        }))
    }

    pub fn config(&self) -> &config::Config {
        &self.config
    }

    pub fn registry(&self) -> &PathwayRegistry {
        &self.registry
    }

    pub fn model(&self, name: &str) -> Option<Arc<ModelRuntime>> {
        self.models.get(name).cloned()
    }

    /// All model names known to the runtime.
    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn tokenizer(&self) -> &Arc<chunker::Tokenizer> {
        &self.tokenizer
    }

    pub fn bus(&self) -> &Arc<ProgressBus> {
        &self.bus
    }

    pub fn files(&self) -> &Arc<FileCollection> {
        &self.files
    }

    /// Register a native execution override for a pathway. The override
    /// replaces the declarative prompt pipeline for that pathway name.
    pub fn register_override(&self, pathway_name: impl Into<String>, handler: Arc<dyn PathwayOverride>) {
        self.overrides.insert(pathway_name.into(), handler);
    }

    /// The override registered for a pathway, if any.
    pub(crate) fn override_for(&self, pathway_name: &str) -> Option<Arc<dyn PathwayOverride>> {
        self.overrides.get(pathway_name).map(|entry| Arc::clone(entry.value()))
    }

    /// Cancel a running request. Returns whether a request was found.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.cancellations.get(request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}
