//! Shared application context.
//!
//! The daemon owns one store, one embedder, one language model, and one of
//! each service; everything downstream gets handles, never globals. Test
//! harnesses build a context against a temporary store.

use std::sync::Arc;

use claudia_core::{
    Config, ConsolidateService, Embedder, IngestService, LanguageModel, RecallService,
    ReflectService, RememberService, Result, SessionBuffer, Store,
};

/// Handles shared by the tool server, scheduler, and health endpoint
pub struct AppContext {
    pub config: Config,
    pub store: Arc<Store>,
    pub embedder: Arc<Embedder>,
    pub language_model: Arc<LanguageModel>,
    pub remember: RememberService,
    pub recall: RecallService,
    pub consolidate: Arc<ConsolidateService>,
    pub ingest: IngestService,
    pub session: SessionBuffer,
    pub reflect: ReflectService,
}

impl AppContext {
    /// Wire up every service against one open store.
    pub fn build(config: Config, store: Store) -> Result<Self> {
        let store = Arc::new(store);
        let embedder = Arc::new(Embedder::new(&config.embedding)?);
        let language_model = Arc::new(LanguageModel::new(&config.language_model)?);

        let remember = RememberService::new(
            store.clone(),
            embedder.clone(),
            language_model.clone(),
            config.clone(),
        );
        let recall = RecallService::new(store.clone(), embedder.clone(), config.clone());
        let consolidate = Arc::new(ConsolidateService::new(
            store.clone(),
            embedder.clone(),
            config.clone(),
        ));
        let ingest = IngestService::new(
            store.clone(),
            embedder.clone(),
            language_model.clone(),
            config.clone(),
        );
        let session = SessionBuffer::new(store.clone(), embedder.clone(), config.clone());
        let reflect = ReflectService::new(store.clone());

        Ok(Self {
            config,
            store,
            embedder,
            language_model,
            remember,
            recall,
            consolidate,
            ingest,
            session,
            reflect,
        })
    }
}
