use crate::{
    ingest::EventIngestor, orchestrator::CampaignOrchestrator, store::Store,
    tracking_links::TrackingLinks,
};
use secrecy::Secret;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: CampaignOrchestrator,
    pub ingestor: EventIngestor,
    pub links: TrackingLinks,
    pub webhook_secret: Option<Secret<String>>,
}

impl AppState {
    pub fn store(&self) -> &Arc<dyn Store> {
        self.orchestrator.store()
    }
}
