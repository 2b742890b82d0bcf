//! Server state shared across all handlers.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use lemonade_catalog::ModelCatalog;
use lemonade_client::HttpClient;
use lemonade_orchestrator::Orchestrator;
use lemonade_router::Router;

use crate::realtime::RealtimeSessionManager;

#[derive(Clone)]
pub struct ServerState {
    pub router: Arc<Router>,
    pub catalog: Arc<ModelCatalog>,
    pub orchestrator: Arc<Orchestrator>,
    pub realtime: Arc<RealtimeSessionManager>,
    pub client: HttpClient,
    /// Generation defaults set through `/params`, echoed into requests that
    /// leave them unset.
    pub params: Arc<RwLock<Value>>,
}

impl ServerState {
    pub fn new(catalog: Arc<ModelCatalog>, router: Arc<Router>) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(router.clone()));
        Self {
            router,
            catalog,
            orchestrator,
            realtime: Arc::new(RealtimeSessionManager::new()),
            client: HttpClient::new(),
            params: Arc::new(RwLock::new(Value::Object(Default::default()))),
        }
    }
}
