use std::sync::Arc;

use crate::models::AppConfig;
use crate::modules::persistence::{AccountStore, QuotaLedgerDb};
use crate::proxy::dispatch::{DispatchEngine, EndpointTable};
use crate::proxy::quota::QuotaLedger;
use crate::proxy::token::{TokenEndpoints, TokenManager};

/// Collaborator wiring. Everything dispatch needs is constructed here and
/// passed down explicitly; tests swap in mock endpoint tables and token
/// URLs through the same constructors.
#[derive(Clone)]
pub struct CoreServices {
    pub store: Arc<AccountStore>,
    pub ledger: Arc<QuotaLedger>,
    pub tokens: Arc<TokenManager>,
    pub engine: Arc<DispatchEngine>,
    pub config: Arc<AppConfig>,
}

impl CoreServices {
    pub fn build(config: Arc<AppConfig>) -> Self {
        let db_path = std::path::PathBuf::from(&config.database.path);
        let store = Arc::new(AccountStore::new(db_path.clone()));
        let ledger = Arc::new(QuotaLedger::new(QuotaLedgerDb::new(db_path)));
        let tokens = Arc::new(TokenManager::new(store.clone(), TokenEndpoints::default()));
        let engine = Arc::new(DispatchEngine::new(
            store.clone(),
            ledger.clone(),
            tokens.clone(),
            EndpointTable::antigravity_default(),
            config.clone(),
        ));
        Self {
            store,
            ledger,
            tokens,
            engine,
            config,
        }
    }
}

/// Axum application state.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<CoreServices>,
}

impl axum::extract::FromRef<AppState> for Arc<CoreServices> {
    fn from_ref(state: &AppState) -> Self {
        state.core.clone()
    }
}
