use std::sync::Arc;

use crate::constants::QUOTA_CACHE_TTL_SECS;
use crate::models::SharedFlag;
use crate::modules::persistence::{ModelQuotaRow, QuotaLedgerDb};
use crate::proxy::quota::refresh::QuotaRefresher;

/// Read side of the quota ledger used by dispatch: cached fractions, the
/// staleness signal, the availability rule and the consumption write.
pub struct QuotaLedger {
    db: QuotaLedgerDb,
    refresher: Arc<QuotaRefresher>,
}

impl QuotaLedger {
    pub fn new(db: QuotaLedgerDb) -> Self {
        let refresher = Arc::new(QuotaRefresher::new(db.clone()));
        Self { db, refresher }
    }

    pub fn refresher(&self) -> Arc<QuotaRefresher> {
        self.refresher.clone()
    }

    pub fn get_quota(&self, cookie_id: &str, model: &str) -> Result<Option<ModelQuotaRow>, String> {
        self.db.get_quota(cookie_id, model)
    }

    /// True when the cache is missing or older than the TTL; dispatch then
    /// fires a non-blocking background refresh.
    pub fn quota_is_stale(&self, cookie_id: &str, model: &str) -> Result<bool, String> {
        match self.db.get_quota(cookie_id, model)? {
            Some(row) => {
                Ok(chrono::Utc::now().timestamp() - row.last_fetched_at > QUOTA_CACHE_TTL_SECS)
            }
            None => Ok(true),
        }
    }

    /// An account can serve model M iff its cached fraction for M is above
    /// zero (an unfetched cache counts as available) and, for shared
    /// accounts, the calling user still has pool balance for M's group.
    pub fn account_available(
        &self,
        user_id: &str,
        cookie_id: &str,
        model: &str,
        shared: SharedFlag,
    ) -> Result<bool, String> {
        if let Some(row) = self.db.get_quota(cookie_id, model)? {
            if !row.available || row.remaining <= 0.0 {
                return Ok(false);
            }
        }
        if shared.is_shared() {
            return Ok(self.db.pool_balance(user_id, model)? > 0.0);
        }
        Ok(true)
    }

    pub fn recent_consumption(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<crate::modules::persistence::ConsumptionRow>, String> {
        self.db.recent_consumption(user_id, limit)
    }

    pub fn record_consumption(
        &self,
        user_id: &str,
        account_id: &str,
        model: &str,
        quota_before: f64,
        quota_after: f64,
        shared: SharedFlag,
    ) -> Result<f64, String> {
        self.db.record_consumption(
            user_id,
            account_id,
            model,
            quota_before,
            quota_after,
            shared.is_shared(),
        )
    }
}
