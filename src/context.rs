//! Application context shared by commands and background loops.
//!
//! Every event (command, HTTP completion, realtime frame, poll tick) mutates
//! the store through [`AppContext::with_store`]. The lock is never held across
//! an `.await`, so reducer steps are applied one at a time.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::auth::AuthState;
use crate::backend::Backend;
use crate::config::AppConfig;
use crate::db::{self, DbState};
use crate::error::{AppError, AppResult};
use crate::events::{self, EventSink};
use crate::models::{Delivery, Payment, Sale};
use crate::store::DashboardStore;
use crate::sync::SyncState;

pub struct AppContext {
    pub config: AppConfig,
    pub backend: Arc<dyn Backend>,
    pub events: Arc<dyn EventSink>,
    pub cache: Option<DbState>,
    pub auth: AuthState,
    pub sync: SyncState,
    store: Mutex<DashboardStore>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn Backend>,
        events: Arc<dyn EventSink>,
        cache: Option<DbState>,
    ) -> Self {
        Self {
            config,
            backend,
            events,
            cache,
            auth: AuthState::default(),
            sync: SyncState::default(),
            store: Mutex::new(DashboardStore::new()),
        }
    }

    /// Run `f` with exclusive access to the store.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut DashboardStore) -> R) -> AppResult<R> {
        let mut store = self
            .store
            .lock()
            .map_err(|e| AppError::State(format!("dashboard store: {e}")))?;
        Ok(f(&mut store))
    }

    /// Surface a failed user action to the operator.
    pub fn alert(&self, action: &str, err: &AppError) {
        warn!(action, error = %err, "operation failed");
        let kind = match err {
            AppError::SchemaMissing { .. } => "setup",
            AppError::Validation(_) => "validation",
            AppError::Unauthorized(_) => "session",
            _ => "error",
        };
        self.events.emit(
            events::OPERATOR_ALERT,
            json!({ "action": action, "kind": kind, "message": err.to_string() }),
        );
    }

    pub fn emit_deliveries(&self) {
        match self.with_store(|s| s.deliveries.entries().to_vec()) {
            Ok(entries) => self.events.emit(events::DELIVERIES_CHANGED, json!(entries)),
            Err(e) => warn!(error = %e, "cannot read deliveries for emit"),
        }
    }

    pub fn emit_sales(&self) {
        match self.with_store(|s| s.sales.rows().to_vec()) {
            Ok(rows) => self.events.emit(events::SALES_CHANGED, json!(rows)),
            Err(e) => warn!(error = %e, "cannot read sales for emit"),
        }
    }

    pub fn emit_payments(&self) {
        match self.with_store(|s| s.payments.rows().to_vec()) {
            Ok(rows) => self.events.emit(events::PAYMENTS_CHANGED, json!(rows)),
            Err(e) => warn!(error = %e, "cannot read payments for emit"),
        }
    }

    /// Store a fetched collection in the snapshot cache. Failures are logged.
    pub fn cache_snapshot<T: Serialize>(&self, collection: &str, rows: &[T]) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        if let Err(e) = db::save_snapshot(cache, collection, rows, Utc::now()) {
            warn!(collection, error = %e, "snapshot cache write failed");
        }
    }

    /// Seed the store from the snapshot cache. Returns the number of
    /// collections restored.
    pub fn restore_from_cache(&self) -> usize {
        let Some(cache) = self.cache.as_ref() else {
            return 0;
        };
        let sales = load_cached::<Sale>(cache, db::COLLECTION_SALES);
        let payments = load_cached::<Payment>(cache, db::COLLECTION_PAYMENTS);
        let deliveries = load_cached::<Delivery>(cache, db::COLLECTION_DELIVERIES);
        let restored = [sales.is_some(), payments.is_some(), deliveries.is_some()]
            .iter()
            .filter(|r| **r)
            .count();

        let applied = self.with_store(|store| {
            if let Some(rows) = sales {
                store.sales.replace_all(rows);
            }
            if let Some(rows) = payments {
                store.payments.replace_all(rows);
            }
            if let Some(rows) = deliveries {
                store
                    .deliveries
                    .apply(crate::reconcile::DeliveryEvent::Loaded(rows));
            }
        });
        if let Err(e) = applied {
            warn!(error = %e, "cannot restore cached snapshots");
            return 0;
        }
        if restored > 0 {
            self.emit_sales();
            self.emit_payments();
            self.emit_deliveries();
        }
        restored
    }
}

fn load_cached<T: serde::de::DeserializeOwned>(cache: &DbState, collection: &str) -> Option<Vec<T>> {
    match db::load_snapshot::<T>(cache, collection) {
        Ok(Some((rows, fetched_at))) => {
            debug!(collection, rows = rows.len(), %fetched_at, "restored cached snapshot");
            Some(rows)
        }
        Ok(None) => None,
        Err(e) => {
            warn!(collection, error = %e, "ignoring unreadable cached snapshot");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::events::RecordingSink;
    use crate::models::StaffMember;
    use chrono::{NaiveDate, TimeZone};

    #[test]
    fn test_restore_from_cache_seeds_store() {
        let cache = db::open_in_memory().unwrap();
        let payment = Payment {
            id: 4,
            person: StaffMember::Bruno,
            date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            value: 30.0,
            created_at: Utc.with_ymd_and_hms(2025, 2, 1, 9, 0, 0).unwrap(),
        };
        db::save_snapshot(&cache, db::COLLECTION_PAYMENTS, &[payment.clone()], Utc::now()).unwrap();

        let events = Arc::new(RecordingSink::new());
        let ctx = AppContext::new(
            AppConfig::with_backend("http://localhost", "anon"),
            Arc::new(MemoryBackend::new()),
            events.clone(),
            Some(cache),
        );
        assert_eq!(ctx.restore_from_cache(), 1);
        let rows = ctx.with_store(|s| s.payments.rows().to_vec()).unwrap();
        assert_eq!(rows, vec![payment]);
        assert!(events.names().contains(&events::PAYMENTS_CHANGED.to_string()));
    }

    #[test]
    fn test_alert_classifies_errors() {
        let events = Arc::new(RecordingSink::new());
        let ctx = AppContext::new(
            AppConfig::with_backend("http://localhost", "anon"),
            Arc::new(MemoryBackend::new()),
            events.clone(),
            None,
        );
        ctx.alert(
            "add_sale",
            &AppError::from_remote(400, "column \"delivery_fee\" of relation \"sales\" does not exist"),
        );
        let alerts = events.payloads(events::OPERATOR_ALERT);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0]["kind"], "setup");
        assert_eq!(alerts[0]["action"], "add_sale");
    }
}
