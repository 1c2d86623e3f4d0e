//! Background refresh: the delivery poll loop and the realtime listener.
//!
//! Both loops feed the same store as user commands. The poll is a
//! correctness backstop for the push channel and runs whether or not the
//! websocket is up.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth;
use crate::backend::realtime::{self, Incoming};
use crate::backend::{ChangeEvent, Table};
use crate::context::AppContext;
use crate::db;
use crate::deliveries;
use crate::error::AppResult;
use crate::events;
use crate::models::UserRole;
use crate::payments;
use crate::sales;

const SETTINGS_CATEGORY: &str = "sync";
const LAST_POLL_KEY: &str = "last_poll";

/// Runtime state of the background loops.
#[derive(Default)]
pub struct SyncState {
    cancel: Mutex<Option<CancellationToken>>,
    last_poll: Mutex<Option<DateTime<Utc>>>,
    realtime_connected: AtomicBool,
    consecutive_failures: AtomicU32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub running: bool,
    pub realtime_connected: bool,
    pub last_poll: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl SyncState {
    pub fn is_running(&self) -> bool {
        self.cancel
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|t| !t.is_cancelled()))
            .unwrap_or(false)
    }

    fn record_success(&self, at: DateTime<Utc>) {
        if let Ok(mut slot) = self.last_poll.lock() {
            *slot = Some(at);
        }
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub fn status(ctx: &AppContext) -> SyncStatus {
    let last_poll = ctx
        .sync
        .last_poll
        .lock()
        .ok()
        .and_then(|slot| *slot)
        .or_else(|| persisted_last_poll(ctx));
    SyncStatus {
        running: ctx.sync.is_running(),
        realtime_connected: ctx.sync.realtime_connected.load(Ordering::SeqCst),
        last_poll,
        consecutive_failures: ctx.sync.consecutive_failures.load(Ordering::SeqCst),
    }
}

fn emit_status(ctx: &AppContext) {
    ctx.events.emit(events::SYNC_STATUS, json!(status(ctx)));
}

fn persisted_last_poll(ctx: &AppContext) -> Option<DateTime<Utc>> {
    let cache = ctx.cache.as_ref()?;
    let conn = cache.conn.lock().ok()?;
    let raw = db::get_setting(&conn, SETTINGS_CATEGORY, LAST_POLL_KEY)?;
    DateTime::parse_from_rfc3339(&raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn persist_last_poll(ctx: &AppContext, at: DateTime<Utc>) {
    let Some(cache) = ctx.cache.as_ref() else {
        return;
    };
    let Ok(conn) = cache.conn.lock() else {
        return;
    };
    if let Err(e) = db::set_setting(&conn, SETTINGS_CATEGORY, LAST_POLL_KEY, &at.to_rfc3339()) {
        warn!(error = %e, "could not persist last poll time");
    }
}

/// Fetch every collection the signed-in role sees. Drivers only load
/// deliveries.
pub async fn refresh_all(ctx: &AppContext) -> AppResult<()> {
    let session = ctx.auth.require_session()?;
    if session.role == UserRole::Admin {
        let sales = sales::refresh_sales(ctx).await?;
        let payments = payments::refresh_payments(ctx).await?;
        debug!(sales, payments, "ledger refreshed");
    }
    let deliveries = deliveries::refresh_deliveries(ctx).await?;
    debug!(deliveries, "deliveries refreshed");
    Ok(())
}

/// One poll tick. Failures are logged and counted, never surfaced.
pub async fn poll_once(ctx: &AppContext) -> bool {
    if let Err(e) = auth::refresh_if_expiring(ctx).await {
        warn!(error = %e, "token refresh before poll failed");
    }
    let ok = match deliveries::refresh_deliveries(ctx).await {
        Ok(count) => {
            let now = Utc::now();
            ctx.sync.record_success(now);
            persist_last_poll(ctx, now);
            debug!(count, "delivery poll complete");
            true
        }
        Err(e) => {
            let failures = ctx.sync.record_failure();
            if e.is_transient() {
                debug!(error = %e, failures, "delivery poll failed; retrying next tick");
            } else {
                warn!(error = %e, failures, "delivery poll failed");
            }
            false
        }
    };
    emit_status(ctx);
    ok
}

pub async fn run_poll_loop(ctx: Arc<AppContext>, cancel: CancellationToken) {
    let period = ctx.config.poll_interval;
    info!(interval_secs = period.as_secs(), "poll loop started");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                poll_once(&ctx).await;
            }
        }
    }
    info!("poll loop stopped");
}

pub async fn run_realtime(ctx: Arc<AppContext>, cancel: CancellationToken) {
    if !ctx.config.realtime_enabled {
        info!("realtime disabled; relying on polling");
        return;
    }
    let url = ctx.config.realtime_url();
    let token_ctx = ctx.clone();
    let handler_ctx = ctx.clone();
    realtime::listen(
        url,
        Table::ALL.to_vec(),
        move || token_ctx.auth.access_token(),
        cancel,
        move |incoming| handle_incoming(&handler_ctx, incoming),
    )
    .await;
    ctx.sync.realtime_connected.store(false, Ordering::SeqCst);
    info!("realtime listener stopped");
}

fn handle_incoming(ctx: &AppContext, incoming: Incoming) {
    match incoming {
        Incoming::Connected => {
            ctx.sync.realtime_connected.store(true, Ordering::SeqCst);
            emit_status(ctx);
        }
        Incoming::Disconnected(reason) => {
            debug!(reason = %reason, "realtime disconnected");
            ctx.sync.realtime_connected.store(false, Ordering::SeqCst);
            emit_status(ctx);
        }
        Incoming::Change(change) => {
            let table = change.table();
            if let Err(e) = apply_remote_change(ctx, change) {
                warn!(table = table.name(), error = %e, "could not apply realtime change");
            }
        }
    }
}

pub fn apply_remote_change(ctx: &AppContext, change: ChangeEvent) -> AppResult<()> {
    match change {
        ChangeEvent::Sales(row) => sales::apply_change(ctx, row),
        ChangeEvent::Payments(row) => payments::apply_change(ctx, row),
        ChangeEvent::Deliveries(row) => deliveries::apply_change(ctx, row),
    }
}

/// Spawn both loops, replacing any that are already running.
pub fn start(ctx: &Arc<AppContext>) -> CancellationToken {
    let token = CancellationToken::new();
    let previous = match ctx.sync.cancel.lock() {
        Ok(mut slot) => slot.replace(token.clone()),
        Err(e) => {
            warn!(error = %e, "sync state lock poisoned");
            None
        }
    };
    if let Some(previous) = previous {
        previous.cancel();
    }

    tokio::spawn(run_poll_loop(ctx.clone(), token.child_token()));
    tokio::spawn(run_realtime(ctx.clone(), token.child_token()));
    emit_status(ctx);
    token
}

pub fn stop(ctx: &AppContext) {
    let token = ctx.sync.cancel.lock().ok().and_then(|mut slot| slot.take());
    if let Some(token) = token {
        token.cancel();
        ctx.sync.realtime_connected.store(false, Ordering::SeqCst);
        info!("background sync stopped");
        emit_status(ctx);
    }
}
