//! Driver delivery lifecycle: start, confirm, cancel.
//!
//! Each operation applies an optimistic event to the [`DeliveryBook`] under
//! the store lock, releases the lock, performs the remote call the reducer
//! asked for, then applies the settlement event. Realtime frames and poll
//! snapshots may land between those steps; the reducer reconciles them.
//!
//! [`DeliveryBook`]: crate::reconcile::DeliveryBook

use chrono::{SubsecRound, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::RowChange;
use crate::context::AppContext;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::models::{Delivery, DeliveryEntry, DeliveryKey, DeliveryStatus, LocalRef, NewDelivery};
use crate::money::round_cents;
use crate::reconcile::{DeliveryEvent, Effect};

/// Result of [`start_delivery`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Confirmed { entry: DeliveryEntry },
    /// The driver cancelled before the backend answered; the created row
    /// has been removed again.
    Cancelled,
}

fn apply(ctx: &AppContext, event: DeliveryEvent) -> AppResult<Effect> {
    ctx.with_store(|s| s.deliveries.apply(event))
}

pub async fn start_delivery(
    ctx: &AppContext,
    order_id: &str,
    address: &str,
    delivery_fee: Option<f64>,
) -> AppResult<StartOutcome> {
    let order_id = order_id.trim();
    let address = address.trim();
    if order_id.is_empty() || address.is_empty() {
        let err = AppError::Validation("Preencha o número do pedido e o endereço.".into());
        ctx.alert("start_delivery", &err);
        return Err(err);
    }
    if let Some(fee) = delivery_fee {
        if !fee.is_finite() || fee < 0.0 {
            let err = AppError::Validation("Taxa de entrega inválida.".into());
            ctx.alert("start_delivery", &err);
            return Err(err);
        }
    }

    let draft = NewDelivery {
        order_id: order_id.to_string(),
        address: address.to_string(),
        status: DeliveryStatus::InRoute,
        // Millisecond precision survives the backend round trip, so the
        // returned row can be matched to its placeholder by start time.
        start_time: Utc::now().trunc_subsecs(3),
        delivered_at: None,
        driver_email: ctx.auth.email(),
        delivery_fee: delivery_fee.map(round_cents),
    };
    let local_ref = LocalRef::new();
    apply(
        ctx,
        DeliveryEvent::StartRequested {
            local_ref,
            draft: draft.clone(),
        },
    )?;
    ctx.emit_deliveries();
    info!(%local_ref, order_id, "delivery started");

    let record = match ctx.backend.insert_delivery(&draft).await {
        Ok(record) => record,
        Err(err) => {
            apply(ctx, DeliveryEvent::StartFailed { local_ref })?;
            ctx.emit_deliveries();
            ctx.alert("start_delivery", &err);
            return Err(err);
        }
    };

    let id = record.id;
    let effect = apply(ctx, DeliveryEvent::StartConfirmed { local_ref, record })?;
    ctx.emit_deliveries();

    if let Effect::DeleteRemote(created) = effect {
        info!(%local_ref, delivery_id = created, "start was cancelled while saving; removing created row");
        settle_delete(ctx, created, "cancel_delivery").await?;
        return Ok(StartOutcome::Cancelled);
    }

    let entry = ctx.with_store(|s| s.deliveries.get(&DeliveryKey::Confirmed { id }).cloned())?;
    Ok(match entry {
        Some(entry) => StartOutcome::Confirmed { entry },
        None => StartOutcome::Cancelled,
    })
}

/// Mark a delivery as delivered now. On remote failure the entry goes back
/// to `in_route` with no delivered time.
pub async fn confirm_delivery(ctx: &AppContext, key: DeliveryKey) -> AppResult<DeliveryEntry> {
    let at = Utc::now();
    let (id, at) = match apply(ctx, DeliveryEvent::ConfirmRequested { key, at })? {
        Effect::ConfirmRemote { id, at } => (id, at),
        Effect::Rejected(reason) => {
            let err = AppError::Validation(reason);
            ctx.alert("confirm_delivery", &err);
            return Err(err);
        }
        other => {
            return Err(AppError::State(format!(
                "unexpected effect for confirm: {other:?}"
            )))
        }
    };
    ctx.emit_deliveries();

    let result = ctx.backend.mark_delivered(id, at).await;
    let record = result.as_ref().ok().cloned();
    apply(ctx, DeliveryEvent::ConfirmSettled { id, record })?;
    ctx.emit_deliveries();

    match result {
        Ok(record) => {
            info!(delivery_id = id, "delivery confirmed");
            Ok(record.into())
        }
        Err(err) => {
            ctx.alert("confirm_delivery", &err);
            Err(err)
        }
    }
}

/// Remove a delivery. Placeholders are dropped locally only; confirmed
/// records are deleted remotely and the list is re-fetched if that fails.
pub async fn cancel_delivery(ctx: &AppContext, key: DeliveryKey) -> AppResult<()> {
    let effect = apply(ctx, DeliveryEvent::CancelRequested(key))?;
    ctx.emit_deliveries();
    match effect {
        Effect::None => {
            debug!(?key, "placeholder cancelled locally");
            Ok(())
        }
        Effect::DeleteRemote(id) => settle_delete(ctx, id, "cancel_delivery").await,
        Effect::Rejected(reason) => {
            let err = AppError::Validation(reason);
            ctx.alert("cancel_delivery", &err);
            Err(err)
        }
        other => Err(AppError::State(format!(
            "unexpected effect for cancel: {other:?}"
        ))),
    }
}

async fn settle_delete(ctx: &AppContext, id: i64, action: &str) -> AppResult<()> {
    let result = ctx.backend.delete_delivery(id).await;
    let effect = apply(
        ctx,
        DeliveryEvent::DeleteSettled {
            id,
            ok: result.is_ok(),
        },
    )?;
    if effect == Effect::Refetch {
        if let Err(e) = refresh_deliveries(ctx).await {
            warn!(delivery_id = id, error = %e, "refetch after failed delete also failed");
        }
    }
    ctx.emit_deliveries();

    match result {
        Ok(()) => {
            info!(delivery_id = id, "delivery deleted");
            Ok(())
        }
        Err(err) => {
            ctx.alert(action, &err);
            Err(err)
        }
    }
}

/// Overwrite confirmed local state with the backend's current list.
pub async fn refresh_deliveries(ctx: &AppContext) -> AppResult<usize> {
    let rows = ctx.backend.list_deliveries().await?;
    ctx.cache_snapshot(db::COLLECTION_DELIVERIES, &rows);
    let count = ctx.with_store(|s| {
        s.deliveries.apply(DeliveryEvent::Loaded(rows));
        s.deliveries.len()
    })?;
    ctx.emit_deliveries();
    Ok(count)
}

pub fn apply_change(ctx: &AppContext, change: RowChange<Delivery>) -> AppResult<()> {
    let event = match change {
        RowChange::Inserted(row) => DeliveryEvent::RemoteInserted(row),
        RowChange::Updated(row) => DeliveryEvent::RemoteUpdated(row),
        RowChange::Deleted(id) => DeliveryEvent::RemoteDeleted(id),
    };
    apply(ctx, event)?;
    ctx.emit_deliveries();
    Ok(())
}

pub fn list(ctx: &AppContext) -> AppResult<Vec<DeliveryEntry>> {
    ctx.with_store(|s| s.deliveries.entries().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::test_support::harness;
    use std::sync::Arc;

    fn pending_key(ctx: &AppContext) -> DeliveryKey {
        ctx.with_store(|s| s.deliveries.entries()[0].key).unwrap()
    }

    #[tokio::test]
    async fn test_start_confirms_in_place() {
        let h = harness();
        let outcome = start_delivery(&h.ctx, "77", " Rua X, 10 ", Some(8.0))
            .await
            .unwrap();
        let StartOutcome::Confirmed { entry } = outcome else {
            panic!("expected confirmed outcome");
        };
        assert_eq!(entry.order_id, "77");
        assert_eq!(entry.address, "Rua X, 10");
        assert_eq!(entry.status, DeliveryStatus::InRoute);
        assert!(entry.server_id().is_some());
        assert_eq!(entry.start_time.timestamp_subsec_nanos() % 1_000_000, 0);
        assert_eq!(list(&h.ctx).unwrap(), vec![entry]);

        let emitted = h.events.payloads(events::DELIVERIES_CHANGED);
        assert_eq!(emitted[0][0]["key"]["kind"], "pending");
        assert_eq!(emitted.last().unwrap()[0]["key"]["kind"], "confirmed");
    }

    #[tokio::test]
    async fn test_start_failure_removes_placeholder_and_alerts() {
        let h = harness();
        h.backend.fail("insert_delivery");
        assert!(start_delivery(&h.ctx, "5", "Rua Y", None).await.is_err());
        assert!(list(&h.ctx).unwrap().is_empty());
        assert_eq!(h.events.payloads(events::OPERATOR_ALERT).len(), 1);
    }

    #[tokio::test]
    async fn test_missing_fields_rejected() {
        let h = harness();
        let err = start_delivery(&h.ctx, " ", "Rua Y", None).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(h.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_start_resolves_deletes_only_created_row() {
        let h = harness();
        h.backend.hold_inserts();
        let task = {
            let ctx = Arc::clone(&h.ctx);
            tokio::spawn(async move { start_delivery(&ctx, "77", "Rua X, 10", None).await })
        };
        h.backend.insert_committed().await;

        let key = pending_key(&h.ctx);
        assert!(key.is_pending());
        cancel_delivery(&h.ctx, key).await.unwrap();
        assert!(list(&h.ctx).unwrap().is_empty());
        assert!(!h.backend.calls().iter().any(|c| c.starts_with("delete_delivery")));

        h.backend.release_inserts();
        assert_eq!(task.await.unwrap().unwrap(), StartOutcome::Cancelled);

        assert_eq!(h.backend.calls(), vec!["insert_delivery", "delete_delivery:1"]);
        assert!(h.backend.deliveries().is_empty());
        assert!(list(&h.ctx).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_push_before_response_keeps_single_entry() {
        let h = harness();
        h.backend.hold_inserts();
        let task = {
            let ctx = Arc::clone(&h.ctx);
            tokio::spawn(async move { start_delivery(&ctx, "12", "Av. Brasil, 5", None).await })
        };
        h.backend.insert_committed().await;

        let pushed = h.backend.deliveries()[0].clone();
        apply_change(&h.ctx, RowChange::Inserted(pushed.clone())).unwrap();
        let entries = list(&h.ctx).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].server_id(), Some(pushed.id));

        h.backend.release_inserts();
        task.await.unwrap().unwrap();
        let entries = list(&h.ctx).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].server_id(), Some(pushed.id));
    }

    #[tokio::test]
    async fn test_confirm_failure_rolls_back() {
        let h = harness();
        let StartOutcome::Confirmed { entry } =
            start_delivery(&h.ctx, "3", "Rua Z", None).await.unwrap()
        else {
            panic!("expected confirmed outcome");
        };
        h.backend.fail("mark_delivered");
        assert!(confirm_delivery(&h.ctx, entry.key).await.is_err());
        let after = list(&h.ctx).unwrap();
        assert_eq!(after[0].status, DeliveryStatus::InRoute);
        assert!(after[0].delivered_at.is_none());

        h.backend.recover("mark_delivered");
        let confirmed = confirm_delivery(&h.ctx, entry.key).await.unwrap();
        assert_eq!(confirmed.status, DeliveryStatus::Delivered);
        assert!(confirmed.delivered_at.is_some());
        assert!(confirm_delivery(&h.ctx, entry.key).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_remote_delete_refetches() {
        let h = harness();
        let StartOutcome::Confirmed { entry } =
            start_delivery(&h.ctx, "4", "Rua W", None).await.unwrap()
        else {
            panic!("expected confirmed outcome");
        };
        h.backend.fail("delete_delivery");
        assert!(cancel_delivery(&h.ctx, entry.key).await.is_err());
        assert_eq!(list(&h.ctx).unwrap(), vec![entry]);
        assert!(h.backend.calls().contains(&"list_deliveries".to_string()));
    }

    #[tokio::test]
    async fn test_refresh_uses_backend_order() {
        let h = harness();
        start_delivery(&h.ctx, "1", "A", None).await.unwrap();
        start_delivery(&h.ctx, "2", "B", None).await.unwrap();
        assert_eq!(refresh_deliveries(&h.ctx).await.unwrap(), 2);
        let entries = list(&h.ctx).unwrap();
        assert!(entries[0].start_time >= entries[1].start_time);
    }
}
