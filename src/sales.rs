//! Sales ledger operations.
//!
//! Writes go to the backend first; the local mirror is updated from the
//! returned row. Realtime echoes of the same write are idempotent upserts.

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::info;

use crate::backend::RowChange;
use crate::context::AppContext;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::models::{NewSale, Sale, SalePatch};
use crate::money::round_cents;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleInput {
    pub date: NaiveDate,
    pub value: f64,
    #[serde(default)]
    pub delivery_fee: Option<f64>,
    #[serde(default)]
    pub order_id: Option<String>,
}

fn validate_value(value: f64) -> AppResult<f64> {
    if !value.is_finite() || value <= 0.0 {
        return Err(AppError::Validation(
            "Por favor insira um valor válido para a venda.".into(),
        ));
    }
    Ok(round_cents(value))
}

fn validate_fee(fee: Option<f64>) -> AppResult<f64> {
    match fee {
        Some(f) if !f.is_finite() || f < 0.0 => Err(AppError::Validation(
            "Taxa de entrega inválida.".into(),
        )),
        Some(f) => Ok(round_cents(f)),
        None => Ok(0.0),
    }
}

pub async fn add_sale(ctx: &AppContext, input: SaleInput) -> AppResult<Sale> {
    let result: AppResult<Sale> = async {
        let new_sale = NewSale {
            order_id: input
                .order_id
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty()),
            date: input.date,
            value: validate_value(input.value)?,
            delivery_fee: validate_fee(input.delivery_fee)?,
        };
        ctx.backend.insert_sale(&new_sale).await
    }
    .await;

    match result {
        Ok(sale) => {
            info!(sale_id = sale.id, value = sale.value, "sale recorded");
            ctx.with_store(|s| s.sales.upsert(sale.clone()))?;
            ctx.emit_sales();
            Ok(sale)
        }
        Err(err) => {
            ctx.alert("add_sale", &err);
            Err(err)
        }
    }
}

/// Edit a sale's value and fee. A justification is always stored with the
/// edit so the list can flag the row as changed.
pub async fn update_sale(
    ctx: &AppContext,
    id: i64,
    value: f64,
    delivery_fee: f64,
    justification: &str,
) -> AppResult<Sale> {
    let result: AppResult<Sale> = async {
        let patch = SalePatch {
            value: validate_value(value).map_err(|_| AppError::Validation("Valor inválido.".into()))?,
            delivery_fee: validate_fee(Some(delivery_fee))?,
            justification: justification.trim().to_string(),
        };
        ctx.backend.update_sale(id, &patch).await
    }
    .await;

    match result {
        Ok(sale) => {
            info!(sale_id = id, "sale updated");
            ctx.with_store(|s| s.sales.upsert(sale.clone()))?;
            ctx.emit_sales();
            Ok(sale)
        }
        Err(err) => {
            ctx.alert("update_sale", &err);
            Err(err)
        }
    }
}

pub async fn delete_sale(ctx: &AppContext, id: i64) -> AppResult<()> {
    if let Err(err) = ctx.backend.delete_sale(id).await {
        ctx.alert("delete_sale", &err);
        return Err(err);
    }
    info!(sale_id = id, "sale deleted");
    ctx.with_store(|s| s.sales.remove(id))?;
    ctx.emit_sales();
    Ok(())
}

/// Replace the local mirror with a fresh fetch.
pub async fn refresh_sales(ctx: &AppContext) -> AppResult<usize> {
    let rows = ctx.backend.list_sales().await?;
    ctx.cache_snapshot(db::COLLECTION_SALES, &rows);
    let count = ctx.with_store(|s| {
        s.sales.replace_all(rows);
        s.sales.len()
    })?;
    ctx.emit_sales();
    Ok(count)
}

pub fn apply_change(ctx: &AppContext, change: RowChange<Sale>) -> AppResult<()> {
    ctx.with_store(|s| match change {
        RowChange::Inserted(row) => s.sales.upsert(row),
        RowChange::Updated(row) => s.sales.update_existing(row),
        RowChange::Deleted(id) => {
            s.sales.remove(id);
        }
    })?;
    ctx.emit_sales();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::test_support::harness;
    use chrono::{TimeZone, Utc};

    fn input(value: f64) -> SaleInput {
        SaleInput {
            date: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            value,
            delivery_fee: Some(10.0),
            order_id: Some(" 77 ".into()),
        }
    }

    #[tokio::test]
    async fn test_add_sale_updates_mirror_and_emits() {
        let h = harness();
        let sale = add_sale(&h.ctx, input(150.0)).await.unwrap();
        assert_eq!(sale.order_id.as_deref(), Some("77"));
        assert_eq!(sale.delivery_fee, Some(10.0));
        let rows = h.ctx.with_store(|s| s.sales.rows().to_vec()).unwrap();
        assert_eq!(rows, vec![sale]);
        assert_eq!(h.events.payloads(events::SALES_CHANGED).len(), 1);
    }

    #[tokio::test]
    async fn test_non_positive_value_is_rejected_without_remote_call() {
        let h = harness();
        let err = add_sale(&h.ctx, input(0.0)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(h.backend.calls().is_empty());
        assert_eq!(h.events.payloads(events::OPERATOR_ALERT).len(), 1);
    }

    #[tokio::test]
    async fn test_remote_rejection_leaves_mirror_unchanged() {
        let h = harness();
        h.backend.fail("insert_sale");
        assert!(add_sale(&h.ctx, input(20.0)).await.is_err());
        assert!(h.ctx.with_store(|s| s.sales.is_empty()).unwrap());
        let alert = &h.events.payloads(events::OPERATOR_ALERT)[0];
        assert_eq!(alert["action"], "add_sale");
    }

    #[tokio::test]
    async fn test_update_records_justification() {
        let h = harness();
        let sale = add_sale(&h.ctx, input(100.0)).await.unwrap();
        let updated = update_sale(&h.ctx, sale.id, 120.5, 0.0, "cliente trocou o arranjo")
            .await
            .unwrap();
        assert_eq!(updated.value, 120.5);
        assert_eq!(updated.justification.as_deref(), Some("cliente trocou o arranjo"));
        let err = update_sale(&h.ctx, sale.id, -1.0, 0.0, "x").await.unwrap_err();
        assert_eq!(err.to_string(), "Valor inválido.");
    }

    #[tokio::test]
    async fn test_delete_and_refresh() {
        let h = harness();
        let a = add_sale(&h.ctx, input(10.0)).await.unwrap();
        add_sale(&h.ctx, input(20.0)).await.unwrap();
        delete_sale(&h.ctx, a.id).await.unwrap();
        assert_eq!(refresh_sales(&h.ctx).await.unwrap(), 1);
    }

    #[test]
    fn test_realtime_changes_apply_to_mirror() {
        let h = harness();
        let row = Sale {
            id: 9,
            order_id: None,
            date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            value: 50.0,
            delivery_fee: None,
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap(),
            justification: None,
        };
        apply_change(&h.ctx, RowChange::Inserted(row.clone())).unwrap();
        apply_change(&h.ctx, RowChange::Inserted(row.clone())).unwrap();
        apply_change(
            &h.ctx,
            RowChange::Updated(Sale {
                id: 404,
                ..row.clone()
            }),
        )
        .unwrap();
        assert_eq!(h.ctx.with_store(|s| s.sales.len()).unwrap(), 1);
        apply_change(&h.ctx, RowChange::Deleted(9)).unwrap();
        assert!(h.ctx.with_store(|s| s.sales.is_empty()).unwrap());
    }
}
