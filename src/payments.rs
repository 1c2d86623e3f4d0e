//! Commission payouts to the two staff members.

use chrono::NaiveDate;
use tracing::info;

use crate::backend::RowChange;
use crate::context::AppContext;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::models::{NewPayment, Payment, StaffMember};
use crate::money::round_cents;

pub async fn add_payment(
    ctx: &AppContext,
    person: StaffMember,
    date: NaiveDate,
    value: f64,
) -> AppResult<Payment> {
    let result: AppResult<Payment> = async {
        if !value.is_finite() || value <= 0.0 {
            return Err(AppError::Validation(
                "Por favor insira um valor válido.".into(),
            ));
        }
        let payment = NewPayment {
            person,
            date,
            value: round_cents(value),
        };
        ctx.backend.insert_payment(&payment).await
    }
    .await;

    match result {
        Ok(payment) => {
            info!(payment_id = payment.id, person = %payment.person, value = payment.value, "payment recorded");
            ctx.with_store(|s| s.payments.upsert(payment.clone()))?;
            ctx.emit_payments();
            Ok(payment)
        }
        Err(err) => {
            ctx.alert("add_payment", &err);
            Err(err)
        }
    }
}

pub async fn delete_payment(ctx: &AppContext, id: i64) -> AppResult<()> {
    if let Err(err) = ctx.backend.delete_payment(id).await {
        ctx.alert("delete_payment", &err);
        return Err(err);
    }
    info!(payment_id = id, "payment deleted");
    ctx.with_store(|s| s.payments.remove(id))?;
    ctx.emit_payments();
    Ok(())
}

pub async fn refresh_payments(ctx: &AppContext) -> AppResult<usize> {
    let rows = ctx.backend.list_payments().await?;
    ctx.cache_snapshot(db::COLLECTION_PAYMENTS, &rows);
    let count = ctx.with_store(|s| {
        s.payments.replace_all(rows);
        s.payments.len()
    })?;
    ctx.emit_payments();
    Ok(count)
}

pub fn apply_change(ctx: &AppContext, change: RowChange<Payment>) -> AppResult<()> {
    ctx.with_store(|s| match change {
        RowChange::Inserted(row) => s.payments.upsert(row),
        RowChange::Updated(row) => s.payments.update_existing(row),
        RowChange::Deleted(id) => {
            s.payments.remove(id);
        }
    })?;
    ctx.emit_payments();
    Ok(())
}
