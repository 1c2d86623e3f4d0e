//! In-process backend for tests.
//!
//! Rows live in plain vectors behind a mutex. Individual operations can be
//! made to fail, and delivery inserts can be held after the row is committed
//! but before the call returns, which is how a response arriving after its
//! own realtime notification is reproduced.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

use super::Backend;
use crate::error::{AppError, AppResult};
use crate::models::{
    Delivery, DeliveryStatus, NewDelivery, NewPayment, NewSale, Payment, Sale, SalePatch,
};

#[derive(Default)]
struct Tables {
    sales: Vec<Sale>,
    payments: Vec<Payment>,
    deliveries: Vec<Delivery>,
    next_id: i64,
}

#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    failing: Mutex<HashSet<&'static str>>,
    calls: Mutex<Vec<String>>,
    hold_inserts: AtomicBool,
    release: Notify,
    committed: Notify,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deliveries(rows: Vec<Delivery>) -> Self {
        let backend = Self::new();
        backend.seed_deliveries(rows);
        backend
    }

    pub fn seed_sales(&self, rows: Vec<Sale>) {
        let mut t = self.lock();
        t.next_id = t.next_id.max(rows.iter().map(|r| r.id).max().unwrap_or(0));
        t.sales = rows;
    }

    pub fn seed_payments(&self, rows: Vec<Payment>) {
        let mut t = self.lock();
        t.next_id = t.next_id.max(rows.iter().map(|r| r.id).max().unwrap_or(0));
        t.payments = rows;
    }

    pub fn seed_deliveries(&self, rows: Vec<Delivery>) {
        let mut t = self.lock();
        t.next_id = t.next_id.max(rows.iter().map(|r| r.id).max().unwrap_or(0));
        t.deliveries = rows;
    }

    /// Make every call to `operation` (e.g. `"insert_delivery"`) fail.
    pub fn fail(&self, operation: &'static str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(operation);
        }
    }

    pub fn recover(&self, operation: &'static str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.remove(operation);
        }
    }

    /// Hold delivery inserts after commit until [`release_inserts`](Self::release_inserts).
    pub fn hold_inserts(&self) {
        self.hold_inserts.store(true, Ordering::SeqCst);
    }

    pub fn release_inserts(&self) {
        self.hold_inserts.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    /// Wait until a held insert has committed its row.
    pub async fn insert_committed(&self) {
        self.committed.notified().await;
    }

    /// Calls made so far, formatted as `operation:id` where an id applies.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.lock().deliveries.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self, operation: &'static str, id: Option<i64>) -> AppResult<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(match id {
                Some(id) => format!("{operation}:{id}"),
                None => operation.to_string(),
            });
        }
        let failing = self
            .failing
            .lock()
            .map(|f| f.contains(operation))
            .unwrap_or(false);
        if failing {
            return Err(AppError::Remote {
                status: 500,
                message: format!("{operation} failed"),
            });
        }
        Ok(())
    }
}

fn sorted_by_date<T: Clone>(rows: &[T], key: impl Fn(&T) -> (chrono::NaiveDate, DateTime<Utc>)) -> Vec<T> {
    let mut rows = rows.to_vec();
    rows.sort_by(|a, b| key(b).cmp(&key(a)));
    rows
}

#[async_trait]
impl Backend for MemoryBackend {
    fn set_access_token(&self, _token: Option<String>) {}

    async fn list_sales(&self) -> AppResult<Vec<Sale>> {
        self.enter("list_sales", None)?;
        Ok(sorted_by_date(&self.lock().sales, |s| (s.date, s.created_at)))
    }

    async fn insert_sale(&self, sale: &NewSale) -> AppResult<Sale> {
        self.enter("insert_sale", None)?;
        let mut t = self.lock();
        t.next_id += 1;
        let row = Sale {
            id: t.next_id,
            order_id: sale.order_id.clone(),
            date: sale.date,
            value: sale.value,
            delivery_fee: Some(sale.delivery_fee),
            created_at: Utc::now(),
            justification: None,
        };
        t.sales.push(row.clone());
        Ok(row)
    }

    async fn update_sale(&self, id: i64, patch: &SalePatch) -> AppResult<Sale> {
        self.enter("update_sale", Some(id))?;
        let mut t = self.lock();
        let row = t
            .sales
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| AppError::NotFound(format!("sales {id}")))?;
        row.value = patch.value;
        row.delivery_fee = Some(patch.delivery_fee);
        row.justification = Some(patch.justification.clone());
        Ok(row.clone())
    }

    async fn delete_sale(&self, id: i64) -> AppResult<()> {
        self.enter("delete_sale", Some(id))?;
        self.lock().sales.retain(|s| s.id != id);
        Ok(())
    }

    async fn list_payments(&self) -> AppResult<Vec<Payment>> {
        self.enter("list_payments", None)?;
        Ok(sorted_by_date(&self.lock().payments, |p| (p.date, p.created_at)))
    }

    async fn insert_payment(&self, payment: &NewPayment) -> AppResult<Payment> {
        self.enter("insert_payment", None)?;
        let mut t = self.lock();
        t.next_id += 1;
        let row = Payment {
            id: t.next_id,
            person: payment.person,
            date: payment.date,
            value: payment.value,
            created_at: Utc::now(),
        };
        t.payments.push(row.clone());
        Ok(row)
    }

    async fn delete_payment(&self, id: i64) -> AppResult<()> {
        self.enter("delete_payment", Some(id))?;
        self.lock().payments.retain(|p| p.id != id);
        Ok(())
    }

    async fn list_deliveries(&self) -> AppResult<Vec<Delivery>> {
        self.enter("list_deliveries", None)?;
        let mut rows = self.lock().deliveries.clone();
        rows.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(rows)
    }

    async fn insert_delivery(&self, delivery: &NewDelivery) -> AppResult<Delivery> {
        self.enter("insert_delivery", None)?;
        let row = {
            let mut t = self.lock();
            t.next_id += 1;
            let row = Delivery {
                id: t.next_id,
                order_id: delivery.order_id.clone(),
                address: delivery.address.clone(),
                status: delivery.status,
                start_time: delivery.start_time,
                delivered_at: delivery.delivered_at,
                created_at: Some(Utc::now()),
                driver_email: delivery.driver_email.clone(),
                delivery_fee: delivery.delivery_fee,
            };
            t.deliveries.push(row.clone());
            row
        };
        if self.hold_inserts.load(Ordering::SeqCst) {
            let released = self.release.notified();
            self.committed.notify_one();
            released.await;
        }
        Ok(row)
    }

    async fn mark_delivered(&self, id: i64, at: DateTime<Utc>) -> AppResult<Delivery> {
        self.enter("mark_delivered", Some(id))?;
        let mut t = self.lock();
        let row = t
            .deliveries
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| AppError::NotFound(format!("deliveries {id}")))?;
        row.status = DeliveryStatus::Delivered;
        row.delivered_at = Some(at);
        Ok(row.clone())
    }

    async fn delete_delivery(&self, id: i64) -> AppResult<()> {
        self.enter("delete_delivery", Some(id))?;
        self.lock().deliveries.retain(|d| d.id != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn new_delivery(order_id: &str) -> NewDelivery {
        NewDelivery {
            order_id: order_id.into(),
            address: "Rua X, 10".into(),
            status: DeliveryStatus::InRoute,
            start_time: Utc::now(),
            delivered_at: None,
            driver_email: None,
            delivery_fee: None,
        }
    }

    #[tokio::test]
    async fn test_ids_continue_after_seed() {
        let backend = MemoryBackend::new();
        backend.seed_payments(vec![Payment {
            id: 10,
            person: crate::models::StaffMember::Bruno,
            date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            value: 5.0,
            created_at: Utc::now(),
        }]);
        let created = backend.insert_delivery(&new_delivery("1")).await.unwrap();
        assert_eq!(created.id, 11);
    }

    #[tokio::test]
    async fn test_injected_failure_and_call_log() {
        let backend = MemoryBackend::new();
        backend.fail("delete_delivery");
        assert!(backend.delete_delivery(3).await.is_err());
        backend.recover("delete_delivery");
        backend.delete_delivery(3).await.unwrap();
        assert_eq!(backend.calls(), vec!["delete_delivery:3", "delete_delivery:3"]);
    }

    #[tokio::test]
    async fn test_held_insert_commits_before_returning() {
        let backend = Arc::new(MemoryBackend::new());
        backend.hold_inserts();
        let task = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.insert_delivery(&new_delivery("77")).await })
        };
        backend.insert_committed().await;
        assert_eq!(backend.deliveries().len(), 1);
        assert!(!task.is_finished());
        backend.release_inserts();
        let row = task.await.unwrap().unwrap();
        assert_eq!(row.order_id, "77");
    }
}
