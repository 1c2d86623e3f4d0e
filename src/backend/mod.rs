//! Boundary to the hosted backend.
//!
//! [`Backend`] covers the request/response side (three tables keyed by a
//! numeric id). The push side lives in [`realtime`], which turns websocket
//! frames into [`ChangeEvent`]s.

#[cfg(test)]
pub mod memory;
pub mod realtime;
pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AppResult;
use crate::models::{Delivery, NewDelivery, NewPayment, NewSale, Payment, Sale, SalePatch};

#[cfg(test)]
pub use memory::MemoryBackend;
pub use rest::RestBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Sales,
    Payments,
    Deliveries,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Sales, Table::Payments, Table::Deliveries];

    pub fn name(self) -> &'static str {
        match self {
            Table::Sales => "sales",
            Table::Payments => "payments",
            Table::Deliveries => "deliveries",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Table::ALL.into_iter().find(|t| t.name() == raw)
    }
}

/// One row-level change pushed by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange<T> {
    Inserted(T),
    Updated(T),
    Deleted(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Sales(RowChange<Sale>),
    Payments(RowChange<Payment>),
    Deliveries(RowChange<Delivery>),
}

impl ChangeEvent {
    pub fn table(&self) -> Table {
        match self {
            ChangeEvent::Sales(_) => Table::Sales,
            ChangeEvent::Payments(_) => Table::Payments,
            ChangeEvent::Deliveries(_) => Table::Deliveries,
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Bearer token for row-level security; `None` falls back to the anon key.
    fn set_access_token(&self, token: Option<String>);

    async fn list_sales(&self) -> AppResult<Vec<Sale>>;
    async fn insert_sale(&self, sale: &NewSale) -> AppResult<Sale>;
    async fn update_sale(&self, id: i64, patch: &SalePatch) -> AppResult<Sale>;
    async fn delete_sale(&self, id: i64) -> AppResult<()>;

    async fn list_payments(&self) -> AppResult<Vec<Payment>>;
    async fn insert_payment(&self, payment: &NewPayment) -> AppResult<Payment>;
    async fn delete_payment(&self, id: i64) -> AppResult<()>;

    async fn list_deliveries(&self) -> AppResult<Vec<Delivery>>;
    async fn insert_delivery(&self, delivery: &NewDelivery) -> AppResult<Delivery>;
    async fn mark_delivered(&self, id: i64, at: DateTime<Utc>) -> AppResult<Delivery>;
    async fn delete_delivery(&self, id: i64) -> AppResult<()>;
}
