//! Owned in-memory state of the dashboard.

use crate::models::{Payment, Sale};
use crate::reconcile::{DeliveryBook, RecordList};

#[derive(Debug, Default)]
pub struct DashboardStore {
    pub sales: RecordList<Sale>,
    pub payments: RecordList<Payment>,
    pub deliveries: DeliveryBook,
}

impl DashboardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything, e.g. on sign-out.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
