//! Record types mirrored from the backend tables (`sales`, `payments`,
//! `deliveries`) plus the local-only delivery key.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Sales
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sale {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub date: NaiveDate,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_fee: Option<f64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

/// Insert body for `sales`; id and created_at are assigned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSale {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub date: NaiveDate,
    pub value: f64,
    pub delivery_fee: f64,
}

/// Edit body for `sales`. Editing always records a justification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalePatch {
    pub value: f64,
    pub delivery_fee: f64,
    pub justification: String,
}

// ---------------------------------------------------------------------------
// Payments
// ---------------------------------------------------------------------------

/// The two staff members who split the sales commission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StaffMember {
    Bruno,
    Daniele,
}

impl StaffMember {
    pub const ALL: [StaffMember; 2] = [StaffMember::Bruno, StaffMember::Daniele];

    pub fn name(self) -> &'static str {
        match self {
            StaffMember::Bruno => "Bruno",
            StaffMember::Daniele => "Daniele",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "bruno" => Some(StaffMember::Bruno),
            "daniele" => Some(StaffMember::Daniele),
            _ => None,
        }
    }
}

impl fmt::Display for StaffMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub person: StaffMember,
    pub date: NaiveDate,
    pub value: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPayment {
    pub person: StaffMember,
    pub date: NaiveDate,
    pub value: f64,
}

// ---------------------------------------------------------------------------
// Deliveries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    InRoute,
    Delivered,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::InRoute => "in_route",
            DeliveryStatus::Delivered => "delivered",
        }
    }
}

/// A `deliveries` row as the backend returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: i64,
    pub order_id: String,
    pub address: String,
    pub status: DeliveryStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_fee: Option<f64>,
}

/// Insert body for `deliveries`, also the content of a local placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDelivery {
    pub order_id: String,
    pub address: String,
    pub status: DeliveryStatus,
    pub start_time: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_fee: Option<f64>,
}

/// Client-side reference for a delivery whose insert has not resolved yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalRef(pub Uuid);

impl LocalRef {
    pub fn new() -> Self {
        LocalRef(Uuid::new_v4())
    }
}

impl Default for LocalRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

/// Identity of a delivery in the local list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryKey {
    Pending { local_ref: LocalRef },
    Confirmed { id: i64 },
}

impl DeliveryKey {
    pub fn server_id(&self) -> Option<i64> {
        match self {
            DeliveryKey::Confirmed { id } => Some(*id),
            DeliveryKey::Pending { .. } => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, DeliveryKey::Pending { .. })
    }
}

/// One row of the local delivery list: either a placeholder or a mirror of
/// an authoritative record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryEntry {
    pub key: DeliveryKey,
    pub order_id: String,
    pub address: String,
    pub status: DeliveryStatus,
    pub start_time: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub driver_email: Option<String>,
    pub delivery_fee: Option<f64>,
}

impl DeliveryEntry {
    pub fn placeholder(local_ref: LocalRef, draft: &NewDelivery) -> Self {
        Self {
            key: DeliveryKey::Pending { local_ref },
            order_id: draft.order_id.clone(),
            address: draft.address.clone(),
            status: draft.status,
            start_time: draft.start_time,
            delivered_at: draft.delivered_at,
            driver_email: draft.driver_email.clone(),
            delivery_fee: draft.delivery_fee,
        }
    }

    pub fn server_id(&self) -> Option<i64> {
        self.key.server_id()
    }
}

impl From<Delivery> for DeliveryEntry {
    fn from(record: Delivery) -> Self {
        Self {
            key: DeliveryKey::Confirmed { id: record.id },
            order_id: record.order_id,
            address: record.address,
            status: record.status,
            start_time: record.start_time,
            delivered_at: record.delivered_at,
            driver_email: record.driver_email,
            delivery_fee: record.delivery_fee,
        }
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Driver,
}

impl UserRole {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "admin" => Some(UserRole::Admin),
            "driver" | "entregador" => Some(UserRole::Driver),
            _ => None,
        }
    }
}
