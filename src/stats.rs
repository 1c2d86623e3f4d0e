//! Dashboard aggregates: commission totals, month and day series, the
//! month-grouped sales list and the driver's daily summary.
//!
//! Commission is never stored. 15% of a sale's value is the total
//! commission, split evenly (7.5% each) between the two staff members.

use chrono::{Datelike, FixedOffset, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::{DeliveryEntry, DeliveryStatus, Payment, Sale, StaffMember};
use crate::money::round_cents;

pub const COMMISSION_RATE: f64 = 0.15;
pub const SHARE_RATE: f64 = 0.075;
pub const RECENT_DELIVERIES: usize = 10;

const MONTHS_PT: [&str; 12] = [
    "janeiro",
    "fevereiro",
    "março",
    "abril",
    "maio",
    "junho",
    "julho",
    "agosto",
    "setembro",
    "outubro",
    "novembro",
    "dezembro",
];

pub fn commission(value: f64) -> f64 {
    value * COMMISSION_RATE
}

pub fn month_key(date: NaiveDate) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

/// `"março de 25"`.
pub fn month_label_short(year: i32, month: u32) -> String {
    format!("{} de {:02}", month_name(month), year.rem_euclid(100))
}

/// `"Março de 2025"`.
pub fn month_title(year: i32, month: u32) -> String {
    let name = month_name(month);
    let mut chars = name.chars();
    let capitalised: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };
    format!("{capitalised} de {year}")
}

fn month_name(month: u32) -> &'static str {
    MONTHS_PT
        .get(month.saturating_sub(1) as usize)
        .copied()
        .unwrap_or("?")
}

fn parse_month_key(key: &str) -> Option<(i32, u32)> {
    let (y, m) = key.split_once('-')?;
    Some((y.parse().ok()?, m.parse().ok()?))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryStats {
    pub total_sales: f64,
    pub total_commission: f64,
    pub commission_per_person: f64,
    pub sales_count: usize,
    pub paid_bruno: f64,
    pub paid_daniele: f64,
    pub balance_bruno: f64,
    pub balance_daniele: f64,
}

pub fn summary_stats(sales: &[Sale], payments: &[Payment]) -> SummaryStats {
    let total_sales: f64 = sales.iter().map(|s| s.value).sum();
    let per_person = total_sales * SHARE_RATE;
    let paid = |person: StaffMember| -> f64 {
        payments
            .iter()
            .filter(|p| p.person == person)
            .map(|p| p.value)
            .sum()
    };
    let paid_bruno = paid(StaffMember::Bruno);
    let paid_daniele = paid(StaffMember::Daniele);

    SummaryStats {
        total_sales: round_cents(total_sales),
        total_commission: round_cents(commission(total_sales)),
        commission_per_person: round_cents(per_person),
        sales_count: sales.len(),
        paid_bruno: round_cents(paid_bruno),
        paid_daniele: round_cents(paid_daniele),
        balance_bruno: round_cents(per_person - paid_bruno),
        balance_daniele: round_cents(per_person - paid_daniele),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthTotal {
    pub key: String,
    pub label: String,
    pub value: f64,
}

/// Sale totals for the newest `n` months that have sales, newest first.
pub fn monthly_comparison(sales: &[Sale], n: usize) -> Vec<MonthTotal> {
    let mut by_month: BTreeMap<String, f64> = BTreeMap::new();
    for sale in sales {
        *by_month.entry(month_key(sale.date)).or_default() += sale.value;
    }
    by_month
        .into_iter()
        .rev()
        .take(n)
        .filter_map(|(key, value)| {
            let (year, month) = parse_month_key(&key)?;
            Some(MonthTotal {
                label: month_label_short(year, month),
                key,
                value: round_cents(value),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayTotal {
    pub date: NaiveDate,
    pub label: String,
    pub value: f64,
}

/// Per-day totals for the latest `n` distinct sale dates, oldest first.
pub fn daily_series(sales: &[Sale], n: usize) -> Vec<DayTotal> {
    let mut by_day: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for sale in sales {
        *by_day.entry(sale.date).or_default() += sale.value;
    }
    let skip = by_day.len().saturating_sub(n);
    by_day
        .into_iter()
        .skip(skip)
        .map(|(date, value)| DayTotal {
            date,
            label: date.format("%d/%m").to_string(),
            value: round_cents(value),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthGroup {
    pub key: String,
    pub title: String,
    pub total: f64,
    pub sales: Vec<Sale>,
}

/// Sales grouped by month (newest month first); inside a month the most
/// recently created sale comes first.
pub fn group_by_month(sales: &[Sale]) -> Vec<MonthGroup> {
    let mut by_month: BTreeMap<String, Vec<Sale>> = BTreeMap::new();
    for sale in sales {
        by_month
            .entry(month_key(sale.date))
            .or_default()
            .push(sale.clone());
    }
    by_month
        .into_iter()
        .rev()
        .map(|(key, mut rows)| {
            rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let title = parse_month_key(&key)
                .map(|(y, m)| month_title(y, m))
                .unwrap_or_else(|| key.clone());
            MonthGroup {
                total: round_cents(rows.iter().map(|s| s.value).sum()),
                key,
                title,
                sales: rows,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverSummary {
    pub today: Vec<DeliveryEntry>,
    pub delivered_today: usize,
    pub in_route: usize,
    pub fees_today: f64,
    pub recent_delivered: Vec<DeliveryEntry>,
}

/// The signed-in driver's view. `offset` is the local UTC offset used to
/// decide which timestamps fall on `today`.
pub fn driver_summary(
    entries: &[DeliveryEntry],
    driver_email: &str,
    today: NaiveDate,
    offset: FixedOffset,
) -> DriverSummary {
    let email = driver_email.trim().to_lowercase();
    let mine: Vec<&DeliveryEntry> = entries
        .iter()
        .filter(|e| {
            e.driver_email
                .as_deref()
                .map(|d| d.trim().to_lowercase() == email)
                .unwrap_or(false)
        })
        .collect();

    let local_day = |ts: chrono::DateTime<chrono::Utc>| ts.with_timezone(&offset).date_naive();
    let is_today = |e: &DeliveryEntry| {
        local_day(e.start_time) == today || e.delivered_at.map(local_day) == Some(today)
    };

    let today_entries: Vec<DeliveryEntry> = mine
        .iter()
        .filter(|e| is_today(e))
        .map(|e| (*e).clone())
        .collect();
    let delivered_today: Vec<&DeliveryEntry> = mine
        .iter()
        .copied()
        .filter(|e| e.delivered_at.map(local_day) == Some(today))
        .collect();

    let mut recent: Vec<DeliveryEntry> = mine
        .iter()
        .filter(|e| e.status == DeliveryStatus::Delivered)
        .map(|e| (*e).clone())
        .collect();
    recent.sort_by(|a, b| b.delivered_at.cmp(&a.delivered_at));
    recent.truncate(RECENT_DELIVERIES);

    DriverSummary {
        in_route: mine
            .iter()
            .filter(|e| e.status == DeliveryStatus::InRoute)
            .count(),
        delivered_today: delivered_today.len(),
        fees_today: round_cents(
            delivered_today
                .iter()
                .filter_map(|e| e.delivery_fee)
                .sum(),
        ),
        today: today_entries,
        recent_delivered: recent,
    }
}
