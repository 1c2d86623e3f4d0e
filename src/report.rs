//! Monthly sales report (printable HTML) and the full CSV export.

use chrono::NaiveDate;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::models::{Payment, Sale};
use crate::money::{format_brl, round_cents};
use crate::stats::{self, commission};

pub const CSV_HEADER: &str = "TIPO,Data,Nome/Pedido,Valor Venda,Taxa Entrega,Justificativa";
pub const CSV_FILENAME: &str = "relatorio_completo.csv";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthOption {
    pub key: String,
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportTotals {
    pub count: usize,
    pub value: f64,
    pub commission: f64,
    pub delivery_fee: f64,
}

impl ReportTotals {
    fn of(rows: &[ReportRow]) -> Self {
        Self {
            count: rows.len(),
            value: round_cents(rows.iter().map(|r| r.value).sum()),
            commission: round_cents(rows.iter().map(|r| r.commission).sum()),
            delivery_fee: round_cents(rows.iter().map(|r| r.delivery_fee).sum()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    pub date: NaiveDate,
    pub order_ref: String,
    pub value: f64,
    pub commission: f64,
    pub delivery_fee: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPage {
    pub number: usize,
    pub rows: Vec<ReportRow>,
    pub subtotal: ReportTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyReport {
    pub month: String,
    pub title: String,
    pub pages: Vec<ReportPage>,
    pub totals: ReportTotals,
}

/// Months that have sales, newest first, for the month selector.
pub fn available_months(sales: &[Sale]) -> Vec<MonthOption> {
    stats::group_by_month(sales)
        .into_iter()
        .map(|g| MonthOption {
            key: g.key,
            label: g.title,
        })
        .collect()
}

/// Parse a `YYYY-MM` selector.
pub fn parse_month(key: &str) -> AppResult<(i32, u32)> {
    let invalid = || AppError::Validation(format!("Mês inválido: {key}"));
    let (y, m) = key.trim().split_once('-').ok_or_else(invalid)?;
    if y.len() != 4 || m.len() != 2 {
        return Err(invalid());
    }
    let year: i32 = y.parse().map_err(|_| invalid())?;
    let month: u32 = m.parse().map_err(|_| invalid())?;
    if !(1..=12).contains(&month) {
        return Err(invalid());
    }
    Ok((year, month))
}

/// The sales of one month in date order, split into pages of
/// `rows_per_page`.
pub fn build_report(sales: &[Sale], month: &str, rows_per_page: usize) -> AppResult<MonthlyReport> {
    let (year, month_no) = parse_month(month)?;
    let key = format!("{year:04}-{month_no:02}");

    let mut selected: Vec<&Sale> = sales
        .iter()
        .filter(|s| stats::month_key(s.date) == key)
        .collect();
    if selected.is_empty() {
        return Err(AppError::Validation(
            "Nenhuma venda encontrada para o mês selecionado.".into(),
        ));
    }
    selected.sort_by(|a, b| (a.date, a.created_at).cmp(&(b.date, b.created_at)));

    let rows: Vec<ReportRow> = selected
        .into_iter()
        .map(|s| ReportRow {
            date: s.date,
            order_ref: s.order_id.clone().unwrap_or_else(|| "-".into()),
            value: s.value,
            commission: round_cents(commission(s.value)),
            delivery_fee: s.delivery_fee.unwrap_or(0.0),
        })
        .collect();

    let totals = ReportTotals::of(&rows);
    let pages = rows
        .chunks(rows_per_page.max(1))
        .enumerate()
        .map(|(i, chunk)| ReportPage {
            number: i + 1,
            subtotal: ReportTotals::of(chunk),
            rows: chunk.to_vec(),
        })
        .collect();

    Ok(MonthlyReport {
        month: key,
        title: format!("Relatório de Vendas - {}", stats::month_title(year, month_no)),
        pages,
        totals,
    })
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn totals_cells(label: &str, t: &ReportTotals) -> String {
    format!(
        "<tr class=\"totals\"><td colspan=\"2\">{label}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
        format_brl(t.value),
        format_brl(t.commission),
        format_brl(t.delivery_fee)
    )
}

pub fn render_html(report: &MonthlyReport) -> String {
    let page_count = report.pages.len();
    let mut body = String::new();

    for page in &report.pages {
        let mut rows_html = String::new();
        for row in &page.rows {
            rows_html.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                row.date.format("%d/%m/%Y"),
                escape_html(&row.order_ref),
                format_brl(row.value),
                format_brl(row.commission),
                format_brl(row.delivery_fee)
            ));
        }

        let mut footer = totals_cells("Subtotal da página", &page.subtotal);
        if page.number == page_count {
            footer.push_str(&totals_cells("Total geral", &report.totals));
        }

        body.push_str(&format!(
            r#"<section class="page">
<header>
<h1>{title}</h1>
<div class="summary">Vendas: {count} | Total: {value} | Comissão: {commission} | Taxas de entrega: {fees}</div>
</header>
<table>
<thead><tr><th>Data</th><th>Pedido</th><th>Valor</th><th>Comissão</th><th>Taxa de entrega</th></tr></thead>
<tbody>
{rows_html}</tbody>
<tfoot>{footer}</tfoot>
</table>
<footer>Página {number} de {page_count}</footer>
</section>
"#,
            title = escape_html(&report.title),
            count = report.totals.count,
            value = format_brl(report.totals.value),
            commission = format_brl(report.totals.commission),
            fees = format_brl(report.totals.delivery_fee),
            number = page.number,
        ));
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="pt-BR">
<head>
<meta charset="UTF-8"/>
<title>{title}</title>
<style>
  body {{ margin: 0; font-family: sans-serif; font-size: 12px; color: #111; }}
  .page {{ padding: 16px; page-break-after: always; }}
  .page:last-child {{ page-break-after: auto; }}
  h1 {{ font-size: 16px; margin: 0 0 4px 0; }}
  .summary {{ margin-bottom: 8px; color: #444; }}
  table {{ width: 100%; border-collapse: collapse; }}
  th, td {{ border-bottom: 1px solid #ddd; padding: 4px; text-align: left; }}
  .totals td {{ font-weight: bold; border-top: 2px solid #111; }}
  footer {{ margin-top: 6px; text-align: right; color: #666; }}
</style>
</head>
<body>
{body}</body>
</html>"#,
        title = escape_html(&report.title),
    )
}

/// Write the rendered report into `dir` and return the file path.
pub fn write_report(dir: &Path, report: &MonthlyReport) -> AppResult<PathBuf> {
    fs::create_dir_all(dir).map_err(|e| AppError::State(format!("create report dir: {e}")))?;
    let path = dir.join(format!("relatorio_{}.html", report.month));
    fs::write(&path, render_html(report))
        .map_err(|e| AppError::State(format!("write report file: {e}")))?;
    info!(path = %path.display(), pages = report.pages.len(), "monthly report written");
    Ok(path)
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

/// Every sale followed by every payment.
pub fn export_csv(sales: &[Sale], payments: &[Payment]) -> String {
    let mut lines = vec![CSV_HEADER.to_string()];
    for s in sales {
        lines.push(format!(
            "VENDA,{},{},{},{},{}",
            s.date,
            csv_field(s.order_id.as_deref().filter(|o| !o.is_empty()).unwrap_or("-")),
            s.value,
            s.delivery_fee.unwrap_or(0.0),
            csv_field(s.justification.as_deref().unwrap_or(""))
        ));
    }
    for p in payments {
        lines.push(format!("PAGAMENTO,{},{},{},,", p.date, p.person, p.value));
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

pub fn write_csv(dir: &Path, sales: &[Sale], payments: &[Payment]) -> AppResult<PathBuf> {
    fs::create_dir_all(dir).map_err(|e| AppError::State(format!("create export dir: {e}")))?;
    let path = dir.join(CSV_FILENAME);
    fs::write(&path, export_csv(sales, payments))
        .map_err(|e| AppError::State(format!("write csv export: {e}")))?;
    info!(path = %path.display(), sales = sales.len(), payments = payments.len(), "csv export written");
    Ok(path)
}
