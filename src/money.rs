//! BRL amount helpers: cent-string form input and pt-BR display.

/// Parse form input typed as digits only, where the last two digits are
/// cents: `"5490"` is 54.90. Non-digit characters are ignored, so a display
/// string like `"54,90"` parses to the same value. Empty input is `None`.
pub fn parse_cents_input(raw: &str) -> Option<f64> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let cents: u64 = digits.parse().ok()?;
    Some(cents as f64 / 100.0)
}

pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Format as `R$ 1.234,56` (negative values keep a leading minus).
pub fn format_brl(value: f64) -> String {
    let cents = (value * 100.0).round() as i64;
    let negative = cents < 0;
    let cents = cents.unsigned_abs();
    let whole = (cents / 100).to_string();
    let frac = cents % 100;

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }

    if negative {
        format!("-R$ {grouped},{frac:02}")
    } else {
        format!("R$ {grouped},{frac:02}")
    }
}
