use serde_json::Value;

/// Parse a scraped price/quantity string into a finite number.
///
/// Currency symbols, spaces and letters are dropped. When both `,` and `.` appear the
/// right-most one is the decimal separator and the other is a thousands separator. A lone
/// separator repeated more than once is a thousands separator; a single `,` is a decimal
/// comma. Anything unparsable or non-finite yields `None`.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let kept: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();
    if !kept.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let negative = kept.starts_with('-');
    let body: String = kept.chars().filter(|c| *c != '-').collect();

    let last_comma = body.rfind(',');
    let last_dot = body.rfind('.');
    let normalized = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => body.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => body.replace(',', ""),
        (Some(_), None) => {
            if body.matches(',').count() > 1 {
                body.replace(',', "")
            } else {
                body.replace(',', ".")
            }
        }
        (None, Some(_)) => {
            if body.matches('.').count() > 1 {
                body.replace('.', "")
            } else {
                body
            }
        }
        (None, None) => body,
    };

    let parsed: f64 = normalized.parse().ok()?;
    if !parsed.is_finite() {
        return None;
    }
    Some(if negative { -parsed } else { parsed })
}

/// Coerce any JSON scalar into a finite number; failures become 0 rather than errors.
pub fn coerce_number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).unwrap_or(0.0),
        Value::String(s) => parse_decimal(s).unwrap_or(0.0),
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

/// Render a coerced number back into JSON, keeping integers integral.
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        let rounded = (n * 1_000_000.0).round() / 1_000_000.0;
        serde_json::Number::from_f64(rounded)
            .map(Value::Number)
            .unwrap_or_else(|| Value::from(0))
    }
}

/// Best-effort integer id extraction (ids arrive as numbers or numeric strings).
pub fn as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}
