//! Kubernetes resource quantity parsing
//!
//! Converts quantity strings such as `1Gi`, `500M`, `1e3` or `100m` into a
//! plain `f64` value in base units.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Parse a quantity into its approximate numeric value
pub fn quantity_to_f64(quantity: &Quantity) -> Option<f64> {
    parse_quantity(&quantity.0)
}

/// Parse a quantity string into its approximate numeric value
pub fn parse_quantity(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let number: f64 = number.parse().ok()?;

    let multiplier = match suffix {
        "" => 1.0,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        // decimal exponent, e.g. 1e3 or 2E6
        s if s.len() > 1 && (s.starts_with('e') || s.starts_with('E')) => {
            let exponent: i32 = s[1..].parse().ok()?;
            10f64.powi(exponent)
        }
        _ => return None,
    };

    Some(number * multiplier)
}
