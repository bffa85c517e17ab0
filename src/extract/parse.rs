//! Normalizers for the number formats marketplaces print: Indonesian
//! thousands separators, "rb"/"jt" suffixes and the like.

use std::sync::OnceLock;

use regex::Regex;

fn number_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d[\d.,]*").expect("valid regex"))
}

fn count_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(\d[\d.,]*)\s*(rb|ribu|k|jt|juta|m)?\b").expect("valid regex"))
}

fn percent_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,3})\s*%").expect("valid regex"))
}

/// Resolve `.`/`,` ambiguity in a bare numeric token.
///
/// With both separators present the last one is the decimal mark. A lone
/// separator followed by exactly three digits is a thousands separator
/// ("50.000"), otherwise it is a decimal mark ("12.99", "4,8").
fn normalize_number(token: &str) -> Option<f64> {
    let token = token.trim_end_matches(|c| c == '.' || c == ',');
    let last_dot = token.rfind('.');
    let last_comma = token.rfind(',');

    let normalized = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) => {
            let (decimal, thousands) = if dot > comma { ('.', ',') } else { (',', '.') };
            token.replace(thousands, "").replace(decimal, ".")
        }
        (Some(_), None) => resolve_single(token, '.'),
        (None, Some(_)) => resolve_single(token, ','),
        (None, None) => token.to_string(),
    };

    normalized.parse::<f64>().ok()
}

fn resolve_single(token: &str, sep: char) -> String {
    let parts: Vec<&str> = token.split(sep).collect();
    let is_thousands = parts.len() > 2 || parts.last().map_or(false, |tail| tail.len() == 3);

    if is_thousands {
        parts.concat()
    } else {
        token.replace(sep, ".")
    }
}

/// "Rp50.000" -> 50000, "Rp 1.250.000" -> 1250000, "$12.99" -> 12.99.
/// A range ("Rp50.000 - Rp75.000") yields its lower bound.
pub fn parse_price(text: &str) -> Option<f64> {
    let token = number_token().find(text)?;
    normalize_number(token.as_str()).filter(|value| *value >= 0.0)
}

/// Sold and review counters: "1,2RB terjual" -> 1200, "10rb+ sold" -> 10000,
/// "3.4k" -> 3400, "2jt" -> 2000000, "1.234 terjual" -> 1234.
pub fn parse_count(text: &str) -> Option<i64> {
    let caps = count_token().captures(text)?;
    let number = caps.get(1)?.as_str();

    let multiplier = match caps.get(2).map(|m| m.as_str().to_lowercase()) {
        Some(suffix) if suffix == "rb" || suffix == "ribu" || suffix == "k" => 1_000.0,
        Some(suffix) if suffix == "jt" || suffix == "juta" || suffix == "m" => 1_000_000.0,
        _ => 1.0,
    };

    let value = if multiplier > 1.0 {
        // With a suffix any separator is a decimal mark
        number.trim_end_matches(|c| c == '.' || c == ',').replace(',', ".").parse::<f64>().ok()?
    } else {
        normalize_number(number)?
    };

    Some((value * multiplier).round() as i64)
}

/// "-25%", "25% OFF", "Diskon 25%" -> 25
pub fn parse_percentage(text: &str) -> Option<i32> {
    let caps = percent_token().captures(text)?;
    caps.get(1)?.as_str().parse::<i32>().ok().filter(|pct| *pct <= 100)
}

/// "4.8", "4,8/5", "Rating 4.5" -> value on a 0..=5 scale
pub fn parse_rating(text: &str) -> Option<f64> {
    let token = number_token().find(text)?;
    let value = token
        .as_str()
        .trim_end_matches(|c| c == '.' || c == ',')
        .replace(',', ".")
        .parse::<f64>()
        .ok()?;

    (0.0..=5.0).contains(&value).then_some(value)
}
