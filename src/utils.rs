use std::str::FromStr;
use tokio::time::Duration;

/// Parses a duration string in the format "50ms", "30s", "10m", "5h", "3d".
///
/// Supported units:
/// - `ms` for milliseconds
/// - `s` for seconds
/// - `m` for minutes
/// - `h` for hours
/// - `d` for days
pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration string cannot be empty".to_string());
    }

    let split_at = s
        .find(|c: char| !c.is_ascii_digit() && c != '-' && c != '.')
        .unwrap_or(s.len());
    let (value_str, unit) = s.split_at(split_at);

    if unit.is_empty() {
        return Err(format!(
            "Unknown duration unit: '{}'. Use 'ms', 's', 'm', 'h', or 'd'.",
            s
        ));
    }

    let value = match u64::from_str(value_str) {
        Ok(v) => v,
        Err(_) => {
            return Err(format!(
                "Invalid numeric value in duration: '{}'",
                value_str
            ))
        }
    };

    let seconds_per_unit: u64 = match unit {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => {
            return Err(format!(
                "Unknown duration unit: '{}'. Use 'ms', 's', 'm', 'h', or 'd'.",
                unit
            ))
        }
    };

    value
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("Duration value too large: '{}'", s))
}

/// Parses a comma-separated header string with support for escaped commas.
///
/// Use `\,` to include a literal comma in a header value.
/// Example: "X-Tenant:acme,Accept:application/json\,text/plain"
pub fn parse_headers_with_escapes(headers_str: &str) -> Vec<String> {
    let mut headers = Vec::new();
    let mut current_header = String::new();
    let mut chars = headers_str.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                if chars.peek() == Some(&',') {
                    current_header.push(',');
                    chars.next();
                } else {
                    current_header.push('\\');
                }
            }
            ',' => {
                if !current_header.trim().is_empty() {
                    headers.push(current_header.clone());
                }
                current_header.clear();
            }
            _ => {
                current_header.push(ch);
            }
        }
    }

    if !current_header.trim().is_empty() {
        headers.push(current_header);
    }

    headers
}
