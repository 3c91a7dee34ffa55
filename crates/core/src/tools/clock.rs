//! Wall-clock time for the `get_current_time` tool.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Resolves a spoken place or abbreviation, an IANA name, or a lowercase
/// IANA name to a time zone.
pub fn resolve_timezone(name: &str) -> Result<Tz, String> {
    let trimmed = name.trim();
    let name = match trimmed.to_lowercase().as_str() {
        "" | "utc" => "UTC",
        "india" | "ist" | "mumbai" | "delhi" | "bangalore" => "Asia/Kolkata",
        "new york" | "nyc" | "est" => "America/New_York",
        "los angeles" | "la" | "pst" => "America/Los_Angeles",
        "chicago" | "cst" => "America/Chicago",
        "london" | "gmt" => "Europe/London",
        "paris" | "cet" => "Europe/Paris",
        "berlin" => "Europe/Berlin",
        "tokyo" | "jst" => "Asia/Tokyo",
        "beijing" | "shanghai" | "cst china" => "Asia/Shanghai",
        "singapore" => "Asia/Singapore",
        "dubai" => "Asia/Dubai",
        "sydney" | "aest" => "Australia/Sydney",
        "riyadh" | "saudi" => "Asia/Riyadh",
        _ => trimmed,
    };
    if let Ok(tz) = name.parse::<Tz>() {
        return Ok(tz);
    }
    let capitalized = name
        .split('/')
        .map(capitalize)
        .collect::<Vec<_>>()
        .join("/");
    capitalized
        .parse::<Tz>()
        .map_err(|_| format!("Unknown timezone: '{name}'"))
}

fn capitalize(part: &str) -> String {
    let mut chars = part.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Describes `now` in the named zone, e.g.
/// `03:45 PM, Thursday, 19 February 2026 (IST UTC+05:30)`.
pub fn describe_time(now: DateTime<Utc>, timezone: &str) -> Result<String, String> {
    let tz = resolve_timezone(timezone).map_err(|e| {
        format!("{e}. Please provide a valid timezone like 'India', 'Tokyo', or 'America/New_York'.")
    })?;
    let local = now.with_timezone(&tz);
    Ok(local
        .format("%I:%M %p, %A, %d %B %Y (%Z UTC%:z)")
        .to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 19, 10, 15, 0).unwrap()
    }

    #[test]
    fn test_aliases_and_iana_names() {
        assert_eq!(resolve_timezone("India").unwrap(), chrono_tz::Asia::Kolkata);
        assert_eq!(resolve_timezone(" New York ").unwrap(), chrono_tz::America::New_York);
        assert_eq!(resolve_timezone("Asia/Tokyo").unwrap(), chrono_tz::Asia::Tokyo);
        assert_eq!(resolve_timezone("europe/berlin").unwrap(), chrono_tz::Europe::Berlin);
        assert_eq!(resolve_timezone("").unwrap(), Tz::UTC);
        assert!(resolve_timezone("Mars/Olympus").is_err());
    }

    #[test]
    fn test_describe_time() {
        assert_eq!(
            describe_time(instant(), "india").unwrap(),
            "03:45 PM, Thursday, 19 February 2026 (IST UTC+05:30)"
        );
        assert_eq!(
            describe_time(instant(), "utc").unwrap(),
            "10:15 AM, Thursday, 19 February 2026 (UTC UTC+00:00)"
        );
        let error = describe_time(instant(), "Mars/Olympus").unwrap_err();
        assert!(error.starts_with("Unknown timezone: 'Mars/Olympus'."));
        assert!(error.contains("'India', 'Tokyo'"));
    }
}
