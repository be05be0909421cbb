//! Maps provider-specific article JSON onto `CanonicalArticle`.
//!
//! Normalization never fails: every field has a fallback chain and any shape
//! mismatch (wrong JSON type, unparseable date) just moves on to the next link.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use cyberfeed_core::{stable_article_key, CanonicalArticle, MISSING_URL, NO_DESCRIPTION, NO_TITLE};
use serde_json::Value as JsonValue;

const TITLE_KEYS: &[&str] = &["title"];
const SUMMARY_KEYS: &[&str] = &["description", "content", "snippet"];
const URL_KEYS: &[&str] = &["url", "link"];
const PUBLISHED_KEYS: &[&str] = &["publishedAt", "pubDate", "datePublished"];

const MINUTES_IN_DAY: i64 = 1_440;
const MINUTES_IN_ALMOST_TWO_DAYS: i64 = 2_520;
const MINUTES_IN_MONTH: i64 = 43_200;
const MINUTES_IN_TWO_MONTHS: i64 = 86_400;

pub fn normalize_articles(
    raw: &[JsonValue],
    source_label: &str,
    fetched_at: DateTime<Utc>,
) -> Vec<CanonicalArticle> {
    raw.iter()
        .enumerate()
        .map(|(index, article)| normalize_article(article, source_label, index, fetched_at))
        .collect()
}

pub fn normalize_article(
    raw: &JsonValue,
    source_label: &str,
    index: usize,
    fetched_at: DateTime<Utc>,
) -> CanonicalArticle {
    let url = first_text(raw, URL_KEYS).unwrap_or_else(|| MISSING_URL.to_string());
    let published_at = resolve_published_at(raw).unwrap_or(fetched_at);

    CanonicalArticle {
        id: format!("{source_label}-{index}-{}", fetched_at.timestamp_millis()),
        title: first_text(raw, TITLE_KEYS).unwrap_or_else(|| NO_TITLE.to_string()),
        summary: first_text(raw, SUMMARY_KEYS).unwrap_or_else(|| NO_DESCRIPTION.to_string()),
        source: resolve_source(raw, source_label),
        timestamp: humanize_since(published_at, fetched_at),
        liked: false,
        bookmarked: false,
        image_url: resolve_image(raw),
        stable_key: stable_article_key(source_label, &url),
        url,
    }
}

fn text_or_none(value: &JsonValue) -> Option<String> {
    let trimmed = value.as_str()?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn first_text(raw: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| raw.get(key).and_then(text_or_none))
}

fn resolve_source(raw: &JsonValue, source_label: &str) -> String {
    raw.get("source")
        .and_then(|source| {
            source
                .get("name")
                .and_then(text_or_none)
                .or_else(|| text_or_none(source))
        })
        .or_else(|| raw.get("provider")?.get("name").and_then(text_or_none))
        .unwrap_or_else(|| source_label.to_string())
}

fn resolve_image(raw: &JsonValue) -> Option<String> {
    if let Some(url) = raw.get("urlToImage").and_then(text_or_none) {
        return Some(url);
    }
    let image = raw.get("image")?;
    text_or_none(image)
        .or_else(|| image.get("url").and_then(text_or_none))
        .or_else(|| image.get("thumbnail").and_then(text_or_none))
}

fn resolve_published_at(raw: &JsonValue) -> Option<DateTime<Utc>> {
    PUBLISHED_KEYS.iter().find_map(|key| match raw.get(key)? {
        JsonValue::String(s) => parse_timestamp(s),
        JsonValue::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    })
}

/// Accepts RFC 3339, RFC 2822 and the zone-less forms some providers emit (read as UTC).
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(input) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// "5 minutes ago", "about 2 hours ago", "in 3 days".
pub fn humanize_since(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let (earlier, later, in_future) = if then > now {
        (now, then, true)
    } else {
        (then, now, false)
    };
    let distance = distance_in_words(earlier, later);
    if in_future {
        format!("in {distance}")
    } else {
        format!("{distance} ago")
    }
}

fn plural(count: i64, one: &str, many: &str) -> String {
    if count == 1 {
        one.to_string()
    } else {
        format!("{count} {many}")
    }
}

fn distance_in_words(earlier: DateTime<Utc>, later: DateTime<Utc>) -> String {
    let seconds = (later - earlier).num_seconds();
    let minutes = (seconds + 30) / 60;

    if minutes == 0 {
        return "less than a minute".to_string();
    }
    if minutes < 45 {
        return plural(minutes, "1 minute", "minutes");
    }
    if minutes < 90 {
        return "about 1 hour".to_string();
    }
    if minutes < MINUTES_IN_DAY {
        let hours = (minutes + 30) / 60;
        return format!("about {}", plural(hours, "1 hour", "hours"));
    }
    if minutes < MINUTES_IN_ALMOST_TWO_DAYS {
        return "1 day".to_string();
    }
    if minutes < MINUTES_IN_MONTH {
        let days = (minutes + MINUTES_IN_DAY / 2) / MINUTES_IN_DAY;
        return plural(days, "1 day", "days");
    }
    if minutes < MINUTES_IN_TWO_MONTHS {
        let months = (minutes + MINUTES_IN_MONTH / 2) / MINUTES_IN_MONTH;
        return format!("about {}", plural(months, "1 month", "months"));
    }

    let months = calendar_months_between(earlier, later);
    if months < 12 {
        let nearest = (minutes + MINUTES_IN_MONTH / 2) / MINUTES_IN_MONTH;
        return plural(nearest, "1 month", "months");
    }

    let years = months / 12;
    match months % 12 {
        0..=2 => format!("about {}", plural(years, "1 year", "years")),
        3..=8 => format!("over {}", plural(years, "1 year", "years")),
        _ => format!("almost {}", plural(years + 1, "1 year", "years")),
    }
}

/// Whole calendar months from `earlier` to `later`.
fn calendar_months_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    let mut months = i64::from(later.year() - earlier.year()) * 12
        + i64::from(later.month()) - i64::from(earlier.month());
    let later_in_month = (later.day(), later.num_seconds_from_midnight());
    let earlier_in_month = (earlier.day(), earlier.num_seconds_from_midnight());
    if months > 0 && later_in_month < earlier_in_month {
        months -= 1;
    }
    months
}
