//! Display-ready source records derived from raw search hits.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::SearchHit;
use crate::text::truncate_chars;

const WORDS_PER_MINUTE: usize = 200;
const SNIPPET_CHARS: usize = 280;
pub const RECENT: &str = "Recent";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Citation number; equals the URL's slot in the run's source index.
    pub id: u32,
    pub title: String,
    pub url: String,
    pub domain: String,
    pub favicon: String,
    pub snippet: String,
    pub read_time: String,
    pub time_ago: String,
    pub author: Option<String>,
}

impl Source {
    pub fn from_hit(id: u32, hit: &SearchHit, now: DateTime<Utc>) -> Self {
        let domain = domain_of(&hit.url);
        let title = if hit.title.trim().is_empty() {
            domain.clone()
        } else {
            hit.title.trim().to_string()
        };
        Self {
            id,
            title,
            favicon: favicon_url(&domain),
            url: hit.url.clone(),
            snippet: truncate_chars(hit.content.trim(), SNIPPET_CHARS).to_string(),
            read_time: read_time(&hit.content),
            time_ago: hit
                .published_date
                .as_deref()
                .map_or_else(|| RECENT.to_string(), |d| time_ago(d, now)),
            author: hit.author.clone(),
            domain,
        }
    }
}

/// Host without a leading `www.`; the raw string when it is not a URL.
pub fn domain_of(raw: &str) -> String {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .map(|h| h.strip_prefix("www.").map(str::to_string).unwrap_or(h))
        .unwrap_or_else(|| raw.to_string())
}

pub fn favicon_url(domain: &str) -> String {
    format!("https://www.google.com/s2/favicons?domain={domain}&sz=64")
}

pub fn read_time(content: &str) -> String {
    let words = content.split_whitespace().count();
    let minutes = words.div_ceil(WORDS_PER_MINUTE).max(1);
    format!("{minutes} min read")
}

/// Human age of a publication date; `"Recent"` whenever the date cannot be
/// read or lies in the future.
pub fn time_ago(published: &str, now: DateTime<Utc>) -> String {
    let Some(date) = parse_date(published.trim()) else {
        return RECENT.to_string();
    };
    let age = now.signed_duration_since(date);
    if age < chrono::Duration::zero() {
        return RECENT.to_string();
    }
    let hours = age.num_hours();
    let days = age.num_days();
    if hours < 1 {
        "Just now".to_string()
    } else if hours < 24 {
        plural(hours, "hour")
    } else if days < 7 {
        plural(days, "day")
    } else if days < 30 {
        plural(days / 7, "week")
    } else if days < 365 {
        plural(days / 30, "month")
    } else {
        plural(days / 365, "year")
    }
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{n} {unit}s ago")
    }
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(d) = DateTime::parse_from_rfc3339(raw) {
        return Some(d.with_timezone(&Utc));
    }
    if let Ok(d) = DateTime::parse_from_rfc2822(raw) {
        return Some(d.with_timezone(&Utc));
    }
    if let Ok(d) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(d.and_utc());
    }
    if let Ok(d) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(d.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}
