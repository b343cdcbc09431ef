use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::headers::{Headers, header_get};

const LONG_WINDOW_SECS: f64 = 24.0 * 60.0 * 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownHint {
    pub recover_at: SystemTime,
    pub reason: &'static str,
}

impl CooldownHint {
    pub fn retry_after(&self, now: SystemTime) -> Option<Duration> {
        self.recover_at
            .duration_since(now)
            .ok()
            .filter(|d| !d.is_zero())
    }
}

/// One named rate-limit block of a quota payload.
#[derive(Debug, Clone, Copy)]
pub struct QuotaSection {
    /// Alternative spellings of the section key (snake and camel case).
    pub keys: &'static [&'static str],
    pub short_reason: &'static str,
    pub long_reason: &'static str,
}

/// Earliest recovery time over every limiting window of every section.
pub fn recover_at(payload: &Value, now: SystemTime, sections: &[QuotaSection]) -> Option<CooldownHint> {
    let mut candidates: Vec<CooldownHint> = Vec::new();
    for section in sections {
        for key in section.keys {
            let Some(block) = payload.get(*key).filter(|v| v.is_object()) else {
                continue;
            };
            collect_section(block, section, now, &mut candidates);
        }
    }
    candidates.into_iter().min_by_key(|hint| hint.recover_at)
}

fn collect_section(
    block: &Value,
    section: &QuotaSection,
    now: SystemTime,
    out: &mut Vec<CooldownHint>,
) {
    let mut parent_limited = flag(block, "limit_reached") || flag(block, "limitReached");
    if let Some(allowed) = block.get("allowed").filter(|v| !v.is_null())
        && !truthy(allowed)
    {
        parent_limited = true;
    }

    let primary = ["primary_window", "primaryWindow"];
    let secondary = ["secondary_window", "secondaryWindow"];
    let mut saw_window = false;

    for key in primary {
        if let Some(window) = window(block, key) {
            saw_window = true;
            let reason = window_reason(window, section);
            push_candidate(window, parent_limited, reason, now, out);
        }
    }
    for key in secondary {
        if let Some(window) = window(block, key) {
            saw_window = true;
            push_candidate(window, parent_limited, section.long_reason, now, out);
        }
    }
    if !saw_window {
        let reason = window_reason(block, section);
        push_candidate(block, parent_limited, reason, now, out);
    }
}

fn window<'a>(block: &'a Value, key: &str) -> Option<&'a Value> {
    block.get(key).filter(|v| !v.is_null())
}

fn window_reason(window: &Value, section: &QuotaSection) -> &'static str {
    if section.short_reason == section.long_reason {
        return section.short_reason;
    }
    let long = [
        "limit_window_seconds",
        "limitWindowSeconds",
        "reset_after_seconds",
        "resetAfterSeconds",
    ]
    .iter()
    .any(|key| number(window, key).is_some_and(|secs| secs >= LONG_WINDOW_SECS));
    if long {
        section.long_reason
    } else {
        section.short_reason
    }
}

fn push_candidate(
    window: &Value,
    parent_limited: bool,
    reason: &'static str,
    now: SystemTime,
    out: &mut Vec<CooldownHint>,
) {
    let limited = parent_limited
        || ["used_percent", "usedPercent"]
            .iter()
            .any(|key| number(window, key).is_some_and(|pct| pct >= 100.0));
    if !limited {
        return;
    }
    let Some(recover_at) = window_recover_at(window, now) else {
        return;
    };
    if recover_at <= now {
        return;
    }
    out.push(CooldownHint { recover_at, reason });
}

fn window_recover_at(window: &Value, now: SystemTime) -> Option<SystemTime> {
    for key in ["reset_at", "resetAt"] {
        if let Some(epoch) = number(window, key).filter(|v| *v > 0.0) {
            return UNIX_EPOCH.checked_add(Duration::from_secs(epoch as u64));
        }
    }
    for key in ["reset_after_seconds", "resetAfterSeconds"] {
        if let Some(secs) = number(window, key).filter(|v| *v > 0.0) {
            return Duration::try_from_secs_f64(secs)
                .ok()
                .and_then(|d| now.checked_add(d));
        }
    }
    None
}

/// Numbers may arrive as JSON numbers or numeric strings.
fn number(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn flag(value: &Value, key: &str) -> bool {
    value.get(key).is_some_and(truthy)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1"),
        _ => false,
    }
}

/// `Retry-After` as integer seconds (> 0) or an HTTP-date in the future.
pub fn retry_after(headers: &Headers, now: SystemTime) -> Option<Duration> {
    let raw = header_get(headers, "retry-after")?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(seconds) = raw.parse::<i64>() {
        return (seconds > 0).then(|| Duration::from_secs(seconds as u64));
    }
    let when = httpdate::parse_http_date(raw).ok()?;
    when.duration_since(now).ok().filter(|d| !d.is_zero())
}

/// Combines a `Retry-After` value with a detector hint.
///
/// Retry-After wins; the hint replaces its timing only when it recovers
/// later. The hint's reason is kept in every case.
pub fn merge_hint(
    retry_after: Option<Duration>,
    hint: Option<CooldownHint>,
    now: SystemTime,
) -> (Option<Duration>, Option<&'static str>) {
    let hinted = hint.and_then(|h| h.retry_after(now));
    let reason = hint.map(|h| h.reason);
    let timing = match (retry_after, hinted) {
        (Some(header), Some(hinted)) if hinted > header => Some(hinted),
        (Some(header), _) => Some(header),
        (None, hinted) => hinted,
    };
    (timing, reason)
}
