use crate::bus::{LogType, WorkItem};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// One structured record produced from a source line. `None` from a parser
/// means the line carries nothing worth shipping.
pub type ParsedEntry = Map<String, Value>;

const DATETIME_PREFIX_LEN: usize = 19;

fn datetime_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}").unwrap())
}

pub fn parser_for(log_type: LogType) -> fn(&str) -> Option<ParsedEntry> {
    match log_type {
        LogType::Error => parse_error_line,
        LogType::Slowquery => parse_slowquery_line,
        LogType::Other => parse_generic_line,
    }
}

/// Error log: `YYYY-MM-DD HH:MM:SS <thread> [Level] message`.
pub fn parse_error_line(line: &str) -> Option<ParsedEntry> {
    if line.trim().is_empty() {
        return None;
    }

    let mut entry = ParsedEntry::new();
    if line.len() > DATETIME_PREFIX_LEN && datetime_prefix().is_match(line) {
        let timestamp = &line[..DATETIME_PREFIX_LEN];
        let remainder = &line[DATETIME_PREFIX_LEN..];

        let (level, message) = if let Some(idx) = remainder.find("[ERROR]") {
            ("ERROR", remainder[idx + "[ERROR]".len()..].trim())
        } else if let Some(idx) = remainder.find("[Warning]") {
            ("WARNING", remainder[idx + "[Warning]".len()..].trim())
        } else if let Some(idx) = remainder.find("[Note]") {
            ("INFO", remainder[idx + "[Note]".len()..].trim())
        } else {
            ("INFO", remainder)
        };

        entry.insert("timestamp".into(), Value::from(timestamp));
        entry.insert("level".into(), Value::from(level));
        entry.insert("message".into(), Value::from(message));
        entry.insert("raw_line".into(), Value::from(line));
        return Some(entry);
    }

    entry.insert("message".into(), Value::from(line));
    entry.insert("raw_line".into(), Value::from(line));
    Some(entry)
}

/// Slow-query log: comment headers followed by the SQL statement itself.
pub fn parse_slowquery_line(line: &str) -> Option<ParsedEntry> {
    if line.trim().is_empty() {
        return None;
    }

    if let Some(rest) = line.strip_prefix("# Time:") {
        let mut entry = ParsedEntry::new();
        entry.insert("timestamp".into(), Value::from(rest.trim()));
        entry.insert("event_type".into(), Value::from("query_start"));
        return Some(entry);
    }

    if let Some(rest) = line.strip_prefix("SET timestamp=") {
        let value = rest.trim().trim_end_matches(';');
        if let Ok(unix) = value.parse::<i64>() {
            if let Some(ts) = Utc.timestamp_opt(unix, 0).single() {
                let mut entry = ParsedEntry::new();
                entry.insert(
                    "timestamp".into(),
                    Value::from(ts.format("%Y-%m-%d %H:%M:%S").to_string()),
                );
                entry.insert("event_type".into(), Value::from("query_timestamp"));
                return Some(entry);
            }
        }
    }

    if let Some(rest) = line.strip_prefix("# User@Host:") {
        let user_host = rest.trim();
        let mut entry = ParsedEntry::new();
        entry.insert("user_host".into(), Value::from(user_host));
        if let Some(open) = user_host.find('[') {
            let user = user_host[..open].trim();
            let host = user_host[open + 1..]
                .split(']')
                .next()
                .unwrap_or_default();
            entry.insert("user".into(), Value::from(user));
            entry.insert("host".into(), Value::from(host));
        }
        entry.insert("event_type".into(), Value::from("query_metadata"));
        return Some(entry);
    }

    if line.starts_with("# Query_time:") {
        let mut entry = ParsedEntry::new();
        entry.insert("event_type".into(), Value::from("query_stats"));

        let parts: Vec<&str> = line.split_whitespace().collect();
        for pair in parts.windows(2) {
            let Some(key) = pair[0].strip_suffix(':') else {
                continue;
            };
            let key = key.trim_start_matches('#').trim().to_lowercase();
            if key.is_empty() {
                continue;
            }
            let value = pair[1];
            let value = match value.parse::<f64>() {
                Ok(number) => Value::from(number),
                Err(_) => Value::from(value),
            };
            entry.insert(key, value);
        }
        return Some(entry);
    }

    if !line.starts_with('#') {
        let mut entry = ParsedEntry::new();
        entry.insert("sql_statement".into(), Value::from(line));
        entry.insert("event_type".into(), Value::from("query_sql"));
        return Some(entry);
    }

    None
}

/// Fallback for anything else: peel a leading timestamp when one exists.
pub fn parse_generic_line(line: &str) -> Option<ParsedEntry> {
    if line.trim().is_empty() {
        return None;
    }

    let mut entry = ParsedEntry::new();
    entry.insert("raw_line".into(), Value::from(line));

    if line.len() > DATETIME_PREFIX_LEN && datetime_prefix().is_match(line) {
        entry.insert(
            "timestamp".into(),
            Value::from(&line[..DATETIME_PREFIX_LEN]),
        );
        entry.insert(
            "message".into(),
            Value::from(line[DATETIME_PREFIX_LEN..].trim()),
        );
        return Some(entry);
    }

    // Bracketed unix timestamp, e.g. `[1722556800] message`.
    if let Some(rest) = line.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            if end < DATETIME_PREFIX_LEN {
                if let Ok(unix) = rest[..end].parse::<i64>() {
                    if unix > 1_000_000_000 {
                        if let Some(ts) = Utc.timestamp_opt(unix, 0).single() {
                            entry.insert(
                                "timestamp".into(),
                                Value::from(ts.format("%Y-%m-%d %H:%M:%S").to_string()),
                            );
                            entry.insert(
                                "message".into(),
                                Value::from(rest[end + 1..].trim()),
                            );
                            return Some(entry);
                        }
                    }
                }
            }
        }
    }

    entry.insert("message".into(), Value::from(line));
    Some(entry)
}

/// Minimal record for passthrough mode: the raw line plus its position.
pub fn passthrough_entry(line: &str, line_number: u64) -> Option<ParsedEntry> {
    let mut entry = ParsedEntry::new();
    entry.insert("message".into(), Value::from(line));
    entry.insert("line_number".into(), Value::from(line_number));
    Some(entry)
}

/// Stamp an entry with its work-item metadata and the dual timestamp. The
/// entry's own parsed timestamp wins when it is parseable; otherwise the
/// supplied wall clock is used.
pub fn enrich(mut entry: ParsedEntry, item: &WorkItem, now: DateTime<Utc>) -> ParsedEntry {
    entry.insert("log_type".into(), Value::from(item.log_type.as_str()));
    entry.insert("instance_id".into(), Value::from(item.instance_id.as_str()));
    entry.insert("cluster_id".into(), Value::from(item.cluster_id.as_str()));
    entry.insert(
        "log_file_name".into(),
        Value::from(item.log_file_name.as_str()),
    );

    let ts = entry
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|raw| parse_log_timestamp(raw, item.log_type))
        .unwrap_or(now);
    entry.insert("_timestamp".into(), Value::from(ts.timestamp_millis()));
    entry.insert(
        "@timestamp".into(),
        Value::from(ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    entry
}

/// Parse the timestamp string carried by an entry, trying the layouts seen
/// for that log kind.
pub fn parse_log_timestamp(raw: &str, log_type: LogType) -> Option<DateTime<Utc>> {
    let naive_layouts: &[&str] = match log_type {
        LogType::Error => &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%dT%H:%M:%S%.3fZ"],
        LogType::Slowquery => &[
            "%Y-%m-%dT%H:%M:%S%.6fZ",
            "%Y-%m-%d %H:%M:%S",
            "%y%m%d %H:%M:%S",
        ],
        LogType::Other => &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%SZ"],
    };

    for layout in naive_layouts {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
