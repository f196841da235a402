//! Structural validation and sanitization for publish input. Everything
//! here is pure: no store, no clock, no allocation beyond the rewritten
//! strings.

use relay_common::{EventType, PlaneError, PlaneResult};
use serde_json::Value;

pub const TOPIC_ID_MAX: usize = 200;
pub const EVENT_TYPE_MAX: usize = 100;
pub const DATA_MAX_PROPERTIES: usize = 50;
const CUSTOM_PREFIX: &str = "custom:";

/// Topic ids: `[A-Za-z0-9_.\-:]{1,200}`.
pub fn validate_topic_id(topic_id: &str) -> PlaneResult<()> {
    if topic_id.is_empty() || topic_id.len() > TOPIC_ID_MAX {
        return Err(PlaneError::invalid(
            "topicId",
            format!("length must be 1..={TOPIC_ID_MAX}"),
        ));
    }
    if !topic_id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-' | b':'))
    {
        return Err(PlaneError::invalid(
            "topicId",
            "allowed characters are A-Z a-z 0-9 _ . - :",
        ));
    }
    Ok(())
}

/// Event types: a baseline tag, or `custom:` followed by
/// `[A-Za-z0-9_\-]`, at most 100 bytes in total.
pub fn validate_event_type(tag: &str) -> PlaneResult<EventType> {
    if tag.is_empty() || tag.len() > EVENT_TYPE_MAX {
        return Err(PlaneError::invalid(
            "type",
            format!("length must be 1..={EVENT_TYPE_MAX}"),
        ));
    }
    let event_type = EventType::from(tag.to_string());
    if event_type.is_baseline() {
        return Ok(event_type);
    }
    let Some(rest) = tag.strip_prefix(CUSTOM_PREFIX) else {
        return Err(PlaneError::invalid(
            "type",
            "must be a baseline tag or start with custom:",
        ));
    };
    if rest.is_empty()
        || !rest
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-'))
    {
        return Err(PlaneError::invalid(
            "type",
            "custom tag characters are A-Z a-z 0-9 _ -",
        ));
    }
    Ok(event_type)
}

pub fn validate_priority(priority: Option<i64>) -> PlaneResult<Option<u8>> {
    match priority {
        None => Ok(None),
        Some(value) if (0..=9).contains(&value) => Ok(Some(value as u8)),
        Some(_) => Err(PlaneError::invalid("priority", "must be an integer 0..9")),
    }
}

/// Payload shape check: a JSON object with a bounded property count.
pub fn validate_data_shape(data: &Value) -> PlaneResult<()> {
    let Some(object) = data.as_object() else {
        return Err(PlaneError::invalid("data", "must be a JSON object"));
    };
    if object.len() > DATA_MAX_PROPERTIES {
        return Err(PlaneError::invalid(
            "data",
            format!("at most {DATA_MAX_PROPERTIES} top-level properties"),
        ));
    }
    Ok(())
}

/// Rewrite every string in the payload: control characters out, HTML/script
/// content out, script-capable URL schemes out. Keys are rewritten the same
/// way as values.
pub fn sanitize_value(data: Value) -> Value {
    match data {
        Value::String(s) => Value::String(sanitize_string(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (sanitize_string(&key), sanitize_value(value)))
                .collect(),
        ),
        other => other,
    }
}

const BANNED_SCHEMES: [&str; 3] = ["javascript:", "vbscript:", "data:text/html"];

pub fn sanitize_string(input: &str) -> String {
    let stripped = strip_markup(input);
    let mut out = String::with_capacity(stripped.len());
    for ch in stripped.chars() {
        // Keep ordinary whitespace, drop the rest of C0 and DEL.
        if (ch.is_control() && !matches!(ch, '\t' | '\n' | '\r')) || ch == '\u{7f}' {
            continue;
        }
        out.push(ch);
    }
    // Removing one scheme can splice another into existence, so run to a
    // fixpoint rather than one pass per scheme.
    let mut changed = true;
    while changed {
        changed = false;
        for scheme in BANNED_SCHEMES {
            while let Some(at) = find_ignore_case(&out, scheme) {
                out.replace_range(at..at + scheme.len(), "");
                changed = true;
            }
        }
    }
    out
}

// Remove <script>...</script> blocks wholesale, then any remaining tags.
fn strip_markup(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = find_ignore_case(rest, "<script") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open..];
        match find_ignore_case(after_open, "</script>") {
            Some(close) => rest = &after_open[close + "</script>".len()..],
            None => {
                rest = "";
            }
        }
    }
    out.push_str(rest);
    strip_tags(&out)
}

fn strip_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut depth = 0usize;
    for ch in input.chars() {
        match ch {
            '<' => depth += 1,
            '>' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    out
}

fn find_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    let haystack_bytes = haystack.as_bytes();
    let needle_bytes = needle.as_bytes();
    'outer: for start in 0..=haystack_bytes.len() - needle_bytes.len() {
        for (offset, expected) in needle_bytes.iter().enumerate() {
            if !haystack_bytes[start + offset].eq_ignore_ascii_case(expected) {
                continue 'outer;
            }
        }
        return Some(start);
    }
    None
}
