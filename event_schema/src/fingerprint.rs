//! Deterministic grouping fingerprints.
//!
//! The fingerprint decides which issue an event belongs to, so it must be
//! stable across retries and redeliveries: it never reads `timestamp` or
//! `event_id`, and every input is normalized before hashing.

use data_types::{EventType, WideEvent};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// How many leading stack frames participate in a crash/error fingerprint.
const FINGERPRINT_FRAMES: usize = 5;

/// Computes the grouping fingerprint for an event.
pub fn fingerprint(event: &WideEvent) -> String {
    let material = match event.event_type {
        EventType::Crash | EventType::Error => {
            let exception = event.exception_type.as_deref().unwrap_or("unknown");
            let frames = top_frames(event.stack_trace.as_deref());
            format!("err|{}|{}", exception, frames.join("|"))
        }
        EventType::Log => {
            let severity = event
                .severity
                .map(|s| s.as_str())
                .unwrap_or("unclassified");
            let template = message_template(event.message.as_deref().unwrap_or(""));
            format!("log|{severity}|{template}")
        }
        EventType::Metric => {
            format!("metric|{}", event.metric_name.as_deref().unwrap_or("unknown"))
        }
        EventType::Span => format!(
            "span|{}|{}",
            event.operation.as_deref().unwrap_or("unknown"),
            event.span_status.as_deref().unwrap_or("")
        ),
    };

    let digest = Sha256::digest(material.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Extracts and normalizes the leading frames of a JSON-encoded stack trace.
///
/// Accepts an array of frame objects (`module`/`function`/`file` keys) or an
/// array of strings. Location detail (line numbers, addresses, directories)
/// varies between otherwise identical failures and is stripped.
fn top_frames(stack_trace: Option<&str>) -> Vec<String> {
    let Some(raw) = stack_trace else {
        return vec![];
    };
    let Ok(Value::Array(frames)) = serde_json::from_str::<Value>(raw) else {
        return vec![];
    };

    frames
        .iter()
        .take(FINGERPRINT_FRAMES)
        .filter_map(|frame| match frame {
            Value::String(s) => Some(normalize_frame(s)),
            Value::Object(map) => {
                let function = map.get("function").and_then(Value::as_str);
                let module = map.get("module").and_then(Value::as_str);
                match (module, function) {
                    (Some(m), Some(f)) => Some(format!("{m}.{f}")),
                    (None, Some(f)) => Some(f.to_string()),
                    _ => map
                        .get("file")
                        .and_then(Value::as_str)
                        .map(normalize_frame),
                }
            }
            _ => None,
        })
        .filter(|frame| !frame.is_empty())
        .collect()
}

/// Strips location noise from a textual frame: directories, hex addresses and
/// trailing `:line:column` suffixes.
fn normalize_frame(frame: &str) -> String {
    let frame = frame.rsplit('/').next().unwrap_or(frame);
    let mut out = String::with_capacity(frame.len());
    let mut chars = frame.chars().peekable();
    while let Some(c) = chars.next() {
        // drop 0x… address runs
        if c == '0' && chars.peek() == Some(&'x') {
            chars.next();
            while chars.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                chars.next();
            }
            continue;
        }
        // drop :line / :column suffixes
        if c == ':' && chars.peek().is_some_and(char::is_ascii_digit) {
            while chars.peek().is_some_and(char::is_ascii_digit) {
                chars.next();
            }
            continue;
        }
        out.push(c);
    }
    out.trim().to_string()
}

/// Collapses the variable parts of a log message so equivalent messages
/// template identically: every run of decimal digits becomes `#`.
fn message_template(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut in_digits = false;
    for c in message.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push('#');
                in_digits = true;
            }
        } else {
            in_digits = false;
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::Severity;
    use proptest::prelude::*;

    fn base_event(event_type: EventType) -> WideEvent {
        WideEvent {
            event_id: "e1".into(),
            timestamp: 1_700_000_000_000,
            project_id: "p1".into(),
            event_type,
            ..Default::default()
        }
    }

    #[test]
    fn error_fingerprint_ignores_identity_and_time() {
        let mut a = base_event(EventType::Error);
        a.exception_type = Some("NullPointerException".into());
        a.stack_trace = Some(r#"[{"module":"app","function":"main"}]"#.into());

        let mut b = a.clone();
        b.event_id = "e2".into();
        b.timestamp += 86_400_000;

        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn error_fingerprint_distinguishes_exceptions() {
        let mut a = base_event(EventType::Error);
        a.exception_type = Some("NullPointerException".into());
        let mut b = base_event(EventType::Error);
        b.exception_type = Some("IndexOutOfBounds".into());
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn frame_normalization_strips_location_noise() {
        assert_eq!(normalize_frame("/usr/src/app/handler.rs:42:7"), "handler.rs");
        assert_eq!(normalize_frame("run_loop+0xdeadbeef"), "run_loop+");
        assert_eq!(normalize_frame("main"), "main");
    }

    #[test]
    fn log_fingerprint_uses_message_template() {
        let mut a = base_event(EventType::Log);
        a.severity = Some(Severity::Warning);
        a.message = Some("timeout after 250 ms on attempt 3".into());

        let mut b = a.clone();
        b.message = Some("timeout after 5000 ms on attempt 17".into());

        let mut c = a.clone();
        c.message = Some("connection refused".into());

        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn metric_and_span_fingerprints() {
        let mut m = base_event(EventType::Metric);
        m.metric_name = Some("http.request.duration".into());
        let mut m2 = m.clone();
        m2.metric_value = Some(12.0);
        assert_eq!(fingerprint(&m), fingerprint(&m2));

        let mut s = base_event(EventType::Span);
        s.operation = Some("GET /users".into());
        s.span_status = Some("ok".into());
        let mut s2 = s.clone();
        s2.span_status = Some("error".into());
        assert_ne!(fingerprint(&s), fingerprint(&s2));
    }

    proptest! {
        #[test]
        fn fingerprint_is_independent_of_event_identity(
            id_a in "[a-f0-9]{8}",
            id_b in "[a-f0-9]{8}",
            ts_a in 0i64..4_000_000_000_000,
            ts_b in 0i64..4_000_000_000_000,
            message in ".{0,64}",
        ) {
            let mut a = base_event(EventType::Log);
            a.event_id = id_a;
            a.timestamp = ts_a;
            a.message = Some(message.clone());

            let mut b = base_event(EventType::Log);
            b.event_id = id_b;
            b.timestamp = ts_b;
            b.message = Some(message);

            prop_assert_eq!(fingerprint(&a), fingerprint(&b));
        }

        #[test]
        fn fingerprint_shape_is_stable(message in ".{0,64}") {
            let mut event = base_event(EventType::Log);
            event.message = Some(message);
            let fp = fingerprint(&event);
            prop_assert_eq!(fp.len(), 16);
            prop_assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
