//! Per-run execution trace.
//!
//! Every behavior run records the store contents it started from and an
//! ordered list of events: snapshot, checks, the implementation call and
//! its outcome, the records it changed, restores. Timestamps come from the
//! engine clock so traces are reproducible under a fixed clock.

use chrono::{DateTime, Utc};
use isl_eval::{EntityQuery, RecordChange, StateHandle, Value};
use serde::Serialize;
use smol_str::SmolStr;

use crate::engine::Clock;
use crate::CheckCategory;

/// Keys whose values never appear in a redacted trace. Matched as
/// lowercase substrings.
const SECRET_KEYS: &[&str] = &[
    "password",
    "secret",
    "api_key",
    "apikey",
    "access_token",
    "accesstoken",
    "refresh_token",
    "refreshtoken",
    "private_key",
    "privatekey",
    "credit_card",
    "creditcard",
    "ssn",
    "social_security",
];

const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEventKind {
    Snapshot {
        version: u64,
    },
    Check {
        category: CheckCategory,
        expression: String,
        passed: bool,
    },
    Call {
        behavior: SmolStr,
        input: Value,
    },
    Return {
        result: Value,
        duration_ms: u64,
    },
    Failure {
        code: SmolStr,
        message: String,
    },
    /// A record written by the implementation; `before` is null for a
    /// created record and `after` is null for a deleted one
    StateChange {
        entity: SmolStr,
        id: Value,
        before: Value,
        after: Value,
        source: SmolStr,
    },
    Timeout {
        after_ms: u64,
    },
    Restore {
        version: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEvent {
    /// `evt_1`, `evt_2`, ... in emission order
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TraceEventKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TraceMetadata {
    /// The run ended with the `pass` verdict
    pub passed: bool,

    /// Index of the first failed check or timeout event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_index: Option<usize>,

    pub duration_ms: u64,
}

/// The recorded trace of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Trace {
    /// Store contents at snapshot time, entity name to records
    pub initial_state: Value,
    pub events: Vec<TraceEvent>,
    pub metadata: TraceMetadata,
}

/// Collects the events of one run.
pub struct TraceRecorder {
    initial_state: Value,
    events: Vec<TraceEvent>,
    clock: Clock,
    redact: bool,
}

impl TraceRecorder {
    pub fn new(clock: Clock, redact: bool) -> Self {
        Self {
            initial_state: Value::Null,
            events: Vec::new(),
            clock,
            redact,
        }
    }

    /// Record the snapshot event and keep the captured contents as the
    /// trace's initial state.
    pub fn snapshot(&mut self, state: &StateHandle) {
        let tables = state
            .entities()
            .map(|entity| {
                let records = state
                    .records(entity)
                    .unwrap_or_default()
                    .into_iter()
                    .map(Value::Map)
                    .collect::<Vec<_>>();
                (entity, Value::List(records))
            })
            .collect::<Vec<_>>();
        self.initial_state = self.scrub(&Value::map(tables));
        self.push(TraceEventKind::Snapshot {
            version: state.version(),
        });
    }

    pub fn check(&mut self, category: CheckCategory, expression: &str, passed: bool) {
        self.push(TraceEventKind::Check {
            category,
            expression: expression.to_string(),
            passed,
        });
    }

    pub fn call(&mut self, behavior: &str, input: &Value) {
        let input = self.scrub(input);
        self.push(TraceEventKind::Call {
            behavior: behavior.into(),
            input,
        });
    }

    pub fn returned(&mut self, result: &Value, duration_ms: u64) {
        let result = self.scrub(result);
        self.push(TraceEventKind::Return {
            result,
            duration_ms,
        });
    }

    pub fn failure(&mut self, code: &str, message: &str) {
        self.push(TraceEventKind::Failure {
            code: code.into(),
            message: message.to_string(),
        });
    }

    pub fn state_change(&mut self, source: &str, change: &RecordChange) {
        let record = |r: &Option<isl_eval::Record>| {
            r.as_ref()
                .map(|fields| self.scrub(&Value::Map(fields.clone())))
                .unwrap_or_default()
        };
        let kind = TraceEventKind::StateChange {
            entity: change.entity.clone(),
            id: change.id.clone(),
            before: record(&change.before),
            after: record(&change.after),
            source: source.into(),
        };
        self.push(kind);
    }

    pub fn timeout(&mut self, after_ms: u64) {
        self.push(TraceEventKind::Timeout { after_ms });
    }

    pub fn restore(&mut self, version: u64) {
        self.push(TraceEventKind::Restore { version });
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn finish(self, passed: bool, duration_ms: u64) -> Trace {
        let failure_index = self.events.iter().position(|e| {
            matches!(
                e.kind,
                TraceEventKind::Check { passed: false, .. } | TraceEventKind::Timeout { .. }
            )
        });
        Trace {
            initial_state: self.initial_state,
            events: self.events,
            metadata: TraceMetadata {
                passed,
                failure_index,
                duration_ms,
            },
        }
    }

    fn push(&mut self, kind: TraceEventKind) {
        self.events.push(TraceEvent {
            id: format!("evt_{}", self.events.len() + 1),
            timestamp: (self.clock)(),
            kind,
        });
    }

    fn scrub(&self, value: &Value) -> Value {
        if self.redact {
            redact(value)
        } else {
            value.clone()
        }
    }
}

/// Mask secrets, phone numbers, email addresses and IPv4 addresses inside
/// `value`. Phone numbers are recognized by key.
pub(crate) fn redact(value: &Value) -> Value {
    match value {
        Value::Map(fields) => Value::Map(
            fields
                .iter()
                .map(|(key, field)| {
                    let lower = key.to_lowercase();
                    let masked = if SECRET_KEYS.iter().any(|s| lower.contains(s)) {
                        Value::from(REDACTED)
                    } else if lower.contains("phone") {
                        match field {
                            Value::String(s) => Value::from(mask_phone(s).as_str()),
                            Value::Int(n) => Value::from(mask_phone(&n.to_string()).as_str()),
                            other => redact(other),
                        }
                    } else {
                        redact(field)
                    };
                    (key.clone(), masked)
                })
                .collect(),
        ),
        Value::List(items) => Value::List(items.iter().map(redact).collect()),
        Value::String(s) if looks_like_email(s) => Value::from(mask_email(s).as_str()),
        Value::String(s) if looks_like_ipv4(s) => Value::from(mask_ipv4(s).as_str()),
        other => other.clone(),
    }
}

fn looks_like_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !s.contains(char::is_whitespace)
        }
        None => false,
    }
}

fn mask_email(email: &str) -> String {
    let (local, domain) = email.split_once('@').unwrap_or((email, ""));
    let mut chars = local.chars();
    let masked = match chars.next() {
        Some(first) if local.chars().count() > 1 => {
            let stars = (local.chars().count() - 1).min(3);
            format!("{}{}", first, "*".repeat(stars))
        }
        _ => "*".to_string(),
    };
    format!("{}@{}", masked, domain)
}

/// Keep the last four characters.
fn mask_phone(phone: &str) -> String {
    let len = phone.chars().count();
    if len > 4 {
        let tail: String = phone.chars().skip(len - 4).collect();
        format!("{}{}", "*".repeat(len - 4), tail)
    } else {
        "****".to_string()
    }
}

fn looks_like_ipv4(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.len() <= 3 && p.bytes().all(|b| b.is_ascii_digit()))
}

fn mask_ipv4(ip: &str) -> String {
    let mut parts = ip.split('.');
    match (parts.next(), parts.next()) {
        (Some(a), Some(b)) => format!("{}.{}.xxx.xxx", a, b),
        _ => "xxx.xxx.xxx.xxx".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use isl_eval::{EntityStore, InMemoryStore, Record};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn fixed_clock() -> Clock {
        let instant = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        Arc::new(move || instant)
    }

    fn seeded_state() -> InMemoryStore {
        let mut store = InMemoryStore::new();
        let mut user = Record::new();
        user.insert("email".into(), "alice@example.com".into());
        user.insert("password_hash".into(), "h$1".into());
        user.insert("phone".into(), "+1 555 0100".into());
        store.create("User", user).unwrap();
        store
    }

    #[test]
    fn test_event_ids_and_timestamps() {
        let state = InMemoryStore::new().snapshot().unwrap();
        let mut recorder = TraceRecorder::new(fixed_clock(), true);
        recorder.snapshot(&state);
        recorder.check(CheckCategory::Precondition, "(input.x != null)", true);
        recorder.restore(state.version());

        let trace = recorder.finish(true, 0);
        let ids: Vec<_> = trace.events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["evt_1", "evt_2", "evt_3"]);
        assert!(trace
            .events
            .iter()
            .all(|e| e.timestamp == trace.events[0].timestamp));
    }

    #[test]
    fn test_initial_state_is_captured_redacted() {
        let state = seeded_state().snapshot().unwrap();
        let mut recorder = TraceRecorder::new(fixed_clock(), true);
        recorder.snapshot(&state);
        let trace = recorder.finish(true, 1);

        let Some(Value::List(users)) = trace.initial_state.get("User") else {
            panic!("expected user table");
        };
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].get("email"), Some(&Value::from("a***@example.com")));
        assert_eq!(users[0].get("password_hash"), Some(&Value::from("[REDACTED]")));
        assert_eq!(users[0].get("phone"), Some(&Value::from("*******0100")));
    }

    #[test]
    fn test_state_change_event() {
        let mut store = seeded_state();
        let before = store.snapshot().unwrap();
        let mut session = Record::new();
        session.insert("user_email".into(), "alice@example.com".into());
        store.create("Session", session).unwrap();

        let mut recorder = TraceRecorder::new(fixed_clock(), true);
        for change in before.diff(&store.snapshot().unwrap()) {
            recorder.state_change("Login", &change);
        }

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        let TraceEventKind::StateChange {
            entity,
            before,
            after,
            source,
            ..
        } = &events[0].kind
        else {
            panic!("expected state change event");
        };
        assert_eq!(entity, "Session");
        assert_eq!(source, "Login");
        assert_eq!(before, &Value::Null);
        assert_eq!(after.get("user_email"), Some(&Value::from("a***@example.com")));

        let json = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(json["kind"], "state_change");
    }

    #[test]
    fn test_metadata_points_at_first_failure() {
        let mut recorder = TraceRecorder::new(fixed_clock(), true);
        recorder.check(CheckCategory::Precondition, "true", true);
        recorder.check(CheckCategory::Postcondition, "(1 == result.n)", false);
        recorder.check(CheckCategory::Invariant, "false", false);
        let trace = recorder.finish(false, 12);

        assert_eq!(
            trace.metadata,
            TraceMetadata {
                passed: false,
                failure_index: Some(1),
                duration_ms: 12,
            }
        );

        let clean = TraceRecorder::new(fixed_clock(), true).finish(true, 0);
        assert_eq!(clean.metadata.failure_index, None);
        let json = serde_json::to_value(&clean.metadata).unwrap();
        assert!(json.get("failure_index").is_none());
    }

    #[test]
    fn test_call_input_is_redacted() {
        let mut recorder = TraceRecorder::new(fixed_clock(), true);
        let input = Value::map([
            ("email", Value::from("alice@example.com")),
            ("password", Value::from("hunter2")),
            ("client_ip", Value::from("192.168.10.44")),
            ("attempts", Value::Int(2)),
        ]);
        recorder.call("Login", &input);

        let TraceEventKind::Call { input, .. } = &recorder.events()[0].kind else {
            panic!("expected call event");
        };
        assert_eq!(input.get("email"), Some(&Value::from("a***@example.com")));
        assert_eq!(input.get("password"), Some(&Value::from("[REDACTED]")));
        assert_eq!(input.get("client_ip"), Some(&Value::from("192.168.xxx.xxx")));
        assert_eq!(input.get("attempts"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_redaction_can_be_disabled() {
        let mut recorder = TraceRecorder::new(fixed_clock(), false);
        let result = Value::map([("api_key", Value::from("k-123"))]);
        recorder.returned(&result, 4);

        let TraceEventKind::Return { result: traced, .. } = &recorder.events()[0].kind else {
            panic!("expected return event");
        };
        assert_eq!(traced, &result);
    }

    #[test]
    fn test_phone_masking() {
        assert_eq!(mask_phone("5550100"), "***0100");
        assert_eq!(mask_phone("0100"), "****");

        let masked = redact(&Value::map([
            ("mobilePhone", Value::Int(5550100)),
            ("phone_verified", Value::Bool(true)),
        ]));
        assert_eq!(masked.get("mobilePhone"), Some(&Value::from("***0100")));
        assert_eq!(masked.get("phone_verified"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_email_masking_edges() {
        assert_eq!(mask_email("a@x.io"), "*@x.io");
        assert_eq!(mask_email("bo@x.io"), "b*@x.io");
        assert!(!looks_like_email("not an @email.com"));
        assert!(!looks_like_ipv4("1.2.3"));
        assert!(!looks_like_ipv4("v1.2.3.4"));
    }

    #[test]
    fn test_serialized_shape() {
        let mut recorder = TraceRecorder::new(fixed_clock(), true);
        recorder.failure("INVALID_CREDENTIALS", "wrong password");
        let json = serde_json::to_value(&recorder.events()[0]).unwrap();

        assert_eq!(json["kind"], "failure");
        assert_eq!(json["id"], "evt_1");
        assert_eq!(json["code"], "INVALID_CREDENTIALS");
    }
}
