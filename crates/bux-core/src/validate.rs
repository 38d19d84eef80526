//! JSON-pointer predicate validation
//!
//! Control-message envelopes (handshakes, availability updates) are loosely
//! typed JSON values; before the bus acts on one, it runs the value through a
//! series of pointer/predicate checks. A check fails when its pointer does
//! not resolve or its predicate rejects the resolved value.

use std::sync::LazyLock;

use serde_json::{json, Value};

use crate::{MessageFormat, MIN_COMPATIBLE_VERSION};

/// A single condition on the value a JSON pointer resolves to
#[derive(Debug, Clone)]
pub enum Predicate {
    /// The pointer resolves at all
    Exists,
    IsBool,
    /// Non-empty string or container; null never passes, other scalars do
    NotEmpty,
    /// Equal to the given value
    Compare(Value),
    /// Equal to one of the given values
    Matches(Vec<Value>),
    /// An integer at least the given bound
    GreaterEq(i64),
    /// Negation of the inner predicate
    Inverse(Box<Predicate>),
}

impl Predicate {
    pub fn check(&self, value: &Value) -> bool {
        match self {
            Predicate::Exists => true,
            Predicate::IsBool => value.is_boolean(),
            Predicate::NotEmpty => match value {
                Value::Null => false,
                Value::String(s) => !s.is_empty(),
                Value::Array(a) => !a.is_empty(),
                Value::Object(o) => !o.is_empty(),
                _ => true,
            },
            Predicate::Compare(expected) => value == expected,
            Predicate::Matches(options) => options.iter().any(|option| option == value),
            Predicate::GreaterEq(bound) => value.as_i64().is_some_and(|n| n >= *bound),
            Predicate::Inverse(inner) => !inner.check(value),
        }
    }
}

/// A pointer/predicate pair
#[derive(Debug, Clone)]
pub struct Check {
    pub pointer: &'static str,
    pub predicate: Predicate,
}

/// Run a value through a series of checks; all must pass.
pub fn validate(value: &Value, checks: &[Check]) -> bool {
    checks.iter().all(|check| match value.pointer(check.pointer) {
        Some(resolved) => check.predicate.check(resolved),
        None => false,
    })
}

fn version_check() -> Check {
    Check {
        pointer: "/version",
        predicate: Predicate::GreaterEq(MIN_COMPATIBLE_VERSION as i64),
    }
}

/// Client→server handshake content: identity, encoding, version.
pub static HANDSHAKE_SERVERSIDE: LazyLock<Vec<Check>> = LazyLock::new(|| {
    vec![
        Check {
            pointer: "/teamname",
            predicate: Predicate::NotEmpty,
        },
        Check {
            pointer: "/format",
            predicate: Predicate::Matches(vec![
                json!(MessageFormat::Json as u8),
                json!(MessageFormat::Msgpack as u8),
            ]),
        },
        version_check(),
    ]
});

/// Server→client handshake content: version only.
pub static HANDSHAKE_CLIENTSIDE: LazyLock<Vec<Check>> = LazyLock::new(|| vec![version_check()]);

/// `$$available` content.
pub static AVAILABLE: LazyLock<Vec<Check>> = LazyLock::new(|| {
    vec![
        Check {
            pointer: "/type",
            predicate: Predicate::NotEmpty,
        },
        Check {
            pointer: "/available",
            predicate: Predicate::IsBool,
        },
    ]
});

/// `$$error` content delivered by a server.
pub static SERVER_MESSAGE: LazyLock<Vec<Check>> = LazyLock::new(|| {
    vec![Check {
        pointer: "",
        predicate: Predicate::NotEmpty,
    }]
});
