use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(TraceId, "trace");
branded_id!(SpanId, "span");
branded_id!(SessionKey, "sess");
branded_id!(MessageId, "msg");
branded_id!(RequestId, "req");

/// Wire identity of a clinician terminal: `client_{deptCode}_{userCode}`.
/// The department and clinician components double as the routing key.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TerminalId(String);

impl TerminalId {
    pub fn new(department: &str, clinician: &str) -> Self {
        Self(format!("client_{department}_{clinician}"))
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into the routing key. Returns None when the id does not follow
    /// the `client_{dept}_{user}` format.
    pub fn routing_key(&self) -> Option<RoutingKey> {
        let rest = self.0.strip_prefix("client_")?;
        let (dept, user) = rest.split_once('_')?;
        if dept.is_empty() || user.is_empty() {
            return None;
        }
        Some(RoutingKey {
            department: dept.to_string(),
            clinician: user.to_string(),
        })
    }
}

impl fmt::Display for TerminalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TerminalId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl AsRef<str> for TerminalId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// (department, clinician) pair an inbound event is addressed to.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RoutingKey {
    pub department: String,
    pub clinician: String,
}

impl RoutingKey {
    pub fn new(department: impl Into<String>, clinician: impl Into<String>) -> Self {
        Self {
            department: department.into(),
            clinician: clinician.into(),
        }
    }

    /// The terminal identity this key resolves to.
    pub fn terminal_id(&self) -> TerminalId {
        TerminalId::new(&self.department, &self.clinician)
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.department, self.clinician)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_has_prefix() {
        let id = TraceId::new();
        assert!(id.as_str().starts_with("trace_"), "got: {id}");
    }

    #[test]
    fn span_id_has_prefix() {
        let id = SpanId::new();
        assert!(id.as_str().starts_with("span_"), "got: {id}");
    }

    #[test]
    fn session_key_has_prefix() {
        let key = SessionKey::new();
        assert!(key.as_str().starts_with("sess_"), "got: {key}");
    }

    #[test]
    fn ids_are_unique() {
        let a = TraceId::new();
        let b = TraceId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn serde_roundtrip() {
        let id = SpanId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: SpanId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn terminal_id_wire_format() {
        let id = TerminalId::new("CARD", "D1001");
        assert_eq!(id.as_str(), "client_CARD_D1001");
    }

    #[test]
    fn terminal_id_routing_key_roundtrip() {
        let key = RoutingKey::new("CARD", "D1001");
        let id = key.terminal_id();
        assert_eq!(id.routing_key().unwrap(), key);
    }

    #[test]
    fn terminal_id_malformed_has_no_routing_key() {
        assert!(TerminalId::from_raw("client_CARD").routing_key().is_none());
        assert!(TerminalId::from_raw("not-a-client").routing_key().is_none());
        assert!(TerminalId::from_raw("client__D1001").routing_key().is_none());
    }

    #[test]
    fn routing_key_allows_underscore_in_clinician() {
        // Everything after the second separator belongs to the clinician code.
        let id = TerminalId::from_raw("client_CARD_D_1001");
        let key = id.routing_key().unwrap();
        assert_eq!(key.department, "CARD");
        assert_eq!(key.clinician, "D_1001");
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<TraceId> = (0..100).map(|_| TraceId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0].as_str() < w[1].as_str(), "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
