//! Consumer identity assigned to each consumer-group member.

use std::fmt;

use uuid::Uuid;

/// Identity of one consumer within a consumer group:
/// `<handler_name>-<host>-<pid>-<random>`.
///
/// Stable for the life of the process so the broker can attribute pending
/// messages to a specific consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerIdentity(String);

impl ConsumerIdentity {
    pub fn new(handler_name: &str) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
        let nonce = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{handler_name}-{host}-{}-{}",
            std::process::id(),
            &nonce[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_shape_and_uniqueness() {
        let a = ConsumerIdentity::new("InventoryHandler");
        let b = ConsumerIdentity::new("InventoryHandler");

        assert!(a.as_str().starts_with("InventoryHandler-"));
        assert!(a.as_str().contains(&std::process::id().to_string()));
        assert_ne!(a, b);
    }
}
