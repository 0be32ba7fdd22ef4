use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A cluster member as advertised in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub address: String,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl NodeInfo {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            node_id: node_id.into(),
            address: address.into(),
            started_at: now,
            heartbeat_at: now,
        }
    }

    pub fn base_url(&self) -> String {
        if self.address.starts_with("http://") || self.address.starts_with("https://") {
            self.address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", self.address.trim_end_matches('/'))
        }
    }

    pub fn touch(&mut self) {
        self.heartbeat_at = Utc::now();
    }

    /// True when the last heartbeat is older than `stale_after`.
    pub fn is_stale(&self, stale_after: Duration, now: DateTime<Utc>) -> bool {
        now - self.heartbeat_at > stale_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_and_staleness() {
        let mut node = NodeInfo::new("a", "127.0.0.1:8484");
        assert_eq!(node.base_url(), "http://127.0.0.1:8484");
        assert_eq!(
            NodeInfo::new("b", "http://peer:1/").base_url(),
            "http://peer:1"
        );

        node.heartbeat_at = Utc::now() - Duration::seconds(120);
        assert!(node.is_stale(Duration::seconds(60), Utc::now()));
        node.touch();
        assert!(!node.is_stale(Duration::seconds(60), Utc::now()));
    }
}
