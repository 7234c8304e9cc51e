//! Shared test utilities for the mq crates
//!
//! - `TestNats`: NATS container with JetStream and automatic cleanup (feature: "nats")
//! - `TestDataBuilder`: Deterministic topic, group and key names (always available)
//! - `assertions`: Custom assertion helpers (always available)
//!
//! # Usage
//!
//! Add `features = ["nats"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["nats"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestNats};
//!
//! #[tokio::test]
//! #[ignore = "requires docker"]
//! async fn my_broker_test() {
//!     let nats = TestNats::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_broker_test");
//!
//!     let topic = builder.topic("orders");
//!     let group = builder.group("billing");
//!     let servers = vec![nats.name_server()];
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "nats")]
pub use nats::TestNats;

/// Builder for test data with deterministic randomization
///
/// Names only use `[a-zA-Z0-9_-]`, so they are valid topics and groups.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_send_sync");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Topic name unique to this builder
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let topic = TestDataBuilder::new(7).topic("orders");
    /// assert_eq!(topic, "test-orders-7");
    /// ```
    pub fn topic(&self, name: &str) -> String {
        format!("test-{}-{}", name, self.seed)
    }

    /// Consumer or producer group name unique to this builder
    pub fn group(&self, name: &str) -> String {
        format!("test_{}_{}", name, self.seed)
    }

    /// Deterministic message key
    pub fn key(&self, index: usize) -> String {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&(index as u64).to_le_bytes());
        Uuid::from_bytes(uuid_bytes).simple().to_string()
    }
}

/// Test assertion helpers
pub mod assertions {
    use std::future::Future;
    use std::time::Duration;

    /// Poll `condition` until it holds or `timeout` elapses
    pub async fn assert_eventually<F, Fut>(timeout: Duration, context: &str, mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition().await {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("{}: condition not met within {:?}", context, timeout);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }
}
