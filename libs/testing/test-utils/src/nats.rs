//! NATS test infrastructure
//!
//! Provides a `TestNats` helper that creates a NATS container with JetStream for testing.

use async_nats::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

/// Test NATS wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestNats;
///
/// # async fn example() {
/// let nats = TestNats::new().await;
///
/// // host:port, the form mq name servers are written in
/// let server = nats.name_server();
///
/// // Inspect what the client under test created
/// let jetstream = nats.jetstream();
/// # }
/// ```
pub struct TestNats {
    #[allow(dead_code)]
    container: ContainerAsync<Nats>,
    client: Client,
    host_port: u16,
}

impl TestNats {
    /// Create a new test NATS instance with JetStream enabled
    pub async fn new() -> Self {
        let nats_image = Nats::default().with_tag("latest").with_cmd(["-js"]);

        let container = nats_image
            .start()
            .await
            .expect("Failed to start NATS container");

        let host_port = container
            .get_host_port_ipv4(4222)
            .await
            .expect("Failed to get NATS port");

        let client = async_nats::connect(format!("nats://127.0.0.1:{}", host_port))
            .await
            .expect("Failed to connect to NATS");

        tracing::info!(port = host_port, "Test NATS ready with JetStream");

        Self {
            container,
            client,
            host_port,
        }
    }

    /// Server address without scheme, as used in mq configuration
    pub fn name_server(&self) -> String {
        format!("127.0.0.1:{}", self.host_port)
    }

    /// Get a cloned client
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Get a JetStream context for stream inspection
    pub fn jetstream(&self) -> async_nats::jetstream::Context {
        async_nats::jetstream::new(self.client.clone())
    }

    /// Number of messages stored in `stream`, 0 if it does not exist
    pub async fn stream_messages(&self, stream: &str) -> u64 {
        match self.jetstream().get_stream(stream).await {
            Ok(mut stream) => stream
                .info()
                .await
                .map(|info| info.state.messages)
                .unwrap_or(0),
            Err(_) => 0,
        }
    }
}

impl Drop for TestNats {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test NATS container");
    }
}
