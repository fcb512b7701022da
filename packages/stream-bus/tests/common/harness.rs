//! Test harness with testcontainers for the Redis-backed tests.
//!
//! One Redis container is started on first use and shared by every test.
//! Each test gets its own stream key, so tests never see each other's entries.

use anyhow::{Context, Result};
use std::sync::Arc;
use stream_bus::RedisLogStore;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Shared Redis container that persists across all tests.
struct SharedRedis {
    url: String,
    // Keep the container alive for the entire test run
    _redis: ContainerAsync<Redis>,
}

static SHARED_REDIS: OnceCell<SharedRedis> = OnceCell::const_new();

impl SharedRedis {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=debug cargo test -- --ignored --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let redis = Redis::default()
            .start()
            .await
            .context("Failed to start Redis container")?;

        let host = redis.get_host().await?;
        let port = redis.get_host_port_ipv4(6379).await?;

        Ok(Self {
            url: format!("redis://{}:{}", host, port),
            _redis: redis,
        })
    }

    async fn get() -> &'static Self {
        SHARED_REDIS
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared Redis container")
            })
            .await
    }
}

/// Per-test Redis connection and stream key.
///
/// ```ignore
/// #[test_context(RedisHarness)]
/// #[tokio::test]
/// #[ignore = "needs Docker"]
/// async fn my_test(ctx: &RedisHarness) {
///     let producer = Producer::new(ctx.store.clone());
///     producer.send(&ctx.stream, payload).await.unwrap();
/// }
/// ```
pub struct RedisHarness {
    pub url: String,
    pub store: Arc<RedisLogStore>,
    /// Stream key unique to this test.
    pub stream: String,
}

impl AsyncTestContext for RedisHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create Redis harness")
    }

    async fn teardown(self) {
        // Connection manager is dropped with the harness
    }
}

impl RedisHarness {
    pub async fn new() -> Result<Self> {
        let shared = SharedRedis::get().await;
        Ok(Self {
            url: shared.url.clone(),
            store: Arc::new(Self::connect_to(&shared.url).await?),
            stream: format!("stream-bus:test:{}", Uuid::new_v4()),
        })
    }

    /// Open a second, independent connection (one per consumer loop).
    pub async fn connect(&self) -> Result<Arc<RedisLogStore>> {
        Ok(Arc::new(Self::connect_to(&self.url).await?))
    }

    async fn connect_to(url: &str) -> Result<RedisLogStore> {
        RedisLogStore::connect(url)
            .await
            .context("Failed to connect to Redis container")
    }
}
