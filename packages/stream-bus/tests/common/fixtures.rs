//! Handlers and payloads shared by the integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use stream_bus::{async_trait, Envelope, EnvelopeHandler, Payload};

/// Handler that records every envelope it sees and can fail the first calls.
#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<Envelope>>,
    fail_first: AtomicUsize,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the first `times` calls, then succeed.
    pub fn failing(times: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail_first: AtomicUsize::new(times),
        })
    }

    pub fn calls(&self) -> Vec<Envelope> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl EnvelopeHandler for Recorder {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(envelope.clone());
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("simulated handler failure");
        }
        Ok(())
    }
}

/// `{"type": "image.process", "id": <id>}`
pub fn image_job(id: i64) -> Payload {
    let mut payload = Payload::new();
    payload.insert("type".into(), json!("image.process"));
    payload.insert("id".into(), json!(id));
    payload
}

/// Poll `condition` until it holds, failing the test after ten minutes of
/// (possibly paused) tokio time.
pub async fn wait_for(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(600), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
