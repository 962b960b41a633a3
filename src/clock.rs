use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use study_harness_core::services::Clock;

/// Wall-clock time and real `tokio` sleeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
