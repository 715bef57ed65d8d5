use std::time::Duration;

use async_trait::async_trait;
use color_eyre::Result;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::types::{RetrievalResult, Task};
use crate::worker::Probe;

/// Exercises the task plumbing without any network I/O.
pub struct StubProbe;

#[async_trait]
impl Probe for StubProbe {
    async fn do_work(&self, _: &Task, _: &CancellationToken) -> Result<RetrievalResult> {
        let mut rng = rand::rng();
        Ok(RetrievalResult::success(
            Duration::from_nanos(rng.random_range(1..u32::MAX as u64)),
            rng.random_range(1..u32::MAX as u64),
            Duration::from_nanos(rng.random_range(1..u32::MAX as u64)),
        ))
    }
}
