#![allow(dead_code)]

use std::{future::Future, time::Duration};
use vaani_core::transport::{MediaEvent, PeerEnd};

pub const WAIT: Duration = Duration::from_secs(5);

/// Reads events until one matches, failing the test after [`WAIT`].
pub async fn expect_event<F>(peer: &mut PeerEnd, mut matches: F) -> MediaEvent
where
    F: FnMut(&MediaEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match peer.next_event().await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("transport closed before the expected event"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Polls `check` until it holds, failing the test after [`WAIT`].
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}
