use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::MediaEngine;
use crate::errors::Result;
use crate::session::CaptureSession;
use crate::utils::redact_url;

/// Grab a frame immediately, then once per `period`, until the session's
/// cancellation token fires. An in-flight grab is allowed to finish.
pub async fn run(session: Arc<CaptureSession>, engine: Arc<dyn MediaEngine>, period: Duration) {
    let cancel = session.cancellation();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Starting capture from {} with {} second interval",
        redact_url(&session.config.url),
        period.as_secs()
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            // The first tick completes immediately.
            _ = ticker.tick() => {
                if let Err(e) = capture_frame(&session, engine.as_ref()).await {
                    warn!("{}", e);
                }
            }
        }
    }

    info!("Capture stopped after {} frames", session.frame_count().await);
}

/// One tick. A failed grab leaves the counter alone, so the next tick
/// retries the same sequence number.
pub async fn capture_frame(session: &CaptureSession, engine: &dyn MediaEngine) -> Result<Option<u64>> {
    let sequence = session.frame_count().await;
    if session.cancellation().is_cancelled() {
        debug!("Skipping frame {}: capture cancelled", sequence);
        return Ok(None);
    }

    let path = session.frame_path(sequence);
    engine
        .grab_one_frame(&session.config.url, &path, session.config.quality)
        .await?;

    session.record_frame().await;
    debug!("Captured frame {} -> {}", sequence, path.display());
    Ok(Some(sequence))
}
