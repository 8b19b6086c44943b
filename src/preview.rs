use std::io;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PreviewConfig;
use crate::demux::{multipart_chunk, MjpegDemuxer};
use crate::engine::{LiveStream, MediaEngine};
use crate::errors::Result;
use crate::utils::redact_url;

// Frames queued per client before the pump waits on the socket.
const CHANNEL_CAPACITY: usize = 4;

/// Start a live MJPEG transcode of `source_url` and return its multipart
/// body chunks. Dropping the stream stops the transcode.
pub async fn open_preview(
    engine: &dyn MediaEngine,
    source_url: &str,
    settings: &PreviewConfig,
) -> Result<ReceiverStream<io::Result<Bytes>>> {
    let live = engine
        .open_live_stream(source_url, settings.framerate, &settings.scale, settings.quality)
        .await?;
    info!("Preview started for {}", redact_url(source_url));
    Ok(spawn_pump(live, settings, redact_url(source_url)))
}

fn spawn_pump(live: LiveStream, settings: &PreviewConfig, source: String) -> ReceiverStream<io::Result<Bytes>> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let demuxer = MjpegDemuxer::new(settings.buffer_ceiling, settings.resync_window);
    let chunk_size = settings.chunk_read_size.max(1);
    tokio::spawn(pump(live, demuxer, tx, chunk_size, source));
    ReceiverStream::new(rx)
}

async fn pump(
    live: LiveStream,
    mut demuxer: MjpegDemuxer,
    tx: mpsc::Sender<io::Result<Bytes>>,
    chunk_size: usize,
    source: String,
) {
    let LiveStream { mut reader, process } = live;
    let kill_switch = process
        .as_ref()
        .map(|p| p.kill_switch())
        .unwrap_or_else(CancellationToken::new);
    let mut chunk = vec![0u8; chunk_size];

    let reason = 'pump: loop {
        let n = tokio::select! {
            _ = tx.closed() => break "client disconnected",
            _ = kill_switch.cancelled() => break "engine killed",
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break "end of stream",
                Ok(n) => n,
                Err(e) => {
                    warn!("Error reading preview stream from {}: {}", source, e);
                    break "read error";
                }
            },
        };

        for frame in demuxer.push(&chunk[..n]) {
            // A client that stops reading fills the channel; the kill switch
            // still has to get through.
            let permit = tokio::select! {
                _ = kill_switch.cancelled() => break 'pump "engine killed",
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'pump "client disconnected",
                },
            };
            permit.send(Ok(multipart_chunk(&frame)));
        }
    };

    if let Some(process) = process {
        process.terminate().await;
    }
    if demuxer.resyncs() > 0 {
        debug!("Preview of {} resynchronised {} times", source, demuxer.resyncs());
    }
    info!(
        "Preview of {} ended ({}) after {} frames",
        source,
        reason,
        demuxer.frames_emitted()
    );
}
