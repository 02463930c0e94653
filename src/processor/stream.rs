use crate::api::FleetApi;
use crate::bus::WorkItem;
use bytes::Bytes;
use futures::StreamExt;
use std::io;
use std::sync::Arc;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

/// Lines fetched per remote read.
pub const PORTION_LINES: i32 = 10_000;

const MARKER_CHANNEL_CAPACITY: usize = 100;
// Keeps the downloader at most one portion ahead of the scanner, like an
// in-memory pipe.
const CHUNK_CHANNEL_CAPACITY: usize = 2;

/// Open a streamed reader over a remote log file starting at `start_marker`.
///
/// A producer task pulls bounded portions from the fleet API and feeds a
/// byte-chunk channel; the returned reader surfaces the bytes in source
/// order and any producer error (including cancellation) as a read error.
/// The side channel carries each new resume marker; sends never block and
/// drop when the channel is full, so a checkpoint can be stale but never
/// ahead of the bytes actually parsed.
pub fn open_log_stream(
    api: Arc<dyn FleetApi>,
    item: &WorkItem,
    start_marker: &str,
    cancel: CancellationToken,
) -> (
    impl AsyncBufRead + Send + Unpin,
    mpsc::Receiver<String>,
) {
    let (chunk_tx, chunk_rx) = mpsc::channel::<io::Result<Bytes>>(CHUNK_CHANNEL_CAPACITY);
    let (marker_tx, marker_rx) = mpsc::channel::<String>(MARKER_CHANNEL_CAPACITY);

    let instance_id = item.instance_id.clone();
    let file_name = item.log_file_name.clone();
    let mut marker = normalize_marker(start_marker);

    tokio::spawn(async move {
        loop {
            if cancel.is_cancelled() {
                let _ = chunk_tx
                    .send(Err(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "download cancelled",
                    )))
                    .await;
                return;
            }

            let portion = match api
                .download_portion(&instance_id, &file_name, &marker, PORTION_LINES)
                .await
            {
                Ok(portion) => portion,
                Err(err) => {
                    let _ = chunk_tx
                        .send(Err(io::Error::other(err.to_string())))
                        .await;
                    return;
                }
            };

            if !portion.data.is_empty()
                && chunk_tx.send(Ok(Bytes::from(portion.data))).await.is_err()
            {
                // Reader side went away; stop downloading.
                return;
            }

            if let Some(new_marker) = portion.marker {
                marker = new_marker;
                let _ = marker_tx.try_send(marker.clone());
            }

            if !portion.additional_data_pending {
                return;
            }
        }
    });

    let chunks = futures::stream::unfold(chunk_rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    })
    .boxed();
    (StreamReader::new(chunks), marker_rx)
}

/// Both the empty marker and the upstream `"end"` sentinel restart at `"0"`.
fn normalize_marker(marker: &str) -> String {
    if marker.is_empty() || marker == "end" {
        "0".to_string()
    } else {
        marker.to_string()
    }
}
