//! Log relay: follows a container's log stream and forwards each line to the
//! client as a `log` message.
//!
//! Three roles share one session. The reader splits the byte stream into
//! lines and queues them, the writer owns the connection's outbound half, and
//! the peer watcher drains client frames to notice a close (answering pings
//! through the writer). All of them observe one cancellation token.

use std::fmt::Display;

use axum::extract::ws::Message;
use futures_util::{Sink, Stream, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::{
    codec::{AnyDelimiterCodec, FramedRead},
    io::StreamReader,
    sync::CancellationToken,
};
use tracing::{info, warn};

use crate::{
    demux::clean_log_line,
    protocol::OutboundMessage,
    provider::{LogSource, LogStream},
    session::{
        reject, EndReason, PeerEvent, SessionKind, SessionMetrics, SessionOutcome, Writer,
        WriterExit,
    },
};

/// Longest log line accepted before the stream is treated as broken.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Opens the log stream for `container_id` and relays it until either side
/// goes away.
pub async fn stream_logs<Tx, Rx, E>(
    source: &dyn LogSource,
    container_id: &str,
    mut tx: Tx,
    rx: Rx,
) -> SessionOutcome
where
    Tx: Sink<Message> + Unpin + Send,
    Rx: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let metrics = SessionMetrics::open(SessionKind::Logs);
    info!(container_id, kind = "logs", "session opened");

    let outcome = match source.open(container_id).await {
        Ok(stream) => relay(stream, tx, rx).await,
        Err(err) => {
            warn!(container_id, error = %err, "failed to open log stream");
            counter!("appdock_provider_failures_total", 1, "kind" => "logs", "error" => err.metric_label());
            SessionOutcome {
                reason: EndReason::Unavailable,
                messages_sent: reject(&mut tx, err.to_string()).await,
            }
        }
    };

    metrics.finish(&outcome);
    info!(
        container_id,
        kind = "logs",
        reason = %outcome.reason,
        messages = outcome.messages_sent,
        "session closed"
    );
    outcome
}

/// Relays an already-open log stream over the connection halves.
pub async fn relay<Tx, Rx, E>(stream: LogStream, tx: Tx, rx: Rx) -> SessionOutcome
where
    Tx: Sink<Message> + Unpin + Send,
    Rx: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let done = CancellationToken::new();
    let (mut writer, outbox) = Writer::new(tx, done.clone());

    let reader = tokio::spawn(read_lines(stream, outbox.data, done.clone()));
    let watcher = tokio::spawn(watch_peer(rx, outbox.pongs, done.clone()));

    let reason = match writer.pump().await {
        WriterExit::Drained => match writer.send_now(OutboundMessage::logs_ended()).await {
            Ok(()) => {
                writer.close().await;
                EndReason::StreamEnded
            }
            Err(exit) => exit.end_reason(),
        },
        exit => exit.end_reason(),
    };

    done.cancel();
    for (task, result) in [("reader", reader.await), ("watcher", watcher.await)] {
        if let Err(err) = result {
            warn!(task, error = %err, "log relay task panicked");
        }
    }

    SessionOutcome {
        reason,
        messages_sent: writer.sent(),
    }
}

async fn read_lines(
    stream: LogStream,
    lines: mpsc::Sender<OutboundMessage>,
    done: CancellationToken,
) {
    let codec = AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_LINE_BYTES);
    let mut framed = FramedRead::new(StreamReader::new(stream), codec);

    loop {
        let next = tokio::select! {
            _ = done.cancelled() => return,
            next = framed.next() => next,
        };
        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(err)) => {
                warn!(error = %err, "log stream read failed");
                return;
            }
            None => return,
        };

        let text = clean_log_line(&line);
        if text.is_empty() {
            continue;
        }
        tokio::select! {
            _ = done.cancelled() => return,
            sent = lines.send(OutboundMessage::Log(text)) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

async fn watch_peer<Rx, E>(mut rx: Rx, pongs: mpsc::Sender<Vec<u8>>, done: CancellationToken)
where
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let item = tokio::select! {
            _ = done.cancelled() => return,
            item = rx.next() => item,
        };
        match PeerEvent::from_frame(item) {
            PeerEvent::Ping(payload) => {
                let _ = pongs.try_send(payload);
            }
            PeerEvent::Data(_) | PeerEvent::Ignored => {}
            PeerEvent::Gone => break,
        }
    }
    done.cancel();
}
