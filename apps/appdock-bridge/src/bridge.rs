//! Interactive shell bridge: one exec session per connection, pumped in both
//! directions until either end stops.

use std::{fmt::Display, pin::Pin, sync::Arc};

use axum::extract::ws::Message;
use futures_util::{Sink, Stream, StreamExt};
use metrics::counter;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    demux::demux,
    protocol::{InboundMessage, OutboundMessage, SHELL_CONNECTED, SHELL_READ_FAILED},
    provider::{ExecHandle, ShellAttachment, ShellProvider},
    session::{
        reject, EndReason, PeerEvent, SessionKind, SessionMetrics, SessionOutcome, Writer,
        WriterExit,
    },
};

pub const READ_CHUNK: usize = 4096;

/// Creates and attaches a shell in `container_id`, then bridges it to the
/// connection halves.
pub async fn run_shell<Tx, Rx, E>(
    shells: Arc<dyn ShellProvider>,
    container_id: &str,
    mut tx: Tx,
    rx: Rx,
) -> SessionOutcome
where
    Tx: Sink<Message> + Unpin + Send,
    Rx: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let metrics = SessionMetrics::open(SessionKind::Exec);
    info!(container_id, kind = "exec", "session opened");

    let started = match shells.create(container_id).await {
        Ok(handle) => shells
            .attach(&handle)
            .await
            .map(|attachment| (handle, attachment)),
        Err(err) => Err(err),
    };

    let outcome = match started {
        Ok((handle, attachment)) => {
            debug!(container_id, exec_id = %handle.id, "shell attached");
            bridge(shells, handle, attachment, tx, rx).await
        }
        Err(err) => {
            warn!(container_id, error = %err, "failed to start shell");
            counter!("appdock_provider_failures_total", 1, "kind" => "exec", "error" => err.metric_label());
            SessionOutcome {
                reason: EndReason::Unavailable,
                messages_sent: reject(&mut tx, err.to_string()).await,
            }
        }
    };

    metrics.finish(&outcome);
    info!(
        container_id,
        kind = "exec",
        reason = %outcome.reason,
        messages = outcome.messages_sent,
        "session closed"
    );
    outcome
}

/// Pumps an attached shell. The greeting goes out before anything the shell
/// prints.
pub async fn bridge<Tx, Rx, E>(
    shells: Arc<dyn ShellProvider>,
    handle: ExecHandle,
    attachment: ShellAttachment,
    tx: Tx,
    rx: Rx,
) -> SessionOutcome
where
    Tx: Sink<Message> + Unpin + Send,
    Rx: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let done = CancellationToken::new();
    let (mut writer, outbox) = Writer::new(tx, done.clone());

    if let Err(exit) = writer
        .send_now(OutboundMessage::Output(SHELL_CONNECTED.to_string()))
        .await
    {
        return SessionOutcome {
            reason: exit.end_reason(),
            messages_sent: 0,
        };
    }

    let ShellAttachment { input, output } = attachment;
    let outbound = tokio::spawn(pump_output(output, outbox.data, done.clone()));
    let inbound = tokio::spawn(pump_input(
        rx,
        input,
        outbox.pongs,
        shells,
        handle,
        done.clone(),
    ));

    let reason = match writer.pump().await {
        WriterExit::Drained => {
            writer.close().await;
            EndReason::StreamEnded
        }
        exit => exit.end_reason(),
    };

    done.cancel();
    for (task, result) in [("output", outbound.await), ("input", inbound.await)] {
        if let Err(err) = result {
            warn!(task, error = %err, "shell bridge task panicked");
        }
    }

    SessionOutcome {
        reason,
        messages_sent: writer.sent(),
    }
}

/// Shell to client. A clean EOF ends silently; any other read error is
/// reported once.
async fn pump_output(
    mut output: Pin<Box<dyn AsyncRead + Send>>,
    data: mpsc::Sender<OutboundMessage>,
    done: CancellationToken,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut pending = Vec::new();

    loop {
        let read = tokio::select! {
            _ = done.cancelled() => return,
            read = output.read(&mut buf) => read,
        };
        let (message, last) = match read {
            Ok(0) => {
                if pending.is_empty() {
                    return;
                }
                let rest = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                (OutboundMessage::Output(rest), true)
            }
            Ok(n) => {
                pending.extend_from_slice(&demux(&buf[..n]));
                let text = take_complete_utf8(&mut pending);
                if text.is_empty() {
                    continue;
                }
                (OutboundMessage::Output(text), false)
            }
            Err(err) => {
                debug!(error = %err, "shell output read failed");
                (OutboundMessage::Error(SHELL_READ_FAILED.to_string()), true)
            }
        };

        tokio::select! {
            _ = done.cancelled() => return,
            sent = data.send(message) => {
                if sent.is_err() || last {
                    return;
                }
            }
        }
    }
}

/// Client to shell. Input and raw frames are written verbatim; resize goes to
/// the provider.
async fn pump_input<Rx, E>(
    mut rx: Rx,
    mut input: Pin<Box<dyn AsyncWrite + Send>>,
    pongs: mpsc::Sender<Vec<u8>>,
    shells: Arc<dyn ShellProvider>,
    handle: ExecHandle,
    done: CancellationToken,
) where
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let item = tokio::select! {
            _ = done.cancelled() => break,
            item = rx.next() => item,
        };
        let bytes = match PeerEvent::from_frame(item) {
            PeerEvent::Data(InboundMessage::Input(bytes) | InboundMessage::Raw(bytes)) => bytes,
            PeerEvent::Data(InboundMessage::Resize(Some(size))) => {
                if let Err(err) = shells.resize(&handle, size).await {
                    warn!(exec_id = %handle.id, error = %err, "terminal resize failed");
                }
                continue;
            }
            PeerEvent::Data(InboundMessage::Resize(None)) => {
                debug!(exec_id = %handle.id, "resize without usable geometry ignored");
                continue;
            }
            PeerEvent::Ping(payload) => {
                let _ = pongs.try_send(payload);
                continue;
            }
            PeerEvent::Ignored => continue,
            PeerEvent::Gone => break,
        };
        if bytes.is_empty() {
            continue;
        }

        let written = async {
            input.write_all(&bytes).await?;
            input.flush().await
        };
        if let Err(err) = written.await {
            debug!(exec_id = %handle.id, error = %err, "shell input write failed");
            break;
        }
        counter!("appdock_exec_input_bytes_total", bytes.len() as u64);
    }

    done.cancel();
    let _ = input.shutdown().await;
}

/// Splits off and returns the longest prefix of `pending` that does not end
/// in the middle of a UTF-8 sequence.
fn take_complete_utf8(pending: &mut Vec<u8>) -> String {
    let keep = incomplete_tail_len(pending);
    let rest = pending.split_off(pending.len() - keep);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    text
}

fn incomplete_tail_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}
