//! Plumbing shared by the log relay and the shell bridge: the single
//! connection writer, peer frame classification and per-session metrics.

use std::fmt;

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt};
use metrics::{counter, decrement_gauge, increment_gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{InboundMessage, OutboundMessage};

/// Messages buffered between a producer and the connection writer.
pub const OUTBOUND_QUEUE_DEPTH: usize = 100;
const CONTROL_QUEUE_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Logs,
    Exec,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Logs => "logs",
            SessionKind::Exec => "exec",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The container side finished; the connection was closed in order.
    StreamEnded,
    /// The client closed the connection or it failed underneath us.
    PeerGone,
    /// Writing to the client failed.
    WriteFailed,
    /// The runtime could not provide a stream; one error message was sent.
    Unavailable,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::StreamEnded => "stream_ended",
            EndReason::PeerGone => "peer_gone",
            EndReason::WriteFailed => "write_failed",
            EndReason::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub reason: EndReason,
    pub messages_sent: u64,
}

/// What a frame read from the client means to a session.
pub(crate) enum PeerEvent {
    Data(InboundMessage),
    Ping(Vec<u8>),
    Ignored,
    Gone,
}

impl PeerEvent {
    pub(crate) fn from_frame<E: fmt::Display>(item: Option<Result<Message, E>>) -> Self {
        match item {
            Some(Ok(Message::Text(text))) => PeerEvent::Data(InboundMessage::from_text(&text)),
            Some(Ok(Message::Binary(bytes))) => {
                PeerEvent::Data(InboundMessage::from_binary(&bytes))
            }
            Some(Ok(Message::Ping(payload))) => PeerEvent::Ping(payload),
            Some(Ok(Message::Pong(_))) => PeerEvent::Ignored,
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(reason = ?frame.map(|f| f.reason.to_string()), "client closed websocket");
                PeerEvent::Gone
            }
            Some(Err(err)) => {
                tracing::debug!(error = %err, "error receiving message");
                PeerEvent::Gone
            }
            None => PeerEvent::Gone,
        }
    }
}

/// Producer-side handles onto a [`Writer`].
pub(crate) struct Outbox {
    pub data: mpsc::Sender<OutboundMessage>,
    pub pongs: mpsc::Sender<Vec<u8>>,
}

pub(crate) enum WriterExit {
    /// Every data producer hung up and the queue is empty.
    Drained,
    Cancelled,
    Failed,
}

impl WriterExit {
    pub(crate) fn end_reason(&self) -> EndReason {
        match self {
            WriterExit::Drained => EndReason::StreamEnded,
            WriterExit::Cancelled => EndReason::PeerGone,
            WriterExit::Failed => EndReason::WriteFailed,
        }
    }
}

/// Sole owner of the outbound half of a connection. Every write races the
/// session's cancellation token, so a stalled client cannot pin the session.
pub(crate) struct Writer<Tx> {
    tx: Tx,
    data: mpsc::Receiver<OutboundMessage>,
    pongs: mpsc::Receiver<Vec<u8>>,
    done: CancellationToken,
    sent: u64,
}

impl<Tx> Writer<Tx>
where
    Tx: Sink<Message> + Unpin,
{
    pub(crate) fn new(tx: Tx, done: CancellationToken) -> (Self, Outbox) {
        let (data_tx, data_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (pong_tx, pong_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let writer = Self {
            tx,
            data: data_rx,
            pongs: pong_rx,
            done,
            sent: 0,
        };
        let outbox = Outbox {
            data: data_tx,
            pongs: pong_tx,
        };
        (writer, outbox)
    }

    pub(crate) fn sent(&self) -> u64 {
        self.sent
    }

    async fn transmit(&mut self, frame: Message) -> Result<(), WriterExit> {
        let done = self.done.clone();
        tokio::select! {
            biased;
            _ = done.cancelled() => Err(WriterExit::Cancelled),
            sent = self.tx.send(frame) => sent.map_err(|_| WriterExit::Failed),
        }
    }

    /// Writes one message immediately, bypassing the queue.
    pub(crate) async fn send_now(&mut self, message: OutboundMessage) -> Result<(), WriterExit> {
        self.transmit(Message::Text(message.to_json())).await?;
        self.sent += 1;
        Ok(())
    }

    /// Forwards queued messages and pong replies until the session ends.
    pub(crate) async fn pump(&mut self) -> WriterExit {
        loop {
            let written = tokio::select! {
                biased;
                _ = self.done.cancelled() => return WriterExit::Cancelled,
                Some(payload) = self.pongs.recv() => self.transmit(Message::Pong(payload)).await,
                next = self.data.recv() => match next {
                    Some(message) => self.send_now(message).await,
                    None => return WriterExit::Drained,
                },
            };
            if let Err(exit) = written {
                return exit;
            }
        }
    }

    pub(crate) async fn close(&mut self) {
        let done = self.done.clone();
        tokio::select! {
            _ = done.cancelled() => {}
            _ = self.tx.close() => {}
        }
    }
}

/// Sends a single error message and closes; used when a session cannot start.
pub(crate) async fn reject<Tx>(tx: &mut Tx, reason: String) -> u64
where
    Tx: Sink<Message> + Unpin,
{
    let message = OutboundMessage::Error(reason);
    let sent = tx.send(Message::Text(message.to_json())).await.is_ok();
    let _ = tx.close().await;
    u64::from(sent)
}

/// Open/close accounting for one session; the active gauge is released on drop.
pub(crate) struct SessionMetrics {
    kind: SessionKind,
}

impl SessionMetrics {
    pub(crate) fn open(kind: SessionKind) -> Self {
        counter!("appdock_sessions_opened_total", 1, "kind" => kind.as_str());
        increment_gauge!("appdock_sessions_active", 1.0, "kind" => kind.as_str());
        Self { kind }
    }

    pub(crate) fn finish(&self, outcome: &SessionOutcome) {
        counter!(
            "appdock_sessions_closed_total",
            1,
            "kind" => self.kind.as_str(),
            "reason" => outcome.reason.as_str()
        );
        counter!(
            "appdock_messages_forwarded_total",
            outcome.messages_sent,
            "kind" => self.kind.as_str()
        );
    }
}

impl Drop for SessionMetrics {
    fn drop(&mut self) {
        decrement_gauge!("appdock_sessions_active", 1.0, "kind" => self.kind.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{channel::mpsc as fmpsc, StreamExt};

    #[tokio::test]
    async fn writer_answers_pings_and_drains_in_order() {
        let (tx, mut sent) = fmpsc::unbounded::<Message>();
        let done = CancellationToken::new();
        let (mut writer, outbox) = Writer::new(tx, done);

        outbox.pongs.send(b"hb".to_vec()).await.expect("pong");
        outbox.data.send(OutboundMessage::Log("one".into())).await.expect("one");
        outbox.data.send(OutboundMessage::Log("two".into())).await.expect("two");
        drop(outbox);

        assert!(matches!(writer.pump().await, WriterExit::Drained));
        assert_eq!(writer.sent(), 2);

        let frames: Vec<Message> = sent.by_ref().take(3).collect().await;
        assert!(matches!(&frames[0], Message::Pong(p) if p == b"hb"));
        assert!(matches!(&frames[1], Message::Text(t) if t.contains("one")));
        assert!(matches!(&frames[2], Message::Text(t) if t.contains("two")));
    }

    #[tokio::test]
    async fn cancelled_writer_stops_before_queued_data() {
        let (tx, mut sent) = fmpsc::unbounded::<Message>();
        let done = CancellationToken::new();
        let (mut writer, outbox) = Writer::new(tx, done.clone());

        outbox.data.send(OutboundMessage::Log("late".into())).await.expect("queue");
        done.cancel();

        assert!(matches!(writer.pump().await, WriterExit::Cancelled));
        drop(writer);
        assert!(sent.next().await.is_none());
    }

    #[tokio::test]
    async fn stalled_client_does_not_outlive_cancellation() {
        // Room for exactly one frame, which nobody reads.
        let (tx, _stalled) = fmpsc::channel::<Message>(0);
        let done = CancellationToken::new();
        let (mut writer, outbox) = Writer::new(tx, done.clone());

        outbox.data.send(OutboundMessage::Log("fits".into())).await.expect("one");
        outbox.data.send(OutboundMessage::Log("stuck".into())).await.expect("two");
        let pump = tokio::spawn(async move {
            let exit = writer.pump().await;
            (exit, writer.sent())
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        done.cancel();

        let (exit, sent) = tokio::time::timeout(std::time::Duration::from_secs(5), pump)
            .await
            .expect("writer stops once cancelled")
            .expect("join");
        assert!(matches!(exit, WriterExit::Cancelled));
        assert_eq!(sent, 1);
    }

    #[tokio::test]
    async fn reject_sends_one_error_then_closes() {
        let (mut tx, sent) = fmpsc::unbounded::<Message>();
        assert_eq!(reject(&mut tx, "container web not found".into()).await, 1);

        let frames: Vec<Message> = sent.collect().await;
        assert_eq!(frames.len(), 1);
        let Message::Text(text) = &frames[0] else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(text).expect("json");
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"], "container web not found");
    }

    #[test]
    fn close_and_errors_mean_the_peer_is_gone() {
        assert!(matches!(
            PeerEvent::from_frame::<std::io::Error>(Some(Ok(Message::Close(None)))),
            PeerEvent::Gone
        ));
        assert!(matches!(
            PeerEvent::from_frame(Some(Err(std::io::Error::other("reset")))),
            PeerEvent::Gone
        ));
        assert!(matches!(
            PeerEvent::from_frame::<std::io::Error>(None),
            PeerEvent::Gone
        ));
        assert!(matches!(
            PeerEvent::from_frame::<std::io::Error>(Some(Ok(Message::Ping(vec![1])))),
            PeerEvent::Ping(p) if p == vec![1]
        ));
    }
}
