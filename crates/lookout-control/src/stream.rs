// ABOUTME: Server-side handle for an agent's outbound command stream.
// ABOUTME: Wraps an mpsc sender with an explicit close signal that ends the gRPC response stream.

use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use lookout_proto::ServerMessage;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;

/// Default buffer size for an agent's outbound channel.
pub const DEFAULT_CHANNEL_BUFFER: usize = 32;

/// The response half handed back to tonic for an agent stream.
pub type OutboundTasks = Pin<Box<dyn Stream<Item = Result<ServerMessage, Status>> + Send>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream closed")]
    Closed,

    #[error("send timed out after {0:?}")]
    TimedOut(Duration),
}

/// Sender half of an agent's command stream.
///
/// Clones share the same close signal: once [`TaskStream::close`] runs, the
/// outbound stream ends and every clone rejects further sends.
#[derive(Debug, Clone)]
pub struct TaskStream {
    inner: mpsc::Sender<ServerMessage>,
    closed: CancellationToken,
}

impl TaskStream {
    /// Create a stream handle and the outbound stream tonic will drain.
    pub fn channel(buffer: usize) -> (Self, OutboundTasks) {
        let (tx, rx) = mpsc::channel(buffer);
        let closed = CancellationToken::new();
        let outbound = ReceiverStream::new(rx)
            .map(Ok::<_, Status>)
            .take_until(closed.clone().cancelled_owned());
        (
            Self {
                inner: tx,
                closed,
            },
            Box::pin(outbound),
        )
    }

    /// Queue a message, waiting at most `timeout` for channel capacity.
    ///
    /// A close that lands while the message is being queued reports
    /// [`StreamError::Closed`]: the outbound stream stops reading at close, so
    /// the message may never go out.
    pub async fn send(&self, msg: ServerMessage, timeout: Duration) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        self.inner
            .send_timeout(msg, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => StreamError::TimedOut(timeout),
                SendTimeoutError::Closed(_) => StreamError::Closed,
            })?;
        if self.closed.is_cancelled() {
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    /// Close the stream. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// True once closed locally or once the peer dropped the outbound half.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.inner.is_closed()
    }

    /// Resolves when the stream is closed locally.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskMessage;
    use futures::FutureExt;

    const TIMEOUT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_send_reaches_outbound() {
        let (stream, mut outbound) = TaskStream::channel(4);
        stream
            .send(TaskMessage::keepalive().to_server_message(), TIMEOUT)
            .await
            .unwrap();
        let received = outbound.next().await.unwrap().unwrap();
        assert_eq!(received, TaskMessage::keepalive().to_server_message());
    }

    #[tokio::test]
    async fn test_close_ends_outbound_and_rejects_sends() {
        let (stream, mut outbound) = TaskStream::channel(4);
        let clone = stream.clone();
        stream.close();
        stream.close();

        assert!(clone.is_closed());
        assert!(outbound.next().await.is_none());
        let err = clone
            .send(TaskMessage::upgrade().to_server_message(), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err, StreamError::Closed);
    }

    #[tokio::test]
    async fn test_dropped_outbound_fails_fast() {
        let (stream, outbound) = TaskStream::channel(4);
        drop(outbound);
        let err = stream
            .send(TaskMessage::upgrade().to_server_message(), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err, StreamError::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_channel_times_out() {
        let (stream, _outbound) = TaskStream::channel(1);
        stream
            .send(TaskMessage::keepalive().to_server_message(), TIMEOUT)
            .await
            .unwrap();
        let err = stream
            .send(TaskMessage::keepalive().to_server_message(), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err, StreamError::TimedOut(TIMEOUT));
    }

    #[tokio::test]
    async fn test_close_during_queued_send_reports_closed() {
        let (stream, mut outbound) = TaskStream::channel(1);
        stream
            .send(TaskMessage::keepalive().to_server_message(), TIMEOUT)
            .await
            .unwrap();

        // Second send parks waiting for capacity.
        let pending = {
            let stream = stream.clone();
            tokio::spawn(async move {
                stream
                    .send(TaskMessage::upgrade().to_server_message(), Duration::from_secs(5))
                    .await
            })
        };
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        // Free the slot and close before the parked sender runs again.
        let first = outbound.next().now_or_never().flatten().unwrap().unwrap();
        assert_eq!(first, TaskMessage::keepalive().to_server_message());
        stream.close();

        assert_eq!(pending.await.unwrap(), Err(StreamError::Closed));
        assert!(outbound.next().await.is_none());
    }
}
