//! Receive-path callbacks
//!
//! A [`MessageHandler`] is invoked synchronously from inside a sync cycle, on the
//! background task that owns the connection. A handler that blocks stalls the whole
//! session: keep it short, or use [`channel_handler`] and drain the queue elsewhere.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Callback for received messages: `(topic, payload)`.
///
/// Caller context is whatever the closure captures; the session never inspects it.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// A message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl ReceivedMessage {
    /// Payload as UTF-8, lossily
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Wrap a closure as a [`MessageHandler`]
pub fn handler_fn<F>(f: F) -> MessageHandler
where
    F: Fn(&str, &[u8]) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handler that moves received messages onto a bounded queue.
///
/// The handler never blocks. When the queue is full the message is dropped and a
/// warning is logged.
pub fn channel_handler(capacity: usize) -> (MessageHandler, mpsc::Receiver<ReceivedMessage>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handler = handler_fn(move |topic, payload| {
        let message = ReceivedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        };
        match tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(topic = %dropped.topic, "Receive queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    });
    (handler, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_handler_fn_captures_context() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = handler_fn(move |topic, payload| {
            sink.lock().unwrap().push((topic.to_string(), payload.len()));
        });

        handler("sensors/temp", b"21.5");
        handler("sensors/hum", b"40");

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![("sensors/temp".to_string(), 4), ("sensors/hum".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn test_channel_handler_delivers_in_order() {
        let (handler, mut rx) = channel_handler(4);

        handler("a", b"1");
        handler("b", b"2");

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.topic, "a");
        assert_eq!(first.payload_str(), "1");
        assert_eq!(second.topic, "b");
    }

    #[tokio::test]
    async fn test_channel_handler_drops_when_full() {
        let (handler, mut rx) = channel_handler(1);

        handler("a", b"1");
        handler("b", b"2");

        assert_eq!(rx.recv().await.unwrap().topic, "a");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_handler_survives_closed_receiver() {
        let (handler, rx) = channel_handler(1);
        drop(rx);
        handler("a", b"1");
    }
}
