//! One subscriber's HTTP response stream.
//!
//! `Client` owns the write side of the wire: every accepted event or
//! heartbeat is rendered to its final SSE text and handed to a bounded
//! channel the HTTP handler drains as the response body. A channel send
//! failing means the peer is gone (dropped receiver), which this treats
//! exactly like a flush failure on a real socket: the client flips closed
//! and every later `send`/`send_keepalive` short-circuits with
//! `ErrClientClosed`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use signalq_core::{Error, Result};
use signalq_events::Event;

/// Heartbeat comment line per §6: a line starting with `:` and no field
/// name, terminated by the blank line that ends every SSE record.
const KEEPALIVE_FRAME: &str = ":\n\n";

/// A live subscriber connection. Cheap to clone; every clone shares the same
/// closed flag and channel, so closing through any handle closes all of
/// them.
#[derive(Clone)]
pub struct Client {
    sender: mpsc::Sender<String>,
    closed: Arc<AtomicBool>,
}

impl Client {
    /// Create a client and the receiver its wire frames are written to.
    /// `buffer` bounds how far behind a slow HTTP write loop may fall before
    /// `send`/`send_keepalive` calls see their channel full — those callers
    /// are expected to treat a full buffer the same as any other transient
    /// backpressure, not as a closed client.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(buffer);
        (
            Self {
                sender,
                closed: Arc::new(AtomicBool::new(false)),
            },
            receiver,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Frame `event` and write it. Assumes the caller has already stamped an
    /// id if one is wanted — `Client` does not invent ids itself.
    pub async fn send(&self, event: &Event) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        let frame = event.to_wire()?;
        self.write(frame).await
    }

    pub async fn send_keepalive(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        self.write(KEEPALIVE_FRAME.to_string()).await
    }

    /// Idempotent: further sends after this return `ErrClientClosed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    async fn write(&self, frame: String) -> Result<()> {
        if self.sender.send(frame).await.is_err() {
            self.close();
            return Err(Error::ClientClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_writes_framed_event_to_channel() {
        let (client, mut rx) = Client::new(4);
        let event = Event::data("hello").with_event("msg").with_id("1");
        client.send(&event).await.unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame, "id: 1\nevent: msg\ndata: hello\n\n");
    }

    #[tokio::test]
    async fn send_keepalive_writes_comment_line() {
        let (client, mut rx) = Client::new(4);
        client.send_keepalive().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), ":\n\n");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_further_sends() {
        let (client, _rx) = Client::new(4);
        client.close();
        client.close();

        let err = client.send(&Event::data("x")).await.unwrap_err();
        assert!(matches!(err, Error::ClientClosed));
    }

    #[tokio::test]
    async fn dropping_receiver_closes_client_on_next_send() {
        let (client, rx) = Client::new(1);
        drop(rx);

        let err = client.send(&Event::data("x")).await.unwrap_err();
        assert!(matches!(err, Error::ClientClosed));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn clone_shares_closed_state() {
        let (client, _rx) = Client::new(4);
        let clone = client.clone();
        clone.close();
        assert!(client.is_closed());
    }
}
