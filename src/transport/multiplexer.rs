//! The shared UDP socket and its receive loop.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::core::error::TransportError;

use super::dispatcher::Dispatcher;
use super::strand::Strand;

/// Largest datagram the receive loop accepts.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Owns the UDP socket shared by every connection of one transport.
///
/// The receive loop runs in its own task and posts each datagram onto the
/// strand for [`Dispatcher::dispatch`], so dispatch work is serialised with
/// every other connection-state mutation.
pub struct Multiplexer {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_endpoint: Mutex<Option<SocketAddr>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Multiplexer {
    /// Create a closed multiplexer.
    pub fn new() -> Self {
        Self {
            socket: Mutex::new(None),
            local_endpoint: Mutex::new(None),
            dispatch_task: Mutex::new(None),
        }
    }

    /// Bind the shared socket to `local_endpoint`.
    pub async fn open(&self, local_endpoint: SocketAddr) -> Result<(), TransportError> {
        if self.is_open() {
            return Err(TransportError::FailedToConnect);
        }
        let socket = UdpSocket::bind(local_endpoint).await?;
        let bound = socket.local_addr()?;
        *self.socket.lock() = Some(Arc::new(socket));
        *self.local_endpoint.lock() = Some(bound);
        Ok(())
    }

    /// Whether the shared socket is bound.
    pub fn is_open(&self) -> bool {
        self.socket.lock().is_some()
    }

    /// The endpoint the shared socket is bound to.
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        *self.local_endpoint.lock()
    }

    /// Handle to the shared socket for per-connection sends.
    pub fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().clone()
    }

    /// Spawn the receive loop; every datagram is posted to the strand for
    /// dispatch.
    pub fn start_dispatch(&self, strand: Strand, dispatcher: Arc<Dispatcher>) {
        let socket = match self.socket() {
            Some(socket) => socket,
            None => return,
        };
        let task = tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, sender)) => {
                        let datagram = buffer[..len].to_vec();
                        let dispatcher = Arc::clone(&dispatcher);
                        strand.post(async move {
                            dispatcher.dispatch(&datagram, sender).await;
                        });
                    }
                    Err(error) => {
                        trace!(%error, "receive loop terminating");
                        break;
                    }
                }
            }
        });
        *self.dispatch_task.lock() = Some(task);
    }

    /// Drop the socket and stop the receive loop. Idempotent.
    pub fn close(&self) {
        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }
        *self.socket.lock() = None;
        *self.local_endpoint.lock() = None;
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_and_close() {
        let multiplexer = Multiplexer::new();
        assert!(!multiplexer.is_open());

        multiplexer.open("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(multiplexer.is_open());
        let bound = multiplexer.local_endpoint().unwrap();
        assert_ne!(bound.port(), 0);

        // A second open on the same multiplexer is refused.
        assert!(multiplexer.open("127.0.0.1:0".parse().unwrap()).await.is_err());

        multiplexer.close();
        assert!(!multiplexer.is_open());
        assert!(multiplexer.local_endpoint().is_none());

        // Close is idempotent.
        multiplexer.close();
    }

    #[tokio::test]
    async fn test_open_fails_on_taken_port() {
        let first = Multiplexer::new();
        first.open("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let taken = first.local_endpoint().unwrap();

        let second = Multiplexer::new();
        let result = second.open(taken).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }
}
