//! RPC transport: a single bidirectional ZeroMQ DEALER channel to the
//! master, guarded so the non-thread-safe underlying socket is never
//! touched from two threads at once.

use std::sync::Mutex;
use std::time::Duration;

use crate::error::RswarmError;
use crate::message::{Message, MessageCodec};

/// How long a single `recv` call blocks before giving up and returning
/// [`RecvOutcome::TimedOut`]. Short enough that the Sender/Heartbeater
/// threads get several lock-acquisition windows per heartbeat interval.
pub const RECV_TIMEOUT_MS: i32 = 300;

/// The result of one `recv` call.
#[derive(Debug)]
pub enum RecvOutcome {
    Received(Message),
    TimedOut,
}

/// A single ZeroMQ DEALER socket to the master, wrapped so `send`/`recv`
/// are each individually safe to call from any thread, serialized through
/// a `std::sync::Mutex`.
///
/// `std::sync::Mutex` rather than `tokio::sync::Mutex` is deliberate: every
/// lock here guards a blocking libzmq call made from a dedicated OS thread
/// (the control pool), never across an `.await` point, so there is nothing
/// to gain from an async-aware mutex and a std one is cheaper.
pub struct RpcTransport {
    socket: Mutex<zmq::Socket>,
    codec: MessageCodec,
    closed: std::sync::atomic::AtomicBool,
}

impl RpcTransport {
    /// Connect a DEALER socket to `tcp://{host}:{port}` with `ZMQ_RCVTIMEO`
    /// set to `recv_timeout_ms`.
    pub fn connect(host: &str, port: u16, recv_timeout_ms: i32) -> Result<Self, RswarmError> {
        let ctx = zmq::Context::new();
        let socket = ctx
            .socket(zmq::DEALER)
            .map_err(|e| RswarmError::TransportFatal(format!("failed to create socket: {e}")))?;
        socket
            .set_rcvtimeo(recv_timeout_ms)
            .map_err(|e| RswarmError::TransportFatal(format!("failed to set recv timeout: {e}")))?;
        let endpoint = format!("tcp://{host}:{port}");
        socket
            .connect(&endpoint)
            .map_err(|e| RswarmError::TransportFatal(format!("failed to connect to {endpoint}: {e}")))?;

        Ok(Self {
            socket: Mutex::new(socket),
            codec: MessageCodec,
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Send one message. Safe to call from any thread; blocks until the
    /// message is handed to the OS socket buffer.
    pub fn send(&self, message: &Message) -> Result<(), RswarmError> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RswarmError::TransportFatal("transport is closed".to_string()));
        }
        let bytes = self.codec.encode(message)?;
        let socket = self.socket.lock().unwrap();
        socket
            .send(bytes, 0)
            .map_err(|e| RswarmError::Transport(format!("send failed: {e}")))
    }

    /// Receive one message, blocking at most `RECV_TIMEOUT_MS`. Safe to
    /// call from one dedicated reader thread; calling from more than one
    /// thread would violate the single-reader assumption documented on
    /// `RpcTransport` (the mutex only prevents data races, not logical
    /// message-stealing between two concurrent readers).
    pub fn recv(&self) -> Result<RecvOutcome, RswarmError> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RswarmError::TransportFatal("transport is closed".to_string()));
        }
        let socket = self.socket.lock().unwrap();
        match socket.recv_bytes(0) {
            Ok(bytes) => {
                drop(socket);
                let message = self.codec.decode(&bytes)?;
                Ok(RecvOutcome::Received(message))
            }
            Err(zmq::Error::EAGAIN) => Ok(RecvOutcome::TimedOut),
            Err(e) => Err(RswarmError::TransportFatal(format!("recv failed: {e}"))),
        }
    }

    /// Idempotent; safe against concurrent `send`/`recv` (they will observe
    /// `closed` and return `TransportFatal` rather than touch the socket).
    pub fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Default recv timeout matching [`RECV_TIMEOUT_MS`], used when no override
/// is supplied via [`crate::config::WorkerConfig`].
pub fn default_recv_timeout() -> Duration {
    Duration::from_millis(RECV_TIMEOUT_MS as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RpcTransport::connect requires a live libzmq context and an actual
    // socket connect, which is exercised in the `tests/` integration suite
    // against a loopback ROUTER standing in for the master. Here we only
    // cover the logic that doesn't require a real socket.

    #[test]
    fn closed_transport_rejects_recv_timeout_constant_is_sane() {
        assert!(RECV_TIMEOUT_MS > 0);
        assert_eq!(default_recv_timeout(), Duration::from_millis(300));
    }
}
