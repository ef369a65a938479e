//! Shared test harness: an in-process loopback ZeroMQ ROUTER socket standing
//! in for the master, matching the reference protocol's DEALER/ROUTER wire
//! shape without requiring a real network master.

use std::sync::mpsc;
use std::time::Duration;

use rswarm_core::message::{Message, MessageCodec, MessageData};

/// A minimal stand-in master: a ROUTER socket bound to an ephemeral
/// loopback port, plus channels the test drives it with.
pub struct FakeMaster {
    pub port: u16,
    /// Every message the master receives, in arrival order.
    pub inbound: mpsc::Receiver<Message>,
    /// Send a message here to have the master relay it to the worker.
    pub outbound: mpsc::Sender<Message>,
}

/// Spawn the fake master on a dedicated OS thread (it makes its own
/// blocking `zmq` calls, same constraint the real worker transport has).
pub fn spawn_fake_master() -> FakeMaster {
    let ctx = zmq::Context::new();
    let socket = ctx.socket(zmq::ROUTER).expect("create ROUTER socket");
    socket.bind("tcp://127.0.0.1:0").expect("bind ROUTER socket");
    let endpoint = socket
        .get_last_endpoint()
        .expect("get_last_endpoint call")
        .expect("get_last_endpoint utf8");
    let port: u16 = endpoint
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .expect("parse bound port");

    let (inbound_tx, inbound_rx) = mpsc::channel::<Message>();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Message>();

    std::thread::Builder::new()
        .name("fake-master".to_string())
        .spawn(move || {
            socket
                .set_rcvtimeo(200)
                .expect("set fake master recv timeout");
            let codec = MessageCodec;
            let mut worker_identity: Option<Vec<u8>> = None;
            loop {
                match socket.recv_multipart(0) {
                    Ok(parts) if parts.len() == 2 => {
                        worker_identity = Some(parts[0].clone());
                        if let Ok(message) = codec.decode(&parts[1]) {
                            if inbound_tx.send(message).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(_) => continue,
                    Err(zmq::Error::EAGAIN) => {}
                    Err(_) => return,
                }

                while let Ok(message) = outbound_rx.try_recv() {
                    if let Some(identity) = &worker_identity {
                        let bytes = codec.encode(&message).expect("encode outbound message");
                        let _ = socket.send_multipart([identity.clone(), bytes], 0);
                    }
                }
            }
        })
        .expect("spawn fake master thread");

    FakeMaster {
        port,
        inbound: inbound_rx,
        outbound: outbound_tx,
    }
}

impl FakeMaster {
    pub fn send(&self, message: Message) {
        self.outbound.send(message).expect("fake master outbound channel open");
    }

    /// Block (on a blocking-safe thread) until a message of `kind` arrives,
    /// or the timeout elapses.
    pub fn expect_within(&self, kind: &str, timeout: Duration) -> Message {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                panic!("timed out waiting for message type {kind}");
            }
            match self.inbound.recv_timeout(remaining) {
                Ok(message) if message.message_type == kind => return message,
                Ok(_other) => continue,
                Err(_) => panic!("timed out waiting for message type {kind}"),
            }
        }
    }
}

pub fn spawn_data(user_count: u64, spawn_rate: f64) -> MessageData {
    let mut data = MessageData::new();
    data.insert("user_count".to_string(), serde_json::json!(user_count));
    data.insert("spawn_rate".to_string(), serde_json::json!(spawn_rate));
    data
}
