//! Shared helpers for the integration suites
#![allow(dead_code)]

use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use relay_server::{ControlMessage, Frame, PROTOCOL_VERSION};

/// Minimal reliable-channel client for driving the relay in tests
pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Connect and complete the handshake, returning the assigned session id
    pub async fn join(addr: SocketAddr, name: &str) -> (Self, u64) {
        let mut client = Self::connect(addr).await;
        client
            .send(&ControlMessage::Hello {
                version: PROTOCOL_VERSION,
                name: name.to_string(),
                token: None,
            })
            .await;
        match client.recv().await {
            ControlMessage::Welcome { session_id } => (client, session_id),
            other => panic!("expected welcome, got {:?}", other),
        }
    }

    pub async fn send(&mut self, msg: &ControlMessage) {
        let data = Frame::from_control(msg).unwrap().encode().unwrap();
        self.stream.write_all(&data).await.expect("send frame");
    }

    /// Write raw bytes, bypassing framing (for violation tests)
    pub async fn send_raw(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.expect("send raw bytes");
    }

    /// Receive the next control message (2s deadline)
    pub async fn recv(&mut self) -> ControlMessage {
        self.try_recv(Duration::from_secs(2))
            .await
            .expect("expected a control message")
    }

    /// Receive the next control message, or None on timeout/close
    pub async fn try_recv(&mut self, deadline: Duration) -> Option<ControlMessage> {
        let result = tokio::time::timeout(deadline, async {
            loop {
                if let Some(frame) = Frame::decode(&mut self.buf).ok()? {
                    return frame.to_control().ok();
                }
                let n = self.stream.read_buf(&mut self.buf).await.ok()?;
                if n == 0 {
                    return None;
                }
            }
        })
        .await;
        result.ok().flatten()
    }

    /// Wait until the server closes the connection
    pub async fn expect_closed(&mut self) {
        let deadline = Duration::from_secs(2);
        loop {
            match self.try_recv(deadline).await {
                Some(_) => continue,
                None => return,
            }
        }
    }
}
