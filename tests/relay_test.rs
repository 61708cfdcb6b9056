//! Unreliable-channel tests: datagram relay, address learning, and the
//! latest-sequence-wins policy

mod common;

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

use common::TestClient;
use relay_server::{Packet, RelayConfig, RelayServer, MAX_DATAGRAM_SIZE};

struct UdpClient {
    socket: UdpSocket,
    server: SocketAddr,
}

impl UdpClient {
    async fn bind(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind udp");
        Self { socket, server }
    }

    async fn send(&self, packet: &Packet) {
        let data = packet.encode().expect("encode packet");
        self.socket.send_to(&data, self.server).await.expect("send datagram");
    }

    /// Receive the next relayed packet, or None on timeout
    async fn try_recv(&self, deadline: Duration) -> Option<Packet> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let result = tokio::time::timeout(deadline, self.socket.recv_from(&mut buf)).await;
        match result {
            Ok(Ok((n, _))) => Some(Packet::decode(&buf[..n]).expect("decode relayed packet")),
            _ => None,
        }
    }

    async fn recv(&self) -> Packet {
        self.try_recv(Duration::from_secs(2))
            .await
            .expect("expected a relayed packet")
    }

    /// Drop anything already queued on the socket
    async fn drain(&self) {
        while self.try_recv(Duration::from_millis(100)).await.is_some() {}
    }
}

async fn two_joined_clients() -> (RelayServer, TestClient, u64, TestClient, u64, SocketAddr) {
    let mut server = RelayServer::new(RelayConfig::new("127.0.0.1:0"));
    let addr = server.start().await.expect("start server");
    let (a, a_id) = TestClient::join(addr, "Alice").await;
    let (b, b_id) = TestClient::join(addr, "Bob").await;
    (server, a, a_id, b, b_id, addr)
}

#[tokio::test]
async fn test_update_is_relayed_to_the_other_session() {
    let (mut server, _a, a_id, _b, b_id, addr) = two_joined_clients().await;

    let a_udp = UdpClient::bind(addr).await;
    let b_udp = UdpClient::bind(addr).await;

    // First datagram from each side teaches the relay its return address
    a_udp.send(&Packet::new(a_id, 1, 1, vec![0])).await;
    b_udp.send(&Packet::new(b_id, 2, 1, vec![0])).await;
    a_udp.drain().await;
    b_udp.drain().await;

    a_udp
        .send(&Packet::new(a_id, 7, 100, vec![0xAA, 0xBB]))
        .await;

    let relayed = b_udp.recv().await;
    assert_eq!(relayed.session_id, a_id);
    assert_eq!(relayed.entity_id, 7);
    assert_eq!(relayed.sequence, 100);
    assert_eq!(&relayed.payload[..], &[0xAA, 0xBB]);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stale_sequence_is_dropped() {
    let (mut server, _a, a_id, _b, b_id, addr) = two_joined_clients().await;

    let a_udp = UdpClient::bind(addr).await;
    let b_udp = UdpClient::bind(addr).await;
    b_udp.send(&Packet::new(b_id, 2, 1, vec![0])).await;

    a_udp.send(&Packet::new(a_id, 7, 100, vec![1])).await;
    let first = b_udp.recv().await;
    assert_eq!(first.sequence, 100);

    // Older and duplicate sequences for the same entity never reach peers
    a_udp.send(&Packet::new(a_id, 7, 99, vec![2])).await;
    a_udp.send(&Packet::new(a_id, 7, 100, vec![3])).await;
    assert!(b_udp.try_recv(Duration::from_millis(300)).await.is_none());

    // A newer sequence resumes the flow
    a_udp.send(&Packet::new(a_id, 7, 101, vec![4])).await;
    assert_eq!(b_udp.recv().await.sequence, 101);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_sequences_are_tracked_per_entity() {
    let (mut server, _a, a_id, _b, b_id, addr) = two_joined_clients().await;

    let a_udp = UdpClient::bind(addr).await;
    let b_udp = UdpClient::bind(addr).await;
    b_udp.send(&Packet::new(b_id, 2, 1, vec![0])).await;

    a_udp.send(&Packet::new(a_id, 7, 100, vec![1])).await;
    assert_eq!(b_udp.recv().await.entity_id, 7);

    // Entity 8 starts its own sequence space
    a_udp.send(&Packet::new(a_id, 8, 1, vec![2])).await;
    let relayed = b_udp.recv().await;
    assert_eq!(relayed.entity_id, 8);
    assert_eq!(relayed.sequence, 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_datagram_for_unknown_session_is_dropped() {
    let mut server = RelayServer::new(RelayConfig::new("127.0.0.1:0"));
    let addr = server.start().await.unwrap();
    let (_a, a_id) = TestClient::join(addr, "Alice").await;

    let a_udp = UdpClient::bind(addr).await;
    a_udp.send(&Packet::new(a_id, 1, 1, vec![0])).await;

    // A datagram claiming a session that was never established
    let stranger = UdpClient::bind(addr).await;
    stranger.send(&Packet::new(9999, 7, 100, vec![1])).await;
    assert!(a_udp.try_recv(Duration::from_millis(300)).await.is_none());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_datagram_from_wrong_source_is_dropped() {
    let (mut server, _a, a_id, _b, b_id, addr) = two_joined_clients().await;

    let a_udp = UdpClient::bind(addr).await;
    let b_udp = UdpClient::bind(addr).await;
    a_udp.send(&Packet::new(a_id, 1, 1, vec![0])).await;
    b_udp.send(&Packet::new(b_id, 2, 1, vec![0])).await;
    b_udp.drain().await;

    // A different socket spoofing Alice's session id is ignored
    let spoofer = UdpClient::bind(addr).await;
    spoofer.send(&Packet::new(a_id, 7, 100, vec![1])).await;
    assert!(b_udp.try_recv(Duration::from_millis(300)).await.is_none());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_datagram_does_not_disturb_the_session() {
    let (mut server, _a, a_id, _b, b_id, addr) = two_joined_clients().await;

    let a_udp = UdpClient::bind(addr).await;
    let b_udp = UdpClient::bind(addr).await;
    a_udp.send(&Packet::new(a_id, 1, 1, vec![0])).await;
    b_udp.send(&Packet::new(b_id, 2, 1, vec![0])).await;
    b_udp.drain().await;

    // Shorter than the fixed header
    a_udp
        .socket
        .send_to(&[1, 2, 3], a_udp.server)
        .await
        .unwrap();

    // The session relays normally afterwards
    a_udp.send(&Packet::new(a_id, 7, 100, vec![1])).await;
    assert_eq!(b_udp.recv().await.sequence, 100);
    assert_eq!(server.table().len(), 2);

    server.stop().await.unwrap();
}
