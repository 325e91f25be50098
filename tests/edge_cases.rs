//! Malformed and hostile input against a running server
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use common::{test_config, wait_until};
use hybrid_net::config::NetworkConfig;
use hybrid_net::core::codec::FrameCodec;
use hybrid_net::core::packet::Packet;
use hybrid_net::core::serialization::DataBuilder;
use hybrid_net::protocol::message::{
    system_ids, AcknowledgeResponse, ClientSystemMessage, WireFormat,
};
use hybrid_net::protocol::{Dispatch, DropReason, MessageTypeRegistry, Messenger};
use hybrid_net::service::Server;
use hybrid_net::transport::Recipient;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};

const WAIT: Duration = Duration::from_secs(5);

async fn running_server(config: NetworkConfig) -> Server {
    let server = Server::new(config, MessageTypeRegistry::new()).unwrap();
    server.start().await.unwrap();
    server
}

fn frame(packet: &Packet) -> BytesMut {
    let bytes = packet.to_bytes();
    let mut buf = BytesMut::with_capacity(4 + bytes.len());
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(&bytes);
    buf
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_short_and_empty_datagrams_are_dropped() {
    let server = running_server(test_config()).await;
    let target = server.local_udp_addr().unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    socket.send_to(&[], target).await.unwrap();
    socket.send_to(&[0x01, 0x02, 0x03], target).await.unwrap();

    assert!(wait_until(WAIT, || server.metrics().snapshot().packets_dropped == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = server.metrics().snapshot();
    assert_eq!(snapshot.packets_dropped, 1);
    assert_eq!(snapshot.messages_received, 0);
    assert!(server.is_running());
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heartbeat_with_unknown_secret_is_ignored() {
    let server = running_server(test_config()).await;
    let target = server.local_udp_addr().unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut payload = DataBuilder::new();
    ClientSystemMessage::heartbeat("no-such-peer".to_string()).write(&mut payload);
    let packet = Packet::new(system_ids::CLIENT_SYSTEM, payload.freeze());
    socket.send_to(&packet.to_bytes(), target).await.unwrap();

    assert!(wait_until(WAIT, || server.metrics().snapshot().messages_received == 1).await);
    assert_eq!(server.peer_count(), 0);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oversized_frame_drops_the_peer() {
    let mut config = test_config();
    config.messenger.max_frame_size = 1024;
    let server = running_server(config.clone()).await;

    let mut stream = TcpStream::connect(config.server.address.as_str()).await.unwrap();
    assert!(wait_until(WAIT, || server.peer_count() == 1).await);

    stream.write_all(&2048u32.to_le_bytes()).await.unwrap();
    stream.write_all(&[0u8; 64]).await.unwrap();

    assert!(wait_until(WAIT, || server.peer_count() == 0).await);
    assert!(server.is_running());
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_and_malformed_frames_keep_the_connection() {
    let config = test_config();
    let server = running_server(config.clone()).await;

    let mut stream = TcpStream::connect(config.server.address.as_str()).await.unwrap();
    assert!(wait_until(WAIT, || server.peer_count() == 1).await);

    let unknown = Packet::new(4242, vec![1, 2, 3, 4]);
    stream.write_all(&frame(&unknown)).await.unwrap();
    // A disconnect message cut off inside its secret
    let truncated = Packet::new(system_ids::DISCONNECT, vec![0x05, 0x00]);
    stream.write_all(&frame(&truncated)).await.unwrap();

    assert!(wait_until(WAIT, || server.metrics().snapshot().packets_dropped == 2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.peer_count(), 1);

    drop(stream);
    assert!(wait_until(WAIT, || server.peer_count() == 0).await);
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_acknowledge_token_is_a_no_op() {
    let messenger = Messenger::new(Arc::new(MessageTypeRegistry::new())).unwrap();
    let (writer, _reader) = tokio::io::duplex(1024);
    let sender = Recipient::stream(writer, FrameCodec::default(), None);

    assert!(!messenger.acknowledge("AAAAAAAAAAA"));

    let mut payload = DataBuilder::new();
    AcknowledgeResponse::new("AAAAAAAAAAA".to_string()).write(&mut payload);
    let response = Packet::new(system_ids::ACKNOWLEDGE_RESPONSE, payload.freeze());
    assert_eq!(
        messenger.handle(response.to_bytes(), &sender).await,
        Dispatch::Dispatched(system_ids::ACKNOWLEDGE_RESPONSE)
    );
    assert_eq!(messenger.pending_count(), 0);
    assert_eq!(messenger.metrics().snapshot().acks_confirmed, 0);
}

#[tokio::test]
async fn test_undersized_and_unknown_packets_are_dropped() {
    let messenger = Messenger::new(Arc::new(MessageTypeRegistry::new())).unwrap();
    let (writer, _reader) = tokio::io::duplex(1024);
    let sender = Recipient::stream(writer, FrameCodec::default(), None);

    let short = bytes::Bytes::from_static(&[0xFF, 0xFF]);
    assert_eq!(
        messenger.handle(short, &sender).await,
        Dispatch::Dropped(DropReason::Undersized(2))
    );
    let unknown = Packet::new(77, Vec::<u8>::new());
    assert_eq!(
        messenger.handle(unknown.to_bytes(), &sender).await,
        Dispatch::Dropped(DropReason::UnknownType(77))
    );
}
