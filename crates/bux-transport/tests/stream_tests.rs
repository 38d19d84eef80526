//! Transport tests
//!
//! Framed connections over TCP and UNIX sockets: frame delivery, protocol
//! error surfacing, and disconnect events.

use std::time::Duration;

use bux_core::{codec, Message, MessageFormat};
use bux_transport::{
    connect_tcp, connect_unix, Acceptor, StreamEvent, TcpAcceptor, UnixAcceptor,
};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

fn test_message(text: &str) -> Message {
    Message {
        msg_type: "note".to_string(),
        content: json!(text),
        ..Default::default()
    }
}

fn unix_path(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("bux-transport-{tag}-{}.sock", std::process::id()))
}

async fn expect_frame(receiver: &mut bux_transport::FrameReceiver) -> Message {
    let event = timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("stream ended");

    match event {
        StreamEvent::Frame(frame) => codec::decode_message(&frame).unwrap(),
        other => panic!("expected Frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_tcp_echo() {
    let mut acceptor = TcpAcceptor::bind(0).await.unwrap();
    let addr = acceptor.local_addr().unwrap();

    let accept_task = tokio::spawn(async move {
        let (sender, mut receiver, _) = acceptor.accept().await.unwrap();
        if let Some(StreamEvent::Frame(frame)) = receiver.recv().await {
            let msg = codec::decode_message(&frame).unwrap();
            let bytes = codec::encode_message(frame.format, &msg).unwrap();
            sender.send(bytes).await.unwrap();
        }
        (sender, receiver)
    });

    let (sender, mut receiver) = connect_tcp("127.0.0.1", addr.port()).await.unwrap();

    let msg = test_message("hello tcp");
    let bytes = codec::encode_message(MessageFormat::Msgpack, &msg).unwrap();
    sender.send(bytes).await.unwrap();

    assert_eq!(expect_frame(&mut receiver).await, msg);
    let _ = accept_task.await;
}

#[tokio::test]
async fn test_unix_roundtrip() {
    let path = unix_path("roundtrip");
    let _ = std::fs::remove_file(&path);

    let mut acceptor = UnixAcceptor::bind(&path).unwrap();
    let accept_task = tokio::spawn(async move {
        let (sender, receiver, _) = acceptor.accept().await.unwrap();
        let msg = test_message("over the socket file");
        let bytes = codec::encode_message(MessageFormat::Json, &msg).unwrap();
        sender.send(bytes).await.unwrap();
        (sender, receiver)
    });

    let (_sender, mut receiver) = connect_unix(&path).await.unwrap();
    assert_eq!(
        expect_frame(&mut receiver).await,
        test_message("over the socket file")
    );

    let _ = accept_task.await;
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_protocol_error_does_not_kill_connection() {
    let mut acceptor = TcpAcceptor::bind(0).await.unwrap();
    let addr = acceptor.local_addr().unwrap();

    let accept_task = tokio::spawn(async move {
        let (sender, mut receiver, _) = acceptor.accept().await.unwrap();

        // A bad format tag first...
        let event = receiver.recv().await.unwrap();
        assert!(
            matches!(event, StreamEvent::Protocol(bux_core::Error::InvalidFormat(0x07))),
            "expected protocol error, got {event:?}"
        );

        // ...and a valid frame still gets through afterwards.
        let event = receiver.recv().await.unwrap();
        match event {
            StreamEvent::Frame(frame) => {
                assert_eq!(
                    codec::decode_message(&frame).unwrap(),
                    test_message("still alive")
                );
            }
            other => panic!("expected Frame, got {other:?}"),
        }

        (sender, receiver)
    });

    let mut raw = tokio::net::TcpStream::connect(addr).await.unwrap();
    raw.write_all(&[0x07]).await.unwrap();
    raw.write_all(&codec::encode_message(MessageFormat::Json, &test_message("still alive")).unwrap())
        .await
        .unwrap();

    timeout(Duration::from_secs(2), accept_task)
        .await
        .expect("server side timed out")
        .unwrap();
}

#[tokio::test]
async fn test_disconnect_event_on_peer_close() {
    let mut acceptor = TcpAcceptor::bind(0).await.unwrap();
    let addr = acceptor.local_addr().unwrap();

    let (client_sender, client_receiver) = connect_tcp("127.0.0.1", addr.port()).await.unwrap();
    let (_sender, mut receiver, _) = acceptor.accept().await.unwrap();

    // Dropping both client endpoints ends its I/O task and closes the socket.
    drop(client_sender);
    drop(client_receiver);

    let event = timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("timed out waiting for disconnect")
        .expect("stream ended without event");
    assert!(matches!(event, StreamEvent::Disconnected { .. }));
}

#[tokio::test]
async fn test_sender_close_reports_not_connected() {
    let mut acceptor = TcpAcceptor::bind(0).await.unwrap();
    let addr = acceptor.local_addr().unwrap();

    let (sender, _receiver) = connect_tcp("127.0.0.1", addr.port()).await.unwrap();
    let _server_side = acceptor.accept().await.unwrap();

    sender.close();
    assert!(!sender.is_connected());

    let bytes = codec::encode_message(MessageFormat::Json, &test_message("late")).unwrap();
    assert!(matches!(
        sender.try_send(bytes),
        Err(bux_transport::TransportError::NotConnected)
    ));
}
