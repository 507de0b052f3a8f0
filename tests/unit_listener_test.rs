//! End-to-end admin surface test: a real TCP client speaking RESP against a
//! running coordinator loop and listener.

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use vigil::core::protocol::{RespFrame, RespFrameCodec};
use vigil::watcher::addr::InstanceAddr;
use vigil::watcher::instance::PrimaryOptions;
use vigil::watcher::listener;
use vigil::watcher::scheduler::Coordinator;

fn command(parts: &[&str]) -> RespFrame {
    RespFrame::Array(
        parts
            .iter()
            .map(|p| RespFrame::BulkString(bytes::Bytes::copy_from_slice(p.as_bytes())))
            .collect(),
    )
}

async fn start_watcher() -> Framed<TcpStream, RespFrameCodec> {
    let announce = InstanceAddr {
        host: "127.0.0.1".into(),
        ip: Some("127.0.0.1".parse().unwrap()),
        port: 26379,
    };
    let (mut coordinator, admin) = Coordinator::new("ab01".repeat(10), announce, None);
    coordinator
        .registry
        .create_primary(
            "cache",
            InstanceAddr {
                host: "10.0.0.1".into(),
                ip: Some("10.0.0.1".parse().unwrap()),
                port: 6379,
            },
            PrimaryOptions::default(),
        )
        .unwrap();

    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(listener::serve(socket, admin));
    tokio::spawn(coordinator.run());

    let socket = TcpStream::connect(addr).await.unwrap();
    Framed::new(socket, RespFrameCodec)
}

#[tokio::test]
async fn ping_and_master_lookup_over_the_wire() {
    let mut client = start_watcher().await;

    client.send(command(&["PING"])).await.unwrap();
    let reply = client.next().await.unwrap().unwrap();
    assert_eq!(reply, RespFrame::SimpleString("PONG".into()));

    client
        .send(command(&["SENTINEL", "get-master-addr-by-name", "cache"]))
        .await
        .unwrap();
    let reply = client.next().await.unwrap().unwrap();
    assert_eq!(
        reply,
        RespFrame::Array(vec![
            RespFrame::BulkString(bytes::Bytes::from_static(b"10.0.0.1")),
            RespFrame::BulkString(bytes::Bytes::from_static(b"6379")),
        ])
    );
}

#[tokio::test]
async fn unknown_commands_get_resp_errors() {
    let mut client = start_watcher().await;

    client.send(command(&["SET", "k", "v"])).await.unwrap();
    let reply = client.next().await.unwrap().unwrap();
    assert!(matches!(reply, RespFrame::Error(ref e) if e.starts_with("ERR")));

    // The connection survives the error and keeps serving.
    client
        .send(command(&["SENTINEL", "masters"]))
        .await
        .unwrap();
    let reply = client.next().await.unwrap().unwrap();
    assert!(matches!(reply, RespFrame::Array(ref items) if items.len() == 1));
}

#[tokio::test]
async fn myid_returns_the_run_id() {
    let mut client = start_watcher().await;
    client.send(command(&["SENTINEL", "myid"])).await.unwrap();
    let reply = client.next().await.unwrap().unwrap();
    assert_eq!(
        reply,
        RespFrame::BulkString(bytes::Bytes::from("ab01".repeat(10)))
    );
}
