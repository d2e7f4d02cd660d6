//! End-to-end broker tests over real sockets.
//!
//! A minimal raw-protocol client drives the broker exactly the way the
//! Matlab/Python clients do: length-prefixed frames, JSON metadata,
//! opaque payload bytes.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWrite};
use compio::net::TcpStream;
use serde_json::{json, Value};

use dime::{Endpoint, Server, ServerConfig, ServerEvent};
use dime_proto::codec::{self, FrameDecoder};
use dime_proto::command::MetaMap;
use dime_proto::RecvBuffer;

struct TestClient<S> {
    stream: S,
    recv: RecvBuffer,
    decoder: FrameDecoder,
}

impl<S> TestClient<S>
where
    S: AsyncRead + AsyncWrite,
{
    fn new(stream: S) -> Self {
        Self {
            stream,
            recv: RecvBuffer::new(),
            decoder: FrameDecoder::new(Default::default()),
        }
    }

    async fn send(&mut self, meta: Value, payload: &[u8]) {
        let map = match meta {
            Value::Object(m) => m,
            _ => unreachable!("test metadata must be an object"),
        };
        let meta_bytes = codec::encode_meta(&map).unwrap();
        codec::write_frame(
            &mut self.stream,
            meta_bytes,
            Bytes::copy_from_slice(payload),
        )
        .await
        .unwrap();
    }

    /// Write raw bytes, bypassing the framer (for framing-error tests).
    async fn send_raw(&mut self, bytes: &[u8]) {
        use compio::io::AsyncWriteExt;
        let BufResult(res, _) = self.stream.write_all(bytes.to_vec()).await;
        res.unwrap();
    }

    async fn read_frame(&mut self) -> (MetaMap, Bytes) {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.recv).unwrap() {
                return (frame.meta, frame.payload);
            }
            let buf = Vec::with_capacity(4096);
            let BufResult(res, buf) = self.stream.read(buf).await;
            let n = res.unwrap();
            assert!(n > 0, "connection closed while awaiting a frame");
            self.recv.push(Bytes::from(buf));
        }
    }

    /// True once the broker closes the connection.
    async fn closed_by_server(&mut self) -> bool {
        let buf = Vec::with_capacity(4096);
        let BufResult(res, _) = self.stream.read(buf).await;
        match res {
            Ok(0) | Err(_) => true,
            Ok(_) => false,
        }
    }

    async fn handshake(&mut self, serialization: &str) -> MetaMap {
        self.send(
            json!({"command": "handshake", "serialization": serialization, "tls": false}),
            b"",
        )
        .await;
        let (meta, _) = self.read_frame().await;
        meta
    }

    async fn join(&mut self, names: Value) {
        self.send(json!({"command": "join", "name": names}), b"").await;
        let (meta, _) = self.read_frame().await;
        assert_eq!(meta["status"], 0, "join failed: {meta:?}");
    }

    async fn leave(&mut self, names: Value) {
        self.send(json!({"command": "leave", "name": names}), b"")
            .await;
        let (meta, _) = self.read_frame().await;
        assert_eq!(meta["status"], 0, "leave failed: {meta:?}");
    }

    async fn send_var(&mut self, group: &str, varname: &str, payload: &[u8]) {
        self.send(
            json!({
                "command": "send",
                "name": group,
                "varname": varname,
                "serialization": "matlab",
            }),
            payload,
        )
        .await;
        let (meta, _) = self.read_frame().await;
        assert_eq!(meta["status"], 0, "send failed: {meta:?}");
    }

    async fn broadcast_var(&mut self, varname: &str, payload: &[u8]) {
        self.send(
            json!({
                "command": "broadcast",
                "varname": varname,
                "serialization": "matlab",
            }),
            payload,
        )
        .await;
        let (meta, _) = self.read_frame().await;
        assert_eq!(meta["status"], 0, "broadcast failed: {meta:?}");
    }

    /// Issue `sync` and collect envelopes until the sentinel (a frame
    /// with no `varname`).
    async fn sync(&mut self, n: i64) -> Vec<(MetaMap, Bytes)> {
        self.send(json!({"command": "sync", "n": n}), b"").await;
        let mut out = Vec::new();
        loop {
            let (meta, payload) = self.read_frame().await;
            if !meta.contains_key("varname") {
                assert_eq!(meta["status"], 0);
                return out;
            }
            out.push((meta, payload));
        }
    }

    async fn devices(&mut self) -> Vec<String> {
        self.send(json!({"command": "devices"}), b"").await;
        let (meta, _) = self.read_frame().await;
        assert_eq!(meta["status"], 0);
        meta["devices"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect()
    }
}

async fn start_tcp_broker(config: ServerConfig) -> (SocketAddr, dime::ServerHandle) {
    let mut server = Server::new(config);
    server
        .bind(&Endpoint::parse("tcp:127.0.0.1:0").unwrap())
        .await
        .unwrap();
    let addr = match &server.local_endpoints()[0] {
        Endpoint::Tcp(addr) => *addr,
        #[cfg(unix)]
        _ => unreachable!(),
    };
    let handle = server.handle();
    compio::runtime::spawn(async move {
        let _ = server.run().await;
    })
    .detach();
    (addr, handle)
}

async fn connect(addr: SocketAddr) -> TestClient<TcpStream> {
    TestClient::new(TcpStream::connect(addr).await.unwrap())
}

#[compio::test]
async fn handshake_then_devices_on_empty_server() {
    let (addr, _handle) = start_tcp_broker(ServerConfig::default()).await;

    let mut a = connect(addr).await;
    let reply = a.handshake("matlab").await;
    assert_eq!(reply["status"], 0);
    assert_eq!(reply["serialization"], "matlab");

    assert!(a.devices().await.is_empty());
}

#[compio::test]
async fn group_fanout_excludes_sender() {
    let (addr, _handle) = start_tcp_broker(ServerConfig::default()).await;

    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    let mut c = connect(addr).await;
    a.handshake("matlab").await;
    b.handshake("matlab").await;
    c.handshake("matlab").await;

    b.join(json!(["g1"])).await;
    c.join(json!(["g1"])).await;

    a.send_var("g1", "x", &[0x01, 0x02, 0x03]).await;

    for receiver in [&mut b, &mut c] {
        let envelopes = receiver.sync(-1).await;
        assert_eq!(envelopes.len(), 1);
        let (meta, payload) = &envelopes[0];
        assert_eq!(meta["varname"], "x");
        assert_eq!(meta["name"], "g1");
        assert_eq!(meta["serialization"], "matlab");
        assert_eq!(&payload[..], &[0x01, 0x02, 0x03]);
    }

    // The sender gets only the sentinel.
    assert!(a.sync(-1).await.is_empty());
}

#[compio::test]
async fn broadcast_excludes_sender() {
    let (addr, _handle) = start_tcp_broker(ServerConfig::default()).await;

    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    let mut c = connect(addr).await;
    a.handshake("matlab").await;
    b.handshake("matlab").await;
    c.handshake("matlab").await;

    a.broadcast_var("y", &[0xff]).await;

    for receiver in [&mut b, &mut c] {
        let envelopes = receiver.sync(-1).await;
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].0["varname"], "y");
        assert_eq!(&envelopes[0].1[..], &[0xff]);
    }
    assert!(a.sync(-1).await.is_empty());
}

#[compio::test]
async fn leave_removes_from_routing() {
    let (addr, _handle) = start_tcp_broker(ServerConfig::default()).await;

    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    a.handshake("matlab").await;
    b.handshake("matlab").await;

    a.join(json!(["g1"])).await;
    b.join(json!(["g1"])).await;
    b.leave(json!(["g1"])).await;

    a.send_var("g1", "x", b"data").await;

    assert!(b.sync(-1).await.is_empty());
}

#[compio::test]
async fn wait_wakes_on_delivery() {
    let (addr, _handle) = start_tcp_broker(ServerConfig::default()).await;

    let mut b = connect(addr).await;
    b.handshake("matlab").await;
    b.join(json!(["g1"])).await;

    // Wait blocks: no reply until something lands in the mailbox.
    b.send(json!({"command": "wait"}), b"").await;

    let mut a = connect(addr).await;
    a.handshake("matlab").await;
    a.join(json!(["g1"])).await;
    a.send_var("g1", "z", b"wake").await;

    let (meta, _) = b.read_frame().await;
    assert_eq!(meta["status"], 0);
    assert_eq!(meta["n"], 1);

    let envelopes = b.sync(-1).await;
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].0["varname"], "z");
}

#[compio::test]
async fn wait_returns_immediately_when_mail_is_pending() {
    let (addr, _handle) = start_tcp_broker(ServerConfig::default()).await;

    let mut b = connect(addr).await;
    b.handshake("matlab").await;
    b.join(json!(["g1"])).await;

    let mut a = connect(addr).await;
    a.handshake("matlab").await;
    a.send_var("g1", "x", b"1").await;

    b.send(json!({"command": "wait"}), b"").await;
    let (meta, _) = b.read_frame().await;
    assert_eq!(meta["n"], 1);
}

#[compio::test]
async fn disconnect_cleans_up_groups_and_routing() {
    let (addr, _handle) = start_tcp_broker(ServerConfig::default()).await;

    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    a.handshake("matlab").await;
    b.handshake("matlab").await;

    a.join(json!(["g1", "g2", "only-a"])).await;
    b.join(json!(["g1", "g2"])).await;

    drop(a);

    // Unregistration is asynchronous; poll until the broker notices.
    let mut devices = Vec::new();
    for _ in 0..200 {
        devices = b.devices().await;
        if !devices.iter().any(|d| d == "only-a") {
            break;
        }
        compio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(devices, vec!["g1".to_string(), "g2".to_string()]);

    // Sending to g1 no longer attempts delivery to the dead client.
    b.send_var("g1", "x", b"after").await;
    assert!(b.sync(-1).await.is_empty());
}

#[compio::test]
async fn sync_respects_count_and_preserves_order() {
    let (addr, _handle) = start_tcp_broker(ServerConfig::default()).await;

    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    a.handshake("matlab").await;
    b.handshake("matlab").await;
    b.join(json!("g1")).await; // single string form

    a.send_var("g1", "first", b"1").await;
    a.send_var("g1", "second", b"2").await;
    a.send_var("g1", "third", b"3").await;

    let first = b.sync(1).await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].0["varname"], "first");

    let rest = b.sync(-1).await;
    assert_eq!(rest.len(), 2);
    assert_eq!(rest[0].0["varname"], "second");
    assert_eq!(rest[1].0["varname"], "third");
}

#[compio::test]
async fn protocol_errors_leave_the_session_usable() {
    let (addr, _handle) = start_tcp_broker(ServerConfig::default()).await;

    let mut a = connect(addr).await;

    // Command before handshake.
    a.send(json!({"command": "devices"}), b"").await;
    let (meta, _) = a.read_frame().await;
    assert_eq!(meta["status"], -1);
    assert_eq!(meta["error"], "handshake required");

    // Handshake still works afterwards.
    let reply = a.handshake("pickle").await;
    assert_eq!(reply["serialization"], "pickle");

    // Unknown command.
    a.send(json!({"command": "transmogrify"}), b"").await;
    let (meta, _) = a.read_frame().await;
    assert_eq!(meta["status"], -1);

    // Missing required field.
    a.send(json!({"command": "send", "varname": "x", "serialization": "pickle"}), b"")
        .await;
    let (meta, _) = a.read_frame().await;
    assert_eq!(meta["status"], -1);

    // Second handshake is refused but not fatal.
    a.send(
        json!({"command": "handshake", "serialization": "pickle"}),
        b"",
    )
    .await;
    let (meta, _) = a.read_frame().await;
    assert_eq!(meta["status"], -1);

    // The session still serves real commands.
    assert!(a.devices().await.is_empty());
}

#[compio::test]
async fn join_is_idempotent_and_empty_lists_are_noops() {
    let (addr, _handle) = start_tcp_broker(ServerConfig::default()).await;

    let mut a = connect(addr).await;
    a.handshake("matlab").await;

    a.join(json!(["g1"])).await;
    a.join(json!(["g1"])).await;
    a.join(json!([])).await;
    a.leave(json!(["never-joined"])).await;

    assert_eq!(a.devices().await, vec!["g1".to_string()]);

    a.leave(json!(["g1"])).await;
    assert!(a.devices().await.is_empty());
}

#[compio::test]
async fn bad_magic_closes_the_connection() {
    let (addr, _handle) = start_tcp_broker(ServerConfig::default()).await;

    let mut a = connect(addr).await;
    a.handshake("matlab").await;

    a.send_raw(b"XXXX\x00\x00\x00\x02\x00\x00\x00\x00{}").await;
    assert!(a.closed_by_server().await);
}

#[compio::test]
async fn oversized_frame_closes_the_connection() {
    let config = ServerConfig::default()
        .with_frame_limits(dime::FrameLimits::default().with_max_frame(1024));
    let (addr, _handle) = start_tcp_broker(config).await;

    let mut a = connect(addr).await;
    let mut wire = Vec::new();
    wire.extend_from_slice(b"DiME");
    wire.extend_from_slice(&u32::MAX.to_be_bytes());
    wire.extend_from_slice(&0u32.to_be_bytes());
    a.send_raw(&wire).await;
    assert!(a.closed_by_server().await);
}

#[compio::test]
async fn pipelined_commands_are_served_in_order() {
    let (addr, _handle) = start_tcp_broker(ServerConfig::default()).await;

    let mut a = connect(addr).await;
    a.handshake("matlab").await;

    // Two frames in one burst; replies must come back in order.
    a.send(json!({"command": "join", "name": ["g1"]}), b"").await;
    a.send(json!({"command": "devices"}), b"").await;

    let (join_reply, _) = a.read_frame().await;
    assert_eq!(join_reply["status"], 0);
    let (devices_reply, _) = a.read_frame().await;
    assert_eq!(devices_reply["devices"], json!(["g1"]));
}

#[compio::test]
async fn monitor_observes_the_session_lifecycle() {
    let mut server = Server::new(ServerConfig::default());
    let monitor = server.monitor();
    server
        .bind(&Endpoint::parse("tcp:127.0.0.1:0").unwrap())
        .await
        .unwrap();
    let addr = match &server.local_endpoints()[0] {
        Endpoint::Tcp(addr) => *addr,
        #[cfg(unix)]
        _ => unreachable!(),
    };
    compio::runtime::spawn(async move {
        let _ = server.run().await;
    })
    .detach();

    assert!(matches!(
        monitor.recv_async().await.unwrap(),
        ServerEvent::Bound(_)
    ));

    let mut a = connect(addr).await;
    a.handshake("matlab").await;
    assert!(matches!(
        monitor.recv_async().await.unwrap(),
        ServerEvent::Accepted { .. }
    ));

    drop(a);
    assert!(matches!(
        monitor.recv_async().await.unwrap(),
        ServerEvent::SessionClosed { .. }
    ));
}

#[cfg(unix)]
#[compio::test]
async fn fanout_over_unix_socket() {
    let path = format!("/tmp/dime-test-{}.sock", std::process::id());
    let _ = std::fs::remove_file(&path);

    let mut server = Server::new(ServerConfig::default());
    server
        .bind(&Endpoint::parse(&format!("unix:{path}")).unwrap())
        .await
        .unwrap();
    compio::runtime::spawn(async move {
        let _ = server.run().await;
    })
    .detach();

    let mut a = TestClient::new(dime_core::ipc::connect(&path).await.unwrap());
    let mut b = TestClient::new(dime_core::ipc::connect(&path).await.unwrap());
    a.handshake("matlab").await;
    b.handshake("matlab").await;

    b.join(json!(["g1"])).await;
    a.send_var("g1", "x", &[1, 2, 3]).await;

    let envelopes = b.sync(-1).await;
    assert_eq!(envelopes.len(), 1);
    assert_eq!(&envelopes[0].1[..], &[1, 2, 3]);

    let _ = std::fs::remove_file(&path);
}

#[compio::test]
async fn shutdown_stops_accepting() {
    let (addr, handle) = start_tcp_broker(ServerConfig::default()).await;

    // Existing connections keep working.
    let mut a = connect(addr).await;
    a.handshake("matlab").await;

    handle.shutdown();
    compio::time::sleep(Duration::from_millis(50)).await;

    // The existing session still answers.
    assert!(a.devices().await.is_empty());

    // New connections are no longer served.
    match TcpStream::connect(addr).await {
        Err(_) => {}
        Ok(stream) => {
            let mut probe = TestClient::new(stream);
            probe
                .send(json!({"command": "handshake", "serialization": "matlab"}), b"")
                .await;
            assert!(probe.closed_by_server().await);
        }
    }
}
