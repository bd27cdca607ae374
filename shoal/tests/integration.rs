//! End-to-end tests against scripted in-process servers.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use shoal::{Config, Dialect, Error, MemcacheClient, MemcacheStatus, ReconnectPolicy};

fn base_config() -> shoal::ConfigBuilder {
    Config::builder()
        .connect_timeout(Duration::from_secs(1))
        .request_timeout(Duration::from_secs(2))
        .reconnect(ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            attempts_per_round: 3,
        })
}

async fn listen() -> (TcpListener, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Accumulate until one CRLF-terminated line is buffered and return it
/// without the terminator.
async fn next_line(socket: &mut TcpStream, buf: &mut BytesMut) -> String {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(pos + 2);
            return String::from_utf8_lossy(&line[..pos]).into_owned();
        }
        assert_ne!(socket.read_buf(buf).await.unwrap(), 0, "peer closed early");
    }
}

/// Answer the connection probe every textual-dialect connection opens
/// with.
async fn answer_probe(socket: &mut TcpStream, buf: &mut BytesMut) {
    let line = next_line(socket, buf).await;
    assert_eq!(line, "version");
    socket.write_all(b"VERSION 1.6.9\r\n").await.unwrap();
}

/// Read one complete binary frame (header plus body) and return it.
async fn next_frame(socket: &mut TcpStream, buf: &mut BytesMut) -> Vec<u8> {
    loop {
        if buf.len() >= 24 {
            let body = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
            if buf.len() >= 24 + body {
                return buf.split_to(24 + body).to_vec();
            }
        }
        assert_ne!(socket.read_buf(buf).await.unwrap(), 0, "peer closed early");
    }
}

/// Answer the noop a credential-less binary connection opens with.
async fn answer_noop(socket: &mut TcpStream, buf: &mut BytesMut) {
    let frame = next_frame(socket, buf).await;
    assert_eq!(frame[1], 0x0a, "expected noop");
    socket
        .write_all(&binary_reply(0x0a, 0x0000, &[], b"", 0))
        .await
        .unwrap();
}

fn binary_reply(opcode: u8, status: u16, extras: &[u8], value: &[u8], cas: u64) -> Vec<u8> {
    let mut frame = vec![0u8; 24];
    frame[0] = 0x81;
    frame[1] = opcode;
    frame[4] = extras.len() as u8;
    frame[6..8].copy_from_slice(&status.to_be_bytes());
    frame[8..12].copy_from_slice(&((extras.len() + value.len()) as u32).to_be_bytes());
    frame[16..24].copy_from_slice(&cas.to_be_bytes());
    frame.extend_from_slice(extras);
    frame.extend_from_slice(value);
    frame
}

#[tokio::test]
async fn ascii_pipeline_resolves_in_fifo_order() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        answer_probe(&mut socket, &mut buf).await;

        let mut commands = Vec::new();
        for _ in 0..3 {
            commands.push(next_line(&mut socket, &mut buf).await);
        }
        assert_eq!(commands, ["get k1", "get k2", "get k3"]);

        // One write answering all three: hit, miss, hit.
        socket
            .write_all(b"VALUE k1 0 2\r\nv1\r\nEND\r\nEND\r\nVALUE k3 0 2\r\nv3\r\nEND\r\n")
            .await
            .unwrap();
    });

    let client = MemcacheClient::new(
        base_config().server(addr).dialect(Dialect::Ascii).build().unwrap(),
    );
    client.await_connected().await.unwrap();

    let (r1, r2, r3) = tokio::join!(client.get("k1"), client.get("k2"), client.get("k3"));
    assert_eq!(r1.unwrap().unwrap().data.as_ref(), b"v1");
    assert!(r2.unwrap().is_none());
    assert_eq!(r3.unwrap().unwrap().data.as_ref(), b"v3");
}

#[tokio::test]
async fn ascii_set_get_roundtrip() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        answer_probe(&mut socket, &mut buf).await;

        assert_eq!(next_line(&mut socket, &mut buf).await, "set greeting 0 300 5");
        assert_eq!(next_line(&mut socket, &mut buf).await, "hello");
        socket.write_all(b"STORED\r\n").await.unwrap();

        assert_eq!(next_line(&mut socket, &mut buf).await, "get greeting");
        socket
            .write_all(b"VALUE greeting 0 5\r\nhello\r\nEND\r\n")
            .await
            .unwrap();
    });

    let client = MemcacheClient::new(
        base_config().server(addr).dialect(Dialect::Ascii).build().unwrap(),
    );
    client.await_connected().await.unwrap();

    assert_eq!(
        client.set("greeting", "hello", 300).await.unwrap(),
        MemcacheStatus::Ok
    );
    let value = client.get("greeting").await.unwrap().unwrap();
    assert_eq!(value.data.as_ref(), b"hello");
}

#[tokio::test]
async fn gets_carries_cas_tokens() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        answer_probe(&mut socket, &mut buf).await;

        assert_eq!(next_line(&mut socket, &mut buf).await, "gets k1 k2");
        socket
            .write_all(b"VALUE k1 0 2 11\r\nv1\r\nVALUE k2 7 2 22\r\nv2\r\nEND\r\n")
            .await
            .unwrap();
    });

    let client = MemcacheClient::new(
        base_config().server(addr).dialect(Dialect::Ascii).build().unwrap(),
    );
    client.await_connected().await.unwrap();

    let values = client.gets(&[b"k1", b"k2"]).await.unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(values[0].cas, 11);
    assert_eq!(values[1].cas, 22);
    assert_eq!(values[1].flags, 7);
}

#[tokio::test]
async fn flush_broadcast_merges_first_non_ok() {
    let (listener_a, addr_a) = listen().await;
    let (listener_b, addr_b) = listen().await;

    let flush_server = |listener: TcpListener, reply: &'static [u8]| async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        answer_probe(&mut socket, &mut buf).await;
        assert_eq!(next_line(&mut socket, &mut buf).await, "flush_all 0");
        socket.write_all(reply).await.unwrap();
        // Hold the socket open so the connection stays ready.
        let _ = socket.read_buf(&mut buf).await;
    };
    tokio::spawn(flush_server(listener_a, b"OK\r\n"));
    tokio::spawn(flush_server(listener_b, b"SERVER_ERROR out of memory\r\n"));

    let client = MemcacheClient::new(
        base_config()
            .server(addr_a)
            .server(addr_b)
            .dialect(Dialect::Ascii)
            .build()
            .unwrap(),
    );
    client.await_fully_connected().await.unwrap();

    assert_eq!(
        client.flush_all(0).await.unwrap(),
        MemcacheStatus::ServerError
    );
}

#[tokio::test]
async fn flush_broadcast_is_ok_when_every_shard_is_ok() {
    let (listener_a, addr_a) = listen().await;
    let (listener_b, addr_b) = listen().await;

    let flush_server = |listener: TcpListener| async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        answer_probe(&mut socket, &mut buf).await;
        assert_eq!(next_line(&mut socket, &mut buf).await, "flush_all 10");
        socket.write_all(b"OK\r\n").await.unwrap();
        let _ = socket.read_buf(&mut buf).await;
    };
    tokio::spawn(flush_server(listener_a));
    tokio::spawn(flush_server(listener_b));

    let client = MemcacheClient::new(
        base_config()
            .server(addr_a)
            .server(addr_b)
            .dialect(Dialect::Ascii)
            .build()
            .unwrap(),
    );
    client.await_fully_connected().await.unwrap();

    assert_eq!(client.flush_all(10).await.unwrap(), MemcacheStatus::Ok);
}

#[tokio::test]
async fn flush_broadcast_short_circuits_on_connection_loss() {
    let (listener_a, addr_a) = listen().await;
    let (listener_b, addr_b) = listen().await;

    tokio::spawn(async move {
        let (mut socket, _) = listener_a.accept().await.unwrap();
        let mut buf = BytesMut::new();
        answer_probe(&mut socket, &mut buf).await;
        assert_eq!(next_line(&mut socket, &mut buf).await, "flush_all 0");
        socket.write_all(b"OK\r\n").await.unwrap();
        let _ = socket.read_buf(&mut buf).await;
    });
    tokio::spawn(async move {
        let (mut socket, _) = listener_b.accept().await.unwrap();
        let mut buf = BytesMut::new();
        answer_probe(&mut socket, &mut buf).await;
        // Die instead of answering the flush.
        let _ = next_line(&mut socket, &mut buf).await;
        drop(socket);
    });

    let client = MemcacheClient::new(
        base_config()
            .server(addr_a)
            .server(addr_b)
            .dialect(Dialect::Ascii)
            .build()
            .unwrap(),
    );
    client.await_fully_connected().await.unwrap();

    assert!(matches!(
        client.flush_all(0).await.unwrap_err(),
        Error::ConnectionReset
    ));
}

#[tokio::test]
async fn binary_second_credential_wins() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();

        let first = next_frame(&mut socket, &mut buf).await;
        assert_eq!(first[1], 0x21, "expected sasl auth");
        assert!(first.ends_with(b"\0app\0wrong"));
        socket
            .write_all(&binary_reply(0x21, 0x0020, &[], b"Auth failure.", 0))
            .await
            .unwrap();

        let second = next_frame(&mut socket, &mut buf).await;
        assert!(second.ends_with(b"\0app\0right"));
        socket
            .write_all(&binary_reply(0x21, 0x0000, &[], b"Authenticated", 0))
            .await
            .unwrap();

        let _ = socket.read_buf(&mut buf).await;
    });

    let client = MemcacheClient::new(
        base_config()
            .server(addr)
            .credential("app", "wrong")
            .credential("app", "right")
            .build()
            .unwrap(),
    );
    client.await_connected().await.unwrap();
}

#[tokio::test]
async fn binary_exhausted_credentials_never_reach_ready() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut buf = BytesMut::new();
            let _ = next_frame(&mut socket, &mut buf).await;
            let _ = socket
                .write_all(&binary_reply(0x21, 0x0020, &[], b"Auth failure.", 0))
                .await;
        }
    });

    let client = MemcacheClient::new(
        base_config()
            .server(addr)
            .credential("app", "wrong")
            .build()
            .unwrap(),
    );
    let err = client.await_connected().await.unwrap_err();
    assert!(matches!(err, Error::Authentication(_)));

    // Operations after the terminal auth failure fail the same way.
    let err = client.get("k").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Authentication(_) | Error::ShardUnavailable(_)
    ));
}

#[tokio::test]
async fn credential_less_binary_client_fails_against_sasl_server() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            // Enforce SASL: even the opening noop is refused.
            let mut buf = BytesMut::new();
            let _ = next_frame(&mut socket, &mut buf).await;
            let _ = socket
                .write_all(&binary_reply(0x0a, 0x0020, &[], b"Auth failure.", 0))
                .await;
        }
    });

    let client = MemcacheClient::new(base_config().server(addr).build().unwrap());
    let err = client.await_connected().await.unwrap_err();
    assert!(matches!(err, Error::Authentication(_)));
}

#[tokio::test]
async fn ascii_dialect_against_auth_demanding_server_fails_fast() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut buf = BytesMut::new();
            let _ = next_line(&mut socket, &mut buf).await;
            let _ = socket
                .write_all(b"CLIENT_ERROR authentication required\r\n")
                .await;
        }
    });

    let client = MemcacheClient::new(
        base_config().server(addr).dialect(Dialect::Ascii).build().unwrap(),
    );
    let err = client.await_connected().await.unwrap_err();
    assert!(matches!(err, Error::Authentication(_)));
}

#[tokio::test]
async fn dropped_connection_fails_every_inflight_request_once() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        answer_probe(&mut socket, &mut buf).await;
        for _ in 0..3 {
            let _ = next_line(&mut socket, &mut buf).await;
        }
        // Drop with three requests in flight and nothing answered.
        drop(socket);
    });

    let client = MemcacheClient::new(
        base_config().server(addr).dialect(Dialect::Ascii).build().unwrap(),
    );
    client.await_connected().await.unwrap();

    let (r1, r2, r3) = tokio::join!(client.get("k1"), client.get("k2"), client.get("k3"));
    for result in [r1, r2, r3] {
        assert!(matches!(result.unwrap_err(), Error::ConnectionReset));
    }
}

#[tokio::test]
async fn binary_set_get_roundtrip() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        answer_noop(&mut socket, &mut buf).await;

        let set = next_frame(&mut socket, &mut buf).await;
        assert_eq!(set[1], 0x01);
        assert!(set.ends_with(b"greetinghello"));
        socket
            .write_all(&binary_reply(0x01, 0x0000, &[], b"", 9))
            .await
            .unwrap();

        let get = next_frame(&mut socket, &mut buf).await;
        assert_eq!(get[1], 0x00);
        socket
            .write_all(&binary_reply(0x00, 0x0000, &5u32.to_be_bytes(), b"hello", 9))
            .await
            .unwrap();
    });

    let client = MemcacheClient::new(base_config().server(addr).build().unwrap());
    client.await_connected().await.unwrap();

    assert_eq!(
        client.set("greeting", "hello", 300).await.unwrap(),
        MemcacheStatus::Ok
    );
    let value = client.get("greeting").await.unwrap().unwrap();
    assert_eq!(value.data.as_ref(), b"hello");
    assert_eq!(value.flags, 5);
}

#[tokio::test]
async fn binary_gets_pipelines_per_key_and_stitches_results() {
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        answer_noop(&mut socket, &mut buf).await;

        // Two keyed gets, answered hit then miss.
        let first = next_frame(&mut socket, &mut buf).await;
        assert_eq!(first[1], 0x0c, "expected getk");
        let second = next_frame(&mut socket, &mut buf).await;
        assert_eq!(second[1], 0x0c);

        socket
            .write_all(&binary_reply(0x0c, 0x0000, &0u32.to_be_bytes(), b"v1", 31))
            .await
            .unwrap();
        socket
            .write_all(&binary_reply(0x0c, 0x0001, &[], b"Not found", 0))
            .await
            .unwrap();
    });

    let client = MemcacheClient::new(base_config().server(addr).build().unwrap());
    client.await_connected().await.unwrap();

    let values = client.gets(&[b"k1", b"k2"]).await.unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].key.as_ref(), b"k1");
    assert_eq!(values[0].data.as_ref(), b"v1");
    assert_eq!(values[0].cas, 31);
}

#[tokio::test]
async fn shard_unavailable_while_owner_reconnects() {
    // One healthy server, one that never accepts.
    let (listener, addr_up) = listen().await;
    let (down_listener, addr_down) = listen().await;
    drop(down_listener);

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();
        answer_probe(&mut socket, &mut buf).await;
        loop {
            let line = next_line(&mut socket, &mut buf).await;
            assert!(line.starts_with("get "));
            socket.write_all(b"END\r\n").await.unwrap();
        }
    });

    // Slow backoff keeps the dead shard in the ring for the whole test.
    let client = MemcacheClient::new(
        base_config()
            .server(addr_up)
            .server(addr_down)
            .dialect(Dialect::Ascii)
            .reconnect(ReconnectPolicy {
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(2),
                attempts_per_round: 10,
            })
            .build()
            .unwrap(),
    );
    client.await_connected().await.unwrap();

    // Before the dead shard is excluded from the ring, keys it owns fail
    // loudly instead of silently moving to the healthy shard.
    let mut saw_unavailable = false;
    let mut saw_miss = false;
    for i in 0..64 {
        match client.get(format!("key-{i}").into_bytes()).await {
            Ok(None) => saw_miss = true,
            Err(Error::ShardUnavailable(addr)) => {
                assert_eq!(addr, addr_down);
                saw_unavailable = true;
            }
            other => panic!("unexpected result: {other:?}"),
        }
        if saw_unavailable && saw_miss {
            break;
        }
    }
    assert!(saw_miss, "healthy shard never served a key");
    assert!(saw_unavailable, "dead shard never reported unavailable");
}
