
use std::time::Duration;

use serde_json::{json, Value};
use socketio_client::{Client, Error, Transport, ON_DISCONNECT};
use tokio::sync::mpsc;

use fixture::spawn_server;

/// A transport with a ping cadence that stays out of the way and a short
/// handshake deadline.
fn transport() -> Transport {
    let mut transport = Transport::new();
    transport.ping_interval = Duration::from_secs(10);
    transport.ping_timeout = Duration::from_secs(2);
    transport
}

#[tokio::test]
async fn connect_waits_for_the_handshake() {
    let url = spawn_server(|mut server| async move {
        server.open().await;
        server.idle().await;
    })
    .await;

    let client = Client::connect(url, transport()).await.unwrap();
    assert_eq!(client.id().as_deref(), Some(fixture::SID));
    client.close();
}

#[tokio::test]
async fn connect_times_out_without_open() {
    let url = spawn_server(|server| async move {
        server.idle().await;
    })
    .await;

    let mut transport = transport();
    transport.ping_timeout = Duration::from_millis(200);

    let err = match Client::connect(url, transport).await {
        Ok(_) => panic!("connect should time out"),
        Err(err) => err,
    };
    assert!(matches!(err, Error::ConnectTimeout(_)));
}

#[tokio::test]
async fn server_events_reach_listeners() {
    let url = spawn_server(|mut server| async move {
        server.open().await;
        // the client signals readiness before the server emits
        assert_eq!(server.recv_data().await, r#"42,["ready"]"#);
        server.send(r#"42["stdout", "$ ls"]"#).await;
        server.idle().await;
    })
    .await;

    let client = Client::connect(url, transport()).await.unwrap();

    let (tx, mut rx) = mpsc::channel(1);
    client.on("stdout", move |line: String| {
        let _ = tx.try_send(line);
    });
    client.emit("ready", ()).await.unwrap();

    let line = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(line, "$ ls");
    client.close();
}

#[tokio::test]
async fn variadic_listeners_receive_all_arguments() {
    let url = spawn_server(|mut server| async move {
        server.open().await;
        assert_eq!(server.recv_data().await, r#"42,["ready"]"#);
        server.send(r#"42["tail","a",1,true]"#).await;
        server.idle().await;
    })
    .await;

    let client = Client::connect(url, transport()).await.unwrap();

    let (tx, mut rx) = mpsc::channel(1);
    client.on_variadic("tail", move |values| {
        let _ = tx.try_send(values);
    });
    client.emit("ready", ()).await.unwrap();

    let values = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(values, vec![json!("a"), json!(1), json!(true)]);
    client.close();
}

#[tokio::test]
async fn emit_writes_the_expected_frames() {
    let (frames_tx, mut frames_rx) = mpsc::channel(4);
    let url = spawn_server(move |mut server| async move {
        server.open().await;
        for _ in 0..3 {
            let _ = frames_tx.send(server.recv_data().await).await;
        }
        server.idle().await;
    })
    .await;

    let client = Client::connect(url, transport()).await.unwrap();
    client.emit("project", ("create", 7)).await.unwrap();
    client.emit("plain", json!({"id": 1})).await.unwrap();
    client.emit("ready", ()).await.unwrap();

    assert_eq!(frames_rx.recv().await.unwrap(), r#"42["project","create",7]"#);
    assert_eq!(frames_rx.recv().await.unwrap(), r#"42["plain",{"id":1}]"#);
    assert_eq!(frames_rx.recv().await.unwrap(), r#"42,["ready"]"#);
    client.close();
}

#[tokio::test]
async fn ack_round_trip() {
    let url = spawn_server(|mut server| async move {
        server.open().await;
        assert_eq!(server.recv_data().await, r#"421["book_hotel","JFK"]"#);
        server.send(r#"431[{"hotel":"JFK","status":"confirmed"}]"#).await;
        server.idle().await;
    })
    .await;

    let client = Client::connect(url, transport()).await.unwrap();

    let booking: Value = client.ack("book_hotel", "JFK").await.unwrap();
    assert_eq!(booking["status"], "confirmed");
    client.close();
}

#[tokio::test]
async fn cancelled_ack_releases_its_slot() {
    let url = spawn_server(|mut server| async move {
        server.open().await;
        // the first request is never answered
        assert!(server.recv_data().await.starts_with("421"));
        assert!(server.recv_data().await.starts_with("422"));
        server.send(r#"432["late reply"]"#).await;
        server.idle().await;
    })
    .await;

    let client = Client::connect(url, transport()).await.unwrap();

    let timed_out = tokio::time::timeout(
        Duration::from_millis(100),
        client.ack::<Value, _>("slow", "x"),
    )
    .await;
    assert!(timed_out.is_err());

    let reply: String = client.ack("fast", "y").await.unwrap();
    assert_eq!(reply, "late reply");
    client.close();
}

#[tokio::test]
async fn reply_handlers_answer_ack_requests() {
    let url = spawn_server(|mut server| async move {
        server.open().await;
        assert_eq!(server.recv_data().await, r#"42,["ready"]"#);
        server.send(r#"427["add",2,3]"#).await;
        assert_eq!(server.recv_data().await, "437[5]");
        server.send(r#"42["checked"]"#).await;
        server.idle().await;
    })
    .await;

    let client = Client::connect(url, transport()).await.unwrap();
    client.on_with_ack("add", |a: i64, b: i64| a + b);

    let (tx, mut rx) = mpsc::channel(1);
    client.on("checked", move || {
        let _ = tx.try_send(());
    });
    client.emit("ready", ()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    client.close();
}

#[tokio::test]
async fn heartbeat_runs_both_ways() {
    let url = spawn_server(|mut server| async move {
        server.open().await;
        // the client pings at its transport interval
        assert_eq!(server.recv().await, "2");
        // and answers server pings with a pong
        server.send("2").await;
        loop {
            if server.recv().await == "3" {
                break;
            }
        }
        server.send(r#"42["done"]"#).await;
        server.idle().await;
    })
    .await;

    let mut transport = transport();
    transport.ping_interval = Duration::from_millis(100);

    let client = Client::connect(url, transport).await.unwrap();
    let (tx, mut rx) = mpsc::channel(1);
    client.on("done", move || {
        let _ = tx.try_send(());
    });

    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    client.close();
}

#[tokio::test]
async fn namespaces_join_and_dispatch() {
    let url = spawn_server(|mut server| async move {
        server.open().await;
        assert_eq!(server.recv_data().await, "40/shell");
        server.send("40/shell,").await;
        assert_eq!(server.recv_data().await, r#"42/shell,["ready"]"#);
        server.send(r#"42/shell,["stdout", "$ ls"]"#).await;
        server.idle().await;
    })
    .await;

    let client = Client::connect(url, transport()).await.unwrap();
    let shell = client.of("/shell").await.unwrap();

    let (tx, mut rx) = mpsc::channel(1);
    shell.on("stdout", move |line: String| {
        let _ = tx.try_send(line);
    });
    shell.emit("ready", ()).await.unwrap();

    let line = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(line, "$ ls");
    assert!(shell.is_ready());
    assert_eq!(shell.listeners(), vec!["stdout".to_owned()]);

    // the handle is cached: no second join handshake goes out
    let again = client.of("/shell").await.unwrap();
    assert_eq!(again.name(), "/shell");
    client.close();
}

#[tokio::test]
async fn server_error_frames_fire_the_error_event() {
    let url = spawn_server(|mut server| async move {
        server.open().await;
        assert_eq!(server.recv_data().await, r#"42,["ready"]"#);
        server.send(r#"44["bad request"]"#).await;
        server.idle().await;
    })
    .await;

    let client = Client::connect(url, transport()).await.unwrap();

    let (tx, mut rx) = mpsc::channel(1);
    client.on_error(move |err| {
        let _ = tx.try_send(err.to_string());
    });
    client.emit("ready", ()).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(message.contains("error on method"));
    client.close();
}

#[tokio::test]
async fn binary_frames_are_reported_and_skipped() {
    let url = spawn_server(|mut server| async move {
        server.open().await;
        assert_eq!(server.recv_data().await, r#"42,["ready"]"#);
        server.send_binary(&[1, 2, 3]).await;
        server.send(r#"42["after-binary"]"#).await;
        server.idle().await;
    })
    .await;

    let client = Client::connect(url, transport()).await.unwrap();

    let (err_tx, mut err_rx) = mpsc::channel(1);
    client.on_error(move |err| {
        let _ = err_tx.try_send(err.to_string());
    });
    let (tx, mut rx) = mpsc::channel(1);
    client.on("after-binary", move || {
        let _ = tx.try_send(());
    });
    client.emit("ready", ()).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), err_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(message.contains("binary"));

    // the connection survives the binary frame
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    client.close();
}

#[tokio::test]
async fn close_is_idempotent_and_fires_disconnect() {
    let url = spawn_server(|mut server| async move {
        server.open().await;
        server.idle().await;
    })
    .await;

    let client = Client::connect(url, transport()).await.unwrap();

    let (tx, mut rx) = mpsc::channel(2);
    client.on(ON_DISCONNECT, move || {
        let _ = tx.try_send(());
    });

    client.close();
    client.close();

    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err());

    // writes after close fail instead of hanging
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(client.emit("late", ()).await, Err(Error::Closed)));
}

#[tokio::test]
async fn concurrent_emits_interleave_whole_packets() {
    let (frames_tx, mut frames_rx) = mpsc::channel(16);
    let url = spawn_server(move |mut server| async move {
        server.open().await;
        for _ in 0..10 {
            let _ = frames_tx.send(server.recv_data().await).await;
        }
        server.idle().await;
    })
    .await;

    let client = Client::connect(url, transport()).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..10i64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client.emit("count", i).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..10 {
        let frame = frames_rx.recv().await.unwrap();
        let (prefix, payload) = frame.split_at(2);
        assert_eq!(prefix, "42");
        let args: Value = serde_json::from_str(payload).unwrap();
        assert_eq!(args[0], "count");
        seen.push(args[1].as_i64().unwrap());
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..10).collect::<Vec<i64>>());
    client.close();
}
