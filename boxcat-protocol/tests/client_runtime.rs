//! Client runtime behaviour against a scripted server: registration order,
//! keep-alive replies, failure reporting and shutdown.

mod common;

use boxcat_core::BoxcatError;
use boxcat_protocol::{ClientRuntime, ClientState, Message};
use common::*;
use tokio::net::TcpListener;
use tokio::time::{Duration, timeout};

async fn started(server: &ScriptedServer, nick: &str) -> (ClientRuntime, boxcat_protocol::ClientChannels, ScriptedPeer) {
    let mut client = ClientRuntime::new(nick, "127.0.0.1", server.port());
    let (channels, peer) = tokio::join!(client.start(), server.accept());
    (client, channels.unwrap(), peer)
}

#[tokio::test]
async fn registration_precedes_caller_traffic() {
    let server = ScriptedServer::bind().await;
    let (mut client, channels, mut peer) = started(&server, "client1").await;
    assert_eq!(client.state(), ClientState::Running);

    channels
        .outbound
        .send(Message::new("JOIN", ["#test"]))
        .await
        .unwrap();

    peer.expect_registration("client1").await;
    assert_eq!(peer.read_line().await, "JOIN #test");

    client.stop().await.unwrap();
}

#[tokio::test]
async fn ping_is_answered_once_and_forwarded() {
    let server = ScriptedServer::bind().await;
    let (mut client, mut channels, mut peer) = started(&server, "client1").await;
    peer.expect_registration("client1").await;

    peer.send_line("PING :irc.example.org").await;
    assert_eq!(peer.read_line().await, "PONG irc.example.org");

    let ping = recv(&mut channels.inbound).await.unwrap();
    assert!(ping.is_ping());
    assert_eq!(ping.params, vec!["irc.example.org"]);

    // The next line on the wire is caller traffic, not a second PONG.
    channels
        .outbound
        .send(Message::new("PRIVMSG", ["client2", "after ping"]))
        .await
        .unwrap();
    assert_eq!(peer.read_line().await, "PRIVMSG client2 :after ping");

    client.stop().await.unwrap();
}

#[tokio::test]
async fn inbound_preserves_wire_order() {
    let server = ScriptedServer::bind().await;
    let (mut client, mut channels, mut peer) = started(&server, "client1").await;
    peer.expect_registration("client1").await;

    for i in 0..100 {
        peer.send_line(&format!(":irc.example.org NOTICE client1 :line {i}")).await;
    }
    for i in 0..100 {
        let m = recv(&mut channels.inbound).await.unwrap();
        assert_eq!(m.params[1], format!("line {i}"));
    }

    client.stop().await.unwrap();
}

#[tokio::test]
async fn messages_before_failure_are_delivered() {
    let server = ScriptedServer::bind().await;
    let (mut client, mut channels, mut peer) = started(&server, "client1").await;
    peer.expect_registration("client1").await;

    peer.send_line(":irc.example.org 001 client1 :Welcome").await;
    peer.send_line(":irc.example.org 002 client1 :Your host").await;
    peer.send_line(":irc.example.org 003 client1 :Created").await;
    drop(peer);

    let mut commands = Vec::new();
    while let Some(m) = recv(&mut channels.inbound).await {
        commands.push(m.command);
    }
    assert_eq!(commands, vec!["001", "002", "003"]);

    let err = recv(&mut channels.errors).await.unwrap();
    assert!(matches!(err, BoxcatError::ConnectionClosed), "got {err}");

    // Loops exiting on their own does not stop the runtime.
    assert_eq!(client.state(), ClientState::Running);
    let _ = client.stop().await;
    assert_eq!(client.state(), ClientState::Stopped);
    assert!(recv(&mut channels.errors).await.is_none());
}

#[tokio::test]
async fn unparseable_line_is_fatal() {
    let server = ScriptedServer::bind().await;
    let (mut client, mut channels, mut peer) = started(&server, "client1").await;
    peer.expect_registration("client1").await;

    peer.send_line(":irc.example.org 001 client1 :Welcome").await;
    peer.send_line("!!! not a message").await;
    peer.send_line(":irc.example.org 002 client1 :never seen").await;

    assert_eq!(recv(&mut channels.inbound).await.unwrap().command, "001");
    assert!(recv(&mut channels.inbound).await.is_none());

    let err = recv(&mut channels.errors).await.unwrap();
    assert!(matches!(err, BoxcatError::Codec(_)), "got {err}");

    client.stop().await.unwrap();
    assert!(recv(&mut channels.errors).await.is_none());
}

#[tokio::test]
async fn write_failure_ends_only_the_writer() {
    let server = ScriptedServer::bind().await;
    let (mut client, mut channels, mut peer) = started(&server, "client1").await;
    peer.expect_registration("client1").await;

    channels
        .outbound
        .send(Message::new("BAD CMD", ["x"]))
        .await
        .unwrap();
    let err = recv(&mut channels.errors).await.unwrap();
    assert!(matches!(err, BoxcatError::Codec(_)), "got {err}");

    // The reader keeps answering and forwarding.
    peer.send_line("PING :still-alive").await;
    assert_eq!(peer.read_line().await, "PONG still-alive");
    let ping = wait_for_command(&mut channels.inbound, "PING").await;
    assert_eq!(ping.params, vec!["still-alive"]);

    // The writer closes its queue on the way out.
    timeout(Duration::from_secs(2), async {
        while channels
            .outbound
            .send(Message::new("PRIVMSG", ["client2", "after failure"]))
            .await
            .is_ok()
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("outbound still accepting after writer failure");

    client.stop().await.unwrap();
    // Exactly one error, then the queue closes.
    assert!(recv(&mut channels.errors).await.is_none());
}

#[tokio::test]
async fn truncated_line_is_tolerated() {
    let server = ScriptedServer::bind().await;
    let (mut client, mut channels, mut peer) = started(&server, "client1").await;
    peer.expect_registration("client1").await;

    let long = "z".repeat(700);
    peer.send_line(&format!(":client2!u@h PRIVMSG client1 :{long}")).await;

    let m = recv(&mut channels.inbound).await.unwrap();
    assert_eq!(m.command, "PRIVMSG");
    assert!(m.params[1].len() < long.len());

    client.stop().await.unwrap();
    assert!(recv(&mut channels.errors).await.is_none());
}

#[tokio::test]
async fn stop_on_idle_connection_returns_promptly() {
    let server = ScriptedServer::bind().await;
    let (mut client, mut channels, _peer) = started(&server, "client1").await;

    timeout(Duration::from_secs(2), client.stop())
        .await
        .expect("stop hung")
        .unwrap();

    assert!(recv(&mut channels.inbound).await.is_none());
    assert!(recv(&mut channels.errors).await.is_none());
}

#[tokio::test]
async fn stop_with_pending_outbound_does_not_hang() {
    let server = ScriptedServer::bind().await;
    let (mut client, channels, _peer) = started(&server, "client1").await;

    let mut queued = 0;
    while channels
        .outbound
        .try_send(Message::new("PRIVMSG", ["client2", "queued"]))
        .is_ok()
    {
        queued += 1;
        if queued >= 2000 {
            break;
        }
    }
    assert!(queued > 0);

    timeout(Duration::from_secs(10), client.stop())
        .await
        .expect("stop hung")
        .unwrap();

    assert!(
        channels
            .outbound
            .send(Message::new("PRIVMSG", ["client2", "late"]))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn stop_with_undrained_inbound_does_not_hang() {
    let server = ScriptedServer::bind().await;
    let (mut client, _channels, mut peer) = started(&server, "client1").await;
    peer.expect_registration("client1").await;

    // More than the inbound queue holds, never read by the test.
    for i in 0..600 {
        peer.send_line(&format!("NOTICE client1 :{i}")).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    timeout(Duration::from_secs(5), client.stop())
        .await
        .expect("stop hung")
        .unwrap();
}

#[tokio::test]
async fn dial_failure_leaves_nothing_running() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut client = ClientRuntime::new("client1", "127.0.0.1", port);
    let err = client.start().await.unwrap_err();
    assert!(matches!(err, BoxcatError::Connection(_)), "got {err}");
    assert_eq!(client.state(), ClientState::Stopped);

    // stop on a runtime that never ran is harmless
    client.stop().await.unwrap();
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let server = ScriptedServer::bind().await;
    let (mut client, _channels, _peer) = started(&server, "client1").await;

    let err = client.start().await.unwrap_err();
    assert!(matches!(err, BoxcatError::InvalidState(_)));

    client.stop().await.unwrap();
    client.stop().await.unwrap();
}
