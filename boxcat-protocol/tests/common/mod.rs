//! Scripted TCP peer for client runtime tests.
//!
//! `ScriptedServer` binds to an OS-assigned port; each accepted connection
//! is a `ScriptedPeer` the test drives line by line.

#![allow(dead_code)]

use boxcat_protocol::Message;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct ScriptedServer {
    listener: TcpListener,
    port: u16,
}

impl ScriptedServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn accept(&self) -> ScriptedPeer {
        let (stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("accept timed out")
            .expect("accept failed");
        let (read_half, write_half) = stream.into_split();
        ScriptedPeer {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }
}

pub struct ScriptedPeer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ScriptedPeer {
    /// Read one line with the terminator stripped; empty string on EOF.
    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        timeout(WAIT, self.reader.read_line(&mut line))
            .await
            .expect("read_line timed out")
            .expect("read_line IO error");
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    pub async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Consume and check the NICK/USER handshake.
    pub async fn expect_registration(&mut self, nick: &str) {
        assert_eq!(self.read_line().await, format!("NICK {nick}"));
        assert_eq!(self.read_line().await, format!("USER {nick} 0 * {nick}"));
    }
}

pub async fn recv<T>(rx: &mut mpsc::Receiver<T>) -> Option<T> {
    timeout(WAIT, rx.recv()).await.expect("queue recv timed out")
}

/// Wait for a message with the given command, skipping others.
pub async fn wait_for_command(rx: &mut mpsc::Receiver<Message>, command: &str) -> Message {
    loop {
        match recv(rx).await {
            Some(m) if m.command == command => return m,
            Some(_) => continue,
            None => panic!("inbound queue closed while waiting for {command}"),
        }
    }
}
