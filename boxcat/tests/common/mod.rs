//! Harness configs that launch the stub server, and queue helpers.

#![allow(dead_code)]

use boxcat_core::config::{ClientConfig, HarnessConfig, LaunchConfig, ListenStrategy, ServerConfig};
use boxcat_protocol::{ClientChannels, ClientRuntime, Message};
use camino::Utf8PathBuf;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

pub const WAIT: Duration = Duration::from_secs(5);

pub const SERVER_NAME: &str = "irc.boxcat.test";

/// Config for the stub server. `ping_interval_ms` of 0 turns off server PINGs.
pub fn stub_config(strategy: ListenStrategy, ping_interval_ms: u64) -> HarnessConfig {
    HarnessConfig {
        server: ServerConfig {
            directory: Utf8PathBuf::from(env!("CARGO_MANIFEST_DIR")),
            binary: Utf8PathBuf::from(env!("CARGO_BIN_EXE_boxcat-stub-ircd")),
            args: vec![
                "--ping-interval-ms".to_string(),
                ping_interval_ms.to_string(),
            ],
            conf_flag: "--conf".to_string(),
            listen_fd_flag: "--listen-fd".to_string(),
            name: SERVER_NAME.to_string(),
        },
        build: None,
        launch: LaunchConfig {
            strategy,
            ..LaunchConfig::default()
        },
        client: ClientConfig::default(),
    }
}

pub async fn connect(nick: &str, port: u16) -> (ClientRuntime, ClientChannels) {
    let mut client = ClientRuntime::new(nick, "127.0.0.1", port);
    let channels = client.start().await.unwrap();
    (client, channels)
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
