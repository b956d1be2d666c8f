use anyhow::{Context, Result};
use boxcat_core::config::ClientConfig;
use boxcat_protocol::{Connection, ConnectionOptions, Message};
use tracing::info;

/// Register, join `channel` and quit without waiting for any reply.
///
/// Exercises a server's handling of a client that disappears while its
/// registration and join are still being processed.
pub async fn run(
    host: &str,
    port: u16,
    nick: &str,
    channel: &str,
    client_config: &ClientConfig,
) -> Result<()> {
    let options = ConnectionOptions::from_config(client_config);
    let mut conn = Connection::dial(host, port, &options, nick)
        .await
        .with_context(|| format!("error connecting to {host}:{port}"))?;

    let messages = [
        Message::new("NICK", [nick]),
        Message::new("USER", [nick, "0", "*", nick]),
        Message::new("JOIN", [channel]),
        Message::new("QUIT", ["bye bye"]),
    ];
    for message in &messages {
        conn.write_message(message).await?;
    }

    conn.close().await?;
    info!("client {}: sent registration, join and quit to {}:{}", nick, host, port);
    Ok(())
}
