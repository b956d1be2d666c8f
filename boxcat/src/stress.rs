//! Connection stress: many clients registering and quitting concurrently.

use anyhow::{Result, bail};
use boxcat_core::config::ClientConfig;
use boxcat_protocol::message::{ERR_NICKNAME_IN_USE, REPLY_WELCOME};
use boxcat_protocol::{ClientChannels, ClientRuntime, ConnectionOptions, Message};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Longest nick a server is expected to accept.
pub const MAX_NICK_LEN: usize = 15;

// How long to wait for the server to close the link after QUIT.
const QUIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct StressPlan {
    pub host: String,
    pub ports: Vec<u16>,
    pub per_port: usize,
    pub rounds: usize,
    pub nick: String,
}

/// The nick to try after `old` was rejected as in use.
///
/// Short nicks grow by one `a`. At the length limit the first byte below
/// `z` is bumped to its successor.
pub fn next_nick(old: &str) -> Result<String> {
    if old.len() < MAX_NICK_LEN {
        return Ok(format!("{old}a"));
    }

    let mut bytes = old.as_bytes().to_vec();
    match bytes.iter().position(|&b| b < b'z') {
        Some(i) => {
            bytes[i] += 1;
            Ok(String::from_utf8(bytes)?)
        }
        None => bail!("exhausted nicks"),
    }
}

pub async fn run(plan: StressPlan, client_config: &ClientConfig) -> Result<()> {
    let options = ConnectionOptions::from_config(client_config);
    let mut workers = JoinSet::new();

    for &port in &plan.ports {
        for worker in 0..plan.per_port {
            let host = plan.host.clone();
            let nick = format!("{}{}", plan.nick, worker);
            let rounds = plan.rounds;
            workers.spawn(async move {
                let mut nick = nick;
                let mut registered = 0usize;
                for round in 0..rounds {
                    match register_and_quit(&host, port, &nick, options).await {
                        Ok(final_nick) => {
                            registered += 1;
                            nick = final_nick;
                        }
                        Err(e) => warn!("{}:{} {} round {}: {:#}", host, port, nick, round, e),
                    }
                }
                registered
            });
        }
    }

    let attempts = plan.ports.len() * plan.per_port * plan.rounds;
    let mut registered = 0usize;
    while let Some(result) = workers.join_next().await {
        match result {
            Ok(count) => registered += count,
            Err(e) => warn!("stress worker failed: {}", e),
        }
    }

    info!("{} of {} registrations completed", registered, attempts);
    if registered < attempts {
        bail!("{} registrations failed", attempts - registered);
    }
    Ok(())
}

/// One registration: fall through nicks until welcomed, linger briefly,
/// then quit. Returns the nick the server accepted.
async fn register_and_quit(
    host: &str,
    port: u16,
    nick: &str,
    options: ConnectionOptions,
) -> Result<String> {
    let mut client = ClientRuntime::with_options(nick, host, port, options);
    let mut channels = client.start().await?;
    let mut nick = nick.to_string();

    let result = await_welcome_and_quit(&mut channels, &mut nick).await;

    client.stop().await?;
    while let Some(err) = channels.errors.recv().await {
        debug!("client {}: {}", nick, err);
    }

    result.map(|()| nick)
}

async fn await_welcome_and_quit(channels: &mut ClientChannels, nick: &mut String) -> Result<()> {
    while let Some(message) = channels.inbound.recv().await {
        match message.command.as_str() {
            ERR_NICKNAME_IN_USE => {
                *nick = next_nick(nick)?;
                debug!("nick in use, trying {}", nick);
                channels
                    .outbound
                    .send(Message::new("NICK", [nick.as_str()]))
                    .await?;
            }
            REPLY_WELCOME => {
                let linger = rand::random_range(0..1000u64);
                sleep(Duration::from_millis(linger)).await;
                channels.outbound.send(Message::new("QUIT", ["bye"])).await?;
                // Wait for the server to drop us.
                let _ = timeout(QUIT_GRACE, async {
                    while channels.inbound.recv().await.is_some() {}
                })
                .await;
                return Ok(());
            }
            _ => {}
        }
    }
    bail!("connection closed before registration completed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_nick_grows() {
        assert_eq!(next_nick("stress0").unwrap(), "stress0a");
        assert_eq!(next_nick("abcdefghijklmn").unwrap(), "abcdefghijklmna");
    }

    #[test]
    fn test_full_nick_bumps_first_byte_below_z() {
        assert_eq!(next_nick("abcdefghijklmno").unwrap(), "bbcdefghijklmno");
        assert_eq!(next_nick("zzzaaaaaaaaaaaa").unwrap(), "zzzbaaaaaaaaaaa");
        assert_eq!(next_nick("zzzzzzzzzzzzzzy").unwrap(), "zzzzzzzzzzzzzzz");
    }

    #[test]
    fn test_exhausted_nicks() {
        let err = next_nick("zzzzzzzzzzzzzzz").unwrap_err();
        assert_eq!(err.to_string(), "exhausted nicks");
    }

    #[test]
    fn test_sequence_stays_within_limit() {
        let mut nick = "n".to_string();
        for _ in 0..40 {
            nick = next_nick(&nick).unwrap();
            assert!(nick.len() <= MAX_NICK_LEN);
        }
    }
}
