//! Concurrent IRC client runtime used to drive a server under test.
//!
//! [`ClientRuntime::start`] dials, registers and then spawns two loops:
//!
//! - the reader forwards every parsed message to the inbound queue and
//!   answers `PING` with `PONG` on the way;
//! - the writer sends whatever the caller puts on the outbound queue.
//!
//! Fatal errors from either loop land on the error queue. The error queue
//! closes once both loops have exited, so draining it after
//! [`ClientRuntime::stop`] always terminates.

use boxcat_core::error::{BoxcatError, Result};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionOptions, ConnectionReader, ConnectionWriter};
use crate::message::{CMD_PONG, Message};

/// Capacity of the inbound, outbound and error queues.
pub const QUEUE_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unstarted,
    Connecting,
    Registering,
    Running,
    Stopped,
}

/// The caller's ends of the runtime's queues.
#[derive(Debug)]
pub struct ClientChannels {
    /// Every message read from the server, in wire order. Closes when the
    /// reader loop exits.
    pub inbound: mpsc::Receiver<Message>,
    /// Messages to send to the server.
    pub outbound: mpsc::Sender<Message>,
    /// Fatal errors. Closes once both loops have exited.
    pub errors: mpsc::Receiver<BoxcatError>,
}

// Both loops write: the reader for PONG, the writer for caller traffic.
type SharedWriter = Arc<Mutex<ConnectionWriter>>;

struct Running {
    shutdown_tx: broadcast::Sender<()>,
    supervisor: JoinHandle<()>,
    writer: SharedWriter,
}

pub struct ClientRuntime {
    nick: String,
    host: String,
    port: u16,
    options: ConnectionOptions,
    state: ClientState,
    running: Option<Running>,
}

impl ClientRuntime {
    pub fn new(nick: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self::with_options(nick, host, port, ConnectionOptions::default())
    }

    pub fn with_options(
        nick: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            nick: nick.into(),
            host: host.into(),
            port,
            options,
            state: ClientState::Unstarted,
            running: None,
        }
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Connect, register and start the reader and writer loops.
    ///
    /// On error nothing is left running and no queues exist. The runtime
    /// cannot be started twice.
    pub async fn start(&mut self) -> Result<ClientChannels> {
        if self.state != ClientState::Unstarted {
            return Err(BoxcatError::InvalidState(format!(
                "client {} already started ({:?})",
                self.nick, self.state
            )));
        }

        self.state = ClientState::Connecting;
        let conn = match Connection::dial(&self.host, self.port, &self.options, &self.nick).await {
            Ok(conn) => conn,
            Err(e) => {
                self.state = ClientState::Stopped;
                return Err(e);
            }
        };

        self.state = ClientState::Registering;
        let (reader, mut writer) = conn.into_split();
        if let Err(e) = register(&mut writer, &self.nick).await {
            if let Err(close_err) = writer.shutdown().await {
                debug!("client {}: close after failed registration: {}", self.nick, close_err);
            }
            self.state = ClientState::Stopped;
            return Err(e);
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let writer: SharedWriter = Arc::new(Mutex::new(writer));

        let reader_task = tokio::spawn(reader_loop(
            self.nick.clone(),
            reader,
            writer.clone(),
            inbound_tx,
            errors_tx.clone(),
            shutdown_tx.subscribe(),
        ));
        let writer_task = tokio::spawn(writer_loop(
            self.nick.clone(),
            writer.clone(),
            outbound_rx,
            errors_tx.clone(),
            shutdown_tx.subscribe(),
        ));

        let nick = self.nick.clone();
        let supervisor = tokio::spawn(async move {
            for (name, task) in [("reader", reader_task), ("writer", writer_task)] {
                if let Err(e) = task.await {
                    error!("client {}: {} loop failed to complete: {}", nick, name, e);
                }
            }
            // Last sender: the error queue closes here.
            drop(errors_tx);
        });

        self.running = Some(Running {
            shutdown_tx,
            supervisor,
            writer,
        });
        self.state = ClientState::Running;
        info!("client {}: registered with {}:{}", self.nick, self.host, self.port);

        Ok(ClientChannels {
            inbound: inbound_rx,
            outbound: outbound_tx,
            errors: errors_rx,
        })
    }

    /// Signal both loops to stop, wait for them, and close the connection.
    ///
    /// Never blocks on the caller's queues: queued outbound messages are
    /// discarded and a full inbound queue does not hold up the reader.
    /// Calling it again is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            self.state = ClientState::Stopped;
            return Ok(());
        };

        // Err means both loops are already gone.
        let _ = running.shutdown_tx.send(());

        if let Err(e) = running.supervisor.await {
            error!("client {}: supervisor failed: {}", self.nick, e);
        }

        let result = running.writer.lock().await.shutdown().await;
        self.state = ClientState::Stopped;
        info!("client {}: stopped", self.nick);
        result
    }
}

impl Drop for ClientRuntime {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            let _ = running.shutdown_tx.send(());
        }
    }
}

/// Send the registration handshake: NICK, then USER.
async fn register(writer: &mut ConnectionWriter, nick: &str) -> Result<()> {
    writer
        .write_message(&Message::new("NICK", [nick]))
        .await
        .map_err(|e| BoxcatError::Registration(format!("failed to send NICK: {e}")))?;

    writer
        .write_message(&Message::new("USER", [nick, "0", "*", nick]))
        .await
        .map_err(|e| BoxcatError::Registration(format!("failed to send USER: {e}")))?;

    Ok(())
}

async fn reader_loop(
    nick: String,
    mut reader: ConnectionReader,
    writer: SharedWriter,
    inbound: mpsc::Sender<Message>,
    errors: mpsc::Sender<BoxcatError>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let read = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            read = reader.read_message() => read,
        };

        let message = match read {
            Ok(Some(message)) => message,
            // Read deadline expired; go round and look at the shutdown signal again.
            Ok(None) => continue,
            Err(e) => {
                warn!("client {}: error reading message: {}", nick, e);
                let _ = errors.send(e).await;
                break;
            }
        };

        if message.is_ping() {
            let pong = Message::new(CMD_PONG, message.params.first().cloned());
            if let Err(e) = writer.lock().await.write_message(&pong).await {
                warn!("client {}: error sending pong: {}", nick, e);
                let _ = errors.send(e).await;
                break;
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            sent = inbound.send(message) => {
                if sent.is_err() {
                    debug!("client {}: inbound receiver dropped", nick);
                }
            }
        }
    }

    debug!("client {}: reader loop done", nick);
}

async fn writer_loop(
    nick: String,
    writer: SharedWriter,
    mut outbound: mpsc::Receiver<Message>,
    errors: mpsc::Sender<BoxcatError>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if let Err(e) = writer.lock().await.write_message(&message).await {
            warn!("client {}: error writing message: {}", nick, e);
            let _ = errors.send(e).await;
            break;
        }
    }

    // Refuse further sends and throw away whatever is still queued.
    outbound.close();
    let mut discarded = 0usize;
    while outbound.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        debug!("client {}: discarded {} unsent messages", nick, discarded);
    }

    debug!("client {}: writer loop done", nick);
}
