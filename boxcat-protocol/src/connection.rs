//! Line-oriented TCP connection with independent read and write deadlines.
//!
//! A [`Connection`] can be used whole (for simple scripted clients) or split
//! into a [`ConnectionReader`] and a [`ConnectionWriter`] so that the two
//! directions can be driven from different tasks.

use boxcat_core::config::ClientConfig;
use boxcat_core::error::{BoxcatError, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::message::{Message, parse_message};

#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub dial_timeout: Duration,
    pub keepalive: Duration,
    /// Deadline for a single line read; expiry is not an error
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            dial_timeout: config.dial_timeout(),
            keepalive: config.keepalive(),
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
        }
    }
}

pub struct Connection {
    reader: ConnectionReader,
    writer: ConnectionWriter,
}

pub struct ConnectionReader {
    inner: BufReader<OwnedReadHalf>,
    // Bytes of a line whose read hit the deadline before the newline arrived
    pending: Vec<u8>,
    timeout: Duration,
    label: String,
}

pub struct ConnectionWriter {
    inner: BufWriter<OwnedWriteHalf>,
    timeout: Duration,
    label: String,
}

impl Connection {
    /// Dial `host:port`. `label` identifies the connection in logs.
    pub async fn dial(host: &str, port: u16, options: &ConnectionOptions, label: &str) -> Result<Self> {
        let address = format!("{host}:{port}");
        let stream = timeout(options.dial_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| BoxcatError::Connection(format!("error dialing {address}: timed out")))?
            .map_err(|e| BoxcatError::Connection(format!("error dialing {address}: {e}")))?;

        configure_socket(&stream, options.keepalive)
            .map_err(|e| BoxcatError::Connection(format!("error configuring socket: {e}")))?;

        debug!("{}: connected to {}", label, address);
        Ok(Self::from_stream(stream, options, label))
    }

    pub fn from_stream(stream: TcpStream, options: &ConnectionOptions, label: &str) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: ConnectionReader {
                inner: BufReader::new(read_half),
                pending: Vec::new(),
                timeout: options.read_timeout,
                label: label.to_string(),
            },
            writer: ConnectionWriter {
                inner: BufWriter::new(write_half),
                timeout: options.write_timeout,
                label: label.to_string(),
            },
        }
    }

    pub fn into_split(self) -> (ConnectionReader, ConnectionWriter) {
        (self.reader, self.writer)
    }

    pub async fn read_message(&mut self) -> Result<Option<Message>> {
        self.reader.read_message().await
    }

    pub async fn write_message(&mut self, message: &Message) -> Result<()> {
        self.writer.write_message(message).await
    }

    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await
    }
}

fn configure_socket(stream: &TcpStream, keepalive: Duration) -> std::io::Result<()> {
    use socket2::SockRef;

    stream.set_nodelay(true)?;

    let sock_ref = SockRef::from(stream);

    #[allow(unused_mut)]
    let mut params = socket2::TcpKeepalive::new().with_time(keepalive);

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "windows"))]
    {
        params = params.with_interval(keepalive);
    }

    sock_ref.set_tcp_keepalive(&params)
}

impl ConnectionReader {
    /// Read one `\n`-terminated line.
    ///
    /// Returns `Ok(None)` when the read deadline expires first. Partial data
    /// is kept and completed by the next call.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let read = timeout(self.timeout, self.inner.read_until(b'\n', &mut self.pending)).await;

        match read {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(BoxcatError::Read(format!("error reading line: {e}"))),
            Ok(Ok(0)) => Err(BoxcatError::ConnectionClosed),
            Ok(Ok(_)) if !self.pending.ends_with(b"\n") => Err(BoxcatError::ConnectionClosed),
            Ok(Ok(_)) => {
                let bytes = std::mem::take(&mut self.pending);
                let line = String::from_utf8_lossy(&bytes).into_owned();
                debug!("client {}: read: {}", self.label, line.trim_end_matches(['\r', '\n']));
                Ok(Some(line))
            }
        }
    }

    /// Read and parse one message. Truncation is logged and tolerated.
    pub async fn read_message(&mut self) -> Result<Option<Message>> {
        let Some(line) = self.read_line().await? else {
            return Ok(None);
        };

        let parsed = parse_message(&line).map_err(|e| {
            BoxcatError::Codec(format!(
                "unable to parse message: {}: {e}",
                line.trim_end_matches(['\r', '\n'])
            ))
        })?;
        if parsed.truncated {
            warn!("client {}: received message was truncated", self.label);
        }

        Ok(Some(parsed.message))
    }
}

impl ConnectionWriter {
    /// Encode, write and flush one message under the write deadline.
    pub async fn write_message(&mut self, message: &Message) -> Result<()> {
        let encoded = message
            .encode()
            .map_err(|e| BoxcatError::Codec(format!("unable to encode message: {e}")))?;
        if encoded.truncated {
            warn!("client {}: sending truncated message", self.label);
        }

        let line = encoded.line;
        let inner = &mut self.inner;
        timeout(self.timeout, async {
            // write_all reports a short write as WriteZero
            inner.write_all(line.as_bytes()).await?;
            inner.flush().await
        })
        .await
        .map_err(|_| BoxcatError::Write("write deadline exceeded".to_string()))?
        .map_err(|e| BoxcatError::Write(e.to_string()))?;

        debug!("client {}: sent: {}", self.label, line.trim_end_matches(['\r', '\n']));
        Ok(())
    }

    /// Flush and shut down the write direction. A connection the peer has
    /// already reset counts as shut down.
    pub async fn shutdown(&mut self) -> Result<()> {
        let shutdown = timeout(self.timeout, self.inner.shutdown())
            .await
            .map_err(|_| BoxcatError::Write("shutdown deadline exceeded".to_string()))?;
        match shutdown {
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {
                debug!("client {}: already disconnected", self.label);
                Ok(())
            }
            result => Ok(result?),
        }
    }
}
