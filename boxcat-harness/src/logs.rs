//! Pass-through logging of the server's output streams.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Spawn a task that logs each non-empty trimmed line of `stream` as
/// `<prefix>: <line>` until the stream closes.
///
/// A read error other than closure ends the whole process.
pub fn spawn_log_drain<R>(prefix: String, stream: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = drain_lines(stream, |line| info!("{}: {}", prefix, line)).await {
            error!("{}: error reading stream: {}", prefix, e);
            std::process::exit(1);
        }
    })
}

/// Feed each non-empty trimmed line to `emit`. Invalid UTF-8 is replaced.
pub async fn drain_lines<R, F>(stream: R, mut emit: F) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if !line.is_empty() {
            emit(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_drain_skips_blank_lines() {
        let (mut tx, rx) = tokio::io::duplex(256);
        tx.write_all(b"  first line \n\n   \nsecond\r\nno newline").await.unwrap();
        drop(tx);

        let mut seen = Vec::new();
        drain_lines(rx, |line| seen.push(line.to_string()))
            .await
            .unwrap();
        assert_eq!(seen, vec!["first line", "second", "no newline"]);
    }

    #[tokio::test]
    async fn test_spawned_drain_finishes_on_close() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let task = spawn_log_drain("stub stdout".to_string(), rx);
        tx.write_all(b"hello\n").await.unwrap();
        drop(tx);
        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
