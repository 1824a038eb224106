use secstor_agent::SecondaryStorage;
use secstor_core::{Answer, Command};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

/// Accepts connections until interrupted. Each connection is a sequence of
/// command lines, each answered by one answer line.
pub async fn serve(storage: Arc<SecondaryStorage>, socket: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(socket).await {
        Ok(()) => tracing::debug!("Removed stale socket {:?}", socket),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let listener = UnixListener::bind(socket)?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let storage = storage.clone();
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    if let Err(e) = handle_connection(&storage, reader, writer).await {
                        tracing::warn!("Connection closed with error: {}", e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    if let Err(e) = tokio::fs::remove_file(socket).await {
        tracing::warn!("Failed to remove socket {:?}: {}", socket, e);
    }
    Ok(())
}

pub async fn handle_connection<R, W>(
    storage: &SecondaryStorage,
    reader: R,
    mut writer: W,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let answer = match serde_json::from_str::<Command>(&line) {
            Ok(command) => storage.execute(command).await,
            Err(e) => {
                tracing::warn!("Malformed command: {}", e);
                Answer::failure(format!("Malformed command: {}", e))
            }
        };
        let mut out = serde_json::to_string(&answer).map_err(std::io::Error::other)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}
