use anyhow::Context;
use std::path::Path;
use tether_core::window_size;
use tether_link::{Link, LinkWriter};
use tokio::io::AsyncReadExt;
use tokio::signal::unix::{SignalKind, signal};
use tracing::debug;

const STDIN_CHUNK: usize = 32 * 1024;

/// Attaches this process's stdio to a running daemon and returns the
/// child's exit code once it finishes.
pub async fn run(socket: &Path) -> anyhow::Result<i32> {
    let link = Link::connect(socket, tokio::io::stdout(), tokio::io::stderr())
        .await
        .with_context(|| format!("failed to link to {}", socket.display()))?;

    forward_window_size(link.writer()).await?;
    tokio::spawn(forward_stdin(link.writer()));

    let code = link.wait().await?;
    debug!(code, "linked process exited");
    Ok(code)
}

async fn forward_window_size(writer: LinkWriter) -> anyhow::Result<()> {
    // not a terminal: nothing to forward
    let Ok(size) = window_size(&std::io::stdin()) else {
        return Ok(());
    };
    writer.set_window_size(size).await?;

    let mut resized = signal(SignalKind::window_change())?;
    tokio::spawn(async move {
        while resized.recv().await.is_some() {
            let Ok(size) = window_size(&std::io::stdin()) else {
                continue;
            };
            if writer.set_window_size(size).await.is_err() {
                break;
            }
        }
    });
    Ok(())
}

async fn forward_stdin(writer: LinkWriter) {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; STDIN_CHUNK];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if writer.write(&buf[..n]).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "reading stdin failed");
                break;
            }
        }
    }
    let _ = writer.close().await;
}
