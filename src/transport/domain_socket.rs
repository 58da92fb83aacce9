//! Unix-domain-socket transport for co-host peers.
//!
//! Used when both endpoints run on the same host and the middleware
//! configuration enables domain sockets; peers then prefer the domain
//! socket over TCP. Socket files live in the system temp directory,
//! namespaced by domain id and participant name, and stale files from a
//! crashed predecessor are removed before binding.

#![cfg(unix)]

use crate::error::IbResult;
use std::path::PathBuf;
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

/// The socket path a participant of a domain binds.
pub(crate) fn socket_path(domain_id: u32, participant_name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("vecu-bus-{domain_id}-{participant_name}.sock"))
}

/// Bind the participant's domain-socket listener.
pub(crate) fn bind(path: &PathBuf) -> IbResult<UnixListener> {
    if path.exists() {
        // Stale socket from a previous run
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    debug!("listening for co-host peers on {:?}", path);
    Ok(listener)
}

/// Connect to a peer's domain socket.
pub(crate) async fn connect(path: &str) -> IbResult<UnixStream> {
    Ok(UnixStream::connect(path).await?)
}

/// Remove the socket file at shutdown.
pub(crate) fn cleanup(path: &PathBuf) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bind_connect_and_stale_socket_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vecu-bus-test.sock");

        let listener = bind(&path).unwrap();
        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 4];
            stream.read_exact(&mut buffer).await.unwrap();
            buffer
        });

        let mut client = connect(path.to_str().unwrap()).await.unwrap();
        client.write_all(&[1, 2, 3, 4]).await.unwrap();
        assert_eq!(accept.await.unwrap(), [1, 2, 3, 4]);

        // Rebinding over the stale file succeeds
        drop(client);
        let _listener = bind(&path).unwrap();
        cleanup(&path);
        assert!(!path.exists());
    }
}
