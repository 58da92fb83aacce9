//! TCP connection establishment with bounded retries and low-latency
//! socket options.

use super::SocketOptions;
use crate::error::{IbError, IbResult};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Timeout of a single connect attempt.
pub const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay between failed connect attempts.
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Bind a listener on an ephemeral port of the given interface.
pub(crate) async fn bind_listener(host: &str) -> IbResult<TcpListener> {
    let listener = TcpListener::bind((host, 0)).await?;
    debug!("listening for peers on {}", listener.local_addr()?);
    Ok(listener)
}

/// Connect to `endpoint` with the configured number of attempts.
///
/// Each attempt is bounded by [`CONNECT_ATTEMPT_TIMEOUT`]; the total
/// budget is therefore `attempts × per-attempt timeout` plus the retry
/// delays.
pub(crate) async fn connect_with_retries(
    endpoint: &str,
    options: &SocketOptions,
    attempts: u32,
) -> IbResult<TcpStream> {
    let attempts = attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match timeout(CONNECT_ATTEMPT_TIMEOUT, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => {
                debug!("connected to {} (attempt {})", endpoint, attempt);
                return apply_socket_options(stream, options);
            }
            Ok(Err(error)) => {
                last_error = error.to_string();
            }
            Err(_) => {
                last_error = format!("connect timed out after {CONNECT_ATTEMPT_TIMEOUT:?}");
            }
        }
        if attempt < attempts {
            warn!(
                "connect to {} failed ({}), retrying ({}/{})",
                endpoint, last_error, attempt, attempts
            );
            sleep(RETRY_DELAY).await;
        }
    }

    Err(IbError::Transport(format!(
        "connect to {endpoint} failed after {attempts} attempt(s): {last_error}"
    )))
}

/// Apply the configured socket options to a connected stream.
pub(crate) fn apply_socket_options(
    stream: TcpStream,
    options: &SocketOptions,
) -> IbResult<TcpStream> {
    let std_stream = stream.into_std()?;
    let socket = socket2::Socket::from(std_stream.try_clone()?);
    socket.set_nodelay(options.no_delay)?;
    #[cfg(target_os = "linux")]
    if options.quick_ack {
        socket.set_quickack(true)?;
    }
    if let Some(size) = options.send_buffer_size {
        socket.set_send_buffer_size(size)?;
    }
    if let Some(size) = options.receive_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    Ok(TcpStream::from_std(std_stream)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_to_nothing_fails_with_transport_error() {
        let options = SocketOptions {
            no_delay: true,
            quick_ack: false,
            send_buffer_size: None,
            receive_buffer_size: None,
        };
        // Port 1 on localhost is essentially never listening.
        let result = connect_with_retries("127.0.0.1:1", &options, 2).await;
        assert!(matches!(result, Err(IbError::Transport(_))));
    }

    #[tokio::test]
    async fn test_options_survive_a_real_connection() {
        let listener = bind_listener("127.0.0.1").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move { listener.accept().await });

        let options = SocketOptions {
            no_delay: true,
            quick_ack: false,
            send_buffer_size: Some(64 * 1024),
            receive_buffer_size: Some(64 * 1024),
        };
        let stream = connect_with_retries(&endpoint, &options, 1).await.unwrap();
        assert!(stream.nodelay().unwrap());
        accept.await.unwrap().unwrap();
    }
}
