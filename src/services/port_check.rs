use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

/// Connect timeout for [`is_port_listening`].
pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(400);

/// Check whether something accepts TCP connections on `127.0.0.1:port`
///
/// This only proves a local listener exists; it says nothing about reachability from
/// outside the machine. Ports outside `1..=65535` are never listening.
pub async fn is_port_listening(port: u32) -> bool {
    let Ok(port) = u16::try_from(port) else {
        return false;
    };
    if port == 0 {
        return false;
    }

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            tracing::debug!("Port {} not listening: {}", port, e);
            false
        }
        Err(_) => {
            tracing::debug!("Port {} probe timed out", port);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_detects_local_listener() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(is_port_listening(u32::from(port)).await);
    }

    #[tokio::test]
    async fn test_closed_port() {
        // Bind then drop to get a port that is very likely free
        let port = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            listener.local_addr().unwrap().port()
        };

        assert!(!is_port_listening(u32::from(port)).await);
    }

    #[tokio::test]
    async fn test_out_of_range_port() {
        assert!(!is_port_listening(0).await);
        assert!(!is_port_listening(70_000).await);
    }
}
