//! Socket setup for the intercom link

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

use crate::error::TransportError;

/// Pending connections the kernel may hold; only one peer is served
const LISTEN_BACKLOG: i32 = 4;

/// Bind a listener on all IPv4 interfaces
///
/// Port 0 picks an ephemeral port; check `local_addr` for the result.
pub fn bind_listener(port: u16) -> Result<TcpListener, TransportError> {
    let bind_failed = |e: std::io::Error| TransportError::BindFailed {
        port,
        reason: e.to_string(),
    };

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(bind_failed)?;

    // Allow quick restarts while the previous link sits in TIME_WAIT
    socket.set_reuse_address(true).map_err(bind_failed)?;
    socket.set_nonblocking(true).map_err(bind_failed)?;
    socket.bind(&addr.into()).map_err(bind_failed)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_failed)?;

    TcpListener::from_std(socket.into()).map_err(bind_failed)
}

/// Dial the peer, giving up after `timeout`
pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, TransportError> {
    let address = format!("{}:{}", host, port);
    let connect_failed = |reason: String| TransportError::ConnectFailed {
        address: address.clone(),
        reason,
    };

    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(connect_failed(e.to_string())),
        Err(_) => Err(connect_failed(format!("timed out after {:?}", timeout))),
    }
}

/// Per-link socket options; audio packets are small and latency bound
pub fn configure_stream(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!("Failed to set TCP_NODELAY: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_and_connect() {
        let listener = bind_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_ne!(port, 0);

        let (client, accepted) = tokio::join!(
            connect("127.0.0.1", port, Duration::from_secs(2)),
            listener.accept()
        );
        let client = client.unwrap();
        configure_stream(&client);
        assert!(client.nodelay().unwrap());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = bind_listener(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = connect("127.0.0.1", port, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
    }
}
