//! Socket setup for the reliable stream and the datagram channel.
//!
//! The stream runs without Nagle batching and with keepalive probes so a
//! silently vanished server is noticed even when the room is quiet. The
//! datagram socket gets a larger receive buffer for bursts of sync traffic.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpStream, UdpSocket};

/// TCP keepalive probing for the reliable stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveProbe {
    /// Idle time before the first probe.
    pub idle: Duration,
    /// Time between probes.
    pub interval: Duration,
    /// Unanswered probes before the stream is dropped. Ignored on macOS.
    pub retries: u32,
}

/// Options for the stream and datagram sockets of one [`NetClient`].
///
/// [`NetClient`]: crate::NetClient
#[derive(Debug, Clone, PartialEq)]
pub struct SocketConfig {
    /// Send room traffic without Nagle batching.
    pub nodelay: bool,
    /// Detect a dead server while the stream is idle; `None` disables it.
    pub keepalive: Option<KeepaliveProbe>,
    /// Datagram receive buffer size in bytes; `None` keeps the OS default.
    pub udp_recv_buffer: Option<usize>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: Some(KeepaliveProbe {
                idle: Duration::from_secs(10),
                interval: Duration::from_secs(2),
                retries: 4,
            }),
            udp_recv_buffer: Some(256 * 1024),
        }
    }
}

/// Apply `config` to the freshly connected reliable stream.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.nodelay)?;
    let Some(probe) = config.keepalive else {
        return Ok(());
    };

    let params = TcpKeepalive::new()
        .with_time(probe.idle)
        .with_interval(probe.interval);
    #[cfg(any(target_os = "linux", target_os = "windows"))]
    let params = params.with_retries(probe.retries);
    SockRef::from(stream).set_tcp_keepalive(&params)
}

/// Create a datagram socket bound to an ephemeral local port and connected
/// to `remote`, so plain `send`/`recv` address the server only.
pub async fn create_datagram_socket(
    remote: SocketAddr,
    config: &SocketConfig,
) -> std::io::Result<UdpSocket> {
    let (domain, local) = if remote.is_ipv6() {
        (Domain::IPV6, SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0))
    } else {
        (Domain::IPV4, SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if let Some(size) = config.udp_recv_buffer {
        // Some platforms cap the buffer; a smaller one still works.
        if let Err(e) = socket.set_recv_buffer_size(size) {
            tracing::debug!("Could not set datagram receive buffer to {size}: {e}");
        }
    }
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    let udp = UdpSocket::from_std(std_socket)?;
    udp.connect(remote).await?;
    Ok(udp)
}

/// Resolve `host:port`, preferring an IPv4 address when both families are
/// available.
pub async fn resolve(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses for {host}:{port}"),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_stream() -> (TcpListener, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        (listener, stream)
    }

    #[tokio::test]
    async fn test_default_stream_options() {
        let (_listener, stream) = connected_stream().await;
        configure_stream(&stream, &SocketConfig::default()).unwrap();
        assert!(stream.nodelay().unwrap());
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_stream_options_can_be_disabled() {
        let (_listener, stream) = connected_stream().await;
        let config = SocketConfig {
            nodelay: false,
            keepalive: None,
            ..Default::default()
        };
        configure_stream(&stream, &config).unwrap();
        assert!(!stream.nodelay().unwrap());
        assert!(!SockRef::from(&stream).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_datagram_socket_reaches_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = create_datagram_socket(server.local_addr().unwrap(), &SocketConfig::default())
            .await
            .unwrap();

        client.send(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);

        server.send_to(&[9], from).await.unwrap();
        let n = client.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[9]);
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = resolve("localhost", 4242).await.unwrap();
        assert_eq!(addr.port(), 4242);
        assert!(addr.ip().is_loopback());
    }
}
