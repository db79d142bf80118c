//! SOCKS-5 client toward the egress listener.
//!
//! No-auth CONNECT only; the authentic channel is the outbound session the
//! listener rides on. Safe to share across tasks: every connect produces an
//! independent stream.

mod protocol;

#[cfg(test)]
pub(crate) mod testing;

use std::io;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use log::warn;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::socks::protocol::auth_methods::NO_AUTH;
use crate::socks::protocol::response_code::SUCCESS;
use crate::socks::protocol::socks_command::CONNECT;
use crate::socks::protocol::{address_type, response_code, RESERVED, SOCKS_VERSION};

#[derive(Clone, Debug)]
pub struct SocksClient {
    server: SocketAddr,
}

impl SocksClient {
    pub fn new(server: SocketAddr) -> SocksClient {
        SocksClient { server }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Opens a stream to `dst` through the egress listener, bounded by
    /// `deadline` end to end.
    pub async fn connect(
        &self,
        dst: Ipv4Addr,
        dst_port: u16,
        deadline: Duration,
    ) -> io::Result<TcpStream> {
        timeout(deadline, self.connect_inner(dst, dst_port))
            .await
            .map_err(|_| {
                io::Error::new(
                    ErrorKind::TimedOut,
                    format!("socks connect to {}:{} timed out", dst, dst_port),
                )
            })?
    }

    async fn connect_inner(&self, dst: Ipv4Addr, dst_port: u16) -> io::Result<TcpStream> {
        let mut stream = TcpStream::connect(self.server).await?;

        // version, auth method count, methods
        stream.write_all(&[SOCKS_VERSION, 1, NO_AUTH]).await?;
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[0] != SOCKS_VERSION {
            warn!("unsupported socks 5 version: {}", reply[0]);
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("unsupported socks 5 version: {}", reply[0]),
            ));
        }
        if reply[1] != NO_AUTH {
            warn!("unsupported socks 5 auth: {}", reply[1]);
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("unsupported socks 5 auth: {}", reply[1]),
            ));
        }

        // version, command, reserved, address type, address, port
        let mut request = Vec::with_capacity(10);
        request.extend_from_slice(&[SOCKS_VERSION, CONNECT, RESERVED, address_type::TYPE_IPV4]);
        request.extend_from_slice(&dst.octets());
        request.extend_from_slice(&dst_port.to_be_bytes());
        stream.write_all(&request).await?;

        // version, reply, reserved, bound address type
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("unsupported socks 5 version: {}", header[0]),
            ));
        }
        if header[1] != SUCCESS {
            return Err(io::Error::new(
                ErrorKind::ConnectionRefused,
                format!(
                    "socks 5 connect to {}:{} failed: {}",
                    dst,
                    dst_port,
                    response_code::describe(header[1])
                ),
            ));
        }

        // drain the bound address so the stream starts at the payload
        match header[3] {
            address_type::TYPE_IPV4 => {
                let mut bound = [0u8; 6];
                stream.read_exact(&mut bound).await?;
            }
            address_type::TYPE_IPV6 => {
                let mut bound = [0u8; 18];
                stream.read_exact(&mut bound).await?;
            }
            address_type::TYPE_DOMAIN_NAME => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut bound = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut bound).await?;
            }
            other => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("unknown address type: {}", other),
                ));
            }
        }

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks::testing::{spawn_fake_socks, FakeSocksBehavior};
    use std::time::Instant;

    #[tokio::test]
    async fn connect_and_echo() {
        let (addr, _handle) = spawn_fake_socks(FakeSocksBehavior::Echo).await;
        let client = SocksClient::new(addr);
        let mut stream = client
            .connect(Ipv4Addr::new(10, 0, 1, 10), 80, Duration::from_secs(5))
            .await
            .unwrap();

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn refused_reply_surfaces_as_error() {
        let (addr, _handle) = spawn_fake_socks(FakeSocksBehavior::Refuse(0x05)).await;
        let client = SocksClient::new(addr);
        let result = client
            .connect(Ipv4Addr::new(10, 0, 1, 10), 80, Duration::from_secs(5))
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn deadline_bounds_a_stalled_server() {
        let (addr, _handle) = spawn_fake_socks(FakeSocksBehavior::Stall).await;
        let client = SocksClient::new(addr);
        let started = Instant::now();
        let result = client
            .connect(Ipv4Addr::new(10, 0, 1, 10), 80, Duration::from_millis(300))
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn records_requested_destination() {
        let (addr, handle) = spawn_fake_socks(FakeSocksBehavior::Echo).await;
        let client = SocksClient::new(addr);
        let _stream = client
            .connect(Ipv4Addr::new(10, 0, 2, 20), 5432, Duration::from_secs(5))
            .await
            .unwrap();

        let seen = handle.connects();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (Ipv4Addr::new(10, 0, 2, 20), 5432));
    }
}
