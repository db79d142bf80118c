//! In-process SOCKS-5 server used by the test suites in this crate.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub(crate) enum FakeSocksBehavior {
    /// Complete the handshake, then echo every byte back.
    Echo,
    /// Complete the handshake, then write each chunk spaced far enough
    /// apart that a polling reader sees them as separate reads.
    Push(Vec<Vec<u8>>),
    /// Reply to CONNECT with the given failure code.
    Refuse(u8),
    /// Accept the connection and never answer the greeting.
    Stall,
    /// Act as a length-prefixed request/response endpoint (TCP DNS shape):
    /// read one framed request, record it, answer with the canned response.
    LengthPrefixedReply(Vec<u8>),
}

pub(crate) struct FakeSocksHandle {
    connects: Arc<Mutex<Vec<(Ipv4Addr, u16)>>>,
    received: Arc<Mutex<Vec<u8>>>,
    _task: JoinHandle<()>,
}

impl FakeSocksHandle {
    pub fn connects(&self) -> Vec<(Ipv4Addr, u16)> {
        self.connects.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }
}

pub(crate) async fn spawn_fake_socks(
    behavior: FakeSocksBehavior,
) -> (SocketAddr, FakeSocksHandle) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connects: Arc<Mutex<Vec<(Ipv4Addr, u16)>>> = Arc::new(Mutex::new(Vec::new()));
    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

    let connects_clone = connects.clone();
    let received_clone = received.clone();
    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let behavior = behavior.clone();
            let connects = connects_clone.clone();
            let received = received_clone.clone();
            tokio::spawn(async move {
                let _ = serve(stream, behavior, connects, received).await;
            });
        }
    });

    (
        addr,
        FakeSocksHandle {
            connects,
            received,
            _task: task,
        },
    )
}

async fn serve(
    mut stream: TcpStream,
    behavior: FakeSocksBehavior,
    connects: Arc<Mutex<Vec<(Ipv4Addr, u16)>>>,
    received: Arc<Mutex<Vec<u8>>>,
) -> std::io::Result<()> {
    if matches!(behavior, FakeSocksBehavior::Stall) {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }

    // greeting
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[0x05, 0x00]).await?;

    // request: ver cmd rsv atyp, ipv4 addr, port
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    assert_eq!(header[3], 0x01, "fake server only speaks ipv4 requests");
    let mut addr = [0u8; 6];
    stream.read_exact(&mut addr).await?;
    let dst = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
    let port = u16::from_be_bytes([addr[4], addr[5]]);
    connects.lock().unwrap().push((dst, port));

    if let FakeSocksBehavior::Refuse(code) = &behavior {
        stream
            .write_all(&[0x05, *code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await?;
        return Ok(());
    }

    stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
        .await?;

    match behavior {
        FakeSocksBehavior::Echo => {
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                received.lock().unwrap().extend_from_slice(&buf[..n]);
                stream.write_all(&buf[..n]).await?;
            }
        }
        FakeSocksBehavior::Push(chunks) => {
            for chunk in chunks {
                stream.write_all(&chunk).await?;
                stream.flush().await?;
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            // drain until the peer goes away
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                received.lock().unwrap().extend_from_slice(&buf[..n]);
            }
        }
        FakeSocksBehavior::LengthPrefixedReply(response) => {
            let mut len = [0u8; 2];
            stream.read_exact(&mut len).await?;
            let mut query = vec![0u8; u16::from_be_bytes(len) as usize];
            stream.read_exact(&mut query).await?;
            received.lock().unwrap().extend_from_slice(&query);

            stream
                .write_all(&(response.len() as u16).to_be_bytes())
                .await?;
            stream.write_all(&response).await?;
            stream.flush().await?;
            Ok(())
        }
        FakeSocksBehavior::Refuse(_) | FakeSocksBehavior::Stall => unreachable!(),
    }
}
