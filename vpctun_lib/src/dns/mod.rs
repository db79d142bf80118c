//! Split-horizon DNS: UDP/53 queries captured on the interface are
//! re-issued as TCP queries through the egress and answered with a
//! synthesized UDP datagram.

pub mod platform;

use std::collections::HashMap;
use std::io;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::packet;
use crate::socks::SocksClient;
use crate::tun::DatagramSink;

/// The cache is a coarse performance aid, not an authoritative resolver:
/// entries live a fixed 60 seconds regardless of record TTLs.
const CACHE_TTL: Duration = Duration::from_secs(60);
const EVICTION_TICK: Duration = Duration::from_secs(60);
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct DnsConfig {
    /// Resolver reachable through the tunnel, e.g. the VPC resolver.
    pub resolver: SocketAddrV4,
    /// Suffixes to capture; empty captures every query.
    pub domains: Vec<String>,
    pub timeout: Duration,
}

impl DnsConfig {
    pub fn new(resolver: SocketAddrV4, domains: Vec<String>) -> DnsConfig {
        DnsConfig {
            resolver,
            domains,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

struct CacheEntry {
    response: Vec<u8>,
    expires: Instant,
}

pub struct DnsResolver {
    config: DnsConfig,
    socks: Arc<SocksClient>,
    cache: Mutex<HashMap<Vec<u8>, CacheEntry>>,
}

impl DnsResolver {
    pub fn new(config: DnsConfig, socks: Arc<SocksClient>) -> Arc<DnsResolver> {
        Arc::new(DnsResolver {
            config,
            socks,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Whether a query for `domain` is resolved through the tunnel.
    /// Matching is case-insensitive and `.suffix` equals `suffix`.
    pub fn should_handle(&self, domain: &str) -> bool {
        if self.config.domains.is_empty() {
            return true;
        }
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        self.config.domains.iter().any(|suffix| {
            let suffix = suffix
                .trim_start_matches('.')
                .trim_end_matches('.')
                .to_ascii_lowercase();
            domain == suffix || domain.ends_with(&format!(".{}", suffix))
        })
    }

    /// Resolves raw query bytes via TCP through the egress, consulting the
    /// cache keyed by the exact query bytes first.
    pub async fn query(&self, query_data: &[u8]) -> io::Result<Vec<u8>> {
        if let Some(cached) = self.cache_get(query_data) {
            debug!("dns: cache hit");
            return Ok(cached);
        }

        let response = timeout(self.config.timeout, self.query_upstream(query_data))
            .await
            .map_err(|_| io::Error::new(ErrorKind::TimedOut, "dns query timed out"))??;

        self.cache_put(query_data.to_vec(), response.clone());
        Ok(response)
    }

    async fn query_upstream(&self, query_data: &[u8]) -> io::Result<Vec<u8>> {
        let mut stream = self
            .socks
            .connect(
                *self.config.resolver.ip(),
                self.config.resolver.port(),
                self.config.timeout,
            )
            .await?;

        // rfc 1035 tcp framing: 2-byte length prefix both ways
        stream
            .write_all(&(query_data.len() as u16).to_be_bytes())
            .await?;
        stream.write_all(query_data).await?;

        let mut len = [0u8; 2];
        stream.read_exact(&mut len).await?;
        let mut response = vec![0u8; u16::from_be_bytes(len) as usize];
        stream.read_exact(&mut response).await?;

        debug!("dns: resolved query ({} bytes response)", response.len());
        Ok(response)
    }

    fn cache_get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let cache = self.cache.lock().unwrap();
        let entry = cache.get(key)?;
        if Instant::now() >= entry.expires {
            return None;
        }
        Some(entry.response.clone())
    }

    fn cache_put(&self, key: Vec<u8>, response: Vec<u8>) {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            key,
            CacheEntry {
                response,
                expires: Instant::now() + CACHE_TTL,
            },
        );
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        self.cache.lock().unwrap().retain(|_, e| e.expires > now);
    }

    pub fn spawn_eviction(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let resolver = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(EVICTION_TICK);
            tick.tick().await; // first tick completes immediately
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tick.tick() => resolver.evict_expired(),
                }
            }
        })
    }
}

/// Extracts the QNAME from a raw DNS query: label-length-prefixed form
/// starting at offset 12, labels capped at 63 bytes, properly terminated.
pub fn extract_qname(query: &[u8]) -> Option<String> {
    if query.len() < 13 {
        return None;
    }
    let mut pos = 12;
    let mut domain = String::new();
    loop {
        if pos >= query.len() {
            return None; // ran off the end without a terminator
        }
        let len = query[pos] as usize;
        if len == 0 {
            break;
        }
        if len > 63 || pos + 1 + len > query.len() {
            return None;
        }
        if !domain.is_empty() {
            domain.push('.');
        }
        domain.push_str(&String::from_utf8_lossy(&query[pos + 1..pos + 1 + len]));
        pos += 1 + len;
    }
    if domain.is_empty() {
        return None;
    }
    Some(domain)
}

/// Handles one captured UDP/53 query end to end: filter, resolve, and emit
/// the synthesized reply. Upstream failure produces no response; the
/// application times out and retries.
pub async fn handle_udp_query(
    resolver: Arc<DnsResolver>,
    sink: Arc<dyn DatagramSink>,
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    query_data: Vec<u8>,
) {
    let Some(domain) = extract_qname(&query_data) else {
        debug!("dns: could not extract domain from query");
        return;
    };
    if !resolver.should_handle(&domain) {
        debug!("dns: domain {} not captured", domain);
        return;
    }

    let response = match resolver.query(&query_data).await {
        Ok(response) => response,
        Err(e) => {
            debug!("dns: query failed for {}: {}", domain, e);
            return;
        }
    };

    let reply = packet::build_udp(dst, dst_port, src, src_port, &response);
    if let Err(e) = sink.send_datagram(&reply) {
        debug!("dns: failed to emit response for {}: {}", domain, e);
        return;
    }
    debug!("dns: answered {} ({} bytes)", domain, response.len());
}
