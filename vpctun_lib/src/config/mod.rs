use std::net::SocketAddrV4;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::cidr::Cidr;
use crate::error::Error;

/// How the jump host is chosen: directly by identifier, or by a tag that
/// must match exactly one running instance.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum InstanceSelector {
    Id(String),
    Tag { key: String, value: String },
}

impl InstanceSelector {
    /// Parses the `Key=Value` form accepted on the command line.
    pub fn from_tag(spec: &str) -> Result<InstanceSelector, Error> {
        match spec.split_once('=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                Ok(InstanceSelector::Tag {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            }
            _ => Err(Error::Config(format!(
                "invalid tag selector '{}': expected Key=Value",
                spec
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StartConfig {
    pub selector: InstanceSelector,
    pub prefixes: Vec<String>,
    pub session_name: Option<String>,

    #[serde(default = "defaults::local_ip")]
    pub local_ip: String,
    #[serde(default = "defaults::mtu")]
    pub mtu: u32,
    #[serde(default = "defaults::socks_port")]
    pub socks_port: u16,
    #[serde(default = "defaults::ssh_user")]
    pub ssh_user: String,

    #[serde(default = "defaults::keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "defaults::reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "defaults::auto_reconnect")]
    pub auto_reconnect: bool,

    pub dns_resolver: Option<String>,
    #[serde(default)]
    pub dns_domains: Vec<String>,

    pub profile: Option<String>,
    pub region: Option<String>,
}

mod defaults {
    pub fn local_ip() -> String {
        "169.254.169.1/30".to_string()
    }
    pub fn mtu() -> u32 {
        1500
    }
    pub fn socks_port() -> u16 {
        1080
    }
    pub fn ssh_user() -> String {
        "ec2-user".to_string()
    }
    pub fn keep_alive_secs() -> u64 {
        30
    }
    pub fn reconnect_delay_secs() -> u64 {
        5
    }
    pub fn auto_reconnect() -> bool {
        true
    }
}

impl StartConfig {
    pub fn new(selector: InstanceSelector, prefixes: Vec<String>) -> StartConfig {
        StartConfig {
            selector,
            prefixes,
            session_name: None,
            local_ip: defaults::local_ip(),
            mtu: defaults::mtu(),
            socks_port: defaults::socks_port(),
            ssh_user: defaults::ssh_user(),
            keep_alive_secs: defaults::keep_alive_secs(),
            reconnect_delay_secs: defaults::reconnect_delay_secs(),
            max_retries: 0,
            auto_reconnect: defaults::auto_reconnect(),
            dns_resolver: None,
            dns_domains: Vec::new(),
            profile: None,
            region: None,
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Validates the whole configuration and returns the parsed destination
    /// prefixes. Any failure here is fatal at startup and never recoverable.
    pub fn validate(&self) -> Result<Vec<Cidr>, Error> {
        if self.prefixes.is_empty() {
            return Err(Error::Config("at least one prefix is required".to_string()));
        }
        let mut cidrs = Vec::with_capacity(self.prefixes.len());
        for prefix in &self.prefixes {
            let cidr = Cidr::parse(prefix).map_err(|e| Error::Config(e.to_string()))?;
            cidrs.push(cidr);
        }

        Cidr::parse(&self.local_ip)
            .map_err(|e| Error::Config(format!("bad local-ip: {}", e)))?;

        if self.mtu < 576 || self.mtu > 65535 {
            return Err(Error::Config(format!(
                "mtu {} out of range (576-65535)",
                self.mtu
            )));
        }

        if self.keep_alive_secs == 0 {
            return Err(Error::Config("keep-alive must be at least 1s".to_string()));
        }

        if let Some(resolver) = &self.dns_resolver {
            resolver.parse::<SocketAddrV4>().map_err(|_| {
                Error::Config(format!(
                    "bad dns-resolver '{}': expected ip:port",
                    resolver
                ))
            })?;
        } else if !self.dns_domains.is_empty() {
            return Err(Error::Config(
                "dns-domains requires dns-resolver".to_string(),
            ));
        }

        Ok(cidrs)
    }

    pub fn dns_resolver_addr(&self) -> Option<SocketAddrV4> {
        self.dns_resolver.as_ref().and_then(|r| r.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> StartConfig {
        StartConfig::new(
            InstanceSelector::Id("i-1234567890abcdef0".to_string()),
            vec!["10.0.0.0/8".to_string()],
        )
    }

    #[test]
    fn defaults_are_applied() {
        let config = base();
        assert_eq!(config.local_ip, "169.254.169.1/30");
        assert_eq!(config.mtu, 1500);
        assert_eq!(config.socks_port, 1080);
        assert_eq!(config.keep_alive(), Duration::from_secs(30));
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert!(config.auto_reconnect);
        assert_eq!(config.max_retries, 0);
    }

    #[test]
    fn validate_parses_prefixes() {
        let mut config = base();
        config.prefixes.push("172.16.0.0/12".to_string());
        let cidrs = config.validate().unwrap();
        assert_eq!(cidrs.len(), 2);
        assert_eq!(cidrs[1].prefix, 12);
    }

    #[test]
    fn validate_rejects_bad_prefix() {
        let mut config = base();
        config.prefixes = vec!["10.0.0.0/8".to_string(), "invalid/99".to_string()];
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_empty_prefixes() {
        let mut config = base();
        config.prefixes.clear();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn dns_domains_require_resolver() {
        let mut config = base();
        config.dns_domains = vec!["internal.example".to_string()];
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.dns_resolver = Some("10.0.0.2:53".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(
            config.dns_resolver_addr().unwrap().to_string(),
            "10.0.0.2:53"
        );
    }

    #[test]
    fn tag_selector_parsing() {
        assert!(InstanceSelector::from_tag("Name=bastion").is_ok());
        assert!(InstanceSelector::from_tag("Name").is_err());
        assert!(InstanceSelector::from_tag("=bastion").is_err());
        assert!(InstanceSelector::from_tag("Name=").is_err());
    }
}
