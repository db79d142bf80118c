//! Supervision of the egress hop: an external ssh child with dynamic SOCKS
//! forwarding, reached through the cloud provider's session command.
//!
//! Host keys are deliberately not checked; the authentic channel is the
//! outbound control-plane session the connection rides on.

pub mod keys;

use std::io;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};

use crate::cloud::{CloudClient, Instance};
use crate::egress::keys::ProvisionedKey;
use crate::error::{Error, ProvisionError};

const LISTENER_DEADLINE: Duration = Duration::from_secs(30);
const LISTENER_POLL: Duration = Duration::from_millis(500);
const STOP_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    ProvisioningKey,
    DialingSession,
    AwaitingListener,
    Running,
    Stopping,
    Stopped,
}

pub struct EgressTunnel {
    instance: Instance,
    ssh_user: String,
    socks_port: u16,
    cloud: Arc<dyn CloudClient>,
    state: Mutex<TunnelState>,
    child: tokio::sync::Mutex<Option<Child>>,
    key: Mutex<Option<ProvisionedKey>>,
}

impl EgressTunnel {
    pub fn new(
        instance: Instance,
        ssh_user: String,
        socks_port: u16,
        cloud: Arc<dyn CloudClient>,
    ) -> EgressTunnel {
        EgressTunnel {
            instance,
            ssh_user,
            socks_port,
            cloud,
            state: Mutex::new(TunnelState::Stopped),
            child: tokio::sync::Mutex::new(None),
            key: Mutex::new(None),
        }
    }

    /// While the tunnel is `Running`, this endpoint accepts SOCKS-5
    /// connections.
    pub fn socks_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.socks_port))
    }

    pub fn state(&self) -> TunnelState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: TunnelState) {
        *self.state.lock().unwrap() = state;
    }

    /// Provisions a key on the jump host, spawns the ssh child, and waits
    /// for the local SOCKS listener. Also used by the health monitor to
    /// reconnect after a non-clean child exit.
    pub async fn start(&self) -> Result<(), Error> {
        self.set_state(TunnelState::ProvisioningKey);
        let key = keys::provision()
            .map_err(|e| ProvisionError::Tunnel(format!("key provisioning failed: {}", e)))?;
        if key.is_ephemeral() {
            info!("no usable user key found, generated an ephemeral pair");
        }
        // short-lived authorization: the pushed key is valid for 60 seconds
        self.cloud
            .push_key(&self.instance, &self.ssh_user, &key.public_key)
            .await
            .map_err(Error::Provision)?;

        self.set_state(TunnelState::DialingSession);
        let proxy_command = self.cloud.session_command(&self.instance);
        let mut command = Command::new("ssh");
        command
            .arg("-D")
            .arg(format!("127.0.0.1:{}", self.socks_port))
            .arg("-N")
            .arg("-i")
            .arg(&key.private_key_path)
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("ServerAliveInterval=30")
            .arg("-o")
            .arg("ServerAliveCountMax=3")
            .arg("-o")
            .arg("ConnectTimeout=10")
            .arg("-o")
            .arg(format!("ProxyCommand={}", proxy_command))
            .arg(format!("{}@{}", self.ssh_user, self.instance.instance_id))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| ProvisionError::Tunnel(format!("failed to start ssh: {}", e)))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("ssh: {}", line);
                }
            });
        }

        *self.key.lock().unwrap() = Some(key);
        *self.child.lock().await = Some(child);

        self.set_state(TunnelState::AwaitingListener);
        if let Err(e) = self.wait_for_listener().await {
            self.stop().await;
            return Err(Error::Provision(ProvisionError::Tunnel(e.to_string())));
        }

        self.set_state(TunnelState::Running);
        info!("egress tunnel running, socks listener at {}", self.socks_addr());
        Ok(())
    }

    async fn wait_for_listener(&self) -> io::Result<()> {
        let deadline = Instant::now() + LISTENER_DEADLINE;
        while Instant::now() < deadline {
            {
                let mut child = self.child.lock().await;
                if let Some(child) = child.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Err(io::Error::new(
                            ErrorKind::Other,
                            format!("ssh exited before the listener came up: {}", status),
                        ));
                    }
                }
            }
            match timeout(LISTENER_POLL, TcpStream::connect(self.socks_addr())).await {
                Ok(Ok(_stream)) => {
                    debug!("socks listener is up on port {}", self.socks_port);
                    return Ok(());
                }
                _ => sleep(LISTENER_POLL).await,
            }
        }
        Err(io::Error::new(
            ErrorKind::TimedOut,
            format!("timeout waiting for socks listener on port {}", self.socks_port),
        ))
    }

    /// Liveness check for the health monitor: `Running` and the child has
    /// not exited. A discovered exit transitions straight to `Stopped`.
    pub async fn is_running(&self) -> bool {
        if self.state() != TunnelState::Running {
            return false;
        }
        let mut child = self.child.lock().await;
        match child.as_mut() {
            None => false,
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    warn!("ssh exited unexpectedly: {}", status);
                    self.set_state(TunnelState::Stopped);
                    false
                }
                Err(e) => {
                    warn!("failed to poll ssh child: {}", e);
                    false
                }
            },
        }
    }

    /// Kills the child, waits up to five seconds, and deletes any ephemeral
    /// key material. Safe to call in any state.
    pub async fn stop(&self) {
        self.set_state(TunnelState::Stopping);

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                debug!("ssh kill: {}", e);
            }
            match timeout(STOP_DEADLINE, child.wait()).await {
                Ok(_) => debug!("ssh child exited"),
                Err(_) => warn!("timeout waiting for ssh child to exit"),
            }
        }

        if let Some(key) = self.key.lock().unwrap().take() {
            if key.is_ephemeral() {
                debug!("removing ephemeral key material");
            }
        }

        self.set_state(TunnelState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceSelector;
    use async_trait::async_trait;

    struct NullCloud;

    #[async_trait]
    impl CloudClient for NullCloud {
        async fn resolve_instance(&self, _selector: &InstanceSelector) -> Result<Instance, Error> {
            unimplemented!()
        }
        async fn push_key(
            &self,
            _instance: &Instance,
            _user: &str,
            _public_key: &str,
        ) -> Result<(), ProvisionError> {
            Ok(())
        }
        fn session_command(&self, _instance: &Instance) -> String {
            "true".to_string()
        }
        async fn list_instances(
            &self,
            _filters: &[(String, String)],
        ) -> Result<Vec<Instance>, Error> {
            unimplemented!()
        }
    }

    fn instance() -> Instance {
        Instance {
            instance_id: "i-1234567890abcdef0".to_string(),
            name: "bastion".to_string(),
            state: "running".to_string(),
            instance_type: "t3.micro".to_string(),
            private_ip: "10.0.0.10".to_string(),
            availability_zone: "us-east-1a".to_string(),
            agent_connected: true,
        }
    }

    #[tokio::test]
    async fn starts_stopped_with_loopback_endpoint() {
        let tunnel = EgressTunnel::new(instance(), "ec2-user".to_string(), 1080, Arc::new(NullCloud));
        assert_eq!(tunnel.state(), TunnelState::Stopped);
        assert_eq!(tunnel.socks_addr().to_string(), "127.0.0.1:1080");
        assert!(!tunnel.is_running().await);
    }

    #[tokio::test]
    async fn stop_without_start_is_harmless() {
        let tunnel = EgressTunnel::new(instance(), "ec2-user".to_string(), 1080, Arc::new(NullCloud));
        tunnel.stop().await;
        assert_eq!(tunnel.state(), TunnelState::Stopped);
    }
}
