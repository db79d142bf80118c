use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Fatal errors surfaced to the lifecycle supervisor. Per-packet and
/// per-flow failures never reach this type; they are logged and dropped
/// where they occur.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("operation requires elevated privileges: {0}")]
    Privilege(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Provision(#[from] ProvisionError),

    #[error("{0}")]
    Catastrophic(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Failures while provisioning the egress tunnel. The sub-kinds are
/// distinguished so the operator message can point at the actual blocker.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("instance does not support the short-lived key api: {0}")]
    Unsupported(String),

    #[error("missing permission to push key to instance: {0}")]
    AccessDenied(String),

    #[error("transient control-plane error: {0}")]
    Transient(String),

    #[error("egress tunnel failed: {0}")]
    Tunnel(String),
}

impl Error {
    /// Short remediation hint printed under the primary message on fatal
    /// startup errors.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Error::Privilege(_) => Some("re-run with sudo; creating the virtual interface and programming routes requires root"),
            Error::Config(_) => Some("check the command line flags; see `vpctun start --help`"),
            Error::Provision(ProvisionError::Unsupported(_)) => {
                Some("install the instance-connect agent on the jump host, or add your public key to ~/.ssh/authorized_keys there manually")
            }
            Error::Provision(ProvisionError::AccessDenied(_)) => {
                Some("grant the ec2-instance-connect:SendSSHPublicKey permission to the active credentials")
            }
            Error::Provision(ProvisionError::Transient(_)) => {
                Some("check network connectivity and credentials, then retry")
            }
            Error::Provision(ProvisionError::Tunnel(_)) => {
                Some("verify the session agent is online on the jump host and that `ssh` and the provider cli are on PATH")
            }
            _ => None,
        }
    }
}
