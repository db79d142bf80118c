use std::sync::Arc;

use crate::cloud::{AwsCliClient, CloudClient};
use crate::config::StartConfig;

pub mod cloud;
pub mod common;
pub mod config;
pub mod dns;
pub mod egress;
pub mod error;
pub mod packet;
pub mod routing;
pub mod session;
pub mod socks;
pub mod supervisor;
pub mod tracker;
pub mod tun;
pub mod version;

pub use crate::cloud::Instance;
pub use crate::error::{Error, ProvisionError};
pub use crate::session::{Session, SessionStore};

/// Runs a tunnel session to completion. Blocks until the process receives an
/// interrupt or terminate signal, or until startup fails.
pub fn run(config: StartConfig) -> error::Result<()> {
    let cloud = Arc::new(AwsCliClient::new(
        config.profile.clone(),
        config.region.clone(),
    ));
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(Error::Io)?;
    runtime.block_on(supervisor::run(config, cloud))
}

/// Queries the cloud provider for candidate jump hosts. Read-only.
pub fn list_instances(
    profile: Option<String>,
    region: Option<String>,
    filters: Vec<(String, String)>,
) -> error::Result<Vec<Instance>> {
    let cloud = AwsCliClient::new(profile, region);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(Error::Io)?;
    runtime.block_on(cloud.list_instances(&filters))
}
