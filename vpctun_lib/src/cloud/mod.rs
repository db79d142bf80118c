//! The cloud control plane, reached through the provider's own cli.
//!
//! The control plane is an external collaborator: the core needs a resolved
//! jump host, a short-lived key push, and the session command the ssh child
//! uses as its proxy. Everything else about the provider stays outside.

use std::io;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::InstanceSelector;
use crate::error::{Error, ProvisionError};

const DESCRIBE_DEADLINE: Duration = Duration::from_secs(30);
const PUSH_KEY_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct Instance {
    pub instance_id: String,
    pub name: String,
    pub state: String,
    pub instance_type: String,
    pub private_ip: String,
    pub availability_zone: String,
    pub agent_connected: bool,
}

#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Resolves the selector to exactly one instance; ambiguity is a
    /// configuration error.
    async fn resolve_instance(&self, selector: &InstanceSelector) -> Result<Instance, Error>;

    /// Pushes the public key to the instance via the short-lived-key api
    /// (valid for 60 seconds).
    async fn push_key(
        &self,
        instance: &Instance,
        user: &str,
        public_key: &str,
    ) -> Result<(), ProvisionError>;

    /// The command the ssh child runs as its ProxyCommand to reach the
    /// instance through the control-plane session.
    fn session_command(&self, instance: &Instance) -> String;

    async fn list_instances(&self, filters: &[(String, String)]) -> Result<Vec<Instance>, Error>;
}

pub struct AwsCliClient {
    profile: Option<String>,
    region: Option<String>,
}

impl AwsCliClient {
    pub fn new(profile: Option<String>, region: Option<String>) -> AwsCliClient {
        AwsCliClient { profile, region }
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = vec!["--output".to_string(), "json".to_string()];
        if let Some(profile) = &self.profile {
            args.push("--profile".to_string());
            args.push(profile.clone());
        }
        if let Some(region) = &self.region {
            args.push("--region".to_string());
            args.push(region.clone());
        }
        args
    }

    async fn run_cli(&self, args: Vec<String>, deadline: Duration) -> io::Result<std::process::Output> {
        let mut command = Command::new("aws");
        command.args(&args).args(self.common_args()).stdin(Stdio::null());
        debug!("aws {}", args.join(" "));
        timeout(deadline, command.output())
            .await
            .map_err(|_| io::Error::new(ErrorKind::TimedOut, "provider cli timed out"))?
    }

    async fn describe(&self, extra: Vec<String>) -> Result<Vec<Instance>, Error> {
        let mut args = vec!["ec2".to_string(), "describe-instances".to_string()];
        args.extend(extra);
        let output = self
            .run_cli(args, DESCRIBE_DEADLINE)
            .await
            .map_err(|e| Error::Provision(ProvisionError::Transient(e.to_string())))?;
        if !output.status.success() {
            return Err(Error::Provision(ProvisionError::Transient(format!(
                "describe-instances failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }
        parse_describe_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn agent_connected(&self, instance_id: &str) -> bool {
        let args = vec![
            "ssm".to_string(),
            "describe-instance-information".to_string(),
            "--filters".to_string(),
            format!("Key=InstanceIds,Values={}", instance_id),
        ];
        let output = match self.run_cli(args, DESCRIBE_DEADLINE).await {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                warn!(
                    "agent liveness check failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                return false;
            }
            Err(e) => {
                warn!("agent liveness check failed: {}", e);
                return false;
            }
        };
        parse_instance_information(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl CloudClient for AwsCliClient {
    async fn resolve_instance(&self, selector: &InstanceSelector) -> Result<Instance, Error> {
        let mut instances = match selector {
            InstanceSelector::Id(id) => {
                self.describe(vec!["--instance-ids".to_string(), id.clone()])
                    .await?
            }
            InstanceSelector::Tag { key, value } => {
                self.describe(vec![
                    "--filters".to_string(),
                    format!("Name=tag:{},Values={}", key, value),
                    "Name=instance-state-name,Values=running".to_string(),
                ])
                .await?
            }
        };

        let mut instance = match (instances.len(), selector) {
            (0, InstanceSelector::Id(id)) => {
                return Err(Error::Config(format!("instance not found: {}", id)))
            }
            (0, InstanceSelector::Tag { key, value }) => {
                return Err(Error::Config(format!(
                    "no running instances found with tag {}={}",
                    key, value
                )))
            }
            (1, _) => instances.remove(0),
            (n, InstanceSelector::Tag { key, value }) => {
                return Err(Error::Config(format!(
                    "{} instances match tag {}={}; select one by id",
                    n, key, value
                )))
            }
            (n, InstanceSelector::Id(id)) => {
                return Err(Error::Config(format!(
                    "selector {} unexpectedly matched {} instances",
                    id, n
                )))
            }
        };

        instance.agent_connected = self.agent_connected(&instance.instance_id).await;
        Ok(instance)
    }

    async fn push_key(
        &self,
        instance: &Instance,
        user: &str,
        public_key: &str,
    ) -> Result<(), ProvisionError> {
        let args = vec![
            "ec2-instance-connect".to_string(),
            "send-ssh-public-key".to_string(),
            "--instance-id".to_string(),
            instance.instance_id.clone(),
            "--instance-os-user".to_string(),
            user.to_string(),
            "--availability-zone".to_string(),
            instance.availability_zone.clone(),
            "--ssh-public-key".to_string(),
            public_key.to_string(),
        ];
        let output = self
            .run_cli(args, PUSH_KEY_DEADLINE)
            .await
            .map_err(|e| ProvisionError::Transient(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_push_error(stderr.trim()));
        }
        debug!("public key pushed to {} (valid 60s)", instance.instance_id);
        Ok(())
    }

    fn session_command(&self, instance: &Instance) -> String {
        let mut command = format!(
            "aws ssm start-session --target {} --document-name AWS-StartSSHSession --parameters 'portNumber=%p'",
            instance.instance_id
        );
        if let Some(region) = &self.region {
            command.push_str(&format!(" --region {}", region));
        }
        if let Some(profile) = &self.profile {
            command.push_str(&format!(" --profile {}", profile));
        }
        command
    }

    async fn list_instances(&self, filters: &[(String, String)]) -> Result<Vec<Instance>, Error> {
        let mut extra = vec![
            "--filters".to_string(),
            "Name=instance-state-name,Values=running".to_string(),
        ];
        for (key, value) in filters {
            extra.push(format!("Name=tag:{},Values={}", key, value));
        }
        let mut instances = self.describe(extra).await?;
        for instance in &mut instances {
            instance.agent_connected = self.agent_connected(&instance.instance_id).await;
        }
        Ok(instances)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Instance {
    instance_id: String,
    state: InstanceState,
    instance_type: Option<String>,
    private_ip_address: Option<String>,
    placement: Option<Placement>,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceState {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Placement {
    availability_zone: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    value: String,
}

fn parse_describe_output(json: &str) -> Result<Vec<Instance>, Error> {
    let output: DescribeInstancesOutput = serde_json::from_str(json).map_err(|e| {
        Error::Provision(ProvisionError::Transient(format!(
            "unparseable describe-instances output: {}",
            e
        )))
    })?;

    let mut instances = Vec::new();
    for reservation in output.reservations {
        for raw in reservation.instances {
            let name = raw
                .tags
                .iter()
                .find(|t| t.key == "Name")
                .map(|t| t.value.clone())
                .unwrap_or_else(|| raw.instance_id.clone());
            instances.push(Instance {
                name,
                state: raw.state.name,
                instance_type: raw.instance_type.unwrap_or_default(),
                private_ip: raw.private_ip_address.unwrap_or_default(),
                availability_zone: raw
                    .placement
                    .and_then(|p| p.availability_zone)
                    .unwrap_or_default(),
                agent_connected: false,
                instance_id: raw.instance_id,
            });
        }
    }
    Ok(instances)
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceInformationOutput {
    #[serde(default)]
    instance_information_list: Vec<InstanceInformation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceInformation {
    ping_status: String,
}

fn parse_instance_information(json: &str) -> bool {
    match serde_json::from_str::<InstanceInformationOutput>(json) {
        Ok(output) => output
            .instance_information_list
            .first()
            .map(|i| i.ping_status == "Online")
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Splits key-push failures into the three kinds the operator message
/// distinguishes: api unsupported on the instance, missing permission, and
/// everything else as transient.
fn classify_push_error(stderr: &str) -> ProvisionError {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("not supported")
        || lowered.contains("ec2instancetypeinvalid")
        || lowered.contains("ec2instancestateinvalid")
        || lowered.contains("serviceunavailable")
    {
        ProvisionError::Unsupported(stderr.to_string())
    } else if lowered.contains("accessdenied")
        || lowered.contains("unauthorizedoperation")
        || lowered.contains("is not authorized")
    {
        ProvisionError::AccessDenied(stderr.to_string())
    } else {
        ProvisionError::Transient(stderr.to_string())
    }
}
