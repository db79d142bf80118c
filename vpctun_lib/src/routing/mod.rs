//! Host route installation for captured prefixes.
//!
//! Every successful add is recorded so teardown can drain exactly the
//! routes this process created. "not in table" on delete counts as
//! success, which makes cleanup idempotent.

use std::io;
use std::io::ErrorKind;
use std::process::Command;
use std::sync::Mutex;

use log::{debug, warn};

use crate::common::cidr::Cidr;

pub(crate) struct CommandOutput {
    pub success: bool,
    pub output: String,
}

/// Seam over process execution so tests never touch the real routing table.
pub(crate) trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output()?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandOutput {
            success: output.status.success(),
            output: combined,
        })
    }
}

pub struct RouteManager {
    runner: Box<dyn CommandRunner>,
    routes: Mutex<Vec<(Cidr, String)>>,
}

impl RouteManager {
    pub fn new() -> RouteManager {
        RouteManager {
            runner: Box::new(SystemRunner),
            routes: Mutex::new(Vec::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_runner(runner: Box<dyn CommandRunner>) -> RouteManager {
        RouteManager {
            runner,
            routes: Mutex::new(Vec::new()),
        }
    }

    /// Installs one host route binding `cidr` to `interface`.
    pub fn add(&self, cidr: &Cidr, interface: &str) -> io::Result<()> {
        let mut routes = self.routes.lock().unwrap();
        let args = vec![
            "add".to_string(),
            "-net".to_string(),
            cidr.network.to_string(),
            "-netmask".to_string(),
            cidr.netmask().to_string(),
            "-interface".to_string(),
            interface.to_string(),
        ];
        let result = self.runner.run("route", &args)?;
        if !result.success {
            return Err(io::Error::new(
                ErrorKind::Other,
                format!("route add {} failed: {}", cidr, result.output.trim()),
            ));
        }
        routes.push((*cidr, interface.to_string()));
        debug!("route added: {} -> {}", cidr, interface);
        Ok(())
    }

    /// Installs routes for every prefix, rolling back all prior additions
    /// if any add fails. Either all prefixes end up installed or none do.
    pub fn add_all(&self, cidrs: &[Cidr], interface: &str) -> io::Result<()> {
        for cidr in cidrs {
            if let Err(e) = self.add(cidr, interface) {
                self.cleanup();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Removes one route, whether or not this manager installed it.
    pub fn remove(&self, cidr: &Cidr) -> io::Result<()> {
        let mut routes = self.routes.lock().unwrap();
        self.delete_route(cidr)?;
        routes.retain(|(c, _)| c != cidr);
        Ok(())
    }

    /// Drains the recorded set, removing each installed route. Failures are
    /// logged and do not stop the drain; calling twice is indistinguishable
    /// from calling once.
    pub fn cleanup(&self) {
        let mut routes = self.routes.lock().unwrap();
        for (cidr, _) in routes.drain(..) {
            if let Err(e) = self.delete_route(&cidr) {
                warn!("failed to remove route {}: {}", cidr, e);
            }
        }
    }

    pub fn routes(&self) -> Vec<(Cidr, String)> {
        self.routes.lock().unwrap().clone()
    }

    fn delete_route(&self, cidr: &Cidr) -> io::Result<()> {
        let args = vec![
            "delete".to_string(),
            "-net".to_string(),
            cidr.network.to_string(),
            "-netmask".to_string(),
            cidr.netmask().to_string(),
        ];
        let result = self.runner.run("route", &args)?;
        if !result.success && !result.output.contains("not in table") {
            return Err(io::Error::new(
                ErrorKind::Other,
                format!("route delete {} failed: {}", cidr, result.output.trim()),
            ));
        }
        debug!("route removed: {}", cidr);
        Ok(())
    }
}
