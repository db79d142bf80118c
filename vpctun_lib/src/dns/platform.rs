//! Per-suffix resolver configuration on the reference platform: one file
//! under `/etc/resolver/<suffix>` naming the synthetic resolver, with any
//! pre-existing file backed up and restored on exit.

use std::fs;
use std::io;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use log::{debug, warn};

const RESOLVER_DIR: &str = "/etc/resolver";
const BACKUP_SUFFIX: &str = ".vpctun-backup";

pub struct ResolverFiles {
    root: PathBuf,
    dns_ip: String,
    domains: Vec<String>,
    // resolver files this run wrote, plus the backups it made
    created: Mutex<Vec<PathBuf>>,
    flush_cache: bool,
}

impl ResolverFiles {
    pub fn new(domains: Vec<String>, dns_server: &str) -> ResolverFiles {
        ResolverFiles {
            root: PathBuf::from(RESOLVER_DIR),
            dns_ip: host_part(dns_server),
            domains,
            created: Mutex::new(Vec::new()),
            flush_cache: true,
        }
    }

    #[cfg(test)]
    pub(crate) fn at(root: &Path, domains: Vec<String>, dns_server: &str) -> ResolverFiles {
        ResolverFiles {
            root: root.to_path_buf(),
            dns_ip: host_part(dns_server),
            domains,
            created: Mutex::new(Vec::new()),
            flush_cache: false,
        }
    }

    /// Writes one resolver file per configured suffix. A failure mid-way
    /// undoes what was written and surfaces the error; the caller treats it
    /// as a warning and continues without OS integration.
    pub fn install(&self) -> io::Result<()> {
        if self.domains.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.root)?;

        for domain in &self.domains {
            let Some(base) = base_domain(domain) else {
                warn!("skipping invalid domain pattern: {}", domain);
                continue;
            };
            let file = self.root.join(&base);

            if file.exists() {
                let backup = backup_path(&file);
                match fs::rename(&file, &backup) {
                    Ok(()) => {
                        debug!("backed up existing resolver file to {}", backup.display());
                        self.created.lock().unwrap().push(backup);
                    }
                    Err(e) => warn!(
                        "failed to back up resolver file {}: {}",
                        file.display(),
                        e
                    ),
                }
            }

            let content = format!("nameserver {}\nsearch_order 1\n", self.dns_ip);
            if let Err(e) = fs::write(&file, content) {
                self.cleanup();
                return Err(io::Error::new(
                    ErrorKind::Other,
                    format!("failed to write resolver file {}: {}", file.display(), e),
                ));
            }
            self.created.lock().unwrap().push(file.clone());
            debug!("configured resolver: {} -> {}", base, self.dns_ip);
        }

        self.flush();
        Ok(())
    }

    /// Removes every file this run created and restores every backup it
    /// made. Safe to call more than once.
    pub fn cleanup(&self) {
        let created: Vec<PathBuf> = self.created.lock().unwrap().drain(..).collect();
        if created.is_empty() {
            return;
        }

        for file in created {
            if file.to_string_lossy().ends_with(BACKUP_SUFFIX) {
                let original = original_path(&file);
                match fs::rename(&file, &original) {
                    Ok(()) => debug!("restored resolver file {}", original.display()),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => warn!("failed to restore {}: {}", file.display(), e),
                }
            } else {
                match fs::remove_file(&file) {
                    Ok(()) => debug!("removed resolver file {}", file.display()),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => warn!("failed to remove {}: {}", file.display(), e),
                }
            }
        }

        self.flush();
    }

    fn flush(&self) {
        if !self.flush_cache {
            return;
        }
        if let Err(e) = Command::new("dscacheutil").arg("-flushcache").status() {
            debug!("dscacheutil -flushcache failed: {}", e);
        }
        if let Err(e) = Command::new("killall").args(["-HUP", "mDNSResponder"]).status() {
            warn!("failed to signal mDNSResponder: {}", e);
        }
    }
}

fn host_part(addr: &str) -> String {
    match addr.split_once(':') {
        Some((host, _)) => host.to_string(),
        None => addr.to_string(),
    }
}

fn base_domain(pattern: &str) -> Option<String> {
    let domain = pattern.trim().trim_matches('.');
    if domain.is_empty() || !domain.contains('.') {
        return None;
    }
    Some(domain.to_string())
}

fn backup_path(file: &Path) -> PathBuf {
    PathBuf::from(format!("{}{}", file.display(), BACKUP_SUFFIX))
}

fn original_path(backup: &Path) -> PathBuf {
    let s = backup.to_string_lossy();
    PathBuf::from(s.trim_end_matches(BACKUP_SUFFIX).to_string())
}
