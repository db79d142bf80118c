//! Persisted session records: one JSON document per session so concurrent
//! sessions can be listed, signalled, and stale ones reaped.

use std::fs;
use std::io;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Session {
    pub name: String,
    pub instance_id: String,
    // no identifier distinct from the name exists in the socks-over-shell
    // model; the name doubles as the id
    pub session_id: String,
    pub tun_device: String,
    pub tun_ip: String,
    pub prefixes: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub pid: i32,
}

pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new() -> SessionStore {
        let dir = match std::env::var_os("HOME") {
            Some(home) => Path::new(&home).join(".vpctun").join("sessions"),
            None => PathBuf::from("/tmp/vpctun/sessions"),
        };
        SessionStore { dir }
    }

    pub fn at(dir: &Path) -> SessionStore {
        SessionStore {
            dir: dir.to_path_buf(),
        }
    }

    pub fn save(&self, session: &Session) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700));
        }
        let data = serde_json::to_vec_pretty(session)?;
        let path = self.path_for(&session.name);
        fs::write(&path, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o600));
        }
        debug!("session saved: {}", path.display());
        Ok(())
    }

    pub fn get(&self, name: &str) -> io::Result<Session> {
        let data = fs::read(self.path_for(name)).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                io::Error::new(ErrorKind::NotFound, format!("session not found: {}", name))
            } else {
                e
            }
        })?;
        let session = serde_json::from_slice(&data)?;
        Ok(session)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).exists()
    }

    /// All readable session records, newest first. Unreadable or
    /// unparseable files are skipped.
    pub fn list(&self) -> io::Result<Vec<Session>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(data) = fs::read(&path) else {
                continue;
            };
            let Ok(session) = serde_json::from_slice::<Session>(&data) else {
                continue;
            };
            sessions.push(session);
        }
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions)
    }

    /// Removing a session that does not exist is success.
    pub fn remove(&self, name: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drops records whose owning process is gone; returns their names.
    pub fn remove_stale(&self) -> io::Result<Vec<String>> {
        let mut removed = Vec::new();
        for session in self.list()? {
            if !process_alive(session.pid) {
                if self.remove(&session.name).is_ok() {
                    removed.push(session.name);
                }
            }
        }
        Ok(removed)
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        SessionStore::new()
    }
}

/// Signal-0 liveness probe; EPERM still means the process exists.
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Delivers SIGTERM (or SIGKILL when `force`) to a session's process.
pub fn signal_process(pid: i32, force: bool) -> io::Result<()> {
    if pid <= 0 {
        return Err(io::Error::new(ErrorKind::InvalidInput, "bad pid"));
    }
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
