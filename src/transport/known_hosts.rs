//! Known hosts management for SSH host key verification
//!
//! Backs the `ssh_host_key_changed` error taxonomy entry. The store is an
//! explicit object owned by the gateway and handed into each dial; there is
//! no module-level global.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use parking_lot::RwLock;
use russh::keys::{parse_public_key_base64, HashAlg, PublicKey, PublicKeyBase64};
use tracing::{debug, info, warn};

use super::TransportError;

/// Result of host key verification.
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches a known_hosts entry.
    Verified,
    /// Host not in known_hosts (first connection).
    Unknown { fingerprint: String },
    /// Key changed from the known_hosts entry (potential MITM).
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// Known hosts store backed by an OpenSSH-format file.
pub struct KnownHostsStore {
    /// Cache of host -> list of keys (supports multiple key types per host).
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    /// Path to the known_hosts file.
    path: PathBuf,
}

impl Default for KnownHostsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KnownHostsStore {
    /// Create a store loading from the default `~/.ssh/known_hosts`.
    pub fn new() -> Self {
        let path = std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from(".ssh/known_hosts"));

        Self::with_path(path)
    }

    /// Create with a custom path.
    pub fn with_path(path: PathBuf) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path,
        };

        if let Err(e) = store.load() {
            debug!("Known hosts file not found or unreadable: {}", e);
        }

        store
    }

    /// Load the known_hosts file into the cache.
    fn load(&self) -> Result<(), TransportError> {
        if !self.path.exists() {
            return Ok(());
        }

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // Format: hostname[,alias...] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let hostnames = parts[0];
            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in hostnames.split(',') {
                // Hashed hostnames (|1|...) are not supported for lookup.
                if hostname.starts_with('|') {
                    continue;
                }

                let normalized = Self::normalize_hostname(hostname);
                hosts.entry(normalized).or_default().push(entry.clone());
                entry_count += 1;
            }
        }

        info!(
            "Loaded {} known host entries ({} unique hosts)",
            entry_count,
            hosts.len()
        );
        Ok(())
    }

    /// Normalize hostname for lookup: `[host]:port` -> `host`.
    fn normalize_hostname(host: &str) -> String {
        let host = host.trim_start_matches('[');
        if let Some(idx) = host.find("]:") {
            host[..idx].to_lowercase()
        } else {
            host.trim_end_matches(']').to_lowercase()
        }
    }

    /// Lookup key for host:port.
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// SHA256 fingerprint of a public key.
    pub fn fingerprint(key: &PublicKey) -> String {
        key.fingerprint(HashAlg::Sha256).to_string()
    }

    /// Verify a host's public key against the store.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_key_b64 = key.public_key_base64();
        let actual_key_type = key.algorithm().to_string();
        let fingerprint = Self::fingerprint(key);

        let hosts = self.hosts.read();

        let check_entries = |entries: &Vec<HostKeyEntry>| -> Option<HostKeyVerification> {
            for entry in entries {
                if entry.key_type == actual_key_type {
                    if entry.key_data == actual_key_b64 {
                        debug!(
                            "Host key verified for {} (type: {})",
                            lookup_key, actual_key_type
                        );
                        return Some(HostKeyVerification::Verified);
                    } else {
                        let expected_fingerprint =
                            Self::fingerprint_from_b64(&entry.key_data);
                        warn!(
                            "HOST KEY CHANGED for {} (type: {})! Expected {}, got {}",
                            lookup_key, actual_key_type, expected_fingerprint, fingerprint
                        );
                        return Some(HostKeyVerification::Changed {
                            expected_fingerprint,
                            actual_fingerprint: fingerprint.clone(),
                        });
                    }
                }
            }
            // Host known but not for this key type.
            None
        };

        // Exact match (with port) first.
        if let Some(entries) = hosts.get(&lookup_key) {
            if let Some(result) = check_entries(entries) {
                return result;
            }
            return HostKeyVerification::Unknown { fingerprint };
        }

        // Then hostname without port.
        let host_only = host.to_lowercase();
        if let Some(entries) = hosts.get(&host_only) {
            if let Some(result) = check_entries(entries) {
                return result;
            }
            return HostKeyVerification::Unknown { fingerprint };
        }

        debug!("Unknown host: {}", lookup_key);
        HostKeyVerification::Unknown { fingerprint }
    }

    /// Fingerprint of a stored base64 key, or "unknown" if unparseable.
    fn fingerprint_from_b64(stored_b64: &str) -> String {
        match parse_public_key_base64(stored_b64) {
            Ok(key) => Self::fingerprint(&key),
            Err(_) => "unknown".to_string(),
        }
    }

    /// Add a new host key to the store and append it to the file.
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), TransportError> {
        let lookup_key = Self::make_key(host, port);
        let key_b64 = key.public_key_base64();
        let key_type = key.algorithm().to_string();

        {
            let mut hosts = self.hosts.write();
            let entry = HostKeyEntry {
                key_type: key_type.clone(),
                key_data: key_b64.clone(),
            };
            hosts.entry(lookup_key.clone()).or_default().push(entry);
        }

        self.append_to_file(&lookup_key, &key_type, &key_b64)?;

        info!(
            "Added host key for {} (type: {}) to known_hosts",
            lookup_key, key_type
        );
        Ok(())
    }

    /// Append an entry to the known_hosts file.
    fn append_to_file(&self, host: &str, key_type: &str, key_b64: &str) -> Result<(), TransportError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        writeln!(file, "{} {} {}", host, key_type, key_b64)?;

        Ok(())
    }

    /// Remove a host from the store (for key rotation).
    pub fn remove_host(&self, host: &str, port: u16) -> Result<(), TransportError> {
        let lookup_key = Self::make_key(host, port);

        {
            let mut hosts = self.hosts.write();
            hosts.remove(&lookup_key);
        }

        self.rewrite_without_host(&lookup_key)?;

        info!("Removed host key for {} from known_hosts", lookup_key);
        Ok(())
    }

    /// Rewrite the known_hosts file without the given host.
    fn rewrite_without_host(&self, remove_host: &str) -> Result<(), TransportError> {
        if !self.path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(&self.path)?;

        let filtered: Vec<&str> = content
            .lines()
            .filter(|line| {
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.is_empty() {
                    return true;
                }
                let hostnames = parts[0];
                !hostnames
                    .split(',')
                    .any(|h| Self::normalize_hostname(h) == remove_host)
            })
            .collect();

        fs::write(&self.path, filtered.join("\n") + "\n")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(
            KnownHostsStore::normalize_hostname("github.com"),
            "github.com"
        );
        assert_eq!(
            KnownHostsStore::normalize_hostname("[github.com]:22"),
            "github.com"
        );
        assert_eq!(
            KnownHostsStore::normalize_hostname("[server.example.com]:2222"),
            "server.example.com"
        );
    }

    #[test]
    fn test_make_key() {
        assert_eq!(KnownHostsStore::make_key("github.com", 22), "github.com");
        assert_eq!(
            KnownHostsStore::make_key("server.com", 2222),
            "[server.com]:2222"
        );
    }

    #[test]
    fn test_load_skips_comments_and_hashed_hosts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(
            &path,
            "# comment line\n\
             |1|hashed entry ssh-ed25519 AAAA\n\
             example.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFakeFakeFake\n",
        )
        .unwrap();

        let store = KnownHostsStore::with_path(path);
        let hosts = store.hosts.read();
        assert_eq!(hosts.len(), 1);
        assert!(hosts.contains_key("example.com"));
    }

    #[test]
    fn test_rewrite_without_host() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(
            &path,
            "example.com ssh-ed25519 AAAA1\n\
             other.com ssh-ed25519 AAAA2\n",
        )
        .unwrap();

        let store = KnownHostsStore::with_path(path.clone());
        store.remove_host("example.com", 22).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.contains("example.com"));
        assert!(content.contains("other.com"));
    }
}
