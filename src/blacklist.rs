//! Static + dynamic IP denylist consulted by the edge filter
//!
//! The static set comes from configuration (inline list or file) and is
//! replaced wholesale every refresh window. The dynamic map is fed by admin
//! actions and the startup bootstrap file; an entry with a past expiry is
//! dropped the first time it is looked at.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::lazy_cache::LazyRefreshCache;
use crate::lock_utils::{read_lock_or_recover, write_lock_or_recover};

/// A dynamic blacklist entry; `expiry_epoch_millis == 0` means permanent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlacklistEntry {
    pub ip: String,
    pub expiry_epoch_millis: u64,
}

impl BlacklistEntry {
    pub fn is_permanent(&self) -> bool {
        self.expiry_epoch_millis == 0
    }

    pub fn is_expired(&self, now_millis: u64) -> bool {
        !self.is_permanent() && self.expiry_epoch_millis <= now_millis
    }
}

/// Which list matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistRule {
    Static,
    Dynamic,
}

impl fmt::Display for BlacklistRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlacklistRule::Static => f.write_str("static"),
            BlacklistRule::Dynamic => f.write_str("dynamic"),
        }
    }
}

/// Where the static blacklist comes from
#[async_trait]
pub trait StaticBlacklistSource: Send + Sync {
    async fn load(&self) -> Result<HashSet<String>>;
}

/// Inline list from configuration
pub struct FixedBlacklist {
    ips: HashSet<String>,
}

impl FixedBlacklist {
    pub fn new(ips: impl IntoIterator<Item = String>) -> Self {
        Self {
            ips: ips.into_iter().filter_map(|ip| normalize_ip(&ip)).collect(),
        }
    }
}

#[async_trait]
impl StaticBlacklistSource for FixedBlacklist {
    async fn load(&self) -> Result<HashSet<String>> {
        Ok(self.ips.clone())
    }
}

/// Comma-separated list re-read from disk on every refresh
pub struct FileBlacklist {
    path: PathBuf,
}

impl FileBlacklist {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StaticBlacklistSource for FileBlacklist {
    async fn load(&self) -> Result<HashSet<String>> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read static blacklist {:?}", self.path))?;
        Ok(parse_ip_list(&contents).into_iter().collect())
    }
}

/// Split a comma/whitespace separated IP list, dropping invalid addresses
pub fn parse_ip_list(contents: &str) -> Vec<String> {
    contents
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .filter_map(|s| {
            let ip = normalize_ip(s);
            if ip.is_none() {
                warn!("Skipping invalid blacklist address '{}'", s);
            }
            ip
        })
        .collect()
}

/// Canonical text form of an address, so "::1" and "0:0::1" collide
fn normalize_ip(ip: &str) -> Option<String> {
    ip.trim().parse::<IpAddr>().ok().map(|addr| addr.to_string())
}

pub struct BlacklistRegistry {
    static_source: Arc<dyn StaticBlacklistSource>,
    static_ips: LazyRefreshCache<Arc<HashSet<String>>>,
    dynamic: RwLock<HashMap<String, u64>>,
    wall_clock: Arc<dyn Clock>,
}

impl BlacklistRegistry {
    pub fn new(static_source: Arc<dyn StaticBlacklistSource>, refresh: Duration) -> Self {
        Self {
            static_source,
            static_ips: LazyRefreshCache::new("static blacklist", Arc::new(HashSet::new()), refresh),
            dynamic: RwLock::new(HashMap::new()),
            wall_clock: Arc::new(SystemClock),
        }
    }

    /// Override the clocks used for the static refresh window and for
    /// dynamic expiry
    pub fn with_clocks(
        static_source: Arc<dyn StaticBlacklistSource>,
        refresh: Duration,
        refresh_clock: Arc<dyn Clock>,
        wall_clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            static_source,
            static_ips: LazyRefreshCache::with_clock(
                "static blacklist",
                Arc::new(HashSet::new()),
                refresh,
                refresh_clock,
            ),
            dynamic: RwLock::new(HashMap::new()),
            wall_clock,
        }
    }

    /// Registry with no static entries
    pub fn empty() -> Self {
        Self::new(
            Arc::new(FixedBlacklist::new(Vec::new())),
            Duration::from_secs(3600),
        )
    }

    async fn static_set(&self) -> Arc<HashSet<String>> {
        let source = Arc::clone(&self.static_source);
        self.static_ips
            .get_or_stale(|| async move { source.load().await.map(Arc::new) })
            .await
    }

    /// Which list, if any, blocks `ip`
    pub async fn contains(&self, ip: &str) -> Option<BlacklistRule> {
        let ip = normalize_ip(ip).unwrap_or_else(|| ip.to_string());

        if self.static_set().await.contains(&ip) {
            return Some(BlacklistRule::Static);
        }

        let expiry = read_lock_or_recover(&self.dynamic, "dynamic blacklist")
            .get(&ip)
            .copied()?;
        let entry = BlacklistEntry {
            ip: ip.clone(),
            expiry_epoch_millis: expiry,
        };
        if !entry.is_expired(self.wall_clock.now_millis()) {
            return Some(BlacklistRule::Dynamic);
        }

        let mut dynamic = write_lock_or_recover(&self.dynamic, "dynamic blacklist");
        // Re-check: an admin may have extended the entry in between
        if let Some(&current) = dynamic.get(&ip) {
            if current == expiry {
                dynamic.remove(&ip);
                debug!("Expired blacklist entry for {} removed", ip);
            } else if current == 0 || current > self.wall_clock.now_millis() {
                return Some(BlacklistRule::Dynamic);
            }
        }
        None
    }

    /// Block `ip` until `expiry_epoch_millis` (0 = forever)
    pub fn add(&self, ip: &str, expiry_epoch_millis: u64) -> Result<()> {
        let ip = normalize_ip(ip).with_context(|| format!("Invalid IP address '{}'", ip))?;
        write_lock_or_recover(&self.dynamic, "dynamic blacklist").insert(ip.clone(), expiry_epoch_millis);
        info!("Blacklisted {} (expiry: {})", ip, expiry_epoch_millis);
        Ok(())
    }

    /// Block `ip` for `duration` from now
    pub fn add_for(&self, ip: &str, duration: Duration) -> Result<()> {
        let expiry = self
            .wall_clock
            .now_millis()
            .saturating_add(duration.as_millis() as u64)
            .max(1);
        self.add(ip, expiry)
    }

    pub fn remove(&self, ip: &str) -> bool {
        let ip = normalize_ip(ip).unwrap_or_else(|| ip.to_string());
        let removed = write_lock_or_recover(&self.dynamic, "dynamic blacklist")
            .remove(&ip)
            .is_some();
        if removed {
            info!("Removed {} from dynamic blacklist", ip);
        }
        removed
    }

    /// Live dynamic entries, sorted by IP
    pub fn entries(&self) -> Vec<BlacklistEntry> {
        let now = self.wall_clock.now_millis();
        let mut entries: Vec<BlacklistEntry> = read_lock_or_recover(&self.dynamic, "dynamic blacklist")
            .iter()
            .map(|(ip, expiry)| BlacklistEntry {
                ip: ip.clone(),
                expiry_epoch_millis: *expiry,
            })
            .filter(|e| !e.is_expired(now))
            .collect();
        entries.sort_by(|a, b| a.ip.cmp(&b.ip));
        entries
    }

    /// Load the startup bootstrap file as permanent dynamic entries.
    ///
    /// A missing file is not an error: the dynamic list just starts empty.
    pub async fn load_bootstrap_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No blacklist bootstrap file at {:?}, starting empty", path);
                return Ok(0);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read blacklist bootstrap {:?}", path))
            }
        };

        let ips = parse_ip_list(&contents);
        let mut dynamic = write_lock_or_recover(&self.dynamic, "dynamic blacklist");
        for ip in &ips {
            dynamic.insert(ip.clone(), 0);
        }
        info!("Loaded {} blacklist entries from {:?}", ips.len(), path);
        Ok(ips.len())
    }

    /// Recompute the static set now. Returns its size.
    pub async fn reload_static(&self) -> Result<usize> {
        self.static_ips.invalidate();
        let source = Arc::clone(&self.static_source);
        let set = self
            .static_ips
            .try_get(|| async move { source.load().await.map(Arc::new) })
            .await?;
        info!("Static blacklist reloaded: {} entries", set.len());
        Ok(set.len())
    }

    /// Current static set without refreshing it
    pub fn static_entries(&self) -> Vec<String> {
        let mut ips: Vec<String> = self.static_ips.peek().iter().cloned().collect();
        ips.sort();
        ips
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const NOW: u64 = 1_700_000_000_000;

    fn registry(static_ips: &[&str], wall: Arc<ManualClock>) -> BlacklistRegistry {
        BlacklistRegistry::with_clocks(
            Arc::new(FixedBlacklist::new(static_ips.iter().map(|s| s.to_string()))),
            Duration::from_secs(60),
            Arc::new(ManualClock::new(0)),
            wall,
        )
    }

    #[test]
    fn test_parse_ip_list() {
        let ips = parse_ip_list("10.0.0.1, 10.0.0.2,\n::1  not-an-ip,,192.168.1.300");
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2", "::1"]);
    }

    #[tokio::test]
    async fn test_static_match() {
        let bl = registry(&["203.0.113.9"], Arc::new(ManualClock::new(NOW)));
        assert_eq!(bl.contains("203.0.113.9").await, Some(BlacklistRule::Static));
        assert_eq!(bl.contains("203.0.113.10").await, None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent_and_removed() {
        let bl = registry(&[], Arc::new(ManualClock::new(NOW)));
        bl.add("10.1.1.1", NOW - 1).unwrap();

        assert_eq!(bl.contains("10.1.1.1").await, None);
        assert!(!bl.remove("10.1.1.1"), "expired entry should already be gone");
    }

    #[tokio::test]
    async fn test_permanent_entry_never_expires() {
        let wall = Arc::new(ManualClock::new(NOW));
        let bl = registry(&[], wall.clone());
        bl.add("10.1.1.2", 0).unwrap();

        wall.advance(10 * 365 * 24 * 3600 * 1000);
        assert_eq!(bl.contains("10.1.1.2").await, Some(BlacklistRule::Dynamic));
    }

    #[tokio::test]
    async fn test_timed_entry_expires() {
        let wall = Arc::new(ManualClock::new(NOW));
        let bl = registry(&[], wall.clone());
        bl.add_for("10.1.1.3", Duration::from_secs(30)).unwrap();

        assert_eq!(bl.contains("10.1.1.3").await, Some(BlacklistRule::Dynamic));
        wall.advance(30_000);
        assert_eq!(bl.contains("10.1.1.3").await, None);
    }

    #[tokio::test]
    async fn test_add_rejects_garbage() {
        let bl = BlacklistRegistry::empty();
        assert!(bl.add("not-an-ip", 0).is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "198.51.100.1,198.51.100.2, bogus").unwrap();

        let bl = BlacklistRegistry::empty();
        assert_eq!(bl.load_bootstrap_file(file.path()).await.unwrap(), 2);
        assert_eq!(bl.contains("198.51.100.2").await, Some(BlacklistRule::Dynamic));
        assert!(bl.entries().iter().all(BlacklistEntry::is_permanent));
    }

    #[tokio::test]
    async fn test_missing_bootstrap_file_is_tolerated() {
        let bl = BlacklistRegistry::empty();
        let loaded = bl
            .load_bootstrap_file("/nonexistent/aegis/blacklist.txt")
            .await
            .unwrap();
        assert_eq!(loaded, 0);
        assert!(bl.entries().is_empty());
    }

    #[tokio::test]
    async fn test_file_source_reload_replaces_static_set() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "192.0.2.1").unwrap();
        file.flush().unwrap();

        let bl = BlacklistRegistry::new(
            Arc::new(FileBlacklist::new(file.path())),
            Duration::from_secs(3600),
        );
        assert_eq!(bl.contains("192.0.2.1").await, Some(BlacklistRule::Static));

        std::fs::write(file.path(), "192.0.2.2").unwrap();
        // Still inside the refresh window
        assert_eq!(bl.contains("192.0.2.1").await, Some(BlacklistRule::Static));

        assert_eq!(bl.reload_static().await.unwrap(), 1);
        assert_eq!(bl.contains("192.0.2.1").await, None);
        assert_eq!(bl.contains("192.0.2.2").await, Some(BlacklistRule::Static));
    }

    struct BrokenSource {
        loads: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl StaticBlacklistSource for BrokenSource {
        async fn load(&self) -> Result<HashSet<String>> {
            self.loads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            anyhow::bail!("static list unreadable")
        }
    }

    #[tokio::test]
    async fn test_broken_static_source_read_once_per_window() {
        let source = Arc::new(BrokenSource {
            loads: std::sync::atomic::AtomicUsize::new(0),
        });
        let refresh_clock = Arc::new(ManualClock::new(0));
        let bl = BlacklistRegistry::with_clocks(
            source.clone(),
            Duration::from_secs(60),
            refresh_clock.clone(),
            Arc::new(ManualClock::new(NOW)),
        );

        for _ in 0..100 {
            assert_eq!(bl.contains("203.0.113.50").await, None);
        }
        assert_eq!(source.loads.load(std::sync::atomic::Ordering::SeqCst), 1);

        refresh_clock.advance(60_000);
        bl.contains("203.0.113.50").await;
        assert_eq!(source.loads.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_static_refresh_keeps_old_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static.txt");
        std::fs::write(&path, "192.0.2.7").unwrap();

        let bl = BlacklistRegistry::new(Arc::new(FileBlacklist::new(&path)), Duration::from_secs(3600));
        assert_eq!(bl.contains("192.0.2.7").await, Some(BlacklistRule::Static));

        std::fs::remove_file(&path).unwrap();
        assert!(bl.reload_static().await.is_err());
        assert_eq!(bl.static_entries(), vec!["192.0.2.7"]);
    }
}
