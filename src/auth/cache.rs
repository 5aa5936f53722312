use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

/// Default safety margin before an installation token's real expiry.
pub const DEFAULT_REFRESH_BUFFER_SECS: i64 = 5 * 60;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Memoizes short-lived installation tokens per installation id, and the
/// repository to installation id mapping used to find them.
///
/// A token is never handed out once `now > expires_at - buffer`; such an
/// entry is evicted on read so the caller negotiates a fresh one.
pub struct InstallationTokenCache {
    entries: DashMap<u64, CachedToken>,
    installations: DashMap<String, u64>,
    buffer: Duration,
}

impl Default for InstallationTokenCache {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_REFRESH_BUFFER_SECS))
    }
}

fn repo_key(owner: &str, repo: &str) -> String {
    format!("{}/{}", owner, repo).to_lowercase()
}

impl InstallationTokenCache {
    pub fn new(buffer: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            installations: DashMap::new(),
            buffer,
        }
    }

    pub fn get(&self, installation_id: u64) -> Option<String> {
        self.get_at(installation_id, Utc::now())
    }

    pub fn get_at(&self, installation_id: u64, now: DateTime<Utc>) -> Option<String> {
        if let Some(entry) = self.entries.get(&installation_id)
            && !self.is_stale(&entry, now)
        {
            return Some(entry.token.clone());
        }
        self.evict_if_stale(installation_id, now);
        None
    }

    fn is_stale(&self, entry: &CachedToken, now: DateTime<Utc>) -> bool {
        now > entry.expires_at - self.buffer
    }

    /// Re-checks staleness under the shard lock, so a token inserted by a
    /// concurrent refresh after our read is kept.
    fn evict_if_stale(&self, installation_id: u64, now: DateTime<Utc>) {
        self.entries
            .remove_if(&installation_id, |_, entry| self.is_stale(entry, now));
    }

    pub fn insert(&self, installation_id: u64, token: String, expires_at: DateTime<Utc>) {
        self.entries
            .insert(installation_id, CachedToken { token, expires_at });
    }

    pub fn invalidate(&self, installation_id: u64) {
        self.entries.remove(&installation_id);
    }

    pub fn installation_id(&self, owner: &str, repo: &str) -> Option<u64> {
        self.installations.get(&repo_key(owner, repo)).map(|id| *id)
    }

    pub fn remember_installation(&self, owner: &str, repo: &str, installation_id: u64) {
        self.installations
            .insert(repo_key(owner, repo), installation_id);
    }

    /// Drop a repository's installation mapping, e.g. after the App was
    /// reinstalled under a new id.
    pub fn forget_installation(&self, owner: &str, repo: &str) {
        self.installations.remove(&repo_key(owner, repo));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
