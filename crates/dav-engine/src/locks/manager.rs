//! The lock table.

use super::{
    ActiveLock, ConflictCheck, Depth, LockRequest, LockResult, LockScope, LockTimeout, LockToken,
    RefreshError, RefreshResult,
};
use crate::config::{EngineConfig, DEFAULT_LOCK_TIMEOUT, DEFAULT_MAX_LOCK_TIMEOUT};
use crate::error::{DavError, DavResult};
use crate::path::DavPath;
use crate::stats::EngineStats;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Timeout policy applied to lock and refresh requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Used when the request names no timeout.
    pub default_timeout: Duration,
    /// Upper bound for finite requests (`None` = unbounded).
    pub max_timeout: Option<Duration>,
    /// Whether infinite requests are honoured.
    pub allow_infinite: bool,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_LOCK_TIMEOUT,
            max_timeout: Some(DEFAULT_MAX_LOCK_TIMEOUT),
            allow_infinite: false,
        }
    }
}

impl From<&EngineConfig> for LockPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            default_timeout: config.default_lock_timeout,
            max_timeout: config.max_lock_timeout,
            allow_infinite: config.allow_infinite_locks,
        }
    }
}

impl LockPolicy {
    /// Clamp a requested timeout to this policy.
    pub fn effective(&self, requested: Option<LockTimeout>) -> LockTimeout {
        match requested {
            None => LockTimeout::Finite(self.default_timeout),
            Some(LockTimeout::Infinite) if self.allow_infinite => LockTimeout::Infinite,
            Some(LockTimeout::Infinite) => {
                LockTimeout::Finite(self.max_timeout.unwrap_or(self.default_timeout))
            }
            Some(LockTimeout::Finite(d)) if d.is_zero() => LockTimeout::Finite(self.default_timeout),
            Some(LockTimeout::Finite(d)) => {
                LockTimeout::Finite(self.max_timeout.map_or(d, |max| d.min(max)))
            }
        }
    }
}

/// `None` when the lock never expires, including finite timeouts too large
/// to represent as an instant.
fn deadline_for(timeout: LockTimeout, now: Instant) -> Option<Instant> {
    match timeout {
        LockTimeout::Finite(d) => now.checked_add(d),
        LockTimeout::Infinite => None,
    }
}

/// Locks indexed by token and by root path.
#[derive(Debug, Default)]
struct LockTable {
    locks: HashMap<LockToken, ActiveLock>,
    by_path: BTreeMap<String, Vec<LockToken>>,
}

impl LockTable {
    fn insert(&mut self, lock: ActiveLock) {
        self.by_path
            .entry(lock.path.as_str().to_string())
            .or_default()
            .push(lock.token.clone());
        self.locks.insert(lock.token.clone(), lock);
    }

    fn remove(&mut self, token: &LockToken) -> Option<ActiveLock> {
        let lock = self.locks.remove(token)?;
        if let Some(tokens) = self.by_path.get_mut(lock.path.as_str()) {
            tokens.retain(|t| t != token);
            if tokens.is_empty() {
                self.by_path.remove(lock.path.as_str());
            }
        }
        Some(lock)
    }

    /// Tokens rooted at `path` or at one of its ancestors.
    fn tokens_at_or_above(&self, path: &DavPath) -> Vec<LockToken> {
        path.ancestors()
            .iter()
            .chain(std::iter::once(path))
            .filter_map(|p| self.by_path.get(p.as_str()))
            .flatten()
            .cloned()
            .collect()
    }

    /// Tokens rooted strictly below `path`.
    fn tokens_below(&self, path: &DavPath) -> Vec<LockToken> {
        if path.is_root() {
            return self
                .by_path
                .iter()
                .filter(|(k, _)| !k.is_empty())
                .flat_map(|(_, v)| v.iter().cloned())
                .collect();
        }
        let prefix = format!("{}/", path.as_str());
        self.by_path
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .flat_map(|(_, v)| v.iter().cloned())
            .collect()
    }

    /// Live locks intersecting the scope `(path, depth)`, ordered by root
    /// path. Expired candidates are purged; the purge count is returned too.
    fn intersecting(&mut self, path: &DavPath, depth: Depth, now: Instant) -> (Vec<ActiveLock>, usize) {
        let mut candidates = self.tokens_at_or_above(path);
        if depth.reaches_members() {
            candidates.extend(self.tokens_below(path));
        }

        let mut live = Vec::new();
        let mut expired = 0;
        for token in candidates {
            let Some(lock) = self.locks.get(&token) else {
                continue;
            };
            if lock.is_expired(now) {
                trace!(token = %token, path = %lock.path, "Purging expired lock");
                self.remove(&token);
                expired += 1;
            } else if lock.intersects(path, depth) {
                live.push(lock.clone());
            }
        }
        (live, expired)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<LockToken> = self
            .locks
            .values()
            .filter(|l| l.is_expired(now))
            .map(|l| l.token.clone())
            .collect();
        for token in &expired {
            self.remove(token);
        }
        expired.len()
    }
}

/// Process-wide authority over the active locks of one engine.
///
/// All state sits behind a single mutex so depth-infinity checks see a
/// consistent view of the whole table. No method awaits while holding it.
///
/// # Example
///
/// ```
/// use dav_engine::{DavPath, LockManager, LockPolicy, LockRequest, LockResult};
///
/// let manager = LockManager::new(LockPolicy::default());
/// let path = DavPath::parse("/docs").unwrap();
///
/// let LockResult::Granted(lock) = manager.lock(LockRequest::exclusive(path.clone())) else {
///     panic!("first lock must be granted");
/// };
/// assert!(matches!(
///     manager.lock(LockRequest::exclusive(path)),
///     LockResult::Conflict(_)
/// ));
/// manager.unlock(&lock.token).unwrap();
/// ```
#[derive(Debug)]
pub struct LockManager {
    table: Mutex<LockTable>,
    policy: LockPolicy,
    stats: Arc<EngineStats>,
}

impl LockManager {
    /// Create an empty lock manager.
    pub fn new(policy: LockPolicy) -> Self {
        Self::with_stats(policy, Arc::new(EngineStats::new()))
    }

    /// Create an empty lock manager reporting into `stats`.
    pub fn with_stats(policy: LockPolicy, stats: Arc<EngineStats>) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            policy,
            stats,
        }
    }

    /// The timeout policy.
    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    /// Grant a lock unless an intersecting lock forbids it.
    pub fn lock(&self, request: LockRequest) -> LockResult {
        let now = Instant::now();
        let depth = match request.depth {
            Depth::Zero => Depth::Zero,
            Depth::One | Depth::Infinity => Depth::Infinity,
        };

        let mut table = self.table.lock();
        let (existing, expired) = table.intersecting(&request.path, depth, now);
        self.stats.record_locks_expired(expired);

        let blocker = existing
            .into_iter()
            .find(|l| request.scope == LockScope::Exclusive || l.scope == LockScope::Exclusive);
        if let Some(blocker) = blocker {
            drop(table);
            self.stats.record_lock_conflict();
            debug!(
                path = %request.path,
                scope = %request.scope,
                blocker = %blocker.token,
                blocker_path = %blocker.path,
                "Lock request conflicts"
            );
            return LockResult::Conflict(blocker);
        }

        let timeout = self.policy.effective(request.timeout);
        let lock = ActiveLock {
            token: LockToken::generate(),
            path: request.path,
            owner: request.owner,
            scope: request.scope,
            depth,
            timeout,
            issued_at: SystemTime::now(),
            deadline: deadline_for(timeout, now),
        };
        table.insert(lock.clone());
        drop(table);

        self.stats.record_lock_granted();
        info!(
            token = %lock.token,
            path = %lock.path,
            scope = %lock.scope,
            depth = %lock.depth,
            timeout = %lock.timeout,
            "Lock granted"
        );
        LockResult::Granted(lock)
    }

    /// Extend the locks named by `tokens` that cover `path`.
    ///
    /// The new deadline is never earlier than the current one, and never
    /// earlier than `now + effective(timeout)`.
    pub fn refresh(
        &self,
        path: &DavPath,
        tokens: &[LockToken],
        timeout: Option<LockTimeout>,
    ) -> RefreshResult {
        if tokens.is_empty() {
            return RefreshResult::Error(RefreshError::NoTokens);
        }
        let now = Instant::now();
        let timeout = self.policy.effective(timeout);
        let requested_deadline = deadline_for(timeout, now);

        let mut table = self.table.lock();
        let mut refreshed = Vec::new();
        for token in tokens {
            let Some(lock) = table.locks.get_mut(token) else {
                continue;
            };
            if lock.is_expired(now) {
                table.remove(token);
                self.stats.record_locks_expired(1);
                continue;
            }
            if !lock.covers(path) {
                continue;
            }
            lock.deadline = match (lock.deadline, requested_deadline) {
                (None, _) | (_, None) => None,
                (Some(old), Some(new)) => Some(old.max(new)),
            };
            lock.timeout = match lock.deadline {
                None => LockTimeout::Infinite,
                Some(d) => LockTimeout::Finite(d.saturating_duration_since(now)),
            };
            refreshed.push(lock.clone());
        }
        drop(table);

        if refreshed.is_empty() {
            debug!(%path, tokens = tokens.len(), "Refresh matched no lock");
            return RefreshResult::Error(RefreshError::NoMatchingLock);
        }
        self.stats.record_lock_refreshed(refreshed.len());
        debug!(%path, count = refreshed.len(), "Locks refreshed");
        RefreshResult::Refreshed(refreshed)
    }

    /// Release the lock identified by `token`.
    pub fn unlock(&self, token: &LockToken) -> DavResult<ActiveLock> {
        let now = Instant::now();
        let mut table = self.table.lock();
        let lock = table
            .remove(token)
            .ok_or_else(|| DavError::NotFound(format!("lock {token}")))?;
        drop(table);

        if lock.is_expired(now) {
            self.stats.record_locks_expired(1);
            return Err(DavError::NotFound(format!("lock {token}")));
        }
        self.stats.record_locks_released(1);
        info!(token = %lock.token, path = %lock.path, "Lock released");
        Ok(lock)
    }

    /// Live lock with this token.
    pub fn get(&self, token: &LockToken) -> Option<ActiveLock> {
        let now = Instant::now();
        self.table
            .lock()
            .locks
            .get(token)
            .filter(|l| !l.is_expired(now))
            .cloned()
    }

    /// Decide whether a caller holding `tokens` may mutate `(path, depth)`.
    pub fn check(&self, path: &DavPath, depth: Depth, tokens: &[LockToken]) -> ConflictCheck {
        let now = Instant::now();
        let (locks, expired) = self.table.lock().intersecting(path, depth, now);
        self.stats.record_locks_expired(expired);

        if let Some(denied) = locks
            .iter()
            .find(|l| l.scope == LockScope::Exclusive && !tokens.contains(&l.token))
        {
            self.stats.record_mutation_denied();
            debug!(%path, blocker = %denied.token, "Mutation denied by exclusive lock");
            return ConflictCheck::Denied(denied.clone());
        }

        let mut shared = locks.iter().filter(|l| l.scope == LockScope::Shared).peekable();
        if let Some(first) = shared.peek().map(|l| (*l).clone())
            && !shared.any(|l| tokens.contains(&l.token))
        {
            self.stats.record_mutation_denied();
            debug!(%path, blocker = %first.token, "Mutation denied by shared lock");
            return ConflictCheck::Denied(first);
        }

        ConflictCheck::Allowed
    }

    /// [`check`](Self::check) as a `DavResult`, mapping denial to `Locked`.
    pub fn require(&self, path: &DavPath, depth: Depth, tokens: &[LockToken]) -> DavResult<()> {
        match self.check(path, depth, tokens) {
            ConflictCheck::Allowed => Ok(()),
            ConflictCheck::Denied(lock) => Err(DavError::Locked(Box::new(lock))),
        }
    }

    /// Live locks covering `path`, outermost first.
    pub fn discover(&self, path: &DavPath) -> Vec<ActiveLock> {
        let now = Instant::now();
        let (locks, expired) = self.table.lock().intersecting(path, Depth::Zero, now);
        self.stats.record_locks_expired(expired);
        locks
    }

    /// Drop every lock rooted at or below `path` (the resource was deleted).
    pub fn remove_under(&self, path: &DavPath) -> usize {
        let mut table = self.table.lock();
        let mut tokens = table.by_path.get(path.as_str()).cloned().unwrap_or_default();
        tokens.extend(table.tokens_below(path));
        let removed = tokens.iter().filter(|t| table.remove(t).is_some()).count();
        drop(table);

        if removed > 0 {
            self.stats.record_locks_released(removed);
            debug!(%path, removed, "Removed locks of deleted resources");
        }
        removed
    }

    /// Remove every expired lock.
    pub fn purge_expired(&self) -> usize {
        let purged = self.table.lock().purge_expired(Instant::now());
        if purged > 0 {
            self.stats.record_locks_expired(purged);
            debug!(purged, "Purged expired locks");
        }
        purged
    }

    /// Number of live locks.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.table
            .lock()
            .locks
            .values()
            .filter(|l| !l.is_expired(now))
            .count()
    }

    /// Returns true if no live lock exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn a task purging expired locks every `interval` until `shutdown`
    /// is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("Lock sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        manager.purge_expired();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn p(s: &str) -> DavPath {
        DavPath::parse(s).unwrap()
    }

    fn granted(result: LockResult) -> ActiveLock {
        match result {
            LockResult::Granted(lock) => lock,
            LockResult::Conflict(l) => panic!("expected grant, blocked by {}", l.token),
        }
    }

    #[test]
    fn test_policy_clamps() {
        let policy = LockPolicy {
            default_timeout: Duration::from_secs(60),
            max_timeout: Some(Duration::from_secs(300)),
            allow_infinite: false,
        };
        assert_eq!(policy.effective(None), LockTimeout::Finite(Duration::from_secs(60)));
        assert_eq!(
            policy.effective(Some(LockTimeout::Finite(Duration::from_secs(9999)))),
            LockTimeout::Finite(Duration::from_secs(300))
        );
        assert_eq!(
            policy.effective(Some(LockTimeout::Infinite)),
            LockTimeout::Finite(Duration::from_secs(300))
        );

        let permissive = LockPolicy {
            allow_infinite: true,
            ..policy
        };
        assert_eq!(
            permissive.effective(Some(LockTimeout::Infinite)),
            LockTimeout::Infinite
        );
    }

    #[test]
    fn test_unbounded_finite_timeout_never_expires() {
        let manager = LockManager::new(LockPolicy {
            max_timeout: None,
            ..LockPolicy::default()
        });
        let lock = granted(manager.lock(
            LockRequest::exclusive(p("/a")).with_timeout(LockTimeout::Finite(Duration::MAX)),
        ));
        assert_eq!(lock.remaining(), None);

        let RefreshResult::Refreshed(refreshed) = manager.refresh(
            &p("/a"),
            std::slice::from_ref(&lock.token),
            Some(LockTimeout::Finite(Duration::MAX)),
        ) else {
            panic!("refresh must match the lock");
        };
        assert_eq!(refreshed[0].remaining(), None);
        assert!(!manager.check(&p("/a"), Depth::Zero, &[]).is_allowed());
    }

    #[test]
    fn test_shared_then_exclusive() {
        let manager = LockManager::new(LockPolicy::default());
        granted(manager.lock(LockRequest::shared(p("/doc"))));
        granted(manager.lock(LockRequest::shared(p("/doc"))));
        assert!(matches!(
            manager.lock(LockRequest::exclusive(p("/doc"))),
            LockResult::Conflict(l) if l.scope == LockScope::Shared
        ));
    }

    #[test]
    fn test_depth_zero_does_not_cover_children() {
        let manager = LockManager::new(LockPolicy::default());
        granted(manager.lock(LockRequest::exclusive(p("/dir")).with_depth(Depth::Zero)));
        granted(manager.lock(LockRequest::exclusive(p("/dir/child"))));
        // A depth-infinity lock on the parent now sees the child lock.
        assert!(matches!(
            manager.lock(LockRequest::shared(p("/"))),
            LockResult::Conflict(_)
        ));
    }

    #[test]
    fn test_check_requires_tokens() {
        let manager = LockManager::new(LockPolicy::default());
        let lock = granted(manager.lock(LockRequest::exclusive(p("/dir"))));

        let child = p("/dir/file.txt");
        assert!(matches!(
            manager.check(&child, Depth::Zero, &[]),
            ConflictCheck::Denied(l) if l.token == lock.token
        ));
        assert!(manager.check(&child, Depth::Zero, &[lock.token.clone()]).is_allowed());
        assert!(manager.check(&p("/other"), Depth::Infinity, &[]).is_allowed());
        // Deleting the root reaches the lock below it.
        assert!(!manager.check(&DavPath::root(), Depth::Infinity, &[]).is_allowed());
        assert!(manager.check(&DavPath::root(), Depth::Zero, &[]).is_allowed());
    }

    #[test]
    fn test_check_shared_needs_one_token() {
        let manager = LockManager::new(LockPolicy::default());
        let a = granted(manager.lock(LockRequest::shared(p("/doc"))));
        let _b = granted(manager.lock(LockRequest::shared(p("/doc"))));

        assert!(!manager.check(&p("/doc"), Depth::Zero, &[]).is_allowed());
        assert!(manager.check(&p("/doc"), Depth::Zero, &[a.token]).is_allowed());
    }

    #[test]
    fn test_unlock_unknown() {
        let manager = LockManager::new(LockPolicy::default());
        assert!(matches!(
            manager.unlock(&LockToken::from("urn:uuid:nope")),
            Err(DavError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_under() {
        let manager = LockManager::new(LockPolicy::default());
        granted(manager.lock(LockRequest::exclusive(p("/a/x")).with_depth(Depth::Zero)));
        granted(manager.lock(LockRequest::exclusive(p("/a/y")).with_depth(Depth::Zero)));
        granted(manager.lock(LockRequest::exclusive(p("/ab"))));

        assert_eq!(manager.remove_under(&p("/a")), 2);
        assert_eq!(manager.len(), 1);
        assert!(!manager.discover(&p("/ab")).is_empty());
    }

    #[test]
    fn test_stats_are_recorded() {
        let stats = Arc::new(EngineStats::new());
        let manager = LockManager::with_stats(LockPolicy::default(), Arc::clone(&stats));
        let lock = granted(manager.lock(LockRequest::exclusive(p("/a"))));
        let _ = manager.lock(LockRequest::exclusive(p("/a")));
        manager.unlock(&lock.token).unwrap();

        let snap = stats.snapshot();
        assert_eq!(snap.locks_granted, 1);
        assert_eq!(snap.lock_conflicts, 1);
        assert_eq!(snap.locks_released, 1);
        assert_eq!(snap.locks_outstanding(), 0);
    }

    fn scope_strategy() -> impl Strategy<Value = (String, bool, bool)> {
        ("(/[ab]){0,3}", any::<bool>(), any::<bool>())
    }

    proptest! {
        /// Whether two requests conflict does not depend on their order.
        #[test]
        fn prop_conflict_is_symmetric(
            (path_a, exclusive_a, deep_a) in scope_strategy(),
            (path_b, exclusive_b, deep_b) in scope_strategy(),
        ) {
            let request = |path: &str, exclusive: bool, deep: bool| {
                let req = if exclusive {
                    LockRequest::exclusive(p(path))
                } else {
                    LockRequest::shared(p(path))
                };
                req.with_depth(if deep { Depth::Infinity } else { Depth::Zero })
            };

            let forward = LockManager::new(LockPolicy::default());
            forward.lock(request(&path_a, exclusive_a, deep_a));
            let ab = matches!(forward.lock(request(&path_b, exclusive_b, deep_b)), LockResult::Conflict(_));

            let backward = LockManager::new(LockPolicy::default());
            backward.lock(request(&path_b, exclusive_b, deep_b));
            let ba = matches!(backward.lock(request(&path_a, exclusive_a, deep_a)), LockResult::Conflict(_));

            prop_assert_eq!(ab, ba);
        }
    }
}
