use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn, Span};

use crate::accessor::Accessor;
use crate::error::Diagnostic;
use crate::metrics::{MetricsSnapshot, RegistryMetrics};

/// Project installed by the self-test when the pool is empty
pub const SELF_TEST_PROJECT_ID: i64 = 1337;
pub const SELF_TEST_PROJECT_NAME: &str = "KPilot";
pub const SELF_TEST_SCM: &str = "http://cvs.codeyard.net/svn/kpilot/";

type AccessorPool = HashMap<i64, Arc<Accessor>>;

/// Population lifecycle of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootstrapState {
    Unpopulated,
    Populating,
    Populated,
}

impl std::fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unpopulated => write!(f, "unpopulated"),
            Self::Populating => write!(f, "populating"),
            Self::Populated => write!(f, "populated"),
        }
    }
}

/// Keyed pool of per-project accessors.
///
/// Every pool access goes through one `RwLock`: `exists`/`lookup` share it,
/// everything that mutates takes it exclusively. Accessors are handed out as
/// `Arc`s, so replacing an entry never disturbs callers already holding the
/// previous one.
pub struct AccessorRegistry {
    log: Span,
    pool: RwLock<AccessorPool>,
    state: watch::Sender<BootstrapState>,
    metrics: RegistryMetrics,
    max_accessors: Option<usize>,
}

impl AccessorRegistry {
    /// Create an empty registry. All registry log lines are emitted inside `log`.
    pub fn new(log: Span) -> Self {
        let (state, _) = watch::channel(BootstrapState::Unpopulated);
        Self {
            log,
            pool: RwLock::new(HashMap::new()),
            state,
            metrics: RegistryMetrics::new(),
            max_accessors: None,
        }
    }

    /// Warn when the pool grows beyond `limit` entries. Nothing is evicted.
    pub fn with_max_accessors(mut self, limit: Option<usize>) -> Self {
        self.max_accessors = limit;
        self
    }

    fn read_pool(&self) -> RwLockReadGuard<'_, AccessorPool> {
        self.pool.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_pool(&self) -> RwLockWriteGuard<'_, AccessorPool> {
        self.pool.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// True iff an accessor is registered for `project_id`
    pub fn exists(&self, project_id: i64) -> bool {
        self.read_pool().contains_key(&project_id)
    }

    /// Fetch the accessor registered for `project_id`.
    pub fn lookup(&self, project_id: i64) -> Option<Arc<Accessor>> {
        let _guard = self.log.enter();
        let found = find(&self.read_pool(), project_id);
        match &found {
            Some(accessor) => {
                info!(project_id, name = %accessor.name(), "retrieving accessor")
            }
            None => info!(project_id, "retrieval request for unregistered project"),
        }
        self.metrics.record_lookup(found.is_some());
        found
    }

    /// Tell the registry a caller is done with `accessor`.
    ///
    /// Advisory only: the entry stays pooled. This is the hook for a future
    /// eviction or reference-counting policy.
    pub fn release(&self, accessor: &Accessor) {
        let _guard = self.log.enter();
        info!(
            project_id = accessor.project_id(),
            name = %accessor.name(),
            "release accessor"
        );
        self.metrics.record_release();
    }

    /// Build an accessor and insert it under `project_id`, replacing any
    /// previous entry (last write wins).
    pub fn register(
        &self,
        project_id: i64,
        name: &str,
        bug_tracker: Option<&str>,
        mail: Option<&str>,
        scm: Option<&str>,
    ) -> Arc<Accessor> {
        let accessor = Arc::new(Accessor::new(project_id, name, bug_tracker, mail, scm));
        let _guard = self.log.enter();

        let (duplicate, size) = {
            let mut pool = self.write_pool();
            let duplicate = pool.insert(project_id, Arc::clone(&accessor)).is_some();
            (duplicate, pool.len())
        };

        if duplicate {
            warn!(project_id, name = %name, "adding duplicate project id");
        }
        self.metrics.record_registration(duplicate);
        self.check_capacity(size);
        info!(project_id, name = %name, "added project");
        accessor
    }

    /// Merge a fully built batch of accessors into the pool in one step and
    /// mark the registry populated.
    ///
    /// Readers see either none or all of the batch. Entries are keyed by
    /// their own project id; later entries win over earlier ones and over
    /// whatever was pooled before.
    pub fn commit_snapshot(&self, accessors: Vec<Arc<Accessor>>) -> usize {
        let _guard = self.log.enter();
        let committed = accessors.len();
        let mut duplicates = Vec::new();

        let size = {
            let mut pool = self.write_pool();
            for accessor in accessors {
                let id = accessor.project_id();
                let duplicate = pool.insert(id, accessor).is_some();
                self.metrics.record_registration(duplicate);
                if duplicate {
                    duplicates.push(id);
                }
            }
            pool.len()
        };

        for project_id in duplicates {
            warn!(project_id, "adding duplicate project id");
        }
        self.check_capacity(size);
        self.state.send_replace(BootstrapState::Populated);
        info!(committed, pool_size = size, "accessor snapshot committed");
        committed
    }

    fn check_capacity(&self, size: usize) {
        if let Some(limit) = self.max_accessors {
            if size > limit {
                warn!(pool_size = size, limit, "accessor pool above configured capacity");
            }
        }
    }

    /// Non-destructive consistency check for health reporting.
    ///
    /// Runs under the pool's write lock, so the temporary placeholder used on
    /// an empty pool is never visible to other callers.
    pub fn self_test(&self) -> Result<(), Diagnostic> {
        let result = self.run_self_test();
        self.metrics.record_self_test(result.is_ok());
        if let Err(diagnostic) = &result {
            self.log.in_scope(|| warn!(%diagnostic, "self-test failed"));
        }
        result
    }

    fn run_self_test(&self) -> Result<(), Diagnostic> {
        if self.log.is_none() {
            return Err(Diagnostic::LoggerUnavailable);
        }
        let _guard = self.log.enter();
        let mut pool = self.pool.write().map_err(|_| Diagnostic::PoolUnavailable)?;

        let placeholder = Placeholder::install_if_empty(&mut pool);
        let pool = placeholder.pool();

        let Some((&key, accessor)) = pool.iter().next() else {
            return Err(Diagnostic::NoProjects);
        };
        let project_id = accessor.project_id();
        info!(project_id, name = %accessor.name(), "checking project");

        if key != project_id {
            return Err(Diagnostic::KeyMismatch { key, project_id });
        }
        match find(pool, project_id) {
            Some(found) if Arc::ptr_eq(&found, accessor) => Ok(()),
            _ => Err(Diagnostic::Aliasing { project_id }),
        }
    }

    pub fn len(&self) -> usize {
        self.read_pool().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_pool().is_empty()
    }

    /// Registered project ids, ascending
    pub fn project_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.read_pool().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn state(&self) -> BootstrapState {
        *self.state.borrow()
    }

    pub fn is_populated(&self) -> bool {
        self.state() == BootstrapState::Populated
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BootstrapState> {
        self.state.subscribe()
    }

    /// Resolve once a bootstrap has committed
    pub async fn wait_populated(&self) {
        let mut rx = self.subscribe_state();
        let _ = rx.wait_for(|s| *s == BootstrapState::Populated).await;
    }

    /// Enter `Populating` from `Unpopulated`, returning the state to restore
    /// if population is abandoned. A populated registry stays `Populated`
    /// while a repeat bootstrap runs.
    pub(crate) fn begin_population(&self) -> BootstrapState {
        let mut previous = BootstrapState::Unpopulated;
        self.state.send_if_modified(|state| {
            previous = *state;
            if *state == BootstrapState::Unpopulated {
                *state = BootstrapState::Populating;
                true
            } else {
                false
            }
        });
        previous
    }

    pub(crate) fn abandon_population(&self, previous: BootstrapState) {
        self.state.send_replace(previous);
    }

    pub(crate) fn record_bootstrap(&self, fallback: bool) {
        self.metrics.record_bootstrap(fallback);
    }

    pub(crate) fn span(&self) -> &Span {
        &self.log
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.len())
    }
}

impl Default for AccessorRegistry {
    fn default() -> Self {
        Self::new(tracing::info_span!("tds_registry"))
    }
}

fn find(pool: &AccessorPool, project_id: i64) -> Option<Arc<Accessor>> {
    pool.get(&project_id).cloned()
}

/// Self-test placeholder, removed again when dropped
struct Placeholder<'a> {
    pool: &'a mut AccessorPool,
    installed: bool,
}

impl<'a> Placeholder<'a> {
    fn install_if_empty(pool: &'a mut AccessorPool) -> Self {
        let installed = pool.is_empty();
        if installed {
            info!(
                project_id = SELF_TEST_PROJECT_ID,
                "adding placeholder project to empty accessor pool"
            );
            let accessor = Accessor::new(
                SELF_TEST_PROJECT_ID,
                SELF_TEST_PROJECT_NAME,
                Some(""),
                None,
                Some(SELF_TEST_SCM),
            );
            pool.insert(SELF_TEST_PROJECT_ID, Arc::new(accessor));
        }
        Self { pool, installed }
    }

    fn pool(&self) -> &AccessorPool {
        self.pool
    }
}

impl Drop for Placeholder<'_> {
    fn drop(&mut self) {
        if self.installed {
            self.pool.remove(&SELF_TEST_PROJECT_ID);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::writer::MakeWriter;

    fn registry() -> AccessorRegistry {
        AccessorRegistry::default()
    }

    /// Formatted log output collected in memory
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    /// Run `f` with a subscriber writing into a buffer and return the lines
    fn captured_logs(f: impl FnOnce()) -> Vec<String> {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        text.lines().map(str::to_string).collect()
    }

    #[test]
    fn test_registry_new_is_empty() {
        let r = registry();
        assert!(r.is_empty());
        assert_eq!(r.len(), 0);
        assert_eq!(r.state(), BootstrapState::Unpopulated);
        assert!(!r.is_populated());
    }

    #[test]
    fn test_register_then_lookup() {
        let r = registry();
        r.register(1, "KPilot", Some(""), None, Some("http://cvs.example/kpilot"));
        assert!(r.exists(1));
        let a = r.lookup(1).unwrap();
        assert_eq!(a.name(), "KPilot");
        assert_eq!(a.project_id(), 1);
        assert!(a.bug_tracker().is_none());
    }

    #[test]
    fn test_lookup_missing_is_none() {
        let r = registry();
        assert!(r.lookup(999).is_none());
        assert!(!r.exists(999));
        assert_eq!(r.metrics().lookups_missed, 1);
    }

    #[test]
    fn test_exists_matches_lookup() {
        let r = registry();
        r.register(3, "a", None, None, None);
        r.register(5, "b", None, None, None);
        for id in 0..8 {
            assert_eq!(r.exists(id), r.lookup(id).is_some(), "id {}", id);
        }
    }

    #[test]
    fn test_duplicate_last_write_wins() {
        let r = registry();
        let first = r.register(7, "first", None, None, None);
        let second = r.register(7, "second", None, None, None);

        assert_eq!(r.len(), 1);
        assert_eq!(r.lookup(7).unwrap().name(), "second");
        assert!(Arc::ptr_eq(&r.lookup(7).unwrap(), &second));
        // Outstanding holder keeps the old identity
        assert_eq!(first.name(), "first");
        assert_eq!(r.metrics().duplicate_registrations, 1);
    }

    #[test]
    fn test_duplicate_registration_logs_warning() {
        let lines = captured_logs(|| {
            let r = registry();
            r.register(7, "first", None, None, None);
            r.register(7, "second", None, None, None);
        });

        let warnings: Vec<&String> = lines
            .iter()
            .filter(|l| l.contains("adding duplicate project id"))
            .collect();
        assert_eq!(warnings.len(), 1, "{:#?}", lines);
        assert!(warnings[0].contains("WARN"));
        assert!(warnings[0].contains("project_id=7"));
        assert!(warnings[0].contains("name=second"));
    }

    #[test]
    fn test_lookup_logs_hit_and_miss_differently() {
        let lines = captured_logs(|| {
            let r = registry();
            r.register(1, "KPilot", None, None, None);
            r.lookup(1);
            r.lookup(999);
        });

        let hit = lines
            .iter()
            .find(|l| l.contains("retrieving accessor"))
            .expect("hit not logged");
        assert!(hit.contains("project_id=1"));
        assert!(hit.contains("name=KPilot"));

        let miss = lines
            .iter()
            .find(|l| l.contains("retrieval request for unregistered project"))
            .expect("miss not logged");
        assert!(miss.contains("project_id=999"));
        assert!(!lines
            .iter()
            .any(|l| l.contains("retrieving accessor") && l.contains("project_id=999")));
    }

    #[test]
    fn test_release_is_advisory() {
        let r = registry();
        let a = r.register(2, "kmail", None, None, None);
        r.release(&a);
        assert!(r.exists(2));
        assert_eq!(r.metrics().releases, 1);
    }

    #[test]
    fn test_self_test_empty_pool_leaves_it_empty() {
        let r = registry();
        assert_eq!(r.self_test(), Ok(()));
        assert!(r.is_empty());
        assert!(!r.exists(SELF_TEST_PROJECT_ID));
        assert_eq!(r.metrics().self_tests_passed, 1);
    }

    #[test]
    fn test_self_test_keeps_entries() {
        let r = registry();
        let a = r.register(42, "amarok", None, None, None);
        assert_eq!(r.self_test(), Ok(()));
        assert_eq!(r.project_ids(), vec![42]);
        assert!(Arc::ptr_eq(&r.lookup(42).unwrap(), &a));
    }

    #[test]
    fn test_self_test_without_logger() {
        let r = AccessorRegistry::new(Span::none());
        assert_eq!(r.self_test(), Err(Diagnostic::LoggerUnavailable));
        assert_eq!(r.metrics().self_tests_failed, 1);
    }

    #[test]
    fn test_self_test_detects_poisoned_pool() {
        let r = Arc::new(registry());
        r.register(1, "x", None, None, None);
        let poisoner = Arc::clone(&r);
        let _ = std::thread::spawn(move || {
            let _pool = poisoner.pool.write().unwrap();
            panic!("poison the pool");
        })
        .join();

        assert_eq!(r.self_test(), Err(Diagnostic::PoolUnavailable));
        // Normal operations keep working on the recovered data
        assert!(r.exists(1));
    }

    #[test]
    fn test_self_test_detects_key_mismatch() {
        let r = registry();
        r.pool
            .write()
            .unwrap()
            .insert(9, Arc::new(Accessor::new(10, "wrong", None, None, None)));
        assert_eq!(
            r.self_test(),
            Err(Diagnostic::KeyMismatch {
                key: 9,
                project_id: 10
            })
        );
        assert_eq!(r.project_ids(), vec![9]);
    }

    #[test]
    fn test_placeholder_removed_on_failure_path() {
        let mut pool = AccessorPool::new();
        {
            let placeholder = Placeholder::install_if_empty(&mut pool);
            assert!(placeholder.pool().contains_key(&SELF_TEST_PROJECT_ID));
        }
        assert!(pool.is_empty());

        pool.insert(1, Arc::new(Accessor::new(1, "real", None, None, None)));
        {
            let placeholder = Placeholder::install_if_empty(&mut pool);
            assert!(!placeholder.pool().contains_key(&SELF_TEST_PROJECT_ID));
        }
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_commit_snapshot_marks_populated() {
        let r = registry();
        r.register(1, "existing", None, None, None);
        let batch = vec![
            Arc::new(Accessor::new(1, "replaced", None, None, None)),
            Arc::new(Accessor::new(2, "new", None, None, None)),
        ];
        assert_eq!(r.commit_snapshot(batch), 2);
        assert!(r.is_populated());
        assert_eq!(r.project_ids(), vec![1, 2]);
        assert_eq!(r.lookup(1).unwrap().name(), "replaced");
        assert_eq!(r.metrics().duplicate_registrations, 1);
    }

    #[test]
    fn test_population_state_transitions() {
        let r = registry();
        let previous = r.begin_population();
        assert_eq!(previous, BootstrapState::Unpopulated);
        assert_eq!(r.state(), BootstrapState::Populating);
        r.abandon_population(previous);
        assert_eq!(r.state(), BootstrapState::Unpopulated);
    }

    #[test]
    fn test_repeat_population_stays_populated() {
        let r = registry();
        r.commit_snapshot(vec![Arc::new(Accessor::new(4, "k3b", None, None, None))]);
        let previous = r.begin_population();
        assert_eq!(previous, BootstrapState::Populated);
        assert!(r.is_populated());
        r.abandon_population(previous);
        assert!(r.is_populated());
    }

    #[tokio::test]
    async fn test_subscribe_state_sees_commit() {
        let r = registry();
        let mut rx = r.subscribe_state();
        assert_eq!(*rx.borrow_and_update(), BootstrapState::Unpopulated);

        r.begin_population();
        r.commit_snapshot(vec![]);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), BootstrapState::Populated);
    }

    #[tokio::test]
    async fn test_wait_populated() {
        let r = Arc::new(registry());
        let waiter = {
            let r = Arc::clone(&r);
            tokio::spawn(async move { r.wait_populated().await })
        };
        r.commit_snapshot(vec![Arc::new(Accessor::new(4, "k3b", None, None, None))]);
        waiter.await.unwrap();
        assert!(r.is_populated());
    }

    #[test]
    fn test_capacity_limit_only_warns() {
        let r = registry().with_max_accessors(Some(1));
        r.register(1, "a", None, None, None);
        r.register(2, "b", None, None, None);
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn test_bootstrap_state_display() {
        assert_eq!(BootstrapState::Populating.to_string(), "populating");
    }
}
