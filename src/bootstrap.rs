//! Event-triggered population of the accessor pool.
//!
//! When the persistence layer announces itself on the event bus, the
//! registry asks the store for every known project and commits one accessor
//! per project in a single step. If the store is missing, slow, failing or
//! empty, a single fallback project is committed instead so the pool is never
//! left empty.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::accessor::Accessor;
use crate::error::StoreError;
use crate::events::{EventBus, TdsEvent, PERSISTENCE_STARTED};
use crate::registry::AccessorRegistry;
use crate::store::{ProjectRecord, ProjectStore, StoreQuery};

pub const FALLBACK_PROJECT_ID: i64 = 1;
pub const FALLBACK_PROJECT_NAME: &str = "KPilot";
pub const FALLBACK_SCM: &str = "http://cvs.codeyard.net/svn/kpilot/";

#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    /// Upper bound for begin + query + commit against the store
    pub query_timeout: Duration,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of one population run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Projects from the store were committed
    Loaded(usize),
    /// Nothing usable came from the store; the fallback project was committed
    Fallback,
    /// Shutdown was requested before anything was committed
    Cancelled,
}

/// Populates an [`AccessorRegistry`] from a [`ProjectStore`] on the
/// persistence-started event.
pub struct Bootstrapper {
    registry: Arc<AccessorRegistry>,
    store: Option<Arc<dyn ProjectStore>>,
    options: BootstrapOptions,
}

impl Bootstrapper {
    pub fn new(
        registry: Arc<AccessorRegistry>,
        store: Option<Arc<dyn ProjectStore>>,
        options: BootstrapOptions,
    ) -> Self {
        Self {
            registry,
            store,
            options,
        }
    }

    pub fn registry(&self) -> &Arc<AccessorRegistry> {
        &self.registry
    }

    /// Subscribe to `bus` and populate the registry on every
    /// persistence-started event until `shutdown` fires or the bus closes.
    ///
    /// The subscription is taken before this returns, so events published
    /// afterwards are never missed.
    pub fn spawn_listener(
        self: Arc<Self>,
        bus: &EventBus,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        let span = self.registry.span().clone();

        tokio::spawn(
            async move {
                info!("bootstrap listener subscribed");
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!("bootstrap listener shutting down");
                            break;
                        }
                        event = rx.recv() => match event {
                            Ok(event) => {
                                self.handle_event(&event, &shutdown).await;
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(skipped, "bootstrap listener lagged behind event bus");
                            }
                            Err(RecvError::Closed) => {
                                info!("event bus closed, bootstrap listener exiting");
                                break;
                            }
                        }
                    }
                }
            }
            .instrument(span),
        )
    }

    /// Run population if `event` is the persistence-started event; ignore
    /// anything else.
    pub async fn handle_event(
        &self,
        event: &TdsEvent,
        shutdown: &CancellationToken,
    ) -> Option<BootstrapOutcome> {
        debug!(topic = %event.topic, event_id = %event.id, "caught event");
        if !event.is(PERSISTENCE_STARTED) {
            return None;
        }
        Some(self.populate(shutdown).await)
    }

    /// Load every known project and commit the resulting accessors atomically.
    ///
    /// Never fails: store trouble of any kind ends in the fallback project.
    pub async fn populate(&self, shutdown: &CancellationToken) -> BootstrapOutcome {
        debug!("populating accessor pool");
        let previous = self.registry.begin_population();

        let Some(records) = self.load_records(shutdown).await else {
            self.registry.abandon_population(previous);
            info!("population cancelled by shutdown");
            return BootstrapOutcome::Cancelled;
        };

        let mut accessors: Vec<Arc<Accessor>> = records.iter().map(to_accessor).collect();
        let fallback = accessors.is_empty();
        if fallback {
            debug!(project_id = FALLBACK_PROJECT_ID, "stuffing fallback project");
            accessors.push(Arc::new(fallback_accessor()));
        }

        let committed = self.registry.commit_snapshot(accessors);
        self.registry.record_bootstrap(fallback);
        info!(committed, fallback, "accessor pool populated");

        if fallback {
            BootstrapOutcome::Fallback
        } else {
            BootstrapOutcome::Loaded(committed)
        }
    }

    /// `None` when cancelled; an empty list for every store failure
    async fn load_records(&self, shutdown: &CancellationToken) -> Option<Vec<ProjectRecord>> {
        let Some(store) = self.store.clone() else {
            error!("can not obtain the project store");
            return Some(Vec::new());
        };

        if shutdown.is_cancelled() {
            return None;
        }

        // Run on its own task so a panicking store is contained like any other failure
        let mut task = tokio::spawn(fetch_projects(Arc::clone(&store)));

        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            outcome = tokio::time::timeout(self.options.query_timeout, &mut task) => Some(outcome),
        };

        let Some(outcome) = outcome else {
            task.abort();
            let _ = task.await;
            release_session(store.as_ref()).await;
            return None;
        };

        match outcome {
            Ok(Ok(Ok(records))) => {
                info!(projects = records.len(), "loaded projects from store");
                Some(records)
            }
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "project store unavailable");
                Some(Vec::new())
            }
            Ok(Err(e)) => {
                error!(error = %e, "project store task failed");
                release_session(store.as_ref()).await;
                Some(Vec::new())
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.options.query_timeout.as_millis() as u64,
                    "project query timed out"
                );
                task.abort();
                let _ = task.await;
                release_session(store.as_ref()).await;
                Some(Vec::new())
            }
        }
    }
}

/// begin, query, and commit on every exit path once a session is open
async fn fetch_projects(store: Arc<dyn ProjectStore>) -> Result<Vec<ProjectRecord>, StoreError> {
    if !store.begin_session().await? {
        return Err(StoreError::SessionUnavailable);
    }
    let result = store.query(&StoreQuery::AllProjects).await;
    if let Err(e) = store.commit_session().await {
        warn!(error = %e, "failed to commit project session");
    }
    result
}

/// Close a session left open by an interrupted fetch
async fn release_session(store: &dyn ProjectStore) {
    if store.is_session_active().await {
        if let Err(e) = store.commit_session().await {
            warn!(error = %e, "failed to release project session");
        }
    }
}

fn to_accessor(record: &ProjectRecord) -> Arc<Accessor> {
    Arc::new(Accessor::new(
        record.id,
        record.name.as_str(),
        record.bug_tracker.as_deref(),
        record.mail.as_deref(),
        record.scm.as_deref(),
    ))
}

fn fallback_accessor() -> Accessor {
    Accessor::new(
        FALLBACK_PROJECT_ID,
        FALLBACK_PROJECT_NAME,
        Some(""),
        Some(""),
        Some(FALLBACK_SCM),
    )
}
