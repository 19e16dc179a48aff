use std::sync::Arc;

use crate::accessor::Accessor;
use crate::error::Diagnostic;
use crate::registry::AccessorRegistry;

/// Surface the registry offers to analysis jobs and health checks.
pub trait TdsService: Send + Sync {
    fn project_exists(&self, project_id: i64) -> bool;

    /// Same as `project_exists` for now. Kept separate for when pooling
    /// limits mean a known project may not have a live accessor.
    fn accessor_exists(&self, project_id: i64) -> bool;

    fn get_accessor(&self, project_id: i64) -> Option<Arc<Accessor>>;

    fn release_accessor(&self, accessor: &Accessor);

    fn add_accessor(
        &self,
        project_id: i64,
        name: &str,
        bug_tracker: Option<&str>,
        mail: Option<&str>,
        scm: Option<&str>,
    );

    fn self_test(&self) -> Result<(), Diagnostic>;
}

impl TdsService for AccessorRegistry {
    fn project_exists(&self, project_id: i64) -> bool {
        self.exists(project_id)
    }

    fn accessor_exists(&self, project_id: i64) -> bool {
        self.project_exists(project_id)
    }

    fn get_accessor(&self, project_id: i64) -> Option<Arc<Accessor>> {
        self.lookup(project_id)
    }

    fn release_accessor(&self, accessor: &Accessor) {
        self.release(accessor)
    }

    fn add_accessor(
        &self,
        project_id: i64,
        name: &str,
        bug_tracker: Option<&str>,
        mail: Option<&str>,
        scm: Option<&str>,
    ) {
        self.register(project_id, name, bug_tracker, mail, scm);
    }

    fn self_test(&self) -> Result<(), Diagnostic> {
        AccessorRegistry::self_test(self)
    }
}
