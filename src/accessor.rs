use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection descriptor for one external system (SCM, bug tracker, mail archive).
///
/// The registry never interprets the value; it is handed to the accessor
/// implementations that speak the actual protocols.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator(String);

impl Locator {
    /// Build a locator, treating empty or whitespace-only input as "not tracked".
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        match raw.map(str::trim) {
            Some(s) if !s.is_empty() => Some(Self(s.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-project capability bundle handed out by the registry.
///
/// Identity (`project_id`, `name`) is bound once at construction. Callers
/// share accessors through `Arc`, so a later registration under the same id
/// never changes what an outstanding holder sees.
#[derive(Debug, Serialize)]
pub struct Accessor {
    project_id: i64,
    name: String,
    scm: Option<Locator>,
    bug_tracker: Option<Locator>,
    mail: Option<Locator>,
}

impl Accessor {
    /// Create an accessor. Argument order follows project records:
    /// bug tracker, mail, then SCM.
    pub fn new(
        project_id: i64,
        name: impl Into<String>,
        bug_tracker: Option<&str>,
        mail: Option<&str>,
        scm: Option<&str>,
    ) -> Self {
        Self {
            project_id,
            name: name.into(),
            scm: Locator::parse(scm),
            bug_tracker: Locator::parse(bug_tracker),
            mail: Locator::parse(mail),
        }
    }

    pub fn project_id(&self) -> i64 {
        self.project_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source-control handle, `None` when the project has no tracked repository
    pub fn scm(&self) -> Option<&Locator> {
        self.scm.as_ref()
    }

    pub fn bug_tracker(&self) -> Option<&Locator> {
        self.bug_tracker.as_ref()
    }

    pub fn mail(&self) -> Option<&Locator> {
        self.mail.as_ref()
    }

    /// Number of external systems this project is wired to (0..=3)
    pub fn tracked_sources(&self) -> usize {
        [&self.scm, &self.bug_tracker, &self.mail]
            .iter()
            .filter(|l| l.is_some())
            .count()
    }
}
