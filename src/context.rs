// ============================================
// context.rs - What every step of a run gets to see
// ============================================

use std::path::PathBuf;

use crate::config::{Config, Paths};
use crate::elevation::Privilege;

/// Read-only state shared by all steps of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: Config,
    pub paths: Paths,
    /// Determined once at startup
    pub privilege: Privilege,
    /// Set when a log file is active, so messages can point at it
    pub log_file: Option<PathBuf>,
}

impl RunContext {
    pub fn new(config: Config, paths: Paths, privilege: Privilege) -> Self {
        RunContext {
            config,
            paths,
            privilege,
            log_file: None,
        }
    }

    pub fn with_log_file(mut self, log_file: PathBuf) -> Self {
        self.log_file = Some(log_file);
        self
    }
}
