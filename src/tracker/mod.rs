//! Git as the source of changed paths, commit ids and diff stats.

mod git;

pub use git::{GitTracker, STATE_DIR_PREFIX, WorktreeSnapshot};
