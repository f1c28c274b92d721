//! Dependency detection, cycle checking, and blocking resolution.
//!
//! ## Architecture
//!
//! ```text
//! issue body/comments/labels ──DependencyDetector::detect──▶ depends_on
//!                                                               │
//!               records of one repo ──DependencyGraph──▶ check_for_cycles / find_cycles
//!                                                               │
//!                   phases of deps ──resolve_blocking──▶ Ready | Blocked | DependencyFailed
//! ```
//!
//! The daemon runs all three before admitting an item to the worker pool.
//! Nothing here talks to the tracker.

pub mod blocking;
pub mod detector;
pub mod graph;

pub use blocking::{Blocking, resolve_blocking};
pub use detector::{
    DEPENDS_LABEL_PREFIX, DependencyDetector, DetectionMode, OVERRIDE_LABEL, OVERRIDE_TOKEN,
    parse_dependency_labels, parse_issue_references,
};
pub use graph::DependencyGraph;
