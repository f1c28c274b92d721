//! Persisted workflow state.
//!
//! ## Architecture
//!
//! ```text
//! tracker text ──decode/latest──▶ ProgressRecord ──transition()──▶ ProgressRecord
//!       ▲                                                              │
//!       └──────────────── append_to_body / update_body ◀── encode ─────┘
//! ```
//!
//! There is no local database. A [`ProgressRecord`] lives in a JSON fragment
//! embedded in comments on the item, and the `phase:<name>` label mirrors its
//! `current_phase` for humans. Phase changes go through
//! [`ProgressRecord::transition`], which rejects edges outside the workflow graph.

pub mod fragment;
pub mod phase;
pub mod record;

pub use fragment::{
    SYSTEM_MARKER, add_system_marker, append_to_body, contains_fragment, decode, encode,
    has_system_marker, is_system_text, latest, strip, update_body,
};
pub use phase::{LABEL_PREFIX, Phase, labels_to_remove, phase_from_labels};
pub use record::{FailureReason, ProgressRecord, QaEntry};
