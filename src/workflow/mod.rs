//! Reading human replies and agent output, and writing the notices posted back.
//!
//! Pure text handling; nothing here performs I/O.

pub mod commands;
pub mod notices;
pub mod output;

pub use commands::{extract_feedback, is_abort, is_approval, is_retry};
pub use output::{
    has_git_error, needs_rereview, parse_branch, parse_existing_pr, parse_merge_conflict,
    questions_pending,
};
