//! Who may steer an item.

use tracing::{debug, warn};

use crate::tracker::Tracker;

/// Whether `user` may answer questions, approve plans, or request changes in `repo`.
///
/// Fails closed: a lookup error denies.
pub async fn is_authorized(tracker: &dyn Tracker, repo: &str, user: &str) -> bool {
    if user.trim().is_empty() {
        return false;
    }
    match tracker.is_collaborator(repo, user).await {
        Ok(true) => true,
        Ok(false) => {
            debug!(repo, user, "Ignoring comment from non-collaborator");
            false
        }
        Err(e) => {
            warn!(repo, user, error = %e, "Collaborator check failed, denying");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TrackerError;
    use crate::tracker::InMemoryTracker;

    #[tokio::test]
    async fn test_collaborator_is_authorized() {
        let tracker = InMemoryTracker::new();
        tracker.add_collaborator("acme/app", "alice");
        assert!(is_authorized(&tracker, "acme/app", "alice").await);
        assert!(!is_authorized(&tracker, "acme/app", "mallory").await);
        assert!(!is_authorized(&tracker, "acme/app", "").await);
    }

    #[tokio::test]
    async fn test_lookup_error_fails_closed() {
        let tracker = InMemoryTracker::new();
        tracker.fail_next("is_collaborator", TrackerError::status(500, "boom"));
        assert!(!is_authorized(&tracker, "acme/app", "alice").await);
        assert!(is_authorized(&tracker, "acme/app", "alice").await);
    }
}
