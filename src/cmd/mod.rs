//! CLI command implementations.
//!
//! | Module    | Commands handled   |
//! |-----------|--------------------|
//! | `daemon`  | `Daemon`           |
//! | `run`     | `Run`              |
//! | `status`  | `Status`           |
//! | `abort`   | `Abort`            |
//! | `config`  | `Config`           |

pub mod abort;
pub mod config;
pub mod daemon;
pub mod run;
pub mod status;

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use taskwright::agent::ClaudeAgent;
use taskwright::config::Config;
use taskwright::orchestrator::Orchestrator;

pub use abort::cmd_abort;
pub use config::cmd_config;
pub use daemon::cmd_daemon;
pub use run::cmd_run;
pub use status::cmd_status;

/// Accept `owner/name` only.
pub fn parse_repo(s: &str) -> Result<String, String> {
    let s = s.trim();
    match s.split_once('/') {
        Some((owner, name))
            if !owner.is_empty() && !name.is_empty() && !name.contains('/') =>
        {
            Ok(s.to_string())
        }
        _ => Err(format!("expected owner/name, got '{}'", s)),
    }
}

pub fn build_orchestrator(config: Config) -> Result<Arc<Orchestrator>> {
    let tracker = taskwright::tracker::from_config(&config)?;
    let agent = Arc::new(ClaudeAgent::new(
        config.agent.command.clone(),
        config.agent_timeout(),
    ));
    Ok(Arc::new(Orchestrator::new(Arc::new(config), tracker, agent)))
}

/// A token cancelled on the first Ctrl-C.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            trigger.cancel();
        }
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repo() {
        assert_eq!(parse_repo("acme/api").unwrap(), "acme/api");
        assert_eq!(parse_repo(" acme/api ").unwrap(), "acme/api");
        assert!(parse_repo("acme").is_err());
        assert!(parse_repo("acme/").is_err());
        assert!(parse_repo("/api").is_err());
        assert!(parse_repo("a/b/c").is_err());
    }
}
