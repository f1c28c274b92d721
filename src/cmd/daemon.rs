//! `taskwright daemon`: poll until Ctrl-C.

use anyhow::Result;

use taskwright::config::Config;
use taskwright::daemon::Daemon;

pub async fn cmd_daemon(config: Config, repos: Vec<String>) -> Result<()> {
    let orchestrator = super::build_orchestrator(config)?;
    let cancel = super::shutdown_token();
    let daemon = Daemon::new(orchestrator, repos);
    daemon.run(cancel).await
}
