//! `taskwright abort`: stop an item from the command line.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use taskwright::config::Config;
use taskwright::state::Phase;
use taskwright::workflow::notices::{self, ABORT_LABEL};

pub async fn cmd_abort(config: &Config, repo: &str, issue: u64) -> Result<()> {
    let tracker = taskwright::tracker::from_config(config)?;
    let retry = config.retry_policy();
    let cancel = CancellationToken::new();
    let aborted_comment = notices::aborted_from_cli();
    let failed_label = Phase::Failed.label();

    retry
        .run(&cancel, || tracker.create_comment(repo, issue, &aborted_comment))
        .await
        .context("Failed to post abort comment")?;
    retry
        .run(&cancel, || tracker.add_label(repo, issue, ABORT_LABEL))
        .await
        .context("Failed to add abort label")?;
    retry
        .run(&cancel, || tracker.add_label(repo, issue, &failed_label))
        .await
        .context("Failed to add failed label")?;
    retry
        .run(&cancel, || tracker.remove_label(repo, issue, &config.trigger_label))
        .await
        .context("Failed to remove trigger label")?;

    println!(
        "{} processing of {}#{}",
        console::style("Aborted").yellow().bold(),
        repo,
        issue
    );
    Ok(())
}
