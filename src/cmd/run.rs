//! `taskwright run`: one pass over one issue.

use anyhow::Result;

use taskwright::config::Config;
use taskwright::daemon::run_once;
use taskwright::pool::JobStatus;
use taskwright::tracker::WorkItem;

pub async fn cmd_run(config: Config, repo: &str, issue: u64) -> Result<()> {
    let orchestrator = super::build_orchestrator(config)?;
    let cancel = super::shutdown_token();
    let item = WorkItem::new(repo, issue);

    let result = run_once(&orchestrator, &item, &cancel).await?;
    let record = &result.record;
    let phase = record.phase().to_string();

    println!();
    match result.status {
        JobStatus::Completed => {
            let pr = record
                .pr_number
                .map(|n| format!(" (PR #{})", n))
                .unwrap_or_default();
            println!("{} {}{}", console::style("Completed").green().bold(), item, pr);
        }
        JobStatus::Waiting if record.is_blocked() => {
            let deps: Vec<String> = record.blocked_by.iter().map(|n| format!("#{}", n)).collect();
            println!(
                "{} {} is blocked by {}",
                console::style("Blocked").yellow().bold(),
                item,
                deps.join(", ")
            );
        }
        JobStatus::Waiting => {
            println!(
                "{} {} is in {}; run again after replying on the issue.",
                console::style("Waiting").yellow().bold(),
                item,
                console::style(&phase).cyan()
            );
        }
        JobStatus::Cancelled => {
            println!("{} {} stopped in {}", console::style("Interrupted").yellow(), item, phase);
        }
        JobStatus::Failed | JobStatus::Errored => {
            println!(
                "{} {}: {}",
                console::style("Error:").red().bold(),
                item,
                result.error.as_deref().unwrap_or("unknown error")
            );
            println!();
            anyhow::bail!("{} did not complete", item);
        }
    }
    println!();
    Ok(())
}
