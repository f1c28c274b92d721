//! `taskwright status`: phases from labels and saved state.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use taskwright::config::Config;
use taskwright::state::{Phase, ProgressRecord, latest, phase_from_labels};
use taskwright::tracker::{Issue, Tracker};
use taskwright::workflow::notices::NEEDS_MANUAL_RESOLUTION_LABEL;

pub async fn cmd_status(config: &Config, repo: &str, issue: Option<u64>) -> Result<()> {
    let tracker = taskwright::tracker::from_config(config)?;
    let cancel = CancellationToken::new();
    let retry = config.retry_policy();

    if let Some(number) = issue {
        let issue = retry
            .run(&cancel, || tracker.get_issue(repo, number))
            .await
            .with_context(|| format!("Failed to fetch {}#{}", repo, number))?;
        let record = saved_record(tracker.as_ref(), repo, &issue).await?;
        print_detail(repo, &issue, record.as_ref());
        return Ok(());
    }

    let mut issues = retry
        .run(&cancel, || tracker.list_issues_with_label(repo, &config.trigger_label))
        .await
        .context("Failed to list issues")?;
    let manual = retry
        .run(&cancel, || {
            tracker.list_issues_with_label(repo, NEEDS_MANUAL_RESOLUTION_LABEL)
        })
        .await
        .context("Failed to list issues")?;
    for issue in manual {
        if !issues.iter().any(|i| i.number == issue.number) {
            issues.push(issue);
        }
    }
    issues.sort_by_key(|i| i.number);

    println!();
    if issues.is_empty() {
        println!("No issues labelled '{}' in {}.", config.trigger_label, repo);
        println!();
        return Ok(());
    }

    println!("{:<8} {:<14} {:<10} Title", "Issue", "Phase", "PR");
    println!("{:<8} {:<14} {:<10} -----", "-----", "-----", "--");
    for issue in &issues {
        let record = saved_record(tracker.as_ref(), repo, issue).await?;
        let phase = record
            .as_ref()
            .map(|r| r.phase())
            .unwrap_or_else(|| phase_from_labels(&issue.labels));
        let pr = record
            .as_ref()
            .and_then(|r| r.pr_number)
            .map(|n| format!("#{}", n))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:<14} {:<10} {}",
            format!("#{}", issue.number),
            styled_phase(phase),
            pr,
            issue.title
        );
    }
    println!();
    Ok(())
}

async fn saved_record(tracker: &dyn Tracker, repo: &str, issue: &Issue) -> Result<Option<ProgressRecord>> {
    let comments = tracker
        .get_comments(repo, issue.number)
        .await
        .with_context(|| format!("Failed to fetch comments for {}#{}", repo, issue.number))?;
    let texts = std::iter::once(issue.body.as_str()).chain(comments.iter().map(|c| c.body.as_str()));
    Ok(latest(texts))
}

fn styled_phase(phase: Phase) -> String {
    // Pad before styling so escape codes do not break the column.
    let text = format!("{:<14}", phase.as_str());
    match phase {
        Phase::Completed => console::style(text).green().to_string(),
        Phase::Failed => console::style(text).red().to_string(),
        Phase::Questions | Phase::Approval => console::style(text).yellow().to_string(),
        _ => console::style(text).cyan().to_string(),
    }
}

fn print_detail(repo: &str, issue: &Issue, record: Option<&ProgressRecord>) {
    println!();
    println!(
        "{}",
        console::style(format!("{}#{}: {}", repo, issue.number, issue.title)).bold()
    );
    println!();
    let Some(record) = record else {
        println!("  phase          {}", phase_from_labels(&issue.labels));
        println!("  (no saved state yet)");
        println!();
        return;
    };

    println!("  phase          {}", styled_phase(record.phase()).trim_end());
    println!("  last updated   {}", record.last_updated.format("%Y-%m-%d %H:%M:%S UTC"));
    if record.plan_version > 0 {
        println!("  plan version   {}", record.plan_version);
    }
    if record.qa_round > 0 {
        println!("  question round {}", record.qa_round);
    }
    if let Some(branch) = &record.branch_name {
        println!("  branch         {}", branch);
    }
    if let Some(pr) = record.pr_number {
        println!("  pull request   #{}", pr);
    }
    if record.review_iteration > 0 {
        println!("  code reviews   {}", record.review_iteration);
    }
    if record.ci_fix_attempts > 0 {
        println!("  CI fixes       {}", record.ci_fix_attempts);
    }
    if let Some(deps) = record.depends_on.as_ref().filter(|d| !d.is_empty()) {
        println!("  depends on     {}", numbers(deps.iter()));
    }
    if record.is_blocked() {
        println!("  blocked by     {}", numbers(record.blocked_by.iter()));
    }
    if let Some(error) = &record.error {
        let reason = record.failure_reason.map(|r| r.as_str()).unwrap_or("error");
        let phase = record
            .failed_phase
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "  {}          {} ({} during {})",
            console::style("error").red(),
            error,
            reason,
            phase
        );
    }
    println!();
}

fn numbers<'a>(ns: impl Iterator<Item = &'a u64>) -> String {
    ns.map(|n| format!("#{}", n)).collect::<Vec<_>>().join(", ")
}
