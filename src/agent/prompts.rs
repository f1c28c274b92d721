//! Prompt text for each agent task and the formatting of agent results for humans.
//!
//! The agent writes its structured results into `.taskwright/` inside the
//! workspace, and signals outcomes with marker words in its final output.

use crate::state::QaEntry;

/// Directory inside the workspace the agent writes its results into.
pub const TASK_DIR: &str = ".taskwright";
pub const QUESTIONS_FILE: &str = "questions.md";
pub const PLAN_FILE: &str = "plan.md";
pub const FEEDBACK_FILE: &str = "feedback.md";

pub const NO_QUESTIONS_MARKER: &str = "NO_QUESTIONS_NEEDED";
pub const SIGNIFICANT_CHANGES_MARKER: &str = "SIGNIFICANT_CHANGES";
pub const MINOR_CHANGES_MARKER: &str = "MINOR_CHANGES";
pub const IMPLEMENTATION_COMPLETE_MARKER: &str = "IMPLEMENTATION_COMPLETE";
pub const MERGE_CONFLICT_MARKER: &str = "MERGE_CONFLICT_UNRESOLVED:";
pub const FIX_COMPLETE_MARKER: &str = "FIX_COMPLETE";
pub const FEEDBACK_ADDRESSED_MARKER: &str = "FEEDBACK_ADDRESSED";

/// First look at an issue: questions (or none) plus a draft plan.
pub fn analyze_issue(title: &str, body: &str) -> String {
    format!(
        r#"Analyze this issue and decide if you need clarifying questions.

Issue Title: {title}
Issue Body:
{body}

If you have clarifying questions, write them to {dir}/{questions} in this format:

1. [Question]

   A. [Option] (Recommended)
      **Effort:** [Low/Medium/High]
      **Risk:** [Low/Medium/High - breaking changes, compatibility issues]
      **Pros:** [2-3 benefits]
      **Cons:** [1-2 drawbacks]

   B. [Option]
      **Effort:** [Low/Medium/High]
      **Risk:** [Low/Medium/High]
      **Pros:** [2-3 benefits]
      **Cons:** [1-2 drawbacks]

   C. Other (please specify)

Mark your recommended option with "(Recommended)". Add blank lines between options.
If an option depends on another question's answer, note it (e.g., "Requires 1A").

End with: "If you're unsure, replying with just the recommended options (e.g., '1A, 2A, 3B') is a safe default."

If no questions are needed, write "{none}" to {dir}/{questions}

Then write your implementation plan to {dir}/{plan} with:
- Overview
- Files to create/modify
- Step-by-step approach
- Testing approach"#,
        title = title,
        body = body,
        dir = TASK_DIR,
        questions = QUESTIONS_FILE,
        plan = PLAN_FILE,
        none = NO_QUESTIONS_MARKER,
    )
}

/// Follow-up after the user answered a round of questions.
pub fn incorporate_answers(history: &[QaEntry]) -> String {
    format!(
        r#"The user answered your clarifying questions.

{history}

Update {dir}/{plan} to reflect the answers.

If the answers raise new questions that block a good plan, overwrite {dir}/{questions}
with only the new questions, in the same format as before. Otherwise write "{none}"
to {dir}/{questions}."#,
        history = format_qa_history(history),
        dir = TASK_DIR,
        plan = PLAN_FILE,
        questions = QUESTIONS_FILE,
        none = NO_QUESTIONS_MARKER,
    )
}

pub fn review_plan(iteration: u32, total: u32) -> String {
    format!(
        "/review the plan at {}/{} and fix all issues (review {} of {})",
        TASK_DIR, PLAN_FILE, iteration, total
    )
}

/// Revise the plan from the feedback file. The agent reports how big the change was.
pub fn revise_plan() -> String {
    format!(
        r#"Read the user feedback at {dir}/{feedback}. This feedback is a CHANGE REQUEST: the user wants you to modify the plan, not explain or justify the current approach.

Revise {dir}/{plan} to incorporate the user's requested changes:
- If they ask "can X do Y?" or "why not X?", change the approach to use X
- If they disagree with a decision, change the plan to use their preferred approach
- If they suggest additions, add them to the plan
- Do NOT add explanatory sections defending the current approach

After updating the plan, output:
- "{significant}" if the changes affect architecture, approach, or requirements
- "{minor}" if the changes are clarifications or small additions"#,
        dir = TASK_DIR,
        feedback = FEEDBACK_FILE,
        plan = PLAN_FILE,
        significant = SIGNIFICANT_CHANGES_MARKER,
        minor = MINOR_CHANGES_MARKER,
    )
}

/// Implement the approved plan on a new branch and push it.
pub fn implement(issue_number: u64, title: &str, base_branch: &str) -> String {
    format!(
        r#"Implement the plan from {dir}/{plan}

Issue #{n}: {title}
Base branch: {base}

After implementing the code changes:

## 1. Create a branch
Choose a descriptive branch name based on the issue (e.g., feat/add-user-auth, fix/login-timeout).
- git checkout -b <your-branch-name>

## 2. Commit your changes
- Use conventional commits: type(scope): description
- Explain WHY in the commit body, not just what
- Create multiple commits if changes are logically separate
- Reference the issue in your final commit: "Closes #{n}"
- Do not commit the {dir} directory

## 3. Integrate upstream changes
- git fetch origin {base}
- Prefer rebase for clean history: git rebase origin/{base}
- If rebase conflicts are too complex, use merge: git merge origin/{base}
- Resolve conflicts using your understanding of the code
- If you cannot resolve a conflict, output:
  {conflict} <comma-separated list of files>

## 4. Push the branch
- git push -u origin <your-branch-name>
- If push fails due to remote changes, fetch/rebase and retry

Output "{done} <branch-name>" when done."#,
        dir = TASK_DIR,
        plan = PLAN_FILE,
        n = issue_number,
        title = title,
        base = base_branch,
        conflict = MERGE_CONFLICT_MARKER,
        done = IMPLEMENTATION_COMPLETE_MARKER,
    )
}

pub fn review_code(iteration: u32, total: u32, branch: &str) -> String {
    format!(
        "/review the code on branch {} and fix all issues (review {} of {}). \
         Commit and push any fixes.",
        branch, iteration, total
    )
}

pub fn address_feedback(feedback: &str, branch: &str) -> String {
    format!(
        r#"Address this feedback on the implementation:

{feedback}

Read {dir}/{plan} for context. Fix any issues in the code, commit, and push to {branch}.
Output "{done}" when done."#,
        feedback = feedback,
        dir = TASK_DIR,
        plan = PLAN_FILE,
        branch = branch,
        done = FEEDBACK_ADDRESSED_MARKER,
    )
}

pub fn fix_ci(failure: &str, branch: &str) -> String {
    format!(
        r#"CI failed. Fix the issues.

Error:
{failure}

Fix the code, commit, and push to {branch}. Output "{done}" when done."#,
        failure = failure,
        branch = branch,
        done = FIX_COMPLETE_MARKER,
    )
}

pub fn summarize_changes(base_branch: &str, head_branch: &str) -> String {
    format!(
        r#"Summarize the code changes for a PR description.

Run git diff origin/{base}...{head} to see the changes, then provide a concise summary in this format:

## Summary
[1-2 sentences describing what was implemented]

## Changes
[List each file changed with a brief description]

## Notes
[Any notable decisions, trade-offs, or testing notes. Omit if none.]

Keep it brief and focus on the "what" and "why". Do not include markdown code blocks in your response."#,
        base = base_branch,
        head = head_branch,
    )
}

/// Q&A rounds as plain text for prompts.
pub fn format_qa_history(history: &[QaEntry]) -> String {
    if history.is_empty() {
        return "(none)".to_string();
    }
    let mut out = String::new();
    for (i, entry) in history.iter().enumerate() {
        out.push_str(&format!("Round {}:\n", i + 1));
        out.push_str(&format!("Questions:\n{}\n", entry.questions));
        out.push_str(&format!("Answers:\n{}\n\n", entry.answers));
    }
    out
}

/// Issue comment asking the questions of round `round` (1-based).
pub fn questions_comment(questions: &str, round: u32) -> String {
    let mut out = String::from("## Questions\n\n");
    if round > 1 {
        out.push_str(&format!("*Follow-up questions (round {}):*\n\n", round));
    }
    out.push_str(questions);
    out.push_str("\n\n---\n");
    out.push_str("Reply with your answers (e.g., \"1A, 2B\" or write detailed responses).\n");
    out
}

/// Issue comment presenting a plan for approval.
pub fn plan_comment(plan: &str, review_count: u32) -> String {
    let mut out = String::from("## Implementation Plan\n\n");
    out.push_str(&format!("*Reviewed {} times*\n\n", review_count));
    out.push_str(plan);
    out.push_str("\n\n---\n");
    out.push_str(
        "Reply `/approve` to proceed with implementation, or provide feedback to request changes.\n",
    );
    out
}
