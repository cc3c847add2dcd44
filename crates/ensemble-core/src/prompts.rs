//! Prompt composition for every agent role.
//!
//! Prompts are assembled from session and plan state, always ending with
//! the sentinel-file instruction for the role, since the sentinel is the
//! only completion signal the coordinator trusts. Retried tasks carry the
//! previous attempt's failure so the agent does not repeat it.

use ensemble_state::plan::{Plan, PlanTask};
use ensemble_state::sentinels::ReviewPayload;
use ensemble_state::session::RetryState;

use crate::sentinel::SentinelKind;

fn sentinel_instruction(kind: SentinelKind, shape: &str) -> String {
    format!(
        "When you are completely done, write a file named `{}` in the \
         root of your working directory containing a single JSON object \
         with {shape}. Do not write it before the work is finished.",
        kind.filename()
    )
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("  - {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prompt for a planner agent: turn the objective into a task breakdown.
pub fn planner_prompt(objective: &str) -> String {
    format!(
        "You are planning a multi-task implementation of the following \
         objective:\n\n{objective}\n\n\
         Explore the repository, then produce a plan: an ordered set of \
         tasks with ids, titles, descriptions, the files each touches, \
         `depends_on` lists, integer priorities (lower runs earlier), and \
         `est_complexity` of low, medium, or high. Tasks without a \
         dependency between them may run in parallel, so keep tasks \
         independent where possible and make every real ordering \
         constraint an explicit dependency.\n\n{}",
        sentinel_instruction(
            SentinelKind::Plan,
            "keys: summary, tasks, insights, constraints"
        )
    )
}

/// Prompt for one task agent.
///
/// Carries the plan's insights and constraints, and on a retry the
/// previous attempt's failure.
pub fn task_prompt(plan: &Plan, task: &PlanTask, retry: Option<&RetryState>) -> String {
    let mut sections = vec![format!(
        "You are implementing one task of a larger plan.\n\n\
         Plan summary: {}\n\nTask {}: {}\n\n{}",
        plan.summary, task.id, task.title, task.description
    )];

    if !task.files.is_empty() {
        sections.push(format!("Files expected to change:\n{}", bullet_list(&task.files)));
    }
    if let Some(url) = &task.issue_url {
        sections.push(format!("Tracking issue: {url}"));
    }
    if !plan.insights.is_empty() {
        sections.push(format!("Insights from planning:\n{}", bullet_list(&plan.insights)));
    }
    if !plan.constraints.is_empty() {
        sections.push(format!("Constraints:\n{}", bullet_list(&plan.constraints)));
    }

    if let Some(retry) = retry {
        if retry.retry_count > 0 {
            let reason = retry
                .last_error
                .as_deref()
                .unwrap_or("the previous attempt produced no commits");
            sections.push(format!(
                "This is attempt {} for this task. The previous attempt \
                 failed: {reason}. Commit your work with git as you go; an \
                 attempt that ends with no commits counts as failed.",
                retry.retry_count + 1
            ));
        }
    }

    sections.push(
        "Commit your changes to the current branch. Do not push.".to_string(),
    );
    sections.push(sentinel_instruction(
        SentinelKind::TaskComplete,
        "keys: task_id, status (complete|failed|blocked), summary, files_modified",
    ));

    sections.join("\n\n")
}

/// Prompt for the synthesis agent reviewing the integrated result.
pub fn synthesis_prompt(plan: &Plan, revision_round: u32) -> String {
    format!(
        "All tasks of the plan below have been executed and consolidated \
         onto this branch. Review the integrated result as a whole: look \
         for broken interactions between tasks, missing glue, and \
         regressions. This is revision round {revision_round}.\n\n\
         Plan summary: {}\n\nTasks:\n{}\n\n{}",
        plan.summary,
        bullet_list(
            &plan
                .tasks
                .iter()
                .map(|t| format!("{}: {}", t.id, t.title))
                .collect::<Vec<_>>()
        ),
        sentinel_instruction(
            SentinelKind::SynthesisComplete,
            "keys: status (complete|needs_revision), revision_round, \
             issues_found (each with severity critical|major|minor), \
             tasks_affected, integration_notes, recommendations"
        )
    )
}

/// Prompt for a revision agent addressing synthesis issues for one task.
pub fn revision_prompt(
    task: &PlanTask,
    revision_round: u32,
    issues: &[String],
) -> String {
    format!(
        "Synthesis review found issues attributable to task {} ({}). \
         This is revision round {revision_round}. Address these issues:\n{}\n\n\
         Commit your fixes to the current branch.\n\n{}",
        task.id,
        task.title,
        bullet_list(issues),
        sentinel_instruction(
            SentinelKind::RevisionComplete,
            "keys: task_id, revision_round, issues_addressed, summary, \
             files_modified, remaining_issues"
        )
    )
}

/// Prompt for a delegated group consolidator agent.
pub fn group_consolidation_prompt(
    group_index: usize,
    base_branch: &str,
    task_branches: &[String],
) -> String {
    format!(
        "Consolidate execution group {group_index}. Starting from the base \
         branch `{base_branch}`, cherry-pick the commits of each of these \
         task branches, in order, onto the current branch, resolving any \
         conflicts:\n{}\n\nVerify the result builds before finishing.\n\n{}",
        bullet_list(task_branches),
        sentinel_instruction(
            SentinelKind::GroupConsolidationComplete,
            "keys: group_index, status (complete|failed), branch_name, \
             tasks_consolidated, conflicts_resolved, verification"
        )
    )
}

/// Prompt for the overall consolidator at the end of a run.
pub fn consolidation_prompt(objective: &str, group_branches: &[String]) -> String {
    format!(
        "All execution groups for the objective below are consolidated on \
         this branch chain:\n{}\n\nObjective: {objective}\n\n\
         Produce the final consolidation report and open pull requests \
         where appropriate.\n\n{}",
        bullet_list(group_branches),
        sentinel_instruction(
            SentinelKind::ConsolidationComplete,
            "keys: status (complete|partial|failed), mode, group_results, \
             prs_created, total_commits, files_changed"
        )
    )
}

/// Prompt for the adversarial implementer.
///
/// Rounds after the first carry the previous review's required changes.
pub fn implementer_prompt(
    task: &str,
    round: u32,
    previous_review: Option<&ReviewPayload>,
) -> String {
    let mut sections = vec![format!(
        "You are the implementer in round {round} of an \
         implement-and-review loop.\n\nTask:\n{task}"
    )];

    if let Some(review) = previous_review {
        sections.push(format!(
            "The previous round was rejected (score {}). Required changes:\n{}",
            review.score,
            bullet_list(&review.required_changes)
        ));
    }

    sections.push("Commit your work to the current branch.".to_string());
    sections.push(sentinel_instruction(
        SentinelKind::AdversarialIncrement,
        "keys: round, status, summary",
    ));
    sections.join("\n\n")
}

/// Prompt for the adversarial reviewer.
pub fn reviewer_prompt(task: &str, round: u32, increment_summary: &str, minimum_score: i64) -> String {
    format!(
        "You are the reviewer in round {round} of an implement-and-review \
         loop. Review the implementer's work in this worktree \
         adversarially: try to find real defects.\n\nTask:\n{task}\n\n\
         Implementer's summary: {increment_summary}\n\n\
         Score the increment 1-10. Approve only if the work genuinely \
         meets the task; the minimum passing score is {minimum_score}. If \
         you do not approve, list concrete required changes.\n\n{}",
        sentinel_instruction(
            SentinelKind::AdversarialReview,
            "keys: round, approved (bool), score (int), summary, required_changes"
        )
    )
}

/// Prompt for the long-lived iterative-loop agent.
///
/// The completion phrase contract: the agent emits
/// `<promise>PHRASE</promise>` only when the promise is genuinely kept.
pub fn iterative_prompt(prompt: &str, completion_phrase: &str) -> String {
    format!(
        "{prompt}\n\n\
         Work in iterations. Keep a `{}` file up to date with your \
         progress. When -- and only when -- the work is genuinely complete, \
         output <promise>{completion_phrase}</promise> exactly. Do not \
         output that tag otherwise.",
        SentinelKind::RalphStatus.filename()
    )
}

/// Re-prompt sent between iterations of the loop.
pub fn iterative_continue_prompt(iteration: u32, completion_phrase: &str) -> String {
    format!(
        "Continue with iteration {iteration}. Review your previous work, \
         fix what is broken, and keep going. Output \
         <promise>{completion_phrase}</promise> only when everything is \
         done.\n"
    )
}

/// Prompt for one triple-shot attempt.
pub fn attempt_prompt(task: &str, attempt_index: u32) -> String {
    format!(
        "You are attempt {attempt_index} of three independent attempts at \
         the task below. Choose your own approach; other attempts may \
         differ.\n\nTask:\n{task}\n\n\
         Commit your work to the current branch.\n\n{}",
        sentinel_instruction(
            SentinelKind::TripleShotComplete,
            "keys: attempt_index, status (complete|failed), summary, \
             files_modified, approach"
        )
    )
}

/// Prompt for the triple-shot judge.
pub fn judge_prompt(task: &str, attempts: &[(u32, String, String)]) -> String {
    let summaries = attempts
        .iter()
        .map(|(idx, branch, summary)| {
            format!("  - attempt {idx} (branch `{branch}`): {summary}")
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Three independent attempts were made at the task below, each on \
         its own branch:\n{summaries}\n\nTask:\n{task}\n\n\
         Examine the branches and judge them. Either select a single \
         winner (winner_index 0-2, merge_strategy \"select\"), or direct a \
         merge/combination (winner_index of the base attempt or -1, \
         merge_strategy \"merge\" or \"combine\", with suggested_changes).\n\n{}",
        sentinel_instruction(
            SentinelKind::TripleShotEvaluation,
            "keys: winner_index (-1|0|1|2), merge_strategy \
             (select|merge|combine), reasoning, attempt_evaluations"
        )
    )
}
