//! Prompt templates for the four pipeline calls.
//!
//! Pure string formatting: every function takes the run's current data and
//! returns the full prompt text. The ledger slice passed in is the state at
//! call time, so sub-task `i` sees the frozen output of `0..i` only.

use std::fmt::Write;
use std::sync::Arc;

use serde_json::json;

use crate::task::SubtaskRecord;

const NO_PRIOR_WORK: &str = "No tasks have been completed yet.";

/// JSON schema for the decomposition response: `{ "subTasks": string[] }`.
pub fn decomposition_schema() -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "subTasks": {
                "type": "ARRAY",
                "items": {
                    "type": "STRING",
                    "description": "A clear, actionable sub-task."
                }
            }
        },
        "required": ["subTasks"]
    })
}

pub fn decomposition(task: &str) -> String {
    format!(
        r#"# ROLE
You are an expert planner. Break the user's request down into a short, ordered series of concrete sub-tasks.

# INSTRUCTIONS
1. Read the request carefully.
2. Work out the logical sequence of steps needed to reach the goal.
3. Every step must be a concrete action.
4. Do NOT perform the steps; only define them.
5. Write the steps in English.
6. Respond with a JSON object whose "subTasks" field is an array of strings.

# USER REQUEST
"{task}"
"#
    )
}

pub fn reflection(main_task: &str, records: &[Arc<SubtaskRecord>], index: usize) -> String {
    let history = history(records, index, |out, record| {
        let _ = writeln!(out, "Result: {}", record.result());
    });

    format!(
        r#"# MAIN GOAL
The user wants to accomplish the following task: "{main_task}"

# TASK PLAN
{plan}
# PREVIOUS WORK
{history}
# CURRENT TASK
"{current}"

# YOUR JOB
Think about the current task before anyone executes it.
1. Analyze: what is the core question of this task?
2. Identify gaps: what information is missing?
3. Plan: which questions should be answered and which search terms should be used?

This is a planning step. Do NOT execute the task or answer it. Output a brief analysis and an action plan only.
"#,
        plan = plan(records),
        current = description_at(records, index),
    )
}

pub fn execution(main_task: &str, records: &[Arc<SubtaskRecord>], index: usize) -> String {
    let history = history(records, index, |out, record| {
        let _ = writeln!(out, "Analysis: {}", record.reflection());
        let _ = writeln!(out, "Result: {}", record.result());
    });
    let analysis = records
        .get(index)
        .map(|r| r.reflection())
        .unwrap_or_default();

    format!(
        r#"# MAIN GOAL
The user wants to accomplish the following task: "{main_task}"

# TASK PLAN
{plan}
# PREVIOUS WORK
{history}
# CURRENT TASK
Execute ONLY this sub-task, using the available tools where useful:
"{current}"

# ANALYSIS
This task was already analyzed, with the following plan:
"{analysis}"

# INSTRUCTIONS
Follow the analysis and execute the task now. Give a detailed, complete result for this step. Be concise but thorough.
"#,
        plan = plan(records),
        current = description_at(records, index),
    )
}

pub fn consolidation(main_task: &str, records: &[Arc<SubtaskRecord>]) -> String {
    let history = history(records, records.len(), |out, record| {
        let _ = writeln!(out, "Analysis:\n{}", record.reflection());
        let _ = writeln!(out, "Result:\n{}", record.result());
    });

    format!(
        r#"# ROLE
You synthesize the results of a multi-step task into one final answer for the user.

# MAIN GOAL
The user's original request was: "{main_task}"

# COMPLETED WORK
{history}
# INSTRUCTIONS
1. Review every sub-task result and analysis.
2. Combine them into a single, cohesive answer that directly addresses the main goal.
3. Format with markdown (headings, lists, bold).
4. Do not mention sub-tasks or analysis steps; present the information as one complete answer.
"#
    )
}

fn description_at(records: &[Arc<SubtaskRecord>], index: usize) -> &str {
    records
        .get(index)
        .map(|r| r.description())
        .unwrap_or_default()
}

fn plan(records: &[Arc<SubtaskRecord>]) -> String {
    let mut out = String::new();
    for (i, record) in records.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, record.description());
    }
    out
}

/// Render records `0..upto` with a per-record body.
fn history(
    records: &[Arc<SubtaskRecord>],
    upto: usize,
    body: impl Fn(&mut String, &SubtaskRecord),
) -> String {
    let mut out = String::new();
    for (i, record) in records.iter().take(upto).enumerate() {
        let _ = writeln!(out, "---\nSub-task {}: {}", i + 1, record.description());
        body(&mut out, record);
        out.push_str("---\n");
    }
    if out.is_empty() {
        out.push_str(NO_PRIOR_WORK);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Citation;
    use crate::task::{Ledger, SubtaskStatus};

    fn two_step_ledger() -> Ledger {
        let mut ledger = Ledger::new();
        ledger.initialize(["Find destination", "Book flight"]).unwrap();
        ledger.set_status(0, SubtaskStatus::Reflecting).unwrap();
        ledger.append_reflection(0, "Look at beaches").unwrap();
        ledger.set_status(0, SubtaskStatus::Executing).unwrap();
        ledger.append_result(0, "Lisbon").unwrap();
        ledger.merge_sources(0, &[Citation::new("https://x")]).unwrap();
        ledger.set_status(0, SubtaskStatus::Completed).unwrap();
        ledger
    }

    #[test]
    fn test_decomposition_contains_task_and_schema_requires_field() {
        let prompt = decomposition("Plan a trip");
        assert!(prompt.contains("\"Plan a trip\""));
        let schema = decomposition_schema();
        assert_eq!(schema["required"], json!(["subTasks"]));
        assert_eq!(schema["properties"]["subTasks"]["items"]["type"], "STRING");
    }

    #[test]
    fn test_reflection_for_first_task_has_no_history() {
        let mut ledger = Ledger::new();
        ledger.initialize(["Find destination", "Book flight"]).unwrap();
        let prompt = reflection("Plan a trip", ledger.records(), 0);
        assert!(prompt.contains(NO_PRIOR_WORK));
        assert!(prompt.contains("1. Find destination\n2. Book flight"));
        assert!(prompt.contains("\"Find destination\""));
    }

    #[test]
    fn test_reflection_sees_prior_results_only() {
        let ledger = two_step_ledger();
        let prompt = reflection("Plan a trip", ledger.records(), 1);
        assert!(prompt.contains("Sub-task 1: Find destination"));
        assert!(prompt.contains("Result: Lisbon"));
        assert!(!prompt.contains("Look at beaches"));
        assert!(!prompt.contains("Sub-task 2:"));
    }

    #[test]
    fn test_execution_includes_prior_analysis_and_current_reflection() {
        let mut ledger = two_step_ledger();
        ledger.set_status(1, SubtaskStatus::Reflecting).unwrap();
        ledger.append_reflection(1, "Compare airlines").unwrap();

        let prompt = execution("Plan a trip", ledger.records(), 1);
        assert!(prompt.contains("Analysis: Look at beaches"));
        assert!(prompt.contains("Result: Lisbon"));
        assert!(prompt.contains("\"Book flight\""));
        assert!(prompt.contains("\"Compare airlines\""));
    }

    #[test]
    fn test_consolidation_lists_every_task() {
        let mut ledger = two_step_ledger();
        ledger.set_status(1, SubtaskStatus::Reflecting).unwrap();
        ledger.set_status(1, SubtaskStatus::Executing).unwrap();
        ledger.append_result(1, "TAP 10:00").unwrap();
        ledger.set_status(1, SubtaskStatus::Completed).unwrap();

        let prompt = consolidation("Plan a trip", ledger.records());
        assert!(prompt.contains("Sub-task 1: Find destination"));
        assert!(prompt.contains("Sub-task 2: Book flight"));
        assert!(prompt.contains("Result:\nTAP 10:00"));
        assert!(!prompt.contains(NO_PRIOR_WORK));
    }

    #[test]
    fn test_out_of_range_index_does_not_panic() {
        let ledger = Ledger::new();
        let prompt = execution("x", ledger.records(), 4);
        assert!(prompt.contains("\"\""));
    }
}
