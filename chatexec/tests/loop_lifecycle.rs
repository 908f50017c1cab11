//! End-to-end loop tests with a scripted chat client and the real
//! embedded evaluator.

use chatexec::core::types::ChatRole;
use chatexec::io::transcript::load_snapshot;
use chatexec::task::{LoopStop, Task, TaskDeps};
use chatexec::test_support::{
    ApproveAll, ScriptedClient, ScriptedInstaller, ScriptedTool, declaration, exec_marker,
    test_config, test_deps,
};
use serde_json::json;
use std::sync::Arc;

fn scripted_task(
    temp: &tempfile::TempDir,
    replies: Vec<String>,
) -> Task<ScriptedClient> {
    Task::new(
        test_config(temp.path()),
        ScriptedClient::new(replies),
        test_deps(),
    )
    .expect("task")
}

#[test]
fn declares_executes_and_feeds_stdout_back() {
    let temp = tempfile::tempdir().expect("tempdir");
    let replies = vec![
        format!("{}{}", declaration("a", 1, "print(\"hi\")"), exec_marker("a")),
        "All done.".to_string(),
    ];
    let mut task = scripted_task(&temp, replies);

    let outcome = task.run("print a greeting").expect("run");

    assert_eq!(outcome.stop, LoopStop::NothingToRun);
    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.reply, "All done.");

    // system, task payload, reply, feedback, final reply
    let messages = task.history().messages();
    assert_eq!(messages.len(), 5);
    assert_eq!(messages[0].role, ChatRole::System);

    let feedback = &messages[3];
    assert_eq!(feedback.role, ChatRole::User);
    assert!(feedback.content.contains("Runtime Environment"));
    assert!(feedback.content.contains("\"stdout\":\"hi\""));
    assert!(feedback.content.contains("\"block_name\":\"a\""));
    assert!(!feedback.content.contains("stderr"));
    assert!(!feedback.content.contains("errstr"));

    assert_eq!(task.run_log().len(), 1);
}

#[test]
fn redeclaring_a_version_with_new_content_yields_errors_and_no_execution() {
    let temp = tempfile::tempdir().expect("tempdir");
    let replies = vec![
        format!("{}{}", declaration("a", 1, "print(\"one\")"), exec_marker("a")),
        // Same (name, version), different body: protocol error, no run.
        format!("{}{}", declaration("a", 1, "print(\"two\")"), exec_marker("a")),
        "Understood.".to_string(),
    ];
    let mut task = scripted_task(&temp, replies);

    let outcome = task.run("count").expect("run");

    assert_eq!(outcome.stop, LoopStop::NothingToRun);
    assert_eq!(task.run_log().len(), 1, "second directive must not execute");

    let messages = task.history().messages();
    let error_feedback = &messages[5];
    assert!(error_feedback.content.starts_with("# Message parse errors"));
    assert!(error_feedback.content.contains("different content"));

    // The registry still holds the original body.
    let block = task.registry().latest("a").expect("block");
    assert_eq!(block.code, "print(\"one\")");
}

#[test]
fn round_bound_halts_without_error_and_returns_last_reply() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path());
    config.max_rounds = 2;

    let replies = vec![
        format!("{}{}", declaration("a", 1, "print(1)"), exec_marker("a")),
        exec_marker("a"),
        "still going".to_string(),
    ];
    let mut task = Task::new(config, ScriptedClient::new(replies), test_deps()).expect("task");

    let outcome = task.run("loop forever").expect("run");

    assert_eq!(outcome.stop, LoopStop::MaxRounds { max_rounds: 2 });
    assert_eq!(outcome.reply, "still going");
    assert_eq!(task.run_log().len(), 2);
}

#[test]
fn failed_blocks_are_evicted_and_their_turns_pruned() {
    let temp = tempfile::tempdir().expect("tempdir");
    let replies = vec![
        format!(
            "{}{}",
            declaration("boom", 1, "raise RuntimeError(\"nope\")"),
            exec_marker("boom")
        ),
        format!("{}{}", declaration("ok", 1, "print(\"fine\")"), exec_marker("ok")),
        "done".to_string(),
    ];
    let mut task = scripted_task(&temp, replies);

    let outcome = task.run("try things").expect("run");
    assert_eq!(outcome.stop, LoopStop::NothingToRun);

    // The failed block is gone from the registry and the run log.
    assert!(!task.registry().contains("boom"));
    assert!(task.registry().contains("ok"));
    let run_names: Vec<&str> = task
        .run_log()
        .iter()
        .map(|r| r.block_name.as_str())
        .collect();
    assert_eq!(run_names, vec!["ok"]);

    // History repair removed exactly the dead-end pair.
    let messages = task.history().messages();
    assert_eq!(messages.len(), 5);
    assert!(
        messages.iter().all(|m| !m.content.contains("boom")),
        "pruned turns must not linger in history"
    );
}

#[test]
fn stderr_output_alone_triggers_eviction() {
    let temp = tempfile::tempdir().expect("tempdir");
    let replies = vec![
        format!(
            "{}{}",
            declaration(
                "warny",
                1,
                "import sys\nprint(\"result\")\nprint(\"careful\", file=sys.stderr)"
            ),
            exec_marker("warny")
        ),
        "noted".to_string(),
    ];
    let mut task = scripted_task(&temp, replies);

    task.run("warn me").expect("run");

    // The block only printed a warning, but stderr output evicts.
    assert!(!task.registry().contains("warny"));
}

#[test]
fn stop_request_is_honored_at_the_round_boundary() {
    let temp = tempfile::tempdir().expect("tempdir");
    let replies = vec![
        format!("{}{}", declaration("a", 1, "print(1)"), exec_marker("a")),
        exec_marker("a"),
    ];
    let mut task = scripted_task(&temp, replies);
    task.stop_handle().store(true, std::sync::atomic::Ordering::Relaxed);

    let outcome = task.run("start something long").expect("run");

    // The in-flight round completed (the block ran) before the stop.
    assert_eq!(outcome.stop, LoopStop::Stopped);
    assert_eq!(task.run_log().len(), 1);
}

#[test]
fn namespace_persists_between_rounds() {
    let temp = tempfile::tempdir().expect("tempdir");
    let replies = vec![
        format!(
            "{}{}",
            declaration("define", 1, "def f():\n    return \"hello\""),
            exec_marker("define")
        ),
        format!("{}{}", declaration("use", 1, "print(f())"), exec_marker("use")),
        "done".to_string(),
    ];
    let mut task = scripted_task(&temp, replies);

    task.run("define then use").expect("run");

    let messages = task.history().messages();
    let second_feedback = &messages[5];
    assert!(second_feedback.content.contains("\"stdout\":\"hello\""));
}

#[test]
fn tool_call_replies_are_dispatched_when_enabled() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path());
    config.tool_calls = true;

    let tool = Arc::new(ScriptedTool::new(json!({"temp_c": 21})));
    let deps = TaskDeps {
        gate: Arc::new(ApproveAll),
        installer: Arc::new(ScriptedInstaller::succeeding()),
        tools: tool.clone(),
        upload: None,
    };
    let replies = vec![
        r#"{"action": "call_tool", "name": "weather", "arguments": {"city": "Oslo"}}"#.to_string(),
        "Thanks.".to_string(),
    ];
    let mut task = Task::new(config, ScriptedClient::new(replies), deps).expect("task");

    let outcome = task.run("what's the weather in Oslo?").expect("run");

    assert_eq!(outcome.stop, LoopStop::NothingToRun);
    let calls = tool.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "weather");
    assert_eq!(calls[0].1["city"], "Oslo");

    let feedback = &task.history().messages()[3];
    assert!(feedback.content.contains("\"temp_c\":21"));
    assert!(feedback.content.contains("\"block_name\":\"weather\""));
}

#[test]
fn snapshot_records_instruction_blocks_and_runs() {
    let temp = tempfile::tempdir().expect("tempdir");
    let replies = vec![
        format!("{}{}", declaration("a", 1, "print(\"hi\")"), exec_marker("a")),
        "All done.".to_string(),
    ];
    let mut task = scripted_task(&temp, replies);

    task.run("print a greeting").expect("run");

    let snapshot = load_snapshot(&task.cwd().join("task.json")).expect("snapshot");
    assert_eq!(snapshot.instruction, "print a greeting");
    assert_eq!(snapshot.blocks.len(), 1);
    assert_eq!(snapshot.blocks[0].name, "a");
    assert_eq!(snapshot.runner.len(), 1);
    assert_eq!(snapshot.runner[0].result.stdout.as_deref(), Some("hi"));
    assert_eq!(snapshot.chats.len(), 5);
}
