use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use codecall_protocol::WireRequest;
use parking_lot::Mutex;
use serde_json::json;

use super::*;
use crate::backend::scripted::{ScriptedLauncher, Step};

fn is_internal(request: &WireRequest, name: &str) -> bool {
    request.file.is_none() && request.fcn == name
}

fn fast_options() -> WorkerOptions {
    WorkerOptions {
        question_timeout: Duration::from_millis(50),
        ping_timeout: Duration::from_secs(1),
        restart_timeout: Duration::from_millis(50),
    }
}

fn question(function: &str) -> CallRequest {
    CallRequest::new(CallType::Question, "server", function).with_directory("addNumbers")
}

/// Worker prepared for `/course` running `launcher`
async fn prepared(launcher: ScriptedLauncher, options: WorkerOptions) -> Worker<ScriptedLauncher> {
    let mut worker = Worker::new(launcher, options);
    worker
        .prepare_for_course(PrepareForCourse::new("/course"))
        .await
        .unwrap();
    worker
}

/// Launcher that records every request it receives
fn recording(
    script: impl Fn(&WireRequest) -> Option<Vec<Step>> + Send + Sync + 'static,
) -> (ScriptedLauncher, Arc<Mutex<Vec<WireRequest>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let launcher = ScriptedLauncher::new(move |request| {
        log.lock().push(request.clone());
        script(request)
    });
    (launcher, seen)
}

#[test_log::test(tokio::test)]
async fn test_add_numbers_question() {
    let (launcher, seen) = recording(|request| {
        (request.fcn == "generate").then(|| {
            vec![
                Step::Stdout("generating\n".into()),
                Step::value(json!({"params": {"a": 3, "b": 4}})),
            ]
        })
    });
    let stats = launcher.stats();
    let mut worker = prepared(launcher, WorkerOptions::default()).await;
    assert_eq!(worker.state(), WorkerState::Created);

    let output = worker
        .call(question("generate").with_args(vec![json!({"variant_seed": 7})]))
        .await
        .unwrap();
    assert_eq!(output.data, json!({"params": {"a": 3, "b": 4}}));
    assert_eq!(output.output, "generating\n");
    assert_eq!(worker.state(), WorkerState::Waiting);
    assert_eq!(stats.launches.load(Ordering::SeqCst), 1);

    let requests = seen.lock();
    assert_eq!(requests.len(), 2);
    assert!(is_internal(&requests[0], "ping"));
    assert_eq!(requests[0].paths, vec!["/builtin/python".to_string()]);

    let call = &requests[1];
    assert_eq!(call.file.as_deref(), Some("server"));
    assert_eq!(call.fcn, "generate");
    assert_eq!(call.args, vec![json!({"variant_seed": 7})]);
    assert_eq!(call.cwd.as_deref(), Some("/course/questions/addNumbers"));
    assert_eq!(
        call.paths,
        vec![
            "/builtin/python".to_string(),
            "/course/serverFilesCourse".to_string()
        ]
    );
}

#[tokio::test]
async fn test_function_missing_keeps_worker() {
    let mut worker = prepared(ScriptedLauncher::zygote(), WorkerOptions::default()).await;

    let err = worker.call(question("grade")).await.unwrap_err();
    assert!(err.is_function_missing());
    assert!(!err.is_fatal_to_worker());
    assert_eq!(worker.state(), WorkerState::Waiting);
    assert!(worker.restart().await.unwrap());
    assert_eq!(worker.state(), WorkerState::Waiting);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_call_timeout_kills_child() {
    let launcher = ScriptedLauncher::new(|request| {
        (request.fcn == "spin")
            .then(|| vec![Step::Sleep(Duration::from_secs(5)), Step::value(json!(1))])
    });
    let mut worker = prepared(launcher, fast_options()).await;

    let err = worker.call(question("spin")).await.unwrap_err();
    assert!(
        matches!(
            err,
            CallError::Timeout {
                phase: TimeoutPhase::Call,
                limit
            } if limit == Duration::from_millis(50)
        ),
        "unexpected error: {err}"
    );
    assert_eq!(worker.state(), WorkerState::Exiting);

    let err = worker.call(question("spin")).await.unwrap_err();
    assert!(matches!(err, CallError::InvalidState { .. }), "{err}");

    assert!(worker.wait_for_exit(Duration::from_secs(1)).await);
    assert_eq!(worker.state(), WorkerState::Exited);
    assert!(!worker.restart().await.unwrap());
}

#[tokio::test]
async fn test_malformed_data_is_fatal() {
    let launcher = ScriptedLauncher::new(|request| {
        (request.fcn == "broken").then(|| vec![Step::Data("this is not json\n".into())])
    });
    let mut worker = prepared(launcher, WorkerOptions::default()).await;

    let err = worker.call(question("broken")).await.unwrap_err();
    assert!(matches!(err, CallError::ProtocolViolation(_)), "{err}");
    assert_eq!(worker.state(), WorkerState::Exiting);
    assert!(!worker.restart().await.unwrap());
}

#[tokio::test]
async fn test_undecodable_relay_line_is_fatal() {
    let launcher = ScriptedLauncher::new(|request| {
        (request.fcn == "generate").then(|| vec![Step::Malformed("{\"chan".into())])
    });
    let mut worker = prepared(launcher, WorkerOptions::default()).await;

    let err = worker.call(question("generate")).await.unwrap_err();
    assert!(matches!(err, CallError::ProtocolViolation(_)), "{err}");
    assert_eq!(worker.state(), WorkerState::Exiting);
}

#[tokio::test]
async fn test_child_crash_during_call() {
    let launcher =
        ScriptedLauncher::new(|request| (request.fcn == "crash").then(|| vec![Step::Exit(3)]));
    let mut worker = prepared(launcher, WorkerOptions::default()).await;

    let err = worker.call(question("crash")).await.unwrap_err();
    match err {
        CallError::ChildCrashed(message) => assert!(message.contains("exit code 3"), "{message}"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(worker.state(), WorkerState::Exited);
    assert!(!worker.restart().await.unwrap());
}

#[tokio::test]
async fn test_restart_after_call() {
    let (launcher, seen) = recording(|request| {
        (request.fcn == "generate").then(|| vec![Step::value(json!(null))])
    });
    let mut worker = prepared(launcher, WorkerOptions::default()).await;

    worker.call(question("generate")).await.unwrap();
    assert!(worker.restart().await.unwrap());
    assert_eq!(worker.state(), WorkerState::Waiting);

    // The same child serves the next call
    worker.call(question("generate")).await.unwrap();
    let fcns: Vec<_> = seen.lock().iter().map(|r| r.fcn.clone()).collect();
    assert_eq!(fcns, ["ping", "generate", "restart", "generate"]);
}

#[tokio::test]
async fn test_restart_confirmation_before_reply() {
    let launcher = ScriptedLauncher::new(|request| {
        is_internal(request, "restart").then(|| {
            vec![
                Step::Restart("{\"exited\":true}\n".into()),
                Step::value(json!("success")),
            ]
        })
    });
    let mut worker = prepared(launcher, WorkerOptions::default()).await;
    worker.ensure_child().await.unwrap();

    assert!(worker.restart().await.unwrap());
    assert_eq!(worker.state(), WorkerState::Waiting);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_restart_timeout() {
    let launcher = ScriptedLauncher::new(|request| {
        is_internal(request, "restart").then(|| vec![Step::value(json!("success"))])
    });
    let mut worker = prepared(launcher, fast_options()).await;
    worker.ensure_child().await.unwrap();

    let err = worker.restart().await.unwrap_err();
    assert!(matches!(
        err,
        CallError::Timeout {
            phase: TimeoutPhase::Restart,
            ..
        }
    ));
    assert_eq!(worker.state(), WorkerState::Exiting);
    assert!(worker.wait_for_exit(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_restart_not_exited() {
    let launcher = ScriptedLauncher::new(|request| {
        is_internal(request, "restart").then(|| {
            vec![
                Step::value(json!("success")),
                Step::Restart("{\"exited\":false}\n".into()),
            ]
        })
    });
    let mut worker = prepared(launcher, WorkerOptions::default()).await;
    worker.ensure_child().await.unwrap();

    let err = worker.restart().await.unwrap_err();
    assert!(matches!(err, CallError::ProtocolViolation(_)), "{err}");
    assert_eq!(worker.state(), WorkerState::Exiting);
}

#[tokio::test]
async fn test_restart_wrong_reply() {
    let launcher = ScriptedLauncher::new(|request| {
        is_internal(request, "restart").then(|| vec![Step::value(json!("oops"))])
    });
    let mut worker = prepared(launcher, WorkerOptions::default()).await;
    worker.ensure_child().await.unwrap();

    assert!(worker.restart().await.is_err());
    assert_eq!(worker.state(), WorkerState::Exiting);
}

#[tokio::test]
async fn test_restart_without_child() {
    let launcher = ScriptedLauncher::zygote();
    let stats = launcher.stats();
    let mut worker = Worker::new(launcher, WorkerOptions::default());

    assert!(worker.restart().await.unwrap());
    assert_eq!(worker.state(), WorkerState::Created);
    assert_eq!(stats.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_calls_never_launch() {
    let launcher = ScriptedLauncher::zygote();
    let stats = launcher.stats();
    let mut worker = Worker::new(launcher, WorkerOptions::default());

    // Not prepared for a course yet
    let err = worker.call(question("generate")).await.unwrap_err();
    assert!(matches!(err, CallError::InvalidCall(_)), "{err}");

    let err = worker
        .call(CallRequest::new(CallType::Ping, "server", "ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::InvalidCall(_)), "{err}");

    let err = worker
        .call(CallRequest::new(CallType::CoreElement, "server", "render"))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::InvalidCall(_)), "{err}");

    assert_eq!(worker.state(), WorkerState::Created);
    assert_eq!(stats.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_core_element_needs_no_course() {
    let (launcher, seen) = recording(|request| {
        (request.fcn == "render").then(|| vec![Step::value(json!("<div></div>"))])
    });
    let mut worker = Worker::new(launcher, WorkerOptions::default());

    let output = worker
        .call(
            CallRequest::new(CallType::CoreElement, "pl-checkbox", "render")
                .with_directory("pl-checkbox"),
        )
        .await
        .unwrap();
    assert_eq!(output.data, json!("<div></div>"));
    let requests = seen.lock();
    assert_eq!(
        requests[1].cwd.as_deref(),
        Some("/builtin/elements/pl-checkbox")
    );
}

#[tokio::test]
async fn test_launch_failure() {
    let mut worker = Worker::new(ScriptedLauncher::failing(), WorkerOptions::default());

    let err = worker.ensure_child().await.unwrap_err();
    assert!(matches!(err, CallError::ChildCrashed(_)), "{err}");
    assert_eq!(worker.state(), WorkerState::Exited);
    assert!(!worker.restart().await.unwrap());

    let err = worker.ensure_child().await.unwrap_err();
    assert!(matches!(err, CallError::InvalidState { .. }));
}

#[tokio::test]
async fn test_unexpected_ping_reply() {
    let launcher = ScriptedLauncher::new(|request| {
        is_internal(request, "ping").then(|| vec![Step::value(json!("ping?"))])
    });
    let mut worker = Worker::new(launcher, WorkerOptions::default());

    let err = worker.ensure_child().await.unwrap_err();
    assert!(matches!(err, CallError::ProtocolViolation(_)), "{err}");
    assert_eq!(worker.state(), WorkerState::Exiting);
}

#[tokio::test]
async fn test_child_exit_while_idle() {
    let launcher = ScriptedLauncher::new(|request| {
        (request.fcn == "generate").then(|| vec![Step::value(json!(1)), Step::Exit(0)])
    });
    let mut worker = prepared(launcher, WorkerOptions::default()).await;

    worker.call(question("generate")).await.unwrap();
    assert_eq!(worker.state(), WorkerState::Waiting);

    // The exit is noticed by the next operation
    assert!(!worker.restart().await.unwrap());
    assert_eq!(worker.state(), WorkerState::Exited);
}

#[tokio::test]
async fn test_done_is_idempotent() {
    let launcher = ScriptedLauncher::zygote();
    let stats = launcher.stats();
    let mut worker = Worker::new(launcher, WorkerOptions::default());
    worker.ensure_child().await.unwrap();

    worker.done().await;
    worker.done().await;
    assert_eq!(worker.state(), WorkerState::Exited);
    assert_eq!(stats.teardowns.load(Ordering::SeqCst), 1);
    assert!(!worker.is_poisoned());
}

#[tokio::test]
async fn test_combined_output_in_arrival_order() {
    let launcher = ScriptedLauncher::new(|request| {
        (request.fcn == "grade").then(|| {
            vec![
                Step::Stdout("one\n".into()),
                Step::Stderr("two\n".into()),
                Step::Stdout("three\n".into()),
                Step::value(json!({"score": 1.0})),
            ]
        })
    });
    let mut worker = prepared(launcher, WorkerOptions::default()).await;

    let output = worker.call(question("grade")).await.unwrap();
    assert_eq!(output.output, "one\ntwo\nthree\n");
    assert_eq!(output.data, json!({"score": 1.0}));

    let diagnostics = worker.diagnostics();
    assert_eq!(diagnostics.stdout, "one\nthree\n");
    assert_eq!(diagnostics.stderr, "two\n");
    assert!(diagnostics.last_call.is_none());
}

#[tokio::test]
async fn test_data_split_across_chunks() {
    let launcher = ScriptedLauncher::new(|request| {
        (request.fcn == "parse").then(|| {
            vec![
                Step::Data("{\"present\":tr".into()),
                Step::Data("ue,\"val\":42}".into()),
                Step::Data("\n".into()),
            ]
        })
    });
    let mut worker = prepared(launcher, WorkerOptions::default()).await;

    let output = worker.call(question("parse")).await.unwrap();
    assert_eq!(output.data, json!(42));
}

#[tokio::test]
async fn test_forbidden_modules_forwarded() {
    let (launcher, seen) = recording(|_| None);
    let mut worker = Worker::new(launcher, WorkerOptions::default());
    worker
        .prepare_for_course(
            PrepareForCourse::new("/course").with_forbidden_modules(vec!["os".into()]),
        )
        .await
        .unwrap();

    let _ = worker.call(question("generate")).await;
    let requests = seen.lock();
    let call = requests.last().unwrap();
    assert_eq!(call.forbidden_modules, vec!["os".to_string()]);
    assert_eq!(worker.course_path(), Some(std::path::Path::new("/course")));
}

#[tokio::test]
async fn test_state_invariants_hold_across_lifecycle() {
    let mut worker = prepared(ScriptedLauncher::zygote(), WorkerOptions::default()).await;
    assert!(worker.check_state(None));
    worker.ensure_child().await.unwrap();
    assert!(worker.check_state(None));
    let _ = worker.call(question("generate")).await;
    assert!(worker.check_state(None));
    worker.restart().await.unwrap();
    assert!(worker.check_state(None));
    worker.done().await;
    assert!(worker.check_state(None));
    assert!(!worker.is_poisoned());
}

#[tokio::test]
async fn test_inconsistent_state_poisons_worker() {
    let mut worker = prepared(ScriptedLauncher::zygote(), WorkerOptions::default()).await;
    worker.ensure_child().await.unwrap();

    // A deadline while WAITING breaks the invariant
    worker.deadline = Some(Instant::now());
    assert!(!worker.check_state(None));
    assert!(worker.is_poisoned());
    assert!(!worker.restart().await.unwrap());
}

/// `first` answers, then writes a second data line after a short delay
fn late_writer() -> ScriptedLauncher {
    ScriptedLauncher::new(|request| match request.fcn.as_str() {
        "first" => Some(vec![
            Step::value(json!("first")),
            Step::Sleep(Duration::from_millis(30)),
            Step::value(json!("stale")),
        ]),
        "second" => Some(vec![
            Step::Sleep(Duration::from_millis(100)),
            Step::value(json!("second")),
        ]),
        _ => None,
    })
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_data_between_calls_is_fatal() {
    let mut worker = prepared(late_writer(), WorkerOptions::default()).await;

    let output = worker.call(question("first")).await.unwrap();
    assert_eq!(output.data, json!("first"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    match worker.call(question("second")).await {
        Err(CallError::ProtocolViolation(message)) => {
            assert!(message.contains("stale"), "{message}")
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(worker.state(), WorkerState::Exiting);
    assert!(!worker.restart().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_late_data_line_blocks_reuse() {
    let mut worker = prepared(late_writer(), WorkerOptions::default()).await;

    worker.call(question("first")).await.unwrap();
    // The late line lands inside the next call and is indistinguishable from
    // its reply; the genuine reply then arrives unrequested during restart
    let _ = worker.call(question("second")).await;

    let err = worker.restart().await.unwrap_err();
    assert!(matches!(err, CallError::ProtocolViolation(_)), "{err}");
    assert_eq!(worker.state(), WorkerState::Exiting);
}

#[tokio::test]
async fn test_trailing_data_after_result_is_fatal() {
    let launcher = ScriptedLauncher::new(|request| {
        (request.fcn == "twice").then(|| {
            vec![Step::Data(
                "{\"present\":true,\"val\":1}\n{\"present\":true,\"val\":2}\n".into(),
            )]
        })
    });
    let mut worker = prepared(launcher, WorkerOptions::default()).await;

    let err = worker.call(question("twice")).await.unwrap_err();
    assert!(matches!(err, CallError::ProtocolViolation(_)), "{err}");
    assert_eq!(worker.state(), WorkerState::Exiting);
    assert!(!worker.restart().await.unwrap());
}

#[tokio::test]
async fn test_data_while_restarting_is_fatal() {
    let launcher = ScriptedLauncher::new(|request| {
        is_internal(request, "restart")
            .then(|| vec![Step::value(json!("success")), Step::value(json!("extra"))])
    });
    let mut worker = prepared(launcher, WorkerOptions::default()).await;
    worker.ensure_child().await.unwrap();

    let err = worker.restart().await.unwrap_err();
    assert!(matches!(err, CallError::ProtocolViolation(_)), "{err}");
    assert_eq!(worker.state(), WorkerState::Exiting);
}
