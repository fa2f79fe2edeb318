#![cfg(unix)]

use geotrace_trace::{
    run_batch, run_streaming, run_traceroute, Dialect, RunnerEvent, TraceCommand, TraceError,
    TraceSettings,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn script(body: &str) -> TraceSettings {
    TraceSettings {
        dialect: Dialect::Unix,
        run_timeout: Duration::from_secs(10),
        command: Some(TraceCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), body.to_string()],
        }),
        ..TraceSettings::default()
    }
}

async fn collect_streaming(settings: &TraceSettings, cancel: CancellationToken) -> Vec<RunnerEvent> {
    let (tx, mut rx) = mpsc::channel(64);
    run_streaming("8.8.8.8", settings, tx, cancel).await;
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn hop_numbers(events: &[RunnerEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|event| match event {
            RunnerEvent::Hop(fact) => Some(fact.hop_number),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn streaming_reports_hops_then_exit() {
    let settings = script(
        "printf 'traceroute to %s\\n 1  192.168.1.1  2 ms\\n 2  8.8.8.8  25 ms\\n 3  1.1.1.1  10 ms\\n' \"$0\"",
    );
    let events = collect_streaming(&settings, CancellationToken::new()).await;

    assert_eq!(hop_numbers(&events), vec![2, 3]);
    assert!(matches!(
        events.last(),
        Some(RunnerEvent::Exited {
            exit_code: 0,
            hop_count: 2
        })
    ));
}

#[tokio::test]
async fn streaming_keeps_hops_before_abnormal_exit() {
    let settings = script("printf ' 1  8.8.8.8  25 ms\\n 2  1.1.1.1  10 ms\\n'; echo 'boom' >&2; exit 3");
    let events = collect_streaming(&settings, CancellationToken::new()).await;

    assert_eq!(hop_numbers(&events), vec![1, 2]);
    match events.last() {
        Some(RunnerEvent::Failed(TraceError::AbnormalExit { code, stderr })) => {
            assert_eq!(*code, Some(3));
            assert_eq!(stderr, "boom");
        }
        other => panic!("unexpected terminal event: {other:?}"),
    }
    assert_eq!(events.iter().filter(|event| event.is_terminal()).count(), 1);
}

#[tokio::test]
async fn stderr_lines_become_diagnostics() {
    let settings = script("echo 'warning: multiple interfaces' >&2; printf ' 1  8.8.8.8  5 ms\\n'");
    let events = collect_streaming(&settings, CancellationToken::new()).await;

    let diagnostics: Vec<&str> = events
        .iter()
        .filter_map(|event| match event {
            RunnerEvent::Diagnostic(text) => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(diagnostics, vec!["warning: multiple interfaces"]);
    assert!(matches!(events.last(), Some(RunnerEvent::Exited { .. })));
}

#[tokio::test]
async fn trailing_fragment_is_flushed() {
    let settings = script("printf ' 1  8.8.8.8  5 ms\\n 2  1.1.1.1  7 ms'");
    let events = collect_streaming(&settings, CancellationToken::new()).await;
    assert_eq!(hop_numbers(&events), vec![1, 2]);
}

#[tokio::test]
async fn missing_executable_is_a_spawn_error() {
    let settings = TraceSettings {
        command: Some(TraceCommand {
            program: "/nonexistent/geotrace-traceroute".to_string(),
            args: Vec::new(),
        }),
        ..TraceSettings::default()
    };
    let events = collect_streaming(&settings, CancellationToken::new()).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], RunnerEvent::Failed(TraceError::Spawn { .. })));
}

#[tokio::test]
async fn slow_process_times_out() {
    let mut settings = script("sleep 5");
    settings.run_timeout = Duration::from_millis(200);
    let events = collect_streaming(&settings, CancellationToken::new()).await;
    assert!(matches!(events.last(), Some(RunnerEvent::Failed(TraceError::TimedOut(_)))));
}

#[tokio::test]
async fn lingering_stderr_does_not_hold_the_exit() {
    let mut settings = script("sleep 3 >/dev/null & printf ' 1  8.8.8.8  1 ms\\n'");
    settings.run_timeout = Duration::from_secs(5);
    let started = std::time::Instant::now();
    let events = collect_streaming(&settings, CancellationToken::new()).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(
        events.last(),
        Some(RunnerEvent::Exited {
            exit_code: 0,
            hop_count: 1
        })
    ));
}

#[tokio::test]
async fn lingering_stderr_is_bounded_by_run_timeout() {
    let mut settings = script("sleep 3 >/dev/null & printf ' 1  8.8.8.8  1 ms\\n'");
    settings.run_timeout = Duration::from_millis(300);
    let started = std::time::Instant::now();
    let events = collect_streaming(&settings, CancellationToken::new()).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(hop_numbers(&events), vec![1]);
    assert!(events.last().is_some_and(RunnerEvent::is_terminal));
}

#[tokio::test]
async fn cancellation_sends_no_terminal_event() {
    let settings = script("printf ' 1  8.8.8.8  5 ms\\n'; sleep 5");
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let events = collect_streaming(&settings, cancel).await;
    assert!(events.iter().all(|event| !event.is_terminal()));
}

#[tokio::test]
async fn batch_discards_partial_output_on_failure() {
    let settings = script("printf ' 1  8.8.8.8  25 ms\\n 2  1.1.1.1  10 ms\\n'; exit 1");
    let (tx, mut rx) = mpsc::channel(64);
    run_batch("8.8.8.8", &settings, tx).await;

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        RunnerEvent::Failed(TraceError::AbnormalExit { code: Some(1), .. })
    ));
}

#[tokio::test]
async fn batch_reports_all_hops_then_exit() {
    let settings = script("printf ' 1  8.8.8.8  25 ms\\n 2  1.1.1.1  10 ms\\n'");
    let (tx, mut rx) = mpsc::channel(64);
    run_batch("8.8.8.8", &settings, tx).await;

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(hop_numbers(&events), vec![1, 2]);
    assert!(matches!(
        events.last(),
        Some(RunnerEvent::Exited { hop_count: 2, .. })
    ));
}

#[tokio::test]
async fn injected_target_never_reaches_a_process() {
    let marker = std::env::temp_dir().join(format!("geotrace-spawned-{}", std::process::id()));
    let settings = script(&format!("touch '{}'", marker.display()));

    let err = run_traceroute("; rm -rf /", &settings).await.unwrap_err();
    assert!(matches!(err, TraceError::Validation(_)));

    let events = collect_streaming_for("; rm -rf /", &settings).await;
    assert!(matches!(events.as_slice(), [RunnerEvent::Failed(TraceError::Validation(_))]));
    assert!(!marker.exists());
}

async fn collect_streaming_for(target: &str, settings: &TraceSettings) -> Vec<RunnerEvent> {
    let (tx, mut rx) = mpsc::channel(64);
    run_streaming(target, settings, tx, CancellationToken::new()).await;
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}
