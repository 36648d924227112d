//! End-to-end tests of the inference service against a mock backend

mod common;

use common::*;
use spindle_core::prelude::*;
use spindle_core::{status_code, stream::END_OF_TEXT};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::time::{Duration, Instant};

fn service(n_ctx: usize, config: ServiceConfig) -> InferenceService<MockContext> {
    InferenceService::from_context(MockContext::new(n_ctx), config).unwrap()
}

fn texts(events: &[StreamEvent]) -> Vec<String> {
    events.iter().filter_map(|e| e.text().map(str::to_string)).collect()
}

#[test]
fn test_greedy_run_streams_budgeted_tokens() {
    let service = service(2048, config(3, false));
    let (sink, rx) = channel_sink();

    let handle = service.spawn("The quick brown fox", sink).unwrap().unwrap();
    let summary = handle.join().unwrap();

    assert_eq!(summary.prompt_tokens, 5);
    assert_eq!(summary.tokens_generated, 3);
    assert_eq!(summary.finish_reason, FinishReason::MaxTokens);

    let events: Vec<StreamEvent> = rx.try_iter().collect();
    assert_eq!(texts(&events), vec![" t25", " t26", " t27"]);
}

#[test]
fn test_echo_streams_prompt_before_generation() {
    let service = service(2048, config(3, true));
    let (sink, rx) = channel_sink();

    let summary = service
        .spawn("The quick brown fox", sink)
        .unwrap()
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(summary.tokens_emitted, 8);

    let events: Vec<StreamEvent> = rx.try_iter().collect();
    assert_eq!(
        texts(&events),
        vec!["", " t33", " t35", " t35", " t33", " t25", " t26", " t27"]
    );
}

#[test]
fn test_prompt_too_long_releases_context() {
    let context = MockContext::new(8);
    let log = context.log();
    let service = InferenceService::from_context(context, config(3, true)).unwrap();

    let (sink, rx) = channel_sink();
    let err = service
        .spawn("one two three four five", sink)
        .unwrap()
        .unwrap()
        .join()
        .unwrap_err();
    assert_eq!(err.code(), "RUN_PROMPT_TOO_LONG");
    assert!(matches!(
        err,
        CoreError::Run(RunError::PromptTooLong {
            n_tokens: 6,
            max_tokens: 4
        })
    ));

    let events: Vec<StreamEvent> = rx.try_iter().collect();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], StreamEvent::Failed(RunError::PromptTooLong { .. })));
    assert!(log.lock().evals.is_empty());

    // The next request is served normally.
    let (sink, rx) = channel_sink();
    let summary = service.spawn("hi", sink).unwrap().unwrap().join().unwrap();
    assert_eq!(summary.tokens_generated, 3);
    assert_eq!(rx.try_iter().count(), 2 + 3);
}

#[test]
fn test_prompt_filling_whole_context_is_rejected() {
    let service = service(8, config(3, false));

    let (sink, rx) = channel_sink();
    let handle = service.spawn("a b c d e f g", sink).unwrap().unwrap();
    let err = handle.join().unwrap_err();
    assert!(matches!(
        err,
        CoreError::Run(RunError::PromptTooLong {
            n_tokens: 8,
            max_tokens: 4
        })
    ));
    assert!(rx.try_iter().all(|event| event.text().is_none()));

    let (sink, _rx) = channel_sink();
    assert!(service.start("short", sink));
    service.shutdown();
}

#[test]
fn test_second_start_is_rejected_while_busy() {
    let (context, gate) = MockContext::new(2048).gated();
    let service = InferenceService::from_context(context, config(3, false)).unwrap();

    let (sink, rx) = channel_sink();
    let handle = service.spawn("hello world", sink).unwrap().unwrap();
    assert!(service.is_busy());

    let (other_sink, other_rx) = channel_sink();
    assert!(!service.start("rejected", other_sink));

    gate.send(()).unwrap();
    handle.join().unwrap();
    assert_eq!(rx.try_iter().count(), 3);
    assert_eq!(other_rx.try_iter().count(), 0);

    // Free again once the run finished.
    let (sink, _rx) = channel_sink();
    assert!(service.start("again", sink));
    service.shutdown();
}

#[test]
fn test_concurrent_starts_accept_exactly_one() {
    let (context, gate) = MockContext::new(2048).gated();
    let service = Arc::new(InferenceService::from_context(context, config(2, false)).unwrap());
    let barrier = Arc::new(Barrier::new(8));

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let (sink, _rx) = channel_sink();
                barrier.wait();
                service.start("race", sink)
            })
        })
        .collect();

    let accepted = callers
        .into_iter()
        .map(|caller| caller.join().unwrap())
        .filter(|accepted| *accepted)
        .count();
    assert_eq!(accepted, 1);

    drop(gate);
    let service = match Arc::try_unwrap(service) {
        Ok(service) => service,
        Err(_) => panic!("service still shared"),
    };
    let context = service.shutdown();
    assert_eq!(context.log().lock().evals.len(), 2);
}

#[test]
fn test_end_of_sequence_sends_sentinel() {
    let mut context = MockContext::new(2048);
    context.eos_at = Some(7);
    let service = InferenceService::from_context(context, config(50, false)).unwrap();

    let (sink, rx) = channel_sink();
    let summary = service.spawn("The quick brown fox", sink).unwrap().unwrap().join().unwrap();
    assert_eq!(summary.finish_reason, FinishReason::EndOfSequence);

    let events: Vec<StreamEvent> = rx.try_iter().collect();
    assert_eq!(texts(&events), vec![" t25", " t26", "", END_OF_TEXT]);
    assert_eq!(events.last(), Some(&StreamEvent::EndOfText));
}

#[test]
fn test_eval_failure_is_reported_and_releases_context() {
    let mut context = MockContext::new(2048);
    context.fail_at = Some(6);
    let service = InferenceService::from_context(context, config(10, false)).unwrap();

    let (sink, rx) = channel_sink();
    let err = service.spawn("The quick brown fox", sink).unwrap().unwrap().join().unwrap_err();
    assert_eq!(err.code(), "RUN_EVAL_FAILED");

    let events: Vec<StreamEvent> = rx.try_iter().collect();
    assert_eq!(events.len(), 3);
    assert_eq!(texts(&events), vec![" t25", " t26"]);
    match &events[2] {
        StreamEvent::Failed(RunError::EvalFailed { n_past, n_eval, .. }) => {
            assert_eq!(*n_past, 6);
            assert_eq!(*n_eval, 1);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    assert!(!service.is_busy());
    service.swap_adapter("adapter.bin").unwrap();
}

#[test]
fn test_swap_adapter_waits_for_run() {
    let (context, gate) = MockContext::new(2048).gated();
    let log = context.log();
    let service = Arc::new(InferenceService::from_context(context, config(3, false)).unwrap());

    let (sink, _rx) = channel_sink();
    let handle = service.spawn("The quick brown fox", sink).unwrap().unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    let swapper = {
        let service = Arc::clone(&service);
        std::thread::spawn(move || {
            service.swap_adapter("style.bin").unwrap();
            done_tx.send(()).unwrap();
        })
    };

    assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert!(log.lock().adapters.is_empty());

    gate.send(()).unwrap();
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    swapper.join().unwrap();
    handle.join().unwrap();

    let log = log.lock();
    assert_eq!(log.evals, vec![(0, 5), (5, 1), (6, 1)]);
    assert_eq!(log.adapters, vec![std::path::PathBuf::from("style.bin")]);
}

#[test]
fn test_swap_adapter_failure() {
    let service = service(2048, config(3, false));
    let result = service.swap_adapter("style.txt");
    assert_eq!(status_code(&result), 1);
    assert_eq!(result.unwrap_err().code(), "ADAPTER_INVALID");
    assert!(!service.is_busy());
}

#[test]
fn test_initialize_reports_status() {
    let loader = MockLoader { n_ctx: 512 };

    let failed = InferenceService::initialize(&loader, ServiceConfig::for_model("missing.bin"));
    assert_eq!(status_code(&failed), 1);
    assert!(matches!(failed, Err(CoreError::Load { .. })));

    let mut config = config(3, false);
    config.model = ModelParams::new("model.bin").with_lora("lora.bin");
    assert!(!config.model.effective_use_mmap());
    let loaded = InferenceService::initialize(&loader, config);
    assert_eq!(status_code(&loaded), 0);

    let context = loaded.unwrap().shutdown();
    assert_eq!(context.log().lock().adapters, vec![std::path::PathBuf::from("lora.bin")]);
}

#[test]
fn test_per_request_parameters() {
    let service = service(2048, config(3, false));

    let (sink, rx) = channel_sink();
    let summary = service.spawn_with("hello", greedy(1), sink).unwrap().unwrap().join().unwrap();
    assert_eq!(summary.tokens_generated, 1);
    assert_eq!(rx.try_iter().count(), 1);

    let invalid = SamplingParams {
        batch_size: 0,
        ..greedy(1)
    };
    let (sink, _rx) = channel_sink();
    let err = service.spawn_with("hello", invalid, sink).unwrap_err();
    assert_eq!(err.code(), "CONFIG_INVALID_SAMPLING");
    assert!(!service.is_busy());
}

#[test]
fn test_sink_runs_on_delivery_thread() {
    let service = service(2048, config(2, false));
    let (tx, rx) = mpsc::channel();
    let sink = move |_event: StreamEvent| {
        let name = std::thread::current().name().map(str::to_string);
        let _ = tx.send(name);
    };

    service.spawn("hi", sink).unwrap().unwrap().join().unwrap();
    let names: Vec<Option<String>> = rx.try_iter().collect();
    assert_eq!(names.len(), 2);
    assert!(names.iter().all(|name| name.as_deref() == Some("spindle-delivery")));
}

#[test]
fn test_shutdown_waits_for_in_flight_run() {
    let (context, gate) = MockContext::new(2048).gated();
    let service = InferenceService::from_context(context, config(3, false)).unwrap();

    let (sink, rx) = channel_sink();
    assert!(service.start("hello world", sink));

    let opener = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        gate.send(()).unwrap();
    });

    let context = service.shutdown();
    opener.join().unwrap();

    assert_eq!(context.log().lock().evals.len(), 3);
    assert_eq!(rx.try_iter().count(), 3);
}

#[test]
fn test_polling_is_busy_never_rejects_idle_start() {
    let service = Arc::new(service(2048, config(1, false)));
    let stop = Arc::new(AtomicBool::new(false));

    let poller = {
        let service = Arc::clone(&service);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut polls = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let _ = service.is_busy();
                polls += 1;
            }
            polls
        })
    };

    let mut rejected = 0;
    for _ in 0..500 {
        let (sink, _rx) = channel_sink();
        match service.spawn("hi", sink).unwrap() {
            Some(handle) => {
                handle.join().unwrap();
            }
            None => rejected += 1,
        }
    }

    stop.store(true, Ordering::Relaxed);
    assert!(poller.join().unwrap() > 0);
    assert_eq!(rejected, 0);
    assert!(!service.is_busy());
}

#[test]
fn test_shutdown_waits_for_every_delivery() {
    let service = service(2048, config(3, false));
    let delivered = Arc::new(AtomicUsize::new(0));

    let slow_sink = {
        let delivered = Arc::clone(&delivered);
        move |_event: StreamEvent| {
            std::thread::sleep(Duration::from_millis(50));
            delivered.fetch_add(1, Ordering::SeqCst);
        }
    };
    assert!(service.start("hello world", slow_sink));

    // The context frees up before the slow sink has seen every event.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let (sink, _rx) = channel_sink();
        if service.start("next", sink) {
            break;
        }
        assert!(Instant::now() < deadline, "second run never accepted");
        std::thread::sleep(Duration::from_millis(1));
    }

    service.shutdown();
    assert_eq!(delivered.load(Ordering::SeqCst), 3);
}

#[test]
fn test_tokenizer_failure_is_reported() {
    let service = service(2048, config(3, true));

    let (sink, rx) = channel_sink();
    let err = service.spawn("hello <unk>", sink).unwrap().unwrap().join().unwrap_err();
    assert_eq!(err.code(), "RUN_TOKENIZE_FAILED");

    let events: Vec<StreamEvent> = rx.try_iter().collect();
    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Failed(RunError::Tokenize { message }) => {
            assert!(message.contains("TOKENIZER_UNKNOWN_PIECE"));
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(!service.is_busy());
    assert_eq!(service.active_runs(), 0);
}
