//! Concurrent capture scopes through the stream substitution manager.

use std::io::Write;
use std::sync::{mpsc, Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use kernel_streams::{
    BufferOutput, CaptureCallback, CaptureConfig, NoInput, OutputConfig,
    StreamSubstitutionManager, SubstitutionMode,
};

fn quiet_config() -> OutputConfig {
    OutputConfig::new(CaptureConfig {
        buffer_time_limit: Duration::from_secs(3600),
        ..CaptureConfig::default()
    })
}

fn test_manager(mode: SubstitutionMode) -> (StreamSubstitutionManager, Arc<BufferOutput>) {
    let real_stdout = Arc::new(BufferOutput::new("real stdout"));
    let manager = StreamSubstitutionManager::with_defaults(
        mode,
        quiet_config(),
        real_stdout.clone(),
        Arc::new(BufferOutput::new("real stderr")),
        Arc::new(NoInput),
    );
    (manager, real_stdout)
}

fn collector() -> (CaptureCallback, Arc<Mutex<String>>) {
    let text = Arc::new(Mutex::new(String::new()));
    let sink = text.clone();
    let callback: CaptureCallback = Arc::new(move |chunk: &str| {
        sink.lock().unwrap().push_str(chunk);
    });
    (callback, text)
}

#[test]
fn test_overlapping_scopes_end_out_of_order() {
    let (manager, _) = test_manager(SubstitutionMode::NonBlocking);
    let config = manager.output_config().clone();
    let (a_out, _) = collector();
    let (b_out, _) = collector();
    let (err, _) = collector();

    let a = manager.enter_capture(&config, a_out, err.clone()).unwrap();
    let b = manager.enter_capture(&config, b_out, err).unwrap();
    let b_stream = b.stdout().clone();

    drop(a);
    // From a thread with no scope of its own, only the slot is visible.
    let handle = manager.stdout();
    let sees_b = thread::spawn(move || {
        Arc::as_ptr(&handle.target()) as *const () == Arc::as_ptr(&b_stream) as *const ()
    })
    .join()
    .unwrap();
    assert!(sees_b);

    drop(b);
    assert_eq!(manager.stdout().to_string(), "real stdout");
}

#[test]
fn test_concurrent_executions_capture_their_own_output() {
    let (manager, real_stdout) = test_manager(SubstitutionMode::NonBlocking);
    let barrier = Arc::new(Barrier::new(2));

    let workers: Vec<_> = ["first", "second"]
        .into_iter()
        .map(|name| {
            let manager = manager.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let (on_stdout, captured) = collector();
                let (on_stderr, _) = collector();
                let config = manager.output_config().clone();
                let mut out = manager.stdout();
                manager
                    .capture_output(&config, on_stdout, on_stderr, || {
                        barrier.wait();
                        writeln!(out, "{name}").unwrap();
                        barrier.wait();
                    })
                    .unwrap();
                let text = captured.lock().unwrap().clone();
                text
            })
        })
        .collect();

    let captured: Vec<String> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(captured, vec!["first\n", "second\n"]);

    let everything = real_stdout.text();
    assert!(everything.contains("first\n"));
    assert!(everything.contains("second\n"));
}

#[test]
fn test_blocking_scopes_run_one_at_a_time() {
    let (manager, _) = test_manager(SubstitutionMode::Blocking);
    let config = manager.output_config().clone();
    let (out_a, captured_a) = collector();
    let (err_a, _) = collector();

    let scope = manager.enter_capture(&config, out_a, err_a).unwrap();

    let (entered_tx, entered_rx) = mpsc::channel();
    let waiter = {
        let manager = manager.clone();
        let config = config.clone();
        thread::spawn(move || {
            let (out_b, captured_b) = collector();
            let (err_b, _) = collector();
            let mut out = manager.stdout();
            manager
                .capture_output(&config, out_b, err_b, || {
                    entered_tx.send(()).unwrap();
                    write!(out, "b").unwrap();
                })
                .unwrap();
            let text = captured_b.lock().unwrap().clone();
            text
        })
    };

    // The second execution cannot start while the first holds the streams.
    assert!(entered_rx.recv_timeout(Duration::from_millis(100)).is_err());
    write!(manager.stdout(), "a").unwrap();
    drop(scope);

    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(waiter.join().unwrap(), "b");
    assert_eq!(*captured_a.lock().unwrap(), "a");
    assert_eq!(manager.stdout().to_string(), "real stdout");
}

#[test]
fn test_timer_emits_partial_line_during_execution() {
    let real_stdout = Arc::new(BufferOutput::new("real stdout"));
    let config = OutputConfig::new(CaptureConfig {
        buffer_time_limit: Duration::from_millis(20),
        ..CaptureConfig::default()
    });
    let manager = StreamSubstitutionManager::with_defaults(
        SubstitutionMode::NonBlocking,
        config.clone(),
        real_stdout,
        Arc::new(BufferOutput::new("real stderr")),
        Arc::new(NoInput),
    );
    let (on_stdout, captured) = collector();
    let (on_stderr, _) = collector();
    let mut out = manager.stdout();

    manager
        .capture_output(&config, on_stdout, on_stderr, || {
            write!(out, "progress...").unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            while captured.lock().unwrap().is_empty() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            assert_eq!(*captured.lock().unwrap(), "progress...");
        })
        .unwrap();
}
