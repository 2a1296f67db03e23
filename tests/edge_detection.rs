use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, unbounded};
use gpio_edge::{
    Cleanup, Clock, DetectorConfig, EdgeDetect, EdgeDetector, EventError, MockClock, MockDriver,
    MockStep, ResultCode, WaitOutcome,
};

const SETTLE: Duration = Duration::from_secs(2);

fn detector() -> (EdgeDetector<MockDriver>, Arc<MockClock>) {
    let clock = Arc::new(MockClock::new(1_000));
    let detector = EdgeDetector::with_clock(
        MockDriver::default(),
        &DetectorConfig::default(),
        clock.clone(),
    );
    (detector, clock)
}

/// Registers a callback on `pin` that reports the clock at each accepted edge.
fn record_edges(
    detector: &EdgeDetector<MockDriver>,
    clock: &Arc<MockClock>,
    pin: u32,
) -> Receiver<u64> {
    let (tx, rx) = unbounded();
    let clock = clock.clone();
    detector
        .register_callback(
            pin,
            Arc::new(move |_pin: u32| {
                let _ = tx.send(clock.now_us());
            }),
        )
        .unwrap();
    rx
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + SETTLE;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn both_edges_are_debounced_on_the_poll_thread() {
    let (detector, clock) = detector();
    let driver = detector.driver();
    let edges = record_edges(&detector, &clock, 17);

    clock.set_ms(0);
    detector
        .add_edge_detection(17, EdgeDetect::Both, Some(200))
        .unwrap();
    assert!(detector.is_thread_running());
    assert!(driver.wait_reads(17, 1, SETTLE), "initial level not consumed");
    assert!(edges.try_recv().is_err());

    clock.set_ms(50);
    assert!(driver.set_level(17, 1).unwrap());
    assert_eq!(edges.recv_timeout(SETTLE).unwrap(), 50_000);
    assert!(detector.poll_event_occurred(17).unwrap());
    assert!(!detector.poll_event_occurred(17).unwrap());

    clock.set_ms(120);
    assert!(driver.set_level(17, 0).unwrap());
    assert!(driver.wait_reads(17, 3, SETTLE));

    clock.set_ms(400);
    assert!(driver.set_level(17, 1).unwrap());
    assert_eq!(edges.recv_timeout(SETTLE).unwrap(), 400_000);
    assert!(edges.try_recv().is_err());
}

#[test]
fn unset_bounce_accepts_every_edge() {
    let (detector, clock) = detector();
    let driver = detector.driver();
    let edges = record_edges(&detector, &clock, 5);

    detector
        .add_edge_detection(5, EdgeDetect::Rising, None)
        .unwrap();
    assert!(driver.wait_reads(5, 1, SETTLE));

    for _ in 0..3 {
        assert!(driver.set_level(5, 1).unwrap());
        assert!(edges.recv_timeout(SETTLE).is_ok());
        assert!(!driver.set_level(5, 0).unwrap());
    }
}

#[test]
fn callbacks_run_in_registration_order() {
    let (detector, _clock) = detector();
    let driver = detector.driver();
    let (tx, rx) = unbounded();
    for tag in 0..3 {
        let tx = tx.clone();
        detector
            .register_callback(
                12,
                Arc::new(move |pin: u32| {
                    let _ = tx.send((tag, pin));
                }),
            )
            .unwrap();
    }

    detector
        .add_edge_detection(12, EdgeDetect::Falling, None)
        .unwrap();
    assert!(driver.wait_reads(12, 1, SETTLE));
    driver.set_level(12, 1).unwrap();
    assert!(driver.set_level(12, 0).unwrap());

    let seen: Vec<_> = (0..3).map(|_| rx.recv_timeout(SETTLE).unwrap()).collect();
    assert_eq!(seen, vec![(0, 12), (1, 12), (2, 12)]);
}

#[test]
fn unregistered_callbacks_stop_but_flag_still_set() {
    let (detector, clock) = detector();
    let driver = detector.driver();
    let edges = record_edges(&detector, &clock, 6);
    detector.unregister_callbacks(6);

    detector
        .add_edge_detection(6, EdgeDetect::Both, None)
        .unwrap();
    assert!(driver.wait_reads(6, 1, SETTLE));
    driver.set_level(6, 1).unwrap();

    assert!(wait_until(|| detector.poll_event_occurred(6).unwrap()));
    assert!(edges.try_recv().is_err());
}

#[test]
fn wait_for_edge_times_out_without_transitions() {
    let (detector, _clock) = detector();

    let start = Instant::now();
    let outcome = detector
        .wait_for_edge(4, EdgeDetect::Rising, Some(0), Some(Duration::from_millis(100)))
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert!(elapsed >= Duration::from_millis(100), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");
    assert!(!detector.is_thread_running());
}

#[test]
fn wait_for_edge_reports_transition() {
    let (detector, _clock) = detector();
    let driver = detector.driver();

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            detector.wait_for_edge(22, EdgeDetect::Rising, None, Some(Duration::from_secs(5)))
        });

        assert!(driver.wait_reads(22, 1, SETTLE), "waiter never registered");
        assert!(driver.set_level(22, 1).unwrap());
        assert_eq!(waiter.join().unwrap().unwrap(), WaitOutcome::EdgeDetected);
    });

    // the pin stays registered and a second wait sees the next edge
    assert_eq!(detector.registered_pins(), vec![22]);
    thread::scope(|s| {
        let waiter = s.spawn(|| {
            detector.wait_for_edge(22, EdgeDetect::Rising, None, Some(Duration::from_secs(5)))
        });
        assert!(driver.wait_reads(22, 3, SETTLE));
        driver.set_level(22, 0).unwrap();
        assert!(driver.set_level(22, 1).unwrap());
        assert_eq!(waiter.join().unwrap().unwrap(), WaitOutcome::EdgeDetected);
    });
}

#[test]
fn wait_for_edge_accepts_unbounded_timeout() {
    let (detector, _clock) = detector();
    let driver = detector.driver();

    thread::scope(|s| {
        let waiter =
            s.spawn(|| detector.wait_for_edge(4, EdgeDetect::Rising, None, Some(Duration::MAX)));

        assert!(driver.wait_reads(4, 1, SETTLE), "waiter never registered");
        assert!(driver.set_level(4, 1).unwrap());
        assert_eq!(waiter.join().unwrap().unwrap(), WaitOutcome::EdgeDetected);
    });
}

#[test]
fn wait_for_edge_read_failure_is_io_error() {
    let (detector, _clock) = detector();
    detector.driver().fail(21, MockStep::Read);

    let err = detector
        .wait_for_edge(21, EdgeDetect::Rising, None, Some(Duration::from_secs(1)))
        .unwrap_err();
    assert!(matches!(err, EventError::Io(_)));
    assert_eq!(err.code(), ResultCode::Error);
    assert!(!detector.is_thread_running());

    detector.cleanup(Cleanup::All);
    assert_eq!(detector.driver().open_handles(), 0);
}

#[test]
fn wait_for_edge_switches_edge_mode() {
    let (detector, _clock) = detector();
    let short = Some(Duration::from_millis(10));

    detector
        .wait_for_edge(9, EdgeDetect::Rising, None, short)
        .unwrap();
    assert_eq!(detector.driver().edge(9), EdgeDetect::Rising);

    detector
        .wait_for_edge(9, EdgeDetect::Falling, None, short)
        .unwrap();
    assert_eq!(detector.driver().edge(9), EdgeDetect::Falling);
    assert_eq!(detector.driver().open_handles(), 1);
}

#[test]
fn wait_for_edge_rejects_pin_with_callbacks() {
    let (detector, clock) = detector();
    let _edges = record_edges(&detector, &clock, 7);
    detector
        .add_edge_detection(7, EdgeDetect::Both, None)
        .unwrap();

    let start = Instant::now();
    let err = detector
        .wait_for_edge(7, EdgeDetect::Both, None, None)
        .unwrap_err();
    assert!(matches!(err, EventError::AlreadyRegistered(_)));
    assert_eq!(err.code(), ResultCode::AlreadyRegistered);
    assert!(start.elapsed() < Duration::from_secs(1));

    // callbacks alone are enough, and nothing gets created
    let _other = record_edges(&detector, &clock, 8);
    assert!(matches!(
        detector.wait_for_edge(8, EdgeDetect::Rising, None, None),
        Err(EventError::AlreadyRegistered(_))
    ));
    assert_eq!(detector.registered_pins(), vec![7]);
    assert_eq!(detector.driver().edge(7), EdgeDetect::Both);
    assert!(!detector.driver().is_exported(8));
}

#[test]
fn wait_for_edge_rejects_different_bounce() {
    let (detector, _clock) = detector();
    let short = Some(Duration::from_millis(10));

    assert_eq!(
        detector
            .wait_for_edge(3, EdgeDetect::Both, Some(100), short)
            .unwrap(),
        WaitOutcome::TimedOut
    );
    let err = detector
        .wait_for_edge(3, EdgeDetect::Both, Some(50), short)
        .unwrap_err();
    assert!(matches!(err, EventError::EdgeConflict(_)));
    assert_eq!(err.code(), ResultCode::AlreadyRegistered);

    assert_eq!(
        detector
            .wait_for_edge(3, EdgeDetect::Both, Some(100), short)
            .unwrap(),
        WaitOutcome::TimedOut
    );
}

#[test]
fn add_edge_detection_conflicts() {
    let (detector, _clock) = detector();
    detector
        .add_edge_detection(3, EdgeDetect::Rising, None)
        .unwrap();

    let again = detector
        .add_edge_detection(3, EdgeDetect::Rising, None)
        .unwrap_err();
    assert_eq!(again.code(), ResultCode::AlreadyAdded);

    let other_edge = detector
        .add_edge_detection(3, EdgeDetect::Falling, None)
        .unwrap_err();
    assert_eq!(other_edge.code(), ResultCode::AlreadyAdded);

    assert!(matches!(
        detector.add_edge_detection(4, EdgeDetect::None, None),
        Err(EventError::InvalidEdge(_))
    ));
    assert_eq!(detector.registered_pins(), vec![3]);
}

#[test]
fn blocking_pin_can_move_to_the_poll_thread() {
    let (detector, _clock) = detector();
    detector
        .wait_for_edge(10, EdgeDetect::Both, Some(20), Some(Duration::from_millis(10)))
        .unwrap();

    assert!(
        detector
            .add_edge_detection(10, EdgeDetect::Both, Some(30))
            .is_err()
    );
    detector
        .add_edge_detection(10, EdgeDetect::Both, Some(20))
        .unwrap();
    assert!(detector.is_thread_running());
}

#[test]
fn failed_direction_leaves_no_trace() {
    let (detector, _clock) = detector();
    detector.driver().fail(9, MockStep::Direction);

    let err = detector
        .add_edge_detection(9, EdgeDetect::Both, None)
        .unwrap_err();
    assert!(matches!(err, EventError::Io(_)));
    assert_eq!(err.code(), ResultCode::Error);

    assert!(detector.registered_pins().is_empty());
    assert!(!detector.poll_event_occurred(9).unwrap());
    assert_eq!(detector.driver().open_handles(), 0);
    assert!(!detector.driver().is_exported(9));
    assert!(!detector.is_thread_running());

    detector.driver().clear_failures();
    detector
        .add_edge_detection(9, EdgeDetect::Both, None)
        .unwrap();
}

#[test]
fn poll_thread_stops_on_read_failure_until_next_add() {
    let (detector, clock) = detector();
    let driver = detector.driver();
    let dead = record_edges(&detector, &clock, 15);
    driver.fail(15, MockStep::Read);

    detector
        .add_edge_detection(15, EdgeDetect::Rising, None)
        .unwrap();
    assert!(wait_until(|| !detector.is_thread_running()));

    // nothing is watching any more
    driver.clear_failures();
    assert!(driver.set_level(15, 1).unwrap());
    assert!(!driver.wait_reads(15, 1, Duration::from_millis(50)));
    assert!(dead.try_recv().is_err());
    assert!(!detector.poll_event_occurred(15).unwrap());

    let edges = record_edges(&detector, &clock, 16);
    detector
        .add_edge_detection(16, EdgeDetect::Rising, None)
        .unwrap();
    assert!(detector.is_thread_running());
    assert!(driver.wait_reads(16, 1, SETTLE));
    assert!(driver.set_level(16, 1).unwrap());
    assert!(edges.recv_timeout(SETTLE).is_ok());
    assert!(detector.poll_event_occurred(16).unwrap());
}

#[test]
fn remove_then_add_reuses_pin() {
    let (detector, _clock) = detector();
    detector
        .add_edge_detection(11, EdgeDetect::Both, None)
        .unwrap();
    detector.remove_edge_detection(11);
    assert_eq!(detector.driver().open_handles(), 0);
    assert_eq!(detector.driver().edge(11), EdgeDetect::None);
    assert!(!detector.driver().is_exported(11));

    // removing again is a no-op
    detector.remove_edge_detection(11);

    detector
        .add_edge_detection(11, EdgeDetect::Both, None)
        .unwrap();
    assert_eq!(detector.driver().open_handles(), 1);
}

#[test]
fn cleanup_is_idempotent() {
    let (detector, _clock) = detector();
    detector
        .add_edge_detection(1, EdgeDetect::Rising, None)
        .unwrap();
    detector
        .add_edge_detection(2, EdgeDetect::Falling, None)
        .unwrap();
    assert_eq!(detector.driver().open_handles(), 2);

    detector.cleanup(Cleanup::All);
    assert!(detector.registered_pins().is_empty());
    assert_eq!(detector.driver().open_handles(), 0);
    assert!(!detector.is_thread_running());

    detector.cleanup(Cleanup::All);
    assert_eq!(detector.driver().open_handles(), 0);

    detector
        .add_edge_detection(1, EdgeDetect::Rising, None)
        .unwrap();
    assert!(detector.is_thread_running());
}

#[test]
fn poll_thread_outlives_partial_cleanup() {
    let (detector, _clock) = detector();
    detector
        .add_edge_detection(1, EdgeDetect::Rising, None)
        .unwrap();
    detector
        .add_edge_detection(2, EdgeDetect::Rising, None)
        .unwrap();

    detector.cleanup(Cleanup::Pin(1));
    assert!(detector.is_thread_running());
    assert_eq!(detector.registered_pins(), vec![2]);

    detector.cleanup(Cleanup::Pin(2));
    assert!(!detector.is_thread_running());
}

#[test]
fn out_of_range_pins_are_rejected() {
    let (detector, clock) = detector();
    assert!(matches!(
        detector.add_edge_detection(54, EdgeDetect::Both, None),
        Err(EventError::InvalidPin(_))
    ));
    assert!(detector.poll_event_occurred(200).is_err());
    assert!(
        detector
            .register_callback(99, Arc::new(move |_pin: u32| clock.set_ms(0)))
            .is_err()
    );
    assert_eq!(detector.driver().open_handles(), 0);
}

#[test]
fn callback_may_tear_down_from_poll_thread() {
    let clock = Arc::new(MockClock::new(1_000));
    let detector = Arc::new(EdgeDetector::with_clock(
        MockDriver::default(),
        &DetectorConfig::default(),
        clock,
    ));
    let weak = Arc::downgrade(&detector);
    let (tx, rx) = unbounded();
    detector
        .register_callback(
            13,
            Arc::new(move |pin: u32| {
                if let Some(detector) = weak.upgrade() {
                    detector.cleanup(Cleanup::All);
                }
                let _ = tx.send(pin);
            }),
        )
        .unwrap();

    detector
        .add_edge_detection(13, EdgeDetect::Rising, None)
        .unwrap();
    assert!(detector.driver().wait_reads(13, 1, SETTLE));
    assert!(detector.driver().set_level(13, 1).unwrap());

    assert_eq!(rx.recv_timeout(SETTLE).unwrap(), 13);
    assert!(wait_until(|| !detector.is_thread_running()));
    assert!(detector.registered_pins().is_empty());
    assert_eq!(detector.driver().open_handles(), 0);
}

#[test]
fn removal_races_with_notifications() {
    let (detector, _clock) = detector();
    let driver = detector.driver();
    detector
        .add_edge_detection(30, EdgeDetect::Both, None)
        .unwrap();

    thread::scope(|s| {
        let toggler = s.spawn(|| {
            for _ in 0..2_000 {
                driver.toggle(20).unwrap();
            }
        });

        for _ in 0..50 {
            detector
                .add_edge_detection(20, EdgeDetect::Both, None)
                .unwrap();
            detector.remove_edge_detection(20);
        }
        toggler.join().unwrap();
    });

    assert!(detector.is_thread_running());
    assert_eq!(detector.registered_pins(), vec![30]);
    assert_eq!(driver.open_handles(), 1);
    assert!(!detector.poll_event_occurred(20).unwrap());
}
