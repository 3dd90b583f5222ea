mod common;

use common::{open_arbiter, pulse_descriptor, Probe};
use padpilot::arbiter::SourceKind;
use padpilot::command::CommandEnv;
use padpilot::lifecycle::{
    CommandLifecycle, LifecycleError, LifecycleSettings, LifecycleState, RunOutcome, RunReport,
};
use padpilot::transport::mock::MemoryPort;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn lifecycle_on(port: &MemoryPort, grace: Duration) -> (padpilot::arbiter::InputArbiter, CommandLifecycle) {
    let arbiter = open_arbiter(port);
    let lifecycle = CommandLifecycle::new(
        CommandEnv::new(arbiter.submitter(SourceKind::Command)),
        LifecycleSettings { stop_grace: grace },
    );
    (arbiter, lifecycle)
}

fn reporter() -> (
    impl FnOnce(RunReport) + Send + 'static,
    mpsc::UnboundedReceiver<RunReport>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |report| {
            let _ = tx.send(report);
        },
        rx,
    )
}

#[tokio::test]
async fn stop_before_self_completion_reports_once_and_ends_once() {
    let port = MemoryPort::new();
    let (arbiter, lifecycle) = lifecycle_on(&port, Duration::from_secs(1));
    let probe = Arc::new(Probe::default());
    let descriptor = pulse_descriptor(None, Duration::ZERO, probe.clone());

    let (on_complete, mut reports) = reporter();
    lifecycle.start(&descriptor, on_complete).unwrap();
    assert_eq!(lifecycle.state(), LifecycleState::Running);
    assert_eq!(lifecycle.active_name().as_deref(), Some("pulse"));

    tokio::time::sleep(Duration::from_millis(10)).await;
    lifecycle.stop().await;

    let report = reports.try_recv().unwrap();
    assert_eq!(report.name, "pulse");
    assert!(matches!(report.outcome, RunOutcome::Stopped));
    assert_eq!(lifecycle.state(), LifecycleState::Idle);
    assert_eq!(probe.ended(), 1);

    // Nothing else arrives: the sender was consumed with the only callback.
    assert!(reports.recv().await.is_none());

    arbiter.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completion_fires_exactly_once_across_timing_trials() {
    let port = MemoryPort::new();
    let (arbiter, lifecycle) = lifecycle_on(&port, Duration::from_secs(1));

    for trial in 0..300u64 {
        let probe = Arc::new(Probe::default());
        // Some runs complete on their own before the stop, some are stopped mid-run.
        let pulses = Some((trial % 4) as usize);
        let descriptor = pulse_descriptor(pulses, Duration::ZERO, probe.clone());

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let counted = calls.clone();
        lifecycle
            .start(&descriptor, move |report| {
                counted.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(report);
            })
            .unwrap();

        let delay = Duration::from_micros((trial * 7919) % 3000);
        tokio::time::sleep(delay).await;
        lifecycle.stop().await;

        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(rx.recv().await.is_none(), "trial {trial}: second report");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "trial {trial}");
        assert_eq!(probe.constructed(), 1, "trial {trial}");
        assert_eq!(probe.ended(), 1, "trial {trial}");
        assert_eq!(lifecycle.state(), LifecycleState::Idle, "trial {trial}");
    }

    arbiter.close().await.unwrap();
}

#[tokio::test]
async fn start_while_running_or_stopping_is_busy() {
    let port = MemoryPort::new();
    let (arbiter, lifecycle) = lifecycle_on(&port, Duration::from_secs(1));
    let probe = Arc::new(Probe::default());
    let descriptor = pulse_descriptor(None, Duration::from_millis(100), probe.clone());

    let (on_complete, mut reports) = reporter();
    lifecycle.start(&descriptor, on_complete).unwrap();

    let err = lifecycle
        .start(&descriptor, |_| panic!("busy start must not complete"))
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Busy { ref active } if active == "pulse"));
    assert_eq!(probe.constructed(), 1);

    let mut states = lifecycle.subscribe();
    let stopper = lifecycle.clone();
    let stopping = tokio::spawn(async move { stopper.stop().await });

    states
        .wait_for(|state| *state == LifecycleState::Stopping)
        .await
        .unwrap();
    assert!(matches!(
        lifecycle.start(&descriptor, |_| panic!("busy start must not complete")),
        Err(LifecycleError::Busy { .. })
    ));
    assert_eq!(probe.constructed(), 1);

    // A second stop joins the teardown in progress.
    lifecycle.stop().await;
    assert_eq!(lifecycle.state(), LifecycleState::Idle);
    stopping.await.unwrap();

    assert!(reports.try_recv().is_ok());
    assert!(reports.try_recv().is_err());
    assert_eq!(probe.ended(), 1);

    arbiter.close().await.unwrap();
}

#[tokio::test]
async fn closing_the_transport_force_stops_the_run() {
    let port = MemoryPort::new();
    let (arbiter, lifecycle) = lifecycle_on(&port, Duration::from_secs(1));
    let probe = Arc::new(Probe::default());
    let descriptor = pulse_descriptor(None, Duration::ZERO, probe.clone());

    let (on_complete, mut reports) = reporter();
    lifecycle.start(&descriptor, on_complete).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    arbiter.close().await.unwrap();

    let report = tokio::time::timeout(Duration::from_secs(2), reports.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(report.outcome, RunOutcome::TransportLost));
    assert_eq!(probe.ended(), 1);
    assert_eq!(lifecycle.state(), LifecycleState::Idle);
}

#[tokio::test]
async fn stubborn_body_is_dropped_after_the_grace_period() {
    use async_trait::async_trait;
    use padpilot::command::{Command, CommandError, CommandIo, CommandKind};
    use padpilot::registry::CommandDescriptor;

    struct Stubborn;

    #[async_trait]
    impl Command for Stubborn {
        fn name(&self) -> &str {
            "stubborn"
        }

        async fn start(&self, _io: &CommandIo) -> Result<(), CommandError> {
            // Ignores cancellation entirely.
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    let port = MemoryPort::new();
    let (arbiter, lifecycle) = lifecycle_on(&port, Duration::from_millis(50));
    let descriptor = CommandDescriptor::new(
        "stubborn",
        CommandKind::Scripted,
        Arc::new(|_: &CommandEnv| -> Result<Box<dyn Command>, CommandError> {
            Ok(Box::new(Stubborn))
        }),
    );

    let (on_complete, mut reports) = reporter();
    lifecycle.start(&descriptor, on_complete).unwrap();

    tokio::time::timeout(Duration::from_secs(1), lifecycle.stop())
        .await
        .unwrap();
    assert!(matches!(
        reports.try_recv().unwrap().outcome,
        RunOutcome::Stopped
    ));
    assert_eq!(lifecycle.state(), LifecycleState::Idle);

    arbiter.close().await.unwrap();
}

#[tokio::test]
async fn failing_teardown_still_reaches_idle() {
    use async_trait::async_trait;
    use padpilot::command::{Command, CommandError, CommandIo, CommandKind};
    use padpilot::registry::CommandDescriptor;

    struct BadEnd;

    #[async_trait]
    impl Command for BadEnd {
        fn name(&self) -> &str {
            "bad-end"
        }

        async fn start(&self, _io: &CommandIo) -> Result<(), CommandError> {
            Ok(())
        }

        async fn end(&self, _io: &CommandIo) -> Result<(), CommandError> {
            Err(CommandError::Failed("stuck relay".to_string()))
        }
    }

    let port = MemoryPort::new();
    let (arbiter, lifecycle) = lifecycle_on(&port, Duration::from_secs(1));
    let descriptor = CommandDescriptor::new(
        "bad-end",
        CommandKind::Scripted,
        Arc::new(|_: &CommandEnv| -> Result<Box<dyn Command>, CommandError> {
            Ok(Box::new(BadEnd))
        }),
    );

    let (on_complete, mut reports) = reporter();
    lifecycle.start(&descriptor, on_complete).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(1), reports.recv())
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(report.outcome, RunOutcome::Completed));
    assert!(matches!(
        report.teardown_error,
        Some(LifecycleError::TeardownFailure { .. })
    ));
    assert_eq!(lifecycle.state(), LifecycleState::Idle);

    arbiter.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_from_a_thread_outside_the_runtime() {
    let port = MemoryPort::new();
    let (arbiter, lifecycle) = lifecycle_on(&port, Duration::from_secs(1));
    let probe = Arc::new(Probe::default());
    let descriptor = pulse_descriptor(None, Duration::ZERO, probe.clone());

    let (on_complete, mut reports) = reporter();
    let ui = lifecycle.clone();
    let started = descriptor.clone();
    std::thread::spawn(move || ui.start(&started, on_complete))
        .join()
        .unwrap()
        .unwrap();
    assert_eq!(lifecycle.state(), LifecycleState::Running);

    tokio::time::sleep(Duration::from_millis(5)).await;
    lifecycle.stop().await;
    assert!(matches!(reports.try_recv().unwrap().outcome, RunOutcome::Stopped));
    assert_eq!(lifecycle.state(), LifecycleState::Idle);
    assert_eq!(probe.ended(), 1);

    // The slot is usable again, from either side.
    let (on_complete, mut reports) = reporter();
    lifecycle.start(&descriptor, on_complete).unwrap();
    lifecycle.stop().await;
    assert!(reports.try_recv().is_ok());
    assert_eq!(probe.ended(), 2);

    arbiter.close().await.unwrap();
}

#[tokio::test]
async fn factory_runs_without_holding_the_slot() {
    use padpilot::command::{Command, CommandError, CommandKind};
    use padpilot::registry::CommandDescriptor;
    use std::sync::Mutex;

    let port = MemoryPort::new();
    let (arbiter, lifecycle) = lifecycle_on(&port, Duration::from_secs(1));
    let probe = Arc::new(Probe::default());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let inner = lifecycle.clone();
    let nested = pulse_descriptor(None, Duration::ZERO, probe.clone());
    let observed = seen.clone();
    let pulses = probe.clone();
    let descriptor = CommandDescriptor::new(
        "curious",
        CommandKind::Scripted,
        Arc::new(move |_: &CommandEnv| -> Result<Box<dyn Command>, CommandError> {
            let busy = inner.start(&nested, |_| panic!("nested start must not run"));
            observed.lock().unwrap().push((
                inner.active_name(),
                inner.state(),
                matches!(busy, Err(LifecycleError::Busy { ref active }) if active == "curious"),
            ));
            Ok(Box::new(common::Pulse {
                pulses: Some(1),
                end_delay: Duration::ZERO,
                probe: pulses.clone(),
            }))
        }),
    );

    let (on_complete, mut reports) = reporter();
    lifecycle.start(&descriptor, on_complete).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(1), reports.recv())
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(report.outcome, RunOutcome::Completed));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(None, LifecycleState::Idle, true)]
    );
    assert_eq!(probe.constructed(), 0);
    assert_eq!(lifecycle.state(), LifecycleState::Idle);

    arbiter.close().await.unwrap();
}

#[tokio::test]
async fn panicking_factory_frees_the_slot() {
    use padpilot::command::{Command, CommandError, CommandKind};
    use padpilot::registry::CommandDescriptor;

    let port = MemoryPort::new();
    let (arbiter, lifecycle) = lifecycle_on(&port, Duration::from_secs(1));
    let descriptor = CommandDescriptor::new(
        "explodes",
        CommandKind::Scripted,
        Arc::new(|_: &CommandEnv| -> Result<Box<dyn Command>, CommandError> {
            panic!("factory blew up")
        }),
    );

    let starter = lifecycle.clone();
    let attempt = std::thread::spawn(move || {
        let _ = starter.start(&descriptor, |_| panic!("callback must not fire"));
    })
    .join();
    assert!(attempt.is_err());

    assert_eq!(lifecycle.state(), LifecycleState::Idle);
    assert!(lifecycle.active_name().is_none());

    let probe = Arc::new(Probe::default());
    let (on_complete, mut reports) = reporter();
    lifecycle
        .start(&pulse_descriptor(Some(1), Duration::ZERO, probe), on_complete)
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), reports.recv())
        .await
        .unwrap()
        .unwrap();

    arbiter.close().await.unwrap();
}
