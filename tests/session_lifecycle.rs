//! Integration tests for the sweep session lifecycle
//!
//! These tests run complete sessions against the simulated analyzer and
//! check both the returned samples and the exact command traffic the
//! instrument saw, in particular that it is always handed back to local
//! control and the link is closed exactly once.

use futures::FutureExt;
use lcr_sweep::config::{SweepConfig, TimingConfig};
use lcr_sweep::error::SessionError;
use lcr_sweep::protocol::commands;
use lcr_sweep::sample::Sample;
use lcr_sweep::session::SessionController;
use lcr_sweep::simulator::{ScriptedReply, SimulatedAnalyzer, SimulatedConnector, SimulatorLog};
use lcr_sweep::sink::SampleSink;
use lcr_sweep::sweep::RetryPolicy;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::mpsc;

fn fast_config(frequencies: &[f64]) -> SweepConfig {
    SweepConfig {
        port: "SIM".into(),
        frequencies: frequencies.to_vec(),
        timing: TimingConfig {
            settle_delay: Duration::ZERO,
            read_timeout: Duration::from_millis(100),
        },
        ..Default::default()
    }
}

fn configuration_commands() -> Vec<String> {
    vec![
        commands::REMOTE.to_string(),
        commands::APERTURE_FAST.to_string(),
        commands::bias_voltage(0),
        commands::voltage_level(300),
        commands::FUNCTION_A_R.to_string(),
        commands::FUNCTION_B_THR.to_string(),
        commands::RANGE_AUTO_ON.to_string(),
    ]
}

fn assert_finalized_once(log: &SimulatorLog) {
    assert_eq!(log.count(commands::LOCAL), 1, "commands: {:?}", log.commands);
    assert_eq!(log.commands.last().map(String::as_str), Some(commands::LOCAL));
    assert_eq!(log.opens, 1);
    assert_eq!(log.closes, 1);
}

// =============================================================================
// Reference scenarios
// =============================================================================

#[tokio::test]
async fn test_single_frequency_happy_path() {
    let connector =
        SimulatedConnector::new(SimulatedAnalyzer::new().script(commands::FETCH, ["50.0,-30.0"]));
    let controller = SessionController::new(connector);
    let mut samples: Vec<Sample> = Vec::new();

    let result = controller
        .run_sweep(&fast_config(&[100.0]), &mut samples)
        .await
        .unwrap();

    assert_eq!(result.samples(), &[Sample::new(100.0, 50.0, -30.0)]);
    assert_eq!(samples, result.samples());

    let log = controller.connector().wait_closed().await;
    let mut expected = vec![commands::IDN.to_string()];
    expected.extend(configuration_commands());
    expected.extend([
        commands::frequency(100.0),
        commands::FETCH.to_string(),
        commands::LOCAL.to_string(),
    ]);
    assert_eq!(log.commands, expected);
    assert_finalized_once(&log);
}

#[tokio::test]
async fn test_command_error_falls_back_to_measure() {
    let analyzer = SimulatedAnalyzer::new()
        .script(commands::FETCH, ["cmd err"])
        .script(commands::MEASURE_IMPEDANCE, ["12.5,5.0"]);
    let controller = SessionController::new(SimulatedConnector::new(analyzer));
    let mut samples: Vec<Sample> = Vec::new();

    let result = controller
        .run_sweep(&fast_config(&[100.0]), &mut samples)
        .await
        .unwrap();

    assert_eq!(result.samples(), &[Sample::new(100.0, 12.5, 5.0)]);

    let log = controller.connector().wait_closed().await;
    assert_eq!(log.count(commands::FETCH), 1);
    assert_eq!(log.count(commands::MEASURE_IMPEDANCE), 1);
    assert!(log.position(commands::FETCH) < log.position(commands::MEASURE_IMPEDANCE));
    assert_finalized_once(&log);
}

#[tokio::test]
async fn test_silent_instrument_fails_identification() {
    let controller = SessionController::new(SimulatedConnector::new(
        SimulatedAnalyzer::new().without_idn(),
    ));
    let mut samples: Vec<Sample> = Vec::new();

    let err = controller
        .run_sweep(&fast_config(&[100.0, 1000.0]), &mut samples)
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::Identification { ref port } if port == "SIM"));
    assert!(samples.is_empty());

    let log = controller.connector().wait_closed().await;
    assert_eq!(log.commands, vec![commands::IDN, commands::LOCAL]);
    assert_finalized_once(&log);
}

// =============================================================================
// Sweep behavior
// =============================================================================

#[tokio::test]
async fn test_every_frequency_yields_one_sample_in_order() {
    let frequencies = [100.0, 400.0, 1000.0, 20000.0, 100000.0];
    let controller = SessionController::new(SimulatedConnector::new(SimulatedAnalyzer::new()));
    let mut samples: Vec<Sample> = Vec::new();

    let result = controller
        .run_sweep(&fast_config(&frequencies), &mut samples)
        .await
        .unwrap();

    assert_eq!(result.frequencies(), frequencies.to_vec());
    assert_eq!(samples, result.samples());

    // Series RC: R is constant, phase rises towards zero with frequency.
    for pair in result.samples().windows(2) {
        assert!((pair[0].measurement_a - 100.0).abs() < 1e-3);
        assert!(pair[0].measurement_b < pair[1].measurement_b);
    }

    let log = controller.connector().wait_closed().await;
    let set: Vec<&str> = log
        .commands
        .iter()
        .map(String::as_str)
        .filter(|c| c.starts_with("FREQUENCY "))
        .collect();
    assert_eq!(
        set,
        vec![
            "FREQUENCY 100",
            "FREQUENCY 400",
            "FREQUENCY 1000",
            "FREQUENCY 20000",
            "FREQUENCY 100000"
        ]
    );
    assert_finalized_once(&log);
}

#[tokio::test]
async fn test_transient_replies_retry_same_frequency() {
    let analyzer = SimulatedAnalyzer::new().script(
        commands::FETCH,
        [
            ScriptedReply::Silent,
            ScriptedReply::from("1.0,abc"),
            ScriptedReply::from("1,2,3"),
            ScriptedReply::from("7.5,-0.25"),
        ],
    );
    let controller = SessionController::new(SimulatedConnector::new(analyzer));
    let mut samples: Vec<Sample> = Vec::new();

    let result = controller
        .run_sweep(&fast_config(&[250.0]), &mut samples)
        .await
        .unwrap();

    assert_eq!(result.samples(), &[Sample::new(250.0, 7.5, -0.25)]);

    let log = controller.connector().wait_closed().await;
    assert_eq!(log.count("FREQUENCY 250"), 1);
    assert_eq!(log.count(commands::FETCH), 4);
    assert_eq!(log.count(commands::MEASURE_IMPEDANCE), 0);
    assert_finalized_once(&log);
}

#[tokio::test]
async fn test_busy_instrument_is_measured_on_demand() {
    let controller = SessionController::new(SimulatedConnector::new(
        SimulatedAnalyzer::new().with_busy_fetches(1),
    ));
    let mut samples: Vec<Sample> = Vec::new();

    let result = controller
        .run_sweep(&fast_config(&[100.0, 1000.0]), &mut samples)
        .await
        .unwrap();
    assert_eq!(result.len(), 2);

    let log = controller.connector().wait_closed().await;
    assert_eq!(log.count(commands::FETCH), 2);
    assert_eq!(log.count(commands::MEASURE_IMPEDANCE), 2);
}

#[tokio::test]
async fn test_bounded_retry_times_out_and_still_finalizes() {
    let analyzer = SimulatedAnalyzer::new().script(commands::FETCH, ["x,y", "x,y", "x,y"]);
    let controller = SessionController::new(SimulatedConnector::new(analyzer));
    let mut config = fast_config(&[100.0, 1000.0]);
    config.retry = RetryPolicy {
        max_attempts: Some(3),
        ..Default::default()
    };
    let mut samples: Vec<Sample> = Vec::new();

    let err = controller.run_sweep(&config, &mut samples).await.unwrap_err();

    match err {
        SessionError::FrequencyTimeout {
            frequency,
            attempts,
        } => {
            assert_eq!(frequency, 100.0);
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(samples.is_empty());

    let log = controller.connector().wait_closed().await;
    assert_eq!(log.count(commands::FETCH), 3);
    assert_eq!(log.count("FREQUENCY 1000"), 0);
    assert_finalized_once(&log);
}

#[tokio::test]
async fn test_samples_stream_through_channel() {
    let controller = SessionController::new(SimulatedConnector::new(SimulatedAnalyzer::new()));
    let (mut tx, mut rx) = mpsc::unbounded_channel();

    let result = controller
        .run_sweep(&fast_config(&[100.0, 200.0, 400.0]), &mut tx)
        .await
        .unwrap();
    drop(tx);

    let mut streamed = Vec::new();
    while let Some(sample) = rx.recv().await {
        streamed.push(sample);
    }
    assert_eq!(streamed, result.into_samples());
}

// =============================================================================
// Open failures and strict mode
// =============================================================================

#[tokio::test]
async fn test_open_failure_sends_nothing() {
    let controller =
        SessionController::new(SimulatedConnector::failing(std::io::ErrorKind::NotFound));
    let mut samples: Vec<Sample> = Vec::new();

    let err = controller
        .run_sweep(&fast_config(&[100.0]), &mut samples)
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::PortOpen { .. }));
    assert!(!err.reached_instrument());

    let log = controller.connector().wait_closed().await;
    assert!(log.commands.is_empty());
    assert_eq!(log.opens, 0);
    assert_eq!(log.closes, 0);
}

#[tokio::test]
async fn test_strict_mode_accepts_matching_read_back() {
    let controller = SessionController::new(SimulatedConnector::new(SimulatedAnalyzer::new()));
    let mut config = fast_config(&[100.0]);
    config.strict = true;
    let mut samples: Vec<Sample> = Vec::new();

    let result = controller.run_sweep(&config, &mut samples).await.unwrap();
    assert_eq!(result.len(), 1);

    let log = controller.connector().wait_closed().await;
    assert!(log.position(commands::FUNCTION_B_QUERY) < log.position("FREQUENCY 100"));
    assert_finalized_once(&log);
}

#[tokio::test]
async fn test_strict_mode_rejects_mismatch() {
    let analyzer = SimulatedAnalyzer::new().script(commands::BIAS_QUERY, ["0.5"]);
    let controller = SessionController::new(SimulatedConnector::new(analyzer));
    let mut config = fast_config(&[100.0]);
    config.strict = true;
    let mut samples: Vec<Sample> = Vec::new();

    let err = controller.run_sweep(&config, &mut samples).await.unwrap_err();

    match err {
        SessionError::Verification {
            setting,
            expected,
            actual,
        } => {
            assert_eq!(setting, "bias_voltage");
            assert_eq!(expected, "0");
            assert_eq!(actual, "0.5");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let log = controller.connector().wait_closed().await;
    assert_eq!(log.count("FREQUENCY 100"), 0);
    assert_finalized_once(&log);
}

// =============================================================================
// Link failures
// =============================================================================

#[tokio::test]
async fn test_link_lost_during_configuration_reports_io() {
    // The cable is pulled right after the instrument answers *IDN?.
    let controller = SessionController::new(SimulatedConnector::new(
        SimulatedAnalyzer::new().disconnect_after(1),
    ));
    let mut samples: Vec<Sample> = Vec::new();

    let err = controller
        .run_sweep(&fast_config(&[100.0]), &mut samples)
        .await
        .unwrap_err();

    match err {
        SessionError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe),
        other => panic!("unexpected error: {other:?}"),
    }

    let log = controller.connector().wait_closed().await;
    // SYSTEM:LOCAL could not be delivered; the port is still closed once.
    assert_eq!(log.commands, vec![commands::IDN]);
    assert_eq!(log.opens, 1);
    assert_eq!(log.closes, 1);
}

#[tokio::test]
async fn test_link_lost_mid_sweep_stops_retrying() {
    // *IDN?, seven configuration writes, then the first FREQUENCY.
    let controller = SessionController::new(SimulatedConnector::new(
        SimulatedAnalyzer::new().disconnect_after(9),
    ));
    let mut config = fast_config(&[100.0, 1000.0]);
    config.timing.settle_delay = Duration::from_millis(10);
    let mut samples: Vec<Sample> = Vec::new();

    let started = std::time::Instant::now();
    let err = tokio::time::timeout(
        Duration::from_secs(10),
        controller.run_sweep(&config, &mut samples),
    )
    .await
    .expect("sweep kept retrying on a dead link")
    .unwrap_err();

    assert!(matches!(err, SessionError::Io(_)), "unexpected error: {err:?}");
    assert!(samples.is_empty());
    assert!(started.elapsed() < Duration::from_secs(5));

    let log = controller.connector().wait_closed().await;
    assert_eq!(log.commands.len(), 9);
    assert_eq!(log.commands.last().map(String::as_str), Some("FREQUENCY 100"));
    assert_eq!(log.count(commands::LOCAL), 0);
    assert_eq!(log.closes, 1);
}

// =============================================================================
// Panic safety
// =============================================================================

struct ExplodingSink;

impl SampleSink for ExplodingSink {
    fn accept(&mut self, _sample: &Sample) {
        panic!("front-end crashed");
    }
}

#[tokio::test]
async fn test_panic_in_sink_still_restores_instrument() {
    let controller = SessionController::new(SimulatedConnector::new(SimulatedAnalyzer::new()));
    let config = fast_config(&[100.0, 1000.0]);
    let mut sink = ExplodingSink;

    let outcome = AssertUnwindSafe(controller.run_sweep(&config, &mut sink))
        .catch_unwind()
        .await;
    assert!(outcome.is_err(), "panic should propagate to the caller");

    let log = controller.connector().wait_closed().await;
    assert_eq!(log.count("FREQUENCY 1000"), 0);
    assert_finalized_once(&log);
}
