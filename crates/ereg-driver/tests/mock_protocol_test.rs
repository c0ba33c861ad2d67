//! Integration tests for the protocol client against the loopback mock.

use ereg_driver::{ERegError, EReg, MockEReg, SampleBuffer};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(2);

async fn connected() -> (MockEReg, EReg) {
    let mock = MockEReg::spawn().await.expect("mock should bind");
    let ereg = EReg::new();
    ereg.open_connection(&mock.host(), mock.port(), TIMEOUT)
        .await
        .expect("connect to mock");
    (mock, ereg)
}

#[tokio::test]
async fn test_metadata_and_defaults() {
    let (mock, ereg) = connected().await;

    assert_eq!(ereg.model_number().await.unwrap(), "MOCK-EREG");

    let metadata = ereg.metadata().await.unwrap();
    assert_eq!(metadata.serial_number, "SN-0001");
    assert_eq!(metadata.software_version, "1.0.4");
    assert_eq!(metadata.board_revision, "REV-C");

    let defaults = ereg.defaults().await.unwrap();
    assert_eq!(defaults.sample_rate, 10);
    assert_eq!(defaults.relay_timeout, 5000);
    assert_eq!(defaults.calibration_pressure, 45.0);

    assert_eq!(mock.commands(), vec!["mnc", "stc", "rdc"]);
}

#[tokio::test]
async fn test_calibration_is_cached_once() {
    let (mock, ereg) = connected().await;
    assert_eq!(ereg.cached_calibration(), None);

    assert_eq!(ereg.refresh_calibration().await.unwrap(), 45.0);
    assert_eq!(ereg.cached_calibration(), Some(45.0));

    ereg.set_pressure(10.0).await.unwrap();
    ereg.set_pressure(45.0).await.unwrap();
    assert_eq!(mock.count_commands("rdc"), 1);
    assert_eq!(mock.setpoint_history(), vec![10.0, 45.0]);
}

#[tokio::test]
async fn test_setpoint_out_of_range_sends_nothing() {
    let (mock, ereg) = connected().await;
    ereg.refresh_calibration().await.unwrap();
    mock.clear_commands();

    for value in [-1.0, 45.01, 100.0, f64::INFINITY] {
        let err = ereg.set_pressure(value).await.unwrap_err();
        assert!(matches!(err, ERegError::Validation(_)), "{} -> {:?}", value, err);
    }
    let err = ereg.set_fault_pressure(46).await.unwrap_err();
    assert!(matches!(err, ERegError::Validation(_)));

    assert!(mock.commands().is_empty());
}

#[tokio::test]
async fn test_setpoint_without_cache_fetches_calibration_first() {
    let (mock, ereg) = connected().await;
    mock.set_calibration(30.0);

    let err = ereg.set_pressure(31.0).await.unwrap_err();
    assert!(matches!(err, ERegError::Validation(_)));
    assert_eq!(mock.commands(), vec!["rdc"]);
    assert_eq!(ereg.cached_calibration(), Some(30.0));
}

#[tokio::test]
async fn test_typed_roundtrip() {
    let (mock, ereg) = connected().await;

    ereg.set_sample_rate(25).await.unwrap();
    assert_eq!(ereg.sample_rate().await.unwrap(), 25);

    ereg.set_heartbeat(0).await.unwrap();
    ereg.set_heartbeat(1500).await.unwrap();
    assert_eq!(ereg.heartbeat().await.unwrap(), 1500);

    ereg.set_relay_timeout(0).await.unwrap();
    assert_eq!(ereg.relay_timeout().await.unwrap(), 0);

    ereg.set_fault_pressure(5).await.unwrap();
    assert_eq!(ereg.fault_pressure().await.unwrap(), 5.0);

    ereg.set_pressure(14.5).await.unwrap();
    assert_eq!(ereg.pressure().await.unwrap(), 14.5);

    ereg.valves_on().await.unwrap();
    assert!(mock.valves_on());
    ereg.valves_off().await.unwrap();
    assert!(!mock.valves_on());
}

#[tokio::test]
async fn test_sample_buffer_fills_after_not_ready_polls() {
    let (mock, ereg) = connected().await;
    mock.set_not_ready_polls(2);
    mock.set_buffer(vec![10.0, 12.0, 11.0]);

    ereg.set_sample_size(3).await.unwrap();
    ereg.start_sampling(None).await.unwrap();
    assert_eq!(ereg.send_buffer().await.unwrap(), SampleBuffer::NotReady("sbe".into()));
    assert_eq!(ereg.send_buffer().await.unwrap(), SampleBuffer::NotReady("sbe".into()));
    assert_eq!(
        ereg.send_buffer().await.unwrap(),
        SampleBuffer::Samples(vec![10.0, 12.0, 11.0])
    );
    assert!(mock.commands().contains(&"ssc".to_string()));
}

#[tokio::test]
async fn test_nak_keeps_connection() {
    let (mock, ereg) = connected().await;
    mock.fail_next("bcr");

    let err = ereg.valves_on().await.unwrap_err();
    assert_eq!(
        err,
        ERegError::NegativeAcknowledgement {
            code: "bcr".into(),
            description: "bad command response".into(),
        }
    );
    assert!(ereg.is_connected().await);
    ereg.valves_on().await.unwrap();
}

#[tokio::test]
async fn test_malformed_response_is_unexpected() {
    let (mock, ereg) = connected().await;
    mock.queue_response("rsrr:fast");

    let err = ereg.sample_rate().await.unwrap_err();
    assert!(matches!(err, ERegError::Unexpected(_)));
    assert!(ereg.is_connected().await);
}

#[tokio::test]
async fn test_dropped_socket_requires_reconnect() {
    let (mock, ereg) = connected().await;
    ereg.refresh_calibration().await.unwrap();
    mock.drop_connections();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = ereg.pressure().await.unwrap_err();
    assert!(err.is_connection());
    assert!(!ereg.is_connected().await);

    let err = ereg.pressure().await.unwrap_err();
    assert_eq!(err, ERegError::Connection("Socket is not connected".into()));

    ereg.open_connection(&mock.host(), mock.port(), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(ereg.cached_calibration(), None);
    assert_eq!(ereg.pressure().await.unwrap(), 0.0);
}

#[tokio::test]
async fn test_concurrent_callers_never_interleave() {
    let (mock, ereg) = connected().await;
    let ereg = std::sync::Arc::new(ereg);

    let mut tasks = Vec::new();
    for i in 0..8u32 {
        let ereg = ereg.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..10 {
                let rate = 1 + i;
                ereg.set_sample_rate(rate).await.unwrap();
                assert_eq!(ereg.model_number().await.unwrap(), "MOCK-EREG");
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(mock.commands().len(), 160);
}
