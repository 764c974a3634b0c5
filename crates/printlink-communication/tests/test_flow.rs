mod common;

use common::{connected_host, MockPrinter};
use printlink_communication::{BufferAccounting, FlowConfig, PrinterHost};
use printlink_core::{ConnectionError, Error, FlowError, LogDirection};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_five_immediate_acks() {
    let printer = MockPrinter::new();
    let host = connected_host(&printer).await;

    for i in 0..5 {
        let ack = host.send_command(&format!("G1 X{}", i)).await.unwrap();
        assert_eq!(ack.response, "ok");
        assert_eq!(ack.attempts, 1);
    }

    let flow = host.session().flow().lock().await;
    assert_eq!(flow.occupancy(), 0);
    assert_eq!(flow.buffer_usage_percent(), 0);
}

#[tokio::test]
async fn test_resolution_order_matches_submission() {
    let printer = MockPrinter::new();
    let host = connected_host(&printer).await;
    let resolved = Arc::new(Mutex::new(Vec::new()));

    let submit = |host: PrinterHost, command: &'static str| {
        let resolved = Arc::clone(&resolved);
        async move {
            host.send_command(command).await.unwrap();
            resolved.lock().unwrap().push(command);
        }
    };

    tokio::join!(
        submit(host.clone(), "G1 X1"),
        submit(host.clone(), "G1 X2"),
        submit(host.clone(), "G1 X3"),
        submit(host.clone(), "G1 X4"),
    );

    assert_eq!(*resolved.lock().unwrap(), vec!["G1 X1", "G1 X2", "G1 X3", "G1 X4"]);
    let written: Vec<_> = printer
        .written()
        .into_iter()
        .filter(|c| c.starts_with("G1"))
        .collect();
    assert_eq!(written, vec!["G1 X1", "G1 X2", "G1 X3", "G1 X4"]);
}

#[tokio::test]
async fn test_retry_budget_exceeded() {
    let printer = MockPrinter::new();
    let host = connected_host(&printer).await;
    printer.ignore("G28");

    let result = host.send_command("G28").await;

    match result {
        Err(Error::Flow(FlowError::RetryBudgetExceeded {
            command, attempts, ..
        })) => {
            assert_eq!(command, "G28");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected retry budget error, got {:?}", other),
    }
    assert_eq!(printer.count_written("G28"), 3);
    assert_eq!(host.session().flow().lock().await.occupancy(), 0);

    // The link survives a failed command
    printer.recover();
    assert!(host.send_command("M105").await.is_ok());
    assert!(host
        .journal()
        .entries()
        .iter()
        .any(|e| e.direction == LogDirection::Err && e.text.contains("failed after 3 attempts")));
}

#[tokio::test]
async fn test_oversized_command_never_written() {
    let printer = MockPrinter::new();
    let mut config = common::test_config();
    config.flow = FlowConfig {
        capacity: 8,
        accounting: BufferAccounting::Bytes,
        ..config.flow
    };
    let host = PrinterHost::with_opener(config, printer.opener());
    host.connect(Default::default()).await.unwrap();

    let result = host.send_command("G1 X100 Y100 F3000").await;

    assert!(matches!(
        result,
        Err(Error::Flow(FlowError::BufferOverflow { capacity: 8, .. }))
    ));
    assert_eq!(printer.count_written("G1 X100 Y100 F3000"), 0);
    assert!(host.send_command("G28").await.is_ok());
}

#[tokio::test]
async fn test_send_while_disconnected() {
    let printer = MockPrinter::new();
    let host = common::host(&printer);

    let result = host.send_command("M105").await;
    assert!(matches!(
        result,
        Err(Error::Connection(ConnectionError::NotConnected))
    ));
    assert!(printer.written().is_empty());
}

#[tokio::test]
async fn test_empty_command_rejected() {
    let printer = MockPrinter::new();
    let host = connected_host(&printer).await;

    assert!(matches!(
        host.send_command("   ").await,
        Err(Error::Flow(FlowError::EmptyCommand))
    ));
}

#[tokio::test]
async fn test_disconnect_interrupts_wait() {
    let printer = MockPrinter::new();
    let mut config = common::test_config();
    config.flow.ack_timeout = Duration::from_secs(10);
    let host = PrinterHost::with_opener(config, printer.opener());
    host.connect(Default::default()).await.unwrap();
    printer.ignore("G4 S30");

    let waiting = host.clone();
    let pending = tokio::spawn(async move { waiting.send_command("G4 S30").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(host.disconnect(true).await);
    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        result,
        Err(Error::Flow(FlowError::Interrupted { .. }))
    ));
}

#[tokio::test]
async fn test_z_offset_nudge() {
    let printer = MockPrinter::new();
    let host = connected_host(&printer).await;

    host.adjust_z_offset(-0.05).await.unwrap();

    let written = printer.written();
    let nudge = written.iter().position(|c| c == "M290 Z-0.05").unwrap();
    assert_eq!(written[nudge + 1], "M114");
}

#[tokio::test]
async fn test_busy_printer_outlasts_ack_timeout() {
    let printer = MockPrinter::new();
    let host = connected_host(&printer).await;
    printer.busy_for("G29", Duration::from_millis(500));

    let started = Instant::now();
    let ack = host.send_command("G29").await.unwrap();

    // ack_timeout is 300ms; the busy lines kept the attempt alive
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(ack.attempts, 1);
    assert_eq!(printer.count_written("G29"), 1);
}

#[tokio::test]
async fn test_busy_wait_is_bounded() {
    let printer = MockPrinter::new();
    let mut config = common::test_config();
    config.flow.max_attempts = 1;
    let host = PrinterHost::with_opener(config, printer.opener());
    host.connect(Default::default()).await.unwrap();
    printer.stay_busy("G29");

    let started = Instant::now();
    let result = host.send_command("G29").await;
    let waited = started.elapsed();

    match result {
        Err(Error::Flow(FlowError::RetryBudgetExceeded {
            attempts, reason, ..
        })) => {
            assert_eq!(attempts, 1);
            assert!(reason.contains("No acknowledgement for 'G29'"));
        }
        other => panic!("expected acknowledgement timeout, got {:?}", other),
    }
    // ack_timeout + max_busy_wait, although busy lines keep coming
    assert!(waited >= Duration::from_millis(600));
    assert!(waited < Duration::from_millis(1500));
}

#[tokio::test]
async fn test_retry_waits_for_trailing_ok() {
    let printer = MockPrinter::new();
    let host = connected_host(&printer).await;
    printer.reject_once("G1 X1", "checksum mismatch, Last Line: 0", Duration::from_millis(40));

    let ack = host.send_command("G1 X1").await.unwrap();
    assert_eq!(ack.attempts, 2);

    let entries = host.journal().entries();
    let rejected = entries
        .iter()
        .position(|e| e.direction == LogDirection::Rx && e.text.starts_with("Error:checksum"))
        .expect("rejection received");
    let trailing_ok = rejected
        + entries[rejected..]
            .iter()
            .position(|e| e.direction == LogDirection::Rx && e.text == "ok")
            .expect("trailing ok received");
    let retry = entries
        .iter()
        .rposition(|e| e.direction == LogDirection::Tx && e.text == "G1 X1")
        .unwrap();
    assert!(retry > trailing_ok);

    // Later commands are matched to their own ok
    let next = host.send_command("G1 X2").await.unwrap();
    assert_eq!(next.attempts, 1);
    assert_eq!(printer.count_written("G1 X1"), 2);
}
