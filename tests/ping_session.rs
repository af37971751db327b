//! Integration tests for the ping driver

use pathprobe::{PingConfig, Pinger, ProbeResult, INFINITE};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn loopback_config(count: i64) -> PingConfig {
    PingConfig::builder()
        .host("127.0.0.1")
        .count(count)
        .interval(Duration::from_millis(10))
        .timeout(Duration::from_millis(500))
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loopback_ping_three_probes() {
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);

    let pinger = Pinger::new(loopback_config(3));
    pinger
        .ping(move |result| sink.lock().unwrap().push(result))
        .await
        .unwrap();

    let results = results.lock().unwrap();
    // one callback per echo, sequences counting up from 1
    assert_eq!(results.len(), 3);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.sequence(), i as u16 + 1);
        match result {
            ProbeResult::Success {
                remote,
                probe_size,
                overhead,
                elapsed_usec,
                ..
            } => {
                assert_eq!(remote, "127.0.0.1");
                assert_eq!(*probe_size, 32);
                assert_eq!(*overhead, 20);
                assert!(*elapsed_usec >= 0);
            }
            other => {
                // unprivileged ICMP may be disabled in test environments
                eprintln!("loopback echo did not succeed (expected in test environment): {other:?}");
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unroutable_destination_single_probe() {
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);

    let config = PingConfig::builder()
        .host("203.0.113.1")
        .count(1)
        .timeout(Duration::from_millis(1000))
        .build()
        .unwrap();
    Pinger::new(config)
        .ping(move |result| sink.lock().unwrap().push(result))
        .await
        .unwrap();

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].sequence(), 1);
    assert!(matches!(
        results[0],
        ProbeResult::Timeout { .. }
            | ProbeResult::NetUnreachable { .. }
            | ProbeResult::HostUnreachable { .. }
            | ProbeResult::Unknown { .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_infinite_ping_stops_on_cancellation() {
    let pinger = Arc::new(Pinger::new(loopback_config(INFINITE)));
    let session = {
        let pinger = Arc::clone(&pinger);
        tokio::spawn(async move { pinger.ping(|_| {}).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // overlapping sessions are refused while the first one runs
    let err = pinger.ping(|_| {}).await.unwrap_err();
    assert!(matches!(err, pathprobe::ProbeError::SessionActive));

    session.abort();
    let _ = session.await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // cancellation released the active flag: a new session starts instead of
    // failing fast (and is cut short the same way)
    let restarted = {
        let pinger = Arc::clone(&pinger);
        tokio::spawn(async move { pinger.ping(|_| {}).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!restarted.is_finished(), "second session failed to start");
    restarted.abort();
    let _ = restarted.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_pattern_is_accepted() {
    let config = PingConfig::builder()
        .host("127.0.0.1")
        .count(1)
        .interval(Duration::from_millis(10))
        .timeout(Duration::from_millis(300))
        .probe_size(64)
        .pattern(*b"\xDE\xAD\xBE\xEF")
        .build()
        .unwrap();
    let counter = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&counter);
    Pinger::new(config)
        .ping(move |_| *sink.lock().unwrap() += 1)
        .await
        .unwrap();
    assert_eq!(*counter.lock().unwrap(), 1);
}
