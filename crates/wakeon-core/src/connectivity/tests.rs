use super::*;

fn test_config() -> ConnectivityConfig {
    ConnectivityConfig {
        connect_timeout_ms: 1_000,
        reconnect_delay_ms: 200,
        max_attempts: 3,
        min_pin_rssi_dbm: -80,
    }
}

fn credentials() -> StationCredentials {
    let mut credentials = StationCredentials::default();
    credentials.ssid.push_str("home-net").unwrap();
    credentials.passphrase.push_str("hunter22").unwrap();
    credentials
}

fn strong_pin() -> ApPin {
    ApPin {
        bssid: [0x10, 0x20, 0x30, 0x40, 0x50, 0x60],
        channel: 6,
        rssi_dbm: -52,
    }
}

#[test]
fn empty_credentials_boot_straight_to_access_point() {
    let mut manager = ConnectivityManager::new(test_config());
    let command = manager.initialize(StationCredentials::default(), 0);

    assert_eq!(command, WifiCommand::StartAccessPoint);
    assert_eq!(manager.mode(), WifiMode::AccessPoint);
    for t in [0, 10_000, 1_000_000] {
        assert_eq!(manager.poll(t), None);
    }
}

#[test]
fn initialize_scans_then_connects_with_pin() {
    let mut manager = ConnectivityManager::new(test_config());
    assert_eq!(manager.initialize(credentials(), 0), WifiCommand::Scan);
    assert_eq!(manager.mode(), WifiMode::ConnectingStation);

    let command = manager.scan_complete(Some(strong_pin())).unwrap();
    match command {
        WifiCommand::Connect(request) => {
            assert_eq!(request.credentials, credentials());
            assert_eq!(request.pin, Some(strong_pin()));
        }
        other => panic!("expected connect, got {other:?}"),
    }
}

#[test]
fn scan_miss_degrades_to_name_only_connect() {
    let mut manager = ConnectivityManager::new(test_config());
    manager.initialize(credentials(), 0);

    match manager.scan_complete(None).unwrap() {
        WifiCommand::Connect(request) => assert_eq!(request.pin, None),
        other => panic!("expected connect, got {other:?}"),
    }
}

#[test]
fn weak_scan_hit_is_not_pinned() {
    let mut manager = ConnectivityManager::new(test_config());
    manager.initialize(credentials(), 0);

    let weak = ApPin {
        rssi_dbm: -85,
        ..strong_pin()
    };
    match manager.scan_complete(Some(weak)).unwrap() {
        WifiCommand::Connect(request) => assert_eq!(request.pin, None),
        other => panic!("expected connect, got {other:?}"),
    }
}

#[test]
fn scan_complete_without_pending_scan_is_ignored() {
    let mut manager = ConnectivityManager::new(test_config());
    manager.initialize(credentials(), 0);
    manager.scan_complete(None).unwrap();
    assert_eq!(manager.scan_complete(Some(strong_pin())), None);
}

#[test]
fn repeated_timeouts_exhaust_budget_then_fall_back() {
    let mut manager = ConnectivityManager::new(test_config());
    manager.initialize(credentials(), 0);
    manager.scan_complete(None);

    // One tick before the timeout nothing happens.
    assert_eq!(manager.poll(999), None);

    // Attempts 2 and 3 are started by timeouts, each a full timeout apart.
    assert_eq!(manager.poll(1_000), Some(WifiCommand::Scan));
    manager.scan_complete(None);
    assert_eq!(manager.poll(1_999), None);
    assert_eq!(manager.poll(2_000), Some(WifiCommand::Scan));
    manager.scan_complete(None);

    // The budget is spent; the next timeout selects the access point.
    assert_eq!(manager.poll(3_000), Some(WifiCommand::StartAccessPoint));
    assert_eq!(manager.mode(), WifiMode::AccessPoint);
}

#[test]
fn access_point_mode_is_terminal_without_new_credentials() {
    let mut manager = ConnectivityManager::new(test_config());
    manager.initialize(credentials(), 0);
    manager.scan_complete(None);
    manager.poll(1_000);
    manager.scan_complete(None);
    manager.poll(2_000);
    manager.scan_complete(None);
    assert_eq!(manager.poll(3_000), Some(WifiCommand::StartAccessPoint));

    manager.on_disconnected(3_100);
    manager.on_connected(3_200);
    for t in 3_000..3_010 {
        assert_eq!(manager.poll(t * 10), None);
    }
    assert_eq!(manager.mode(), WifiMode::AccessPoint);
}

#[test]
fn successful_connection_resets_all_failure_tracking() {
    let mut manager = ConnectivityManager::new(test_config());
    manager.initialize(credentials(), 0);
    manager.scan_complete(None);
    assert_eq!(manager.poll(1_000), Some(WifiCommand::Scan));
    manager.scan_complete(None);

    manager.on_connected(1_500);

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.mode, WifiMode::ConnectedStation);
    assert_eq!(snapshot.attempt_count, 0);
    assert!(!snapshot.pending_reconnect);
    assert_eq!(manager.poll(100_000), None);
}

#[test]
fn disconnect_schedules_deferred_retry() {
    let mut manager = ConnectivityManager::new(test_config());
    manager.initialize(credentials(), 0);
    manager.scan_complete(None);
    manager.on_connected(500);

    manager.on_disconnected(1_000);
    assert_eq!(manager.mode(), WifiMode::ConnectingStation);
    assert!(manager.snapshot().pending_reconnect);

    // Retry waits out the full reconnect delay.
    assert_eq!(manager.poll(1_100), None);
    assert_eq!(manager.poll(1_200), Some(WifiCommand::Scan));
    assert_eq!(manager.snapshot().attempt_count, 1);
}

#[test]
fn reconnect_is_dropped_when_already_connected_again() {
    let mut manager = ConnectivityManager::new(test_config());
    manager.initialize(credentials(), 0);
    manager.scan_complete(None);
    manager.on_connected(500);

    manager.on_disconnected(1_000);
    manager.on_connected(1_050);

    assert_eq!(manager.poll(1_500), None);
    assert_eq!(manager.mode(), WifiMode::ConnectedStation);
}

#[test]
fn timeout_and_disconnect_in_same_tick_count_one_attempt() {
    let mut manager = ConnectivityManager::new(test_config());
    manager.initialize(credentials(), 0);
    manager.scan_complete(None);
    assert_eq!(manager.snapshot().attempt_count, 1);

    // The explicit failure lands exactly when the timeout would fire.
    manager.on_disconnected(1_000);
    assert_eq!(manager.poll(1_000), None);

    // Only the scheduled retry runs, consuming a single attempt.
    assert_eq!(manager.poll(1_200), Some(WifiCommand::Scan));
    assert_eq!(manager.snapshot().attempt_count, 2);
}

#[test]
fn exhausted_budget_on_disconnect_falls_back_on_next_poll() {
    let config = ConnectivityConfig {
        max_attempts: 1,
        ..test_config()
    };
    let mut manager = ConnectivityManager::new(config);
    manager.initialize(credentials(), 0);
    manager.scan_complete(None);

    manager.on_disconnected(100);
    assert_eq!(manager.poll(110), Some(WifiCommand::StartAccessPoint));
    assert_eq!(manager.mode(), WifiMode::AccessPoint);
}

#[test]
fn disconnect_failures_consume_the_same_budget_as_timeouts() {
    let mut manager = ConnectivityManager::new(test_config());
    manager.initialize(credentials(), 0);
    manager.scan_complete(None);

    manager.on_disconnected(100);
    assert_eq!(manager.poll(300), Some(WifiCommand::Scan));
    manager.scan_complete(None);
    manager.on_disconnected(400);
    assert_eq!(manager.poll(600), Some(WifiCommand::Scan));
    manager.scan_complete(None);
    manager.on_disconnected(700);

    // Third failure spent the budget of three.
    assert_eq!(manager.poll(900), Some(WifiCommand::StartAccessPoint));
}

#[test]
fn stale_connected_event_does_not_leave_access_point() {
    let mut manager = ConnectivityManager::new(test_config());
    manager.initialize(StationCredentials::default(), 0);
    assert_eq!(manager.mode(), WifiMode::AccessPoint);

    manager.on_connected(50);
    assert_eq!(manager.mode(), WifiMode::AccessPoint);
}
