// Integration tests for `Client` against the emulated server.

mod common;

use std::time::Duration;

use serde_json::json;

use common::{EmulatedServer, INSTALLED_SFDS};
use scrutiny_core::{
    CanInterface, CanLinkConfig, Client, ClientEvent, ConnectionState, CoreError, Datatype,
    DeviceLinkConfig, DeviceLinkState, IpLinkConfig, ValueStatus, WatchableListFilter,
    WatchableType, WatchableValue,
};
use scrutiny_core::model::SocketCanConfig;

const WAIT: Duration = Duration::from_secs(2);

// ── Helpers ─────────────────────────────────────────────────────────

async fn connected(server: &EmulatedServer) -> Client {
    let client = Client::new(server.config());
    client.connect().await.unwrap();
    client
}

async fn next_event<F>(
    events: &mut tokio::sync::broadcast::Receiver<ClientEvent>,
    matches: F,
) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

// ── Session ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_watch_wait_disconnect() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;
    assert_eq!(
        *client.connection_state().borrow(),
        ConnectionState::Connected(DeviceLinkState::Ready)
    );

    let x = client.watch("/alias/x").await.unwrap();
    client.wait_new_value_for_all(Duration::from_secs(1)).await.unwrap();
    assert_eq!(x.status(), ValueStatus::Valid);
    assert_eq!(x.value_f64().unwrap(), 1.5);
    assert!(x.last_update_timestamp().is_some());

    client.disconnect().await;
    assert!(matches!(x.value(), Err(CoreError::Disconnected)));
    assert_eq!(x.status(), ValueStatus::ServerGone);
    assert_eq!(*client.connection_state().borrow(), ConnectionState::Disconnected);
    assert!(matches!(client.watch("/alias/x").await, Err(CoreError::Disconnected)));

    // Idempotent.
    client.disconnect().await;
}

#[tokio::test]
async fn test_server_status_accessors() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;

    let status = client.get_latest_server_status().unwrap();
    assert_eq!(status.device_session_id.as_deref(), Some("session-1"));
    assert_eq!(status.loaded_sfd_firmware_id.as_deref(), Some("firmware-a"));
    assert_eq!(status.device_link_state(), DeviceLinkState::Ready);
    assert!(status.supported_features.unwrap().sixtyfour_bits);

    let (update, requested) = tokio::join!(client.wait_server_status_update(WAIT), async {
        client.request_server_status_update()
    });
    requested.unwrap();
    assert_eq!(update.unwrap().device_session_id.as_deref(), Some("session-1"));

    client.wait_device_ready(WAIT).await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn test_server_requests() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;

    let stats = client.get_server_stats().await.unwrap();
    assert_eq!(stats.client_count, 1);
    assert_eq!(stats.uptime, Duration::from_millis(12_500));

    let count = client.get_watchable_count().await.unwrap();
    assert_eq!((count.alias, count.var, count.rpv), (3, 2, 2));
    assert_eq!(count.total(), 7);

    client
        .configure_device_link(&DeviceLinkConfig::Udp(IpLinkConfig {
            host: "localhost".into(),
            port: 8765,
        }))
        .await
        .unwrap();

    let local = client.get_local_stats();
    assert!(local.rx_messages > 0);
    assert!(local.tx_bytes > 0);
    assert_eq!(local.connect_count, 1);
    assert!(local.last_request_latency.is_some());

    client.disconnect().await;
}

#[tokio::test]
async fn test_reset_local_stats() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;
    client.get_server_stats().await.unwrap();
    assert!(client.get_local_stats().last_request_latency.is_some());

    client.reset_local_stats();
    let local = client.get_local_stats();
    assert_eq!(local.last_request_latency, None);
    assert_eq!(local.average_request_latency, None);
    assert!(local.rx_data_rate.abs() < f64::EPSILON);
    assert!(local.rx_messages > 0, "totals survive a reset");
    assert_eq!(local.connect_count, 1);

    client.disconnect().await;
}

// ── Server catalog ──────────────────────────────────────────────────

#[tokio::test]
async fn test_download_full_watchable_list() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;

    let list = client
        .download_watchable_list(&WatchableListFilter::default())
        .await
        .unwrap();
    assert_eq!((list.rpv.len(), list.alias.len(), list.var.len()), (2, 3, 2));

    let mode = list
        .alias
        .iter()
        .find(|w| w.path.as_str() == "/alias/mode")
        .unwrap();
    assert_eq!(mode.datatype, Datatype::Uint8);
    assert_eq!(mode.enum_def.as_ref().unwrap().value_of("Run"), Some(2));
    let first = list.entries().next().unwrap();
    assert_eq!(first.watchable_type(), WatchableType::RuntimePublishedValue);

    client.disconnect().await;
}

#[tokio::test]
async fn test_download_watchable_list_in_segments() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;

    // 7 entries in segments of 2, then 7 in exactly one segment followed
    // by an empty closing one.
    for max_per_response in [2, 7] {
        let filter = WatchableListFilter {
            max_per_response,
            ..WatchableListFilter::default()
        };
        let list = client.download_watchable_list(&filter).await.unwrap();
        assert_eq!(list.len(), 7, "segments of {max_per_response}");
    }

    // Nothing stays registered once the last segment arrived.
    let count = client.get_watchable_count().await.unwrap();
    assert_eq!(count.total(), 7);
    client.disconnect().await;
}

#[tokio::test]
async fn test_download_watchable_list_filters() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;

    let rpv_only = WatchableListFilter::of_types([WatchableType::RuntimePublishedValue]);
    let list = client.download_watchable_list(&rpv_only).await.unwrap();
    assert_eq!(list.len(), 2);
    assert!(list.alias.is_empty() && list.var.is_empty());

    let by_name = WatchableListFilter::default().with_name_pattern("/var/main.c/*");
    let list = client.download_watchable_list(&by_name).await.unwrap();
    let paths: Vec<&str> = list.entries().map(|w| w.path.as_str()).collect();
    assert_eq!(paths, ["/var/main.c/counter", "/var/main.c/silent"]);

    let nothing = WatchableListFilter::default().with_name_pattern("/alias/none*");
    assert!(client.download_watchable_list(&nothing).await.unwrap().is_empty());

    let invalid = WatchableListFilter {
        max_per_response: 0,
        ..WatchableListFilter::default()
    };
    let err = client.download_watchable_list(&invalid).await.unwrap_err();
    assert!(matches!(err, CoreError::Validation { .. }));

    client.disconnect().await;
}

#[tokio::test]
async fn test_download_watchable_list_after_disconnect_fails() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;
    client.disconnect().await;

    let err = client
        .download_watchable_list(&WatchableListFilter::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Disconnected));
}

#[tokio::test]
async fn test_firmware_descriptions() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;

    let installed = client.get_installed_sfds().await.unwrap();
    assert_eq!(installed.keys().map(String::as_str).collect::<Vec<_>>(), INSTALLED_SFDS);
    let sfd = &installed["firmware-b"];
    assert_eq!(sfd.filesize, Some(4096));
    let metadata = sfd.metadata.as_ref().unwrap();
    assert_eq!(metadata.author.as_deref(), Some("tests"));
    assert_eq!(
        metadata.generation_info.timestamp.unwrap().timestamp(),
        1_700_000_000
    );

    let loaded = client.get_loaded_sfd().await.unwrap().unwrap();
    assert_eq!(loaded.firmware_id, "firmware-a");
    assert_eq!(loaded.display_name(), "project firmware-a 1.0.0");

    server.set_loaded_sfd(None);
    assert_eq!(client.get_loaded_sfd().await.unwrap(), None);

    client.disconnect().await;
}

#[tokio::test]
async fn test_device_info() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;

    let info = client.get_device_info().await.unwrap().unwrap();
    assert_eq!(info.session_id, "session-1");
    assert_eq!(info.display_name, "Emulated device");
    assert_eq!(info.max_bitrate_bps, None);
    assert_eq!(info.heartbeat_timeout, Duration::from_secs(5));
    assert!(info.supported_features.memory_write);
    assert_eq!(info.forbidden_memory_regions.len(), 1);
    assert_eq!(info.forbidden_memory_regions[0].size, 0x1000);
    assert!(info.readonly_memory_regions.is_empty());

    server.set_device_session(None);
    assert_eq!(client.get_device_info().await.unwrap(), None);

    client.disconnect().await;
}

#[tokio::test]
async fn test_invalid_link_config_is_not_sent() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;

    let link = DeviceLinkConfig::Canbus(CanLinkConfig {
        interface: CanInterface::SocketCan(SocketCanConfig {
            channel: "can0".into(),
        }),
        txid: 0x100,
        rxid: 0x101,
        extended_id: false,
        fd: false,
        bitrate_switch: true,
    });
    let err = client.configure_device_link(&link).await.unwrap_err();
    assert!(matches!(err, CoreError::Validation { .. }));

    client.disconnect().await;
}

#[tokio::test]
async fn test_reconnect_counts() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;
    let before = client.watch("/rpv/x1000").await.unwrap();

    client.connect().await.unwrap();
    assert!(matches!(before.value(), Err(CoreError::Disconnected)));

    let stats = client.get_local_stats();
    assert_eq!(stats.connect_count, 2);
    assert_eq!(stats.reconnect_count, 1);
    client.disconnect().await;
}

#[tokio::test]
async fn test_oneshot_disconnects() {
    let server = EmulatedServer::start().await;
    let mut kept = None;
    let count = Client::oneshot(server.config(), |client| {
        kept = Some(client.clone());
        async move { client.get_watchable_count().await }
    })
    .await
    .unwrap();

    assert_eq!(count.rpv, 2);
    assert!(!kept.unwrap().is_connected());
}

#[tokio::test]
async fn test_server_loss_releases_waiters() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;
    let silent = client.watch("/var/main.c/silent").await.unwrap();

    let waiter = {
        let silent = silent.clone();
        tokio::spawn(async move { silent.wait_update(Duration::from_secs(10)).await })
    };
    tokio::task::yield_now().await;
    server.drop_connections();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, CoreError::Disconnected));
    assert!(matches!(silent.value(), Err(CoreError::Disconnected)));

    let mut state = client.connection_state();
    tokio::time::timeout(WAIT, state.wait_for(|s| matches!(s, ConnectionState::Error { .. })))
        .await
        .unwrap()
        .unwrap();

    // Explicit reconnect leaves the error state.
    client.connect().await.unwrap();
    assert!(client.connection_state().borrow().is_device_ready());
    client.disconnect().await;
}

// ── Watching ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_watch_returns_identical_handle() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;

    let a = client.watch("/rpv/x1000").await.unwrap();
    let b = client.watch("/rpv/x1000").await.unwrap();
    assert!(a.ptr_eq(&b));
    assert_eq!(server.subscribe_requests(), 1);

    let (c, d) = tokio::join!(client.watch("/alias/x"), client.watch("/alias/x"));
    assert!(c.unwrap().ptr_eq(&d.unwrap()));
    assert_eq!(server.subscribe_requests(), 2);

    assert!(client.try_get_existing_watch_handle("/rpv/x1000").unwrap().ptr_eq(&a));
    assert!(
        client
            .try_get_existing_watch_handle_by_server_id("r-1000")
            .unwrap()
            .ptr_eq(&a)
    );
    assert!(client.try_get_existing_watch_handle("/rpv/x2000").is_none());
    assert_eq!(client.watched_handles().len(), 2);

    client.disconnect().await;
}

#[tokio::test]
async fn test_watch_rejects_bad_paths() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;

    let err = client.watch("/bogus/x").await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidPath { .. }));
    assert_eq!(server.subscribe_requests(), 0);

    let err = client.watch("/alias/does_not_exist").await.unwrap_err();
    match err {
        CoreError::InvalidPath { path, reason } => {
            assert_eq!(path, "/alias/does_not_exist");
            assert!(reason.contains("unknown watchable"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(client.try_get_existing_watch_handle("/alias/does_not_exist").is_none());

    client.disconnect().await;
}

#[tokio::test]
async fn test_unwatch_invalidates_handle() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;

    let x = client.watch("/alias/x").await.unwrap();
    x.wait_update(WAIT).await.unwrap();
    x.unwatch().await.unwrap();

    assert!(matches!(x.value(), Err(CoreError::Unwatched { .. })));
    let counter = x.update_counter();
    tokio::time::sleep(common::UPDATE_PERIOD * 3).await;
    assert_eq!(x.update_counter(), counter);
    assert!(client.try_get_existing_watch_handle("/alias/x").is_none());

    let again = client.watch("/alias/x").await.unwrap();
    assert!(!again.ptr_eq(&x));
    assert_eq!(server.subscribe_requests(), 2);

    client.disconnect().await;
}

#[tokio::test]
async fn test_wait_new_value_for_all_ignores_late_handles() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;
    client.watch("/alias/x").await.unwrap();

    let waiting = {
        let client = client.clone();
        tokio::spawn(async move { client.wait_new_value_for_all(WAIT).await })
    };
    tokio::task::yield_now().await;

    // Never updated by the server; would time the wait out if considered.
    let silent = client.watch("/var/main.c/silent").await.unwrap();
    waiting.await.unwrap().unwrap();
    assert_eq!(silent.update_counter(), 0);
    assert!(matches!(
        silent.value(),
        Err(CoreError::InvalidValue { status: ValueStatus::NeverSet, .. })
    ));

    client.disconnect().await;
}

#[tokio::test]
async fn test_device_session_change_invalidates_all() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;
    let rpv = client.watch("/rpv/x1000").await.unwrap();
    let alias = client.watch("/alias/x").await.unwrap();
    let mut events = client.events();

    server.set_device_session(Some("session-2"));

    let err = rpv.wait_value(|_| false, WAIT).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidValue { status: ValueStatus::DeviceGone, .. }));
    assert_eq!(alias.status(), ValueStatus::DeviceGone);

    let gone = next_event(&mut events, |e| matches!(e, ClientEvent::DeviceGone { .. })).await;
    assert_eq!(gone, ClientEvent::DeviceGone { session_id: "session-1".into() });
    let ready = next_event(&mut events, |e| matches!(e, ClientEvent::DeviceReady { .. })).await;
    assert_eq!(ready, ClientEvent::DeviceReady { session_id: "session-2".into() });

    let fresh = client.watch("/rpv/x1000").await.unwrap();
    assert!(!fresh.ptr_eq(&rpv));
    fresh.wait_update(WAIT).await.unwrap();

    client.disconnect().await;
}

#[tokio::test]
async fn test_sfd_unload_keeps_rpvs() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;
    let alias = client.watch("/alias/x").await.unwrap();
    let var = client.watch("/var/main.c/counter").await.unwrap();
    let rpv = client.watch("/rpv/x1000").await.unwrap();

    server.set_loaded_sfd(None);

    let err = alias.wait_value(|_| false, WAIT).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidValue { status: ValueStatus::SfdUnloaded, .. }));
    assert_eq!(var.status(), ValueStatus::SfdUnloaded);

    let counter = rpv.wait_update(WAIT).await.unwrap();
    assert!(counter >= 1);
    assert_eq!(rpv.value_u64().unwrap(), 100);
    assert!(client.try_get_existing_watch_handle("/alias/x").is_none());
    assert!(client.try_get_existing_watch_handle("/rpv/x1000").is_some());

    client.disconnect().await;
}

// ── Writing ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_batch_applies_duplicates_in_order() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;
    let h1 = client.watch("/var/main.c/counter").await.unwrap();
    let h2 = client.watch("/alias/result").await.unwrap();

    client
        .batch_write(WAIT, |batch| {
            batch.write(&h1, 1)?;
            batch.write(&h2, 2)?;
            batch.write(&h2, 3)
        })
        .await
        .unwrap();

    assert_eq!(
        server.writes(),
        vec![
            ("/var/main.c/counter".to_owned(), json!(1)),
            ("/alias/result".to_owned(), json!(2)),
            ("/alias/result".to_owned(), json!(3)),
        ]
    );
    assert_eq!(server.device_value("/alias/result"), Some(json!(3)));
    let value = h2.wait_value(|v| v.as_i64() == Some(3), WAIT).await.unwrap();
    assert_eq!(value, WatchableValue::Int(3));
    assert!(h1.last_write_timestamp().is_some());
    assert!(h2.last_write_timestamp().is_some());

    client.disconnect().await;
}

#[tokio::test]
async fn test_transaction_object_commit_and_discard() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;
    let counter = client.watch("/var/main.c/counter").await.unwrap();

    let mut batch = client.begin_batch();
    batch.write(&counter, 42).unwrap();
    batch.discard();
    assert!(server.writes().is_empty());

    let mut batch = client.begin_batch();
    batch.write(&counter, 43).unwrap();
    assert_eq!(batch.len(), 1);
    batch.commit().await.unwrap();
    assert_eq!(server.device_value("/var/main.c/counter"), Some(json!(43)));

    client.disconnect().await;
}

#[tokio::test]
async fn test_expression_write() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;
    let result = client.watch("/alias/result").await.unwrap();

    result.write("floor(1.23e5*cos(radians(5^2)))").await.unwrap();

    assert_eq!(server.device_value("/alias/result"), Some(json!(111_475)));
    let value = result
        .wait_value(|v| v.as_i64() == Some(111_475), WAIT)
        .await
        .unwrap();
    assert_eq!(value, WatchableValue::Int(111_475));

    client.disconnect().await;
}

#[tokio::test]
async fn test_enum_write() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;
    let mode = client.watch("/alias/mode").await.unwrap();

    mode.write_enum("Run").await.unwrap();
    mode.wait_value(|v| v.as_u64() == Some(2), WAIT).await.unwrap();
    assert_eq!(mode.value_enum().unwrap(), "Run");
    assert!(matches!(mode.write_enum("Sprint").await, Err(CoreError::Validation { .. })));

    client.disconnect().await;
}

#[tokio::test]
async fn test_device_write_failures() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;
    server.fail_writes_to("/rpv/x2000");
    let ok = client.watch("/rpv/x1000").await.unwrap();
    let bad = client.watch("/rpv/x2000").await.unwrap();

    let err = bad.write(false).await.unwrap_err();
    assert!(matches!(err, CoreError::WriteRejected { .. }));

    let err = client
        .batch_write(WAIT, |batch| {
            batch.write(&ok, 5u32)?;
            batch.write(&bad, true)?;
            batch.write(&ok, 6u32)
        })
        .await
        .unwrap_err();
    match err {
        CoreError::BatchWrite { index, path, .. } => {
            assert_eq!(index, 1);
            assert_eq!(path, "/rpv/x2000");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(server.device_value("/rpv/x1000"), Some(json!(5)));

    client.disconnect().await;
}

#[tokio::test]
async fn test_unconfirmed_write_times_out() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;
    server.hold_write_completions();
    let counter = client.watch("/var/main.c/counter").await.unwrap();

    let mut batch = client.begin_batch_with_timeout(Duration::from_millis(200));
    batch.write(&counter, 1).unwrap();
    batch.write(&counter, 2).unwrap();
    let err = batch.commit().await.unwrap_err();
    assert!(matches!(err, CoreError::WriteTimeout { count: 2, .. }));

    client.disconnect().await;
}

#[tokio::test]
async fn test_write_after_disconnect_fails() {
    let server = EmulatedServer::start().await;
    let client = connected(&server).await;
    let counter = client.watch("/var/main.c/counter").await.unwrap();
    client.disconnect().await;

    assert!(matches!(counter.write(1).await, Err(CoreError::Disconnected)));
    let mut batch = client.begin_batch();
    assert!(matches!(batch.write(&counter, 1), Err(CoreError::Disconnected)));
}

#[tokio::test]
async fn test_batch_rejects_foreign_handles() {
    let server = EmulatedServer::start().await;
    let first = connected(&server).await;
    let second = connected(&server).await;
    let handle = first.watch("/rpv/x1000").await.unwrap();

    let mut batch = second.begin_batch();
    assert!(matches!(batch.write(&handle, 1), Err(CoreError::Validation { .. })));

    first.disconnect().await;
    second.disconnect().await;
}
