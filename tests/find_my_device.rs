use std::sync::Arc;

use findmydevice::auth::RequestGuard;
use findmydevice::config::{Config, HawkConfig};
use findmydevice::hawk::{Credentials, HawkAuthenticator};
use findmydevice::observability::PrometheusMetrics;
use findmydevice::storage::{Device, PendingCommand, Position, Storage, StorageRegistry};
use findmydevice::FmdError;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HOST};
use tempfile::TempDir;

const BODY: &str = r#"{"op":"lock"}"#;

fn open_store(tmp: &TempDir, metrics: Arc<PrometheusMetrics>) -> Arc<dyn Storage> {
    let mut config = Config::default();
    config.storage.path = tmp.path().join("fmd.db").display().to_string();
    StorageRegistry::with_defaults()
        .open(&config.storage, metrics)
        .unwrap()
}

fn post_cmd() -> http::request::Parts {
    http::Request::builder()
        .method("POST")
        .uri("/cmd")
        .header(HOST, "fmd.example.com")
        .header(CONTENT_TYPE, "application/json")
        .body(())
        .unwrap()
        .into_parts()
        .0
}

#[test]
fn lock_command_round_trip() {
    let tmp = TempDir::new().unwrap();
    let metrics = Arc::new(PrometheusMetrics::new().unwrap());
    let store = open_store(&tmp, metrics.clone());

    let device = Device {
        id: "dev-1".into(),
        secret: "s3cr3t".into(),
        has_passcode: true,
        push_url: "https://push.example.com/dev-1".into(),
        ..Device::default()
    };
    store.register_device("user-1", &device).unwrap();

    let guard = RequestGuard::new(HawkConfig::default(), store.clone());
    let nonce = guard.nonces().issue().unwrap();

    // Device side: sign with the server-issued nonce.
    let mut parts = post_cmd();
    let header = HawkAuthenticator::default().sign_with(
        &parts,
        Credentials {
            id: "dev-1",
            secret: "s3cr3t",
        },
        BODY,
        "",
        &chrono::Utc::now().timestamp().to_string(),
        &nonce,
    );
    parts
        .headers
        .insert(AUTHORIZATION, header.render().parse().unwrap());

    let caller = guard.authenticate(&parts, BODY).unwrap();
    assert_eq!(caller.id, "dev-1");
    assert_eq!(caller.user, "user-1");

    // Replay with the same nonce.
    assert!(matches!(
        guard.authenticate(&parts, BODY),
        Err(FmdError::NonceInvalid)
    ));

    store.store_command("dev-1", "lock", "lock").unwrap();
    assert_eq!(
        store.get_pending("dev-1").unwrap(),
        Some(PendingCommand {
            command: "lock".into(),
            command_type: "lock".into(),
        })
    );
    assert_eq!(store.get_pending("dev-1").unwrap(), None);

    assert_eq!(metrics.counter_value("nonce.issued"), 1);
    assert_eq!(metrics.counter_value("nonce.rejected"), 1);
    assert_eq!(metrics.timer_count("cmd.pending"), 1);
}

#[test]
fn device_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp, Arc::new(PrometheusMetrics::new().unwrap()));

    let id = store
        .register_device(
            "user-1",
            &Device {
                name: "Work phone".into(),
                secret: "abc".into(),
                ..Device::default()
            },
        )
        .unwrap();

    let listed = store.get_devices_for_user("user-1", None).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
    assert_eq!(listed[0].name, "Work phone");

    store
        .set_device_location(&id, &Position::new(48.85, 2.35, 35.0, 12.0))
        .unwrap();
    assert_eq!(store.get_positions(&id).unwrap().len(), 1);
    assert_eq!(store.gc_database().unwrap().positions, 0);

    store.delete_device(&id).unwrap();
    assert!(store.get_device_info(&id).unwrap_err().is_not_found());
    assert!(store.get_positions(&id).unwrap().is_empty());
    assert!(store.get_devices_for_user("user-1", None).unwrap().is_empty());
}

#[test]
fn reopening_keeps_schema_marker() {
    let tmp = TempDir::new().unwrap();
    {
        let store = open_store(&tmp, Arc::new(PrometheusMetrics::new().unwrap()));
        store
            .register_device(
                "user-1",
                &Device {
                    id: "dev-1".into(),
                    ..Device::default()
                },
            )
            .unwrap();
    }
    let store = open_store(&tmp, Arc::new(PrometheusMetrics::new().unwrap()));
    assert_eq!(store.get_user_from_device("dev-1").unwrap().0, "user-1");
}
