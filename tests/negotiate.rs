//! Port selection and key/password fallback against the fake host.

mod common;

use std::time::Duration;

use common::{key_pair, FakeHost, PASSWORD};
use server_setup::error::SetupError;
use server_setup::ssh::{AuthMethod, ConnectionNegotiator, Credentials, RemoteSession};

fn credentials(with_key: bool) -> (Option<tempfile::TempDir>, Credentials) {
    let creds = Credentials::new("root").with_password(Some(PASSWORD.to_string()));
    if !with_key {
        return (None, creds);
    }
    let (dir, keys) = key_pair();
    let creds = creds.with_private_key(Some(keys.load_private().expect("load key")));
    (Some(dir), creds)
}

#[tokio::test]
async fn test_legacy_port_closed_selects_hardened_port() {
    let host = FakeHost::hardened(10322);
    let connector = host.connector();
    let (_dir, creds) = credentials(true);

    let session = ConnectionNegotiator::new(&connector)
        .with_probe_timeout(Duration::from_millis(10))
        .negotiate(common::HOST, &creds, &[22, 10322])
        .await
        .expect("negotiation");

    assert_eq!(session.port(), 10322);
    assert_eq!(session.method(), AuthMethod::Key);
    assert!(host.auth_attempts().iter().all(|(port, _)| *port == 10322));
}

#[tokio::test]
async fn test_rejected_key_falls_back_to_password() {
    let host = FakeHost::fresh();
    let connector = host.connector();
    let (_dir, creds) = credentials(true);

    let session = ConnectionNegotiator::new(&connector)
        .negotiate(common::HOST, &creds, &[22, 10322])
        .await
        .expect("negotiation");

    assert_eq!(session.port(), 22);
    assert_eq!(session.method(), AuthMethod::Password);
    assert_eq!(
        host.auth_attempts(),
        vec![(22, AuthMethod::Key), (22, AuthMethod::Password)]
    );
}

#[tokio::test]
async fn test_missing_key_goes_straight_to_password() {
    let host = FakeHost::fresh();
    let connector = host.connector();
    let (_dir, creds) = credentials(false);

    let session = ConnectionNegotiator::new(&connector)
        .negotiate(common::HOST, &creds, &[22])
        .await
        .expect("negotiation");

    assert_eq!(session.method(), AuthMethod::Password);
    assert_eq!(host.auth_attempts(), vec![(22, AuthMethod::Password)]);
}

#[tokio::test]
async fn test_both_methods_rejected() {
    let host = FakeHost::fresh();
    let connector = host.connector();
    let (_dir, creds) = credentials(true);
    let creds = creds.with_password(Some("wrong".to_string()));

    let err = ConnectionNegotiator::new(&connector)
        .negotiate(common::HOST, &creds, &[22, 10322])
        .await
        .unwrap_err();

    assert!(matches!(err, SetupError::Authentication(_)), "{err}");
    assert_eq!(err.exit_code(), 4);
}

#[tokio::test]
async fn test_no_password_configured_after_key_rejection() {
    let host = FakeHost::fresh();
    let connector = host.connector();
    let (_dir, creds) = credentials(true);
    let creds = creds.with_password(Some(String::new()));

    let err = ConnectionNegotiator::new(&connector)
        .negotiate(common::HOST, &creds, &[22])
        .await
        .unwrap_err();

    assert!(err.to_string().contains("no admin password"), "{err}");
    assert_eq!(host.auth_attempts(), vec![(22, AuthMethod::Key)]);
}

#[tokio::test]
async fn test_unreachable_host_reports_every_port_tried() {
    let host = FakeHost::with_ports(&[]);
    let connector = host.connector();
    let (_dir, creds) = credentials(false);

    let err = ConnectionNegotiator::new(&connector)
        .negotiate(common::HOST, &creds, &[22, 10322, 22])
        .await
        .unwrap_err();

    match err {
        SetupError::Connectivity { ref ports, .. } => assert_eq!(ports, &vec![22, 10322]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(host.auth_attempts().is_empty());
}
