// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::time::{Duration, Instant};

use der::Encode;
use host_identity::csr::find_common_name;
use host_identity::scep::message::FailInfo;
use host_identity::scep::pkcs7::ContentCipher;
use host_identity::store::{is_expired, MetadataStore};
use host_identity::validator::public_key_matches;
use host_identity::{
    load_credentials, setup, CancellationToken, EccAlgorithm, Error, PollPolicy,
};

use common::{FakeCa, Reply, COMMON_NAME, MODERN_CAPS};

#[tokio::test]
async fn test_fresh_enrollment_writes_key_and_cert() {
    let ca = FakeCa::start(MODERN_CAPS, vec![]).await;
    let dir = tempfile::tempdir().unwrap();
    let config = ca.config(dir.path(), false);

    let credentials = setup(&config, &CancellationToken::new()).await.unwrap();

    let store = MetadataStore::new(dir.path());
    assert!(store.key_path().exists());
    assert!(store.cert_path().exists());
    #[cfg(unix)]
    {
        assert_eq!(common::mode(&store.key_path()), 0o600);
        assert_eq!(common::mode(&store.cert_path()), 0o600);
    }

    let cert = credentials.certificate();
    assert_eq!(
        find_common_name(&cert.tbs_certificate.subject).as_deref(),
        Some(COMMON_NAME)
    );
    assert_eq!(credentials.ecc_algorithm(), EccAlgorithm::P384);
    assert!(public_key_matches(credentials.public_key(), cert));
    assert_eq!(store.read_cert().unwrap(), *cert);

    let seen = ca.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "POST");
    assert_eq!(seen[0].cipher, ContentCipher::Aes128Cbc);
    assert_eq!(seen[0].common_name.as_deref(), Some(COMMON_NAME));
    credentials.close().unwrap();
}

#[tokio::test]
async fn test_p256_only_tee_gets_p256_key() {
    let ca = FakeCa::start(MODERN_CAPS, vec![]).await;
    let dir = tempfile::tempdir().unwrap();

    let credentials = setup(&ca.config(dir.path(), true), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(credentials.ecc_algorithm(), EccAlgorithm::P256);
    assert!(public_key_matches(
        credentials.public_key(),
        credentials.certificate()
    ));
}

#[tokio::test]
async fn test_restart_reuses_stored_identity() {
    let ca = FakeCa::start(MODERN_CAPS, vec![]).await;
    let dir = tempfile::tempdir().unwrap();
    let config = ca.config(dir.path(), true);
    let first = setup(&config, &CancellationToken::new()).await.unwrap();
    first.close().unwrap();

    let store = MetadataStore::new(dir.path());
    let key_before = std::fs::read(store.key_path()).unwrap();
    let cert_before = std::fs::read(store.cert_path()).unwrap();
    let key_mtime = std::fs::metadata(store.key_path()).unwrap().modified().unwrap();
    let cert_mtime = std::fs::metadata(store.cert_path()).unwrap().modified().unwrap();
    let requests = ca.http_requests();

    let second = setup(&config, &CancellationToken::new()).await.unwrap();

    assert_eq!(ca.http_requests(), requests);
    assert_eq!(
        second.certificate_der().unwrap(),
        first.certificate_der().unwrap()
    );
    assert_eq!(std::fs::read(store.key_path()).unwrap(), key_before);
    assert_eq!(std::fs::read(store.cert_path()).unwrap(), cert_before);
    assert_eq!(
        std::fs::metadata(store.key_path()).unwrap().modified().unwrap(),
        key_mtime
    );
    assert_eq!(
        std::fs::metadata(store.cert_path()).unwrap().modified().unwrap(),
        cert_mtime
    );
}

#[tokio::test]
async fn test_load_credentials_needs_no_network() {
    let ca = FakeCa::start(MODERN_CAPS, vec![]).await;
    let dir = tempfile::tempdir().unwrap();
    let config = ca.config(dir.path(), true);
    let enrolled = setup(&config, &CancellationToken::new()).await.unwrap();
    let requests = ca.http_requests();

    let loaded = load_credentials(&config).unwrap();
    assert_eq!(ca.http_requests(), requests);
    assert_eq!(loaded.certificate(), enrolled.certificate());
    assert_eq!(loaded.public_key(), enrolled.public_key());
}

#[tokio::test]
async fn test_corrupt_certificate_is_reenrolled() {
    let ca = FakeCa::start(MODERN_CAPS, vec![]).await;
    let dir = tempfile::tempdir().unwrap();
    let config = ca.config(dir.path(), true);
    let first = setup(&config, &CancellationToken::new()).await.unwrap();
    let key = first.public_key().clone();
    first.close().unwrap();

    let store = MetadataStore::new(dir.path());
    let garbage: Vec<u8> = (0..512u32).map(|i| (i * 7919 % 251) as u8).collect();
    std::fs::write(store.cert_path(), garbage).unwrap();

    let second = setup(&config, &CancellationToken::new()).await.unwrap();
    assert_eq!(ca.seen().len(), 2);
    assert_eq!(*second.public_key(), key);
    assert!(public_key_matches(&key, second.certificate()));
    assert_ne!(
        second.certificate().tbs_certificate.serial_number,
        first.certificate().tbs_certificate.serial_number
    );
    assert_eq!(store.read_cert().unwrap(), *second.certificate());
}

#[tokio::test]
async fn test_replaced_key_reports_mismatch_then_recovers() {
    let ca = FakeCa::start(MODERN_CAPS, vec![]).await;
    let dir = tempfile::tempdir().unwrap();
    let config = ca.config(dir.path(), true);
    let first = setup(&config, &CancellationToken::new()).await.unwrap();
    first.close().unwrap();

    let store = MetadataStore::new(dir.path());
    store.remove_key().unwrap();

    let err = match setup(&config, &CancellationToken::new()).await {
        Ok(_) => panic!("setup accepted a certificate for another key"),
        Err(e) => e,
    };
    assert!(matches!(err.root(), Error::KeyCertMismatch), "{err}");
    assert!(!store.cert_path().exists());
    assert!(store.key_path().exists());

    // The restart enrolls the new key.
    let third = setup(&config, &CancellationToken::new()).await.unwrap();
    assert!(public_key_matches(third.public_key(), third.certificate()));
    assert_ne!(third.public_key(), first.public_key());
    assert_eq!(ca.seen().len(), 2);
}

#[tokio::test]
async fn test_pending_then_success_with_default_backoff() {
    let ca = FakeCa::start(MODERN_CAPS, vec![Reply::Pending, Reply::Success]).await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = ca.config(dir.path(), true);
    config.scep.poll = PollPolicy::default();

    let started = Instant::now();
    let credentials = setup(&config, &CancellationToken::new()).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(60), "{elapsed:?}");
    assert!(public_key_matches(
        credentials.public_key(),
        credentials.certificate()
    ));

    let seen = ca.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].transaction_id, seen[1].transaction_id);
    assert_ne!(seen[0].sender_nonce, seen[1].sender_nonce);
}

#[tokio::test]
async fn test_repeated_pending_keeps_transaction() {
    let script = vec![Reply::Pending, Reply::Pending, Reply::Pending, Reply::Success];
    let ca = FakeCa::start(MODERN_CAPS, script).await;
    let dir = tempfile::tempdir().unwrap();

    setup(&ca.config(dir.path(), true), &CancellationToken::new())
        .await
        .unwrap();

    let seen = ca.seen();
    assert_eq!(seen.len(), 4);
    assert!(seen.iter().all(|r| r.transaction_id == seen[0].transaction_id));
    let mut nonces: Vec<_> = seen.iter().map(|r| r.sender_nonce.clone()).collect();
    nonces.sort();
    nonces.dedup();
    assert_eq!(nonces.len(), 4);
}

#[tokio::test]
async fn test_endless_pending_hits_deadline() {
    let ca = FakeCa::start(MODERN_CAPS, vec![Reply::Pending]).await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = ca.config(dir.path(), true);
    config.scep.poll.deadline_secs = 1;

    let err = match setup(&config, &CancellationToken::new()).await {
        Ok(_) => panic!("enrollment completed against a pending CA"),
        Err(e) => e,
    };
    assert!(matches!(err.root(), Error::DeadlineExceeded), "{err}");
    assert!(!MetadataStore::new(dir.path()).cert_path().exists());
}

#[tokio::test]
async fn test_failure_reports_fail_info() {
    let ca = FakeCa::start(MODERN_CAPS, vec![Reply::Failure(FailInfo::BadRequest)]).await;
    let dir = tempfile::tempdir().unwrap();

    let err = match setup(&ca.config(dir.path(), true), &CancellationToken::new()).await {
        Ok(_) => panic!("enrollment succeeded against a refusing CA"),
        Err(e) => e,
    };
    match err.root() {
        Error::ScepFailure { info } => {
            assert!(info.starts_with("badRequest"), "{info}");
            assert!(info.contains("request refused by test CA"), "{info}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!MetadataStore::new(dir.path()).cert_path().exists());
    // The key is kept for the next attempt.
    assert!(MetadataStore::new(dir.path()).key_path().exists());
}

#[tokio::test]
async fn test_wrong_challenge_is_refused() {
    let ca = FakeCa::start(MODERN_CAPS, vec![]).await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = ca.config(dir.path(), true);
    config.scep.challenge_password = "not-the-secret".into();

    let err = match setup(&config, &CancellationToken::new()).await {
        Ok(_) => panic!("CA accepted a wrong challenge"),
        Err(e) => e,
    };
    assert!(
        matches!(err.root(), Error::ScepFailure { info } if info.starts_with("badRequest")),
        "{err}"
    );
}

#[tokio::test]
async fn test_legacy_ca_uses_get_and_des3() {
    let ca = FakeCa::start("", vec![]).await;
    let dir = tempfile::tempdir().unwrap();

    let credentials = setup(&ca.config(dir.path(), true), &CancellationToken::new())
        .await
        .unwrap();
    assert!(public_key_matches(
        credentials.public_key(),
        credentials.certificate()
    ));

    let seen = ca.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "GET");
    assert_eq!(seen[0].cipher, ContentCipher::DesEde3Cbc);
}

#[tokio::test]
async fn test_expired_certificate_is_reenrolled() {
    let ca = FakeCa::start(MODERN_CAPS, vec![Reply::SuccessExpired, Reply::Success]).await;
    let dir = tempfile::tempdir().unwrap();
    let config = ca.config(dir.path(), true);

    let first = setup(&config, &CancellationToken::new()).await.unwrap();
    assert!(is_expired(first.certificate(), std::time::SystemTime::now()));
    first.close().unwrap();

    let second = setup(&config, &CancellationToken::new()).await.unwrap();
    assert_eq!(ca.seen().len(), 2);
    assert!(!is_expired(second.certificate(), std::time::SystemTime::now()));
    assert_eq!(second.public_key(), first.public_key());
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let ca = FakeCa::start(MODERN_CAPS, vec![]).await;
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = match setup(&ca.config(dir.path(), true), &cancel).await {
        Ok(_) => panic!("setup ignored cancellation"),
        Err(e) => e,
    };
    assert!(matches!(err.root(), Error::Cancelled), "{err}");
    assert_eq!(ca.http_requests(), 0);
}

#[tokio::test]
async fn test_cancel_while_pending() {
    let ca = FakeCa::start(MODERN_CAPS, vec![Reply::Pending]).await;
    let dir = tempfile::tempdir().unwrap();
    let config = ca.config(dir.path(), true);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = match setup(&config, &cancel).await {
        Ok(_) => panic!("enrollment completed against a pending CA"),
        Err(e) => e,
    };
    assert!(matches!(err.root(), Error::Cancelled), "{err}");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!MetadataStore::new(dir.path()).cert_path().exists());
}

#[tokio::test]
async fn test_certificate_persists_as_pem() {
    let ca = FakeCa::start(MODERN_CAPS, vec![]).await;
    let dir = tempfile::tempdir().unwrap();
    let credentials = setup(&ca.config(dir.path(), true), &CancellationToken::new())
        .await
        .unwrap();

    let store = MetadataStore::new(dir.path());
    let pem = store.read_cert_pem().unwrap();
    assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    assert_eq!(
        store.read_cert().unwrap().to_der().unwrap(),
        credentials.certificate_der().unwrap()
    );
    assert_eq!(credentials.cert_path(), store.cert_path());
}
