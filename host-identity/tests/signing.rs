// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use host_identity::httpsig::{
    content_digest, keyid_from_serial, verify_headers, CONTENT_DIGEST, SIGNATURE,
    SIGNATURE_INPUT,
};
use host_identity::{setup, CancellationToken, Credentials, EcPublicKey, SignatureHeaders};
use reqwest::Url;

use common::{FakeCa, MODERN_CAPS};

const ECHO_BODY: &str = r#"{"k":"v"}"#;

async fn enrolled(dir: &std::path::Path) -> Credentials {
    let ca = FakeCa::start(MODERN_CAPS, vec![]).await;
    setup(&ca.config(dir, true), &CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_echo_request_headers() {
    let dir = tempfile::tempdir().unwrap();
    let credentials = enrolled(dir.path()).await;
    let signer = credentials.http_signer();

    let url = Url::parse("https://api.test/v1/echo").unwrap();
    let headers = signer
        .sign_parts("POST", &url, ECHO_BODY.as_bytes())
        .unwrap();

    assert_eq!(
        headers.content_digest,
        "sha-256=:ZmwaoC6AaMbVzB0ylQCUMsFnkL7CjsjOEZ0NGhjWExk=:"
    );
    let keyid = keyid_from_serial(&credentials.certificate().tbs_certificate.serial_number);
    assert_eq!(signer.keyid(), keyid);
    assert!(keyid.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    assert!(headers.signature_input.starts_with(
        r#"sig=("@method" "@authority" "@path" "@query" "content-digest");created="#
    ));
    assert!(headers
        .signature_input
        .contains(&format!(r#";keyid="{keyid}";"#)));
    assert_eq!(signer.algorithm(), "ecdsa-p256-sha256");

    let verified = verify_headers(
        "POST",
        &url,
        ECHO_BODY.as_bytes(),
        &headers,
        credentials.public_key(),
    )
    .unwrap();
    assert_eq!(verified.keyid, keyid);
    assert_eq!(verified.nonce.len(), 22);
}

#[tokio::test]
async fn test_nonces_differ_between_requests() {
    let dir = tempfile::tempdir().unwrap();
    let signer = enrolled(dir.path()).await.http_signer();
    let url = Url::parse("https://api.test/v1/echo").unwrap();

    let a = signer.sign_parts("POST", &url, b"").unwrap();
    let b = signer.sign_parts("POST", &url, b"").unwrap();
    assert_ne!(a.signature_input, b.signature_input);
    assert_eq!(a.content_digest, content_digest(b""));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_signing_with_one_key() {
    let dir = tempfile::tempdir().unwrap();
    let credentials = enrolled(dir.path()).await;
    let signer = credentials.http_signer();
    let key = credentials.public_key().clone();

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let signer = signer.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let url = Url::parse(&format!("https://api.test/v1/items/{i}?page={i}")).unwrap();
                let body = format!(r#"{{"item":{i}}}"#);
                let mut nonces = Vec::new();
                for _ in 0..8 {
                    let headers = signer.sign_parts("POST", &url, body.as_bytes()).unwrap();
                    let verified =
                        verify_headers("POST", &url, body.as_bytes(), &headers, &key).unwrap();
                    nonces.push(verified.nonce);
                }
                nonces
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for task in tasks {
        for nonce in task.await.unwrap() {
            assert!(seen.insert(nonce), "nonce reused across tasks");
        }
    }
    assert_eq!(seen.len(), 16 * 8);
    credentials.close().unwrap();
}

fn header_str(headers: &HeaderMap, name: &header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Verifies every request against the enrolled key, as a relying party would.
async fn echo(
    State(key): State<Arc<EcPublicKey>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let url = format!("http://{}{}", header_str(&headers, &header::HOST), uri);
    let url = match Url::parse(&url) {
        Ok(url) => url,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let signature = SignatureHeaders {
        content_digest: header_str(&headers, &CONTENT_DIGEST),
        signature_input: header_str(&headers, &SIGNATURE_INPUT),
        signature: header_str(&headers, &SIGNATURE),
    };
    match verify_headers(method.as_str(), &url, &body, &signature, &key) {
        Ok(verified) => Json(serde_json::json!({
            "keyid": verified.keyid,
            "body": String::from_utf8_lossy(&body),
        }))
        .into_response(),
        Err(e) => (StatusCode::UNAUTHORIZED, e.to_string()).into_response(),
    }
}

async fn start_echo(key: EcPublicKey) -> String {
    let app = Router::new()
        .route("/v1/echo", post(echo))
        .with_state(Arc::new(key));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/v1/echo")
}

#[tokio::test]
async fn test_signed_request_accepted_by_server() {
    let dir = tempfile::tempdir().unwrap();
    let credentials = enrolled(dir.path()).await;
    let signer = credentials.http_signer();
    let url = start_echo(credentials.public_key().clone()).await;

    let client = reqwest::Client::new();
    let mut request = client
        .post(format!("{url}?trace=1"))
        .body(ECHO_BODY)
        .build()
        .unwrap();
    signer.sign_request(&mut request).unwrap();
    let response = client.execute(request).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let reply: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(reply["keyid"], signer.keyid());
    assert_eq!(reply["body"], ECHO_BODY);
}

#[tokio::test]
async fn test_server_rejects_other_key() {
    let dir = tempfile::tempdir().unwrap();
    let signing = enrolled(dir.path()).await;
    let other_dir = tempfile::tempdir().unwrap();
    let other = enrolled(other_dir.path()).await;
    let url = start_echo(other.public_key().clone()).await;

    let client = reqwest::Client::new();
    let mut request = client.post(&url).body(ECHO_BODY).build().unwrap();
    signing.http_signer().sign_request(&mut request).unwrap();
    let response = client.execute(request).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_server_rejects_altered_body() {
    let dir = tempfile::tempdir().unwrap();
    let credentials = enrolled(dir.path()).await;
    let url = start_echo(credentials.public_key().clone()).await;
    let signer = credentials.http_signer();

    let client = reqwest::Client::new();
    let signed = signer
        .sign_parts("POST", &Url::parse(&url).unwrap(), ECHO_BODY.as_bytes())
        .unwrap();
    let response = client
        .post(&url)
        .header(CONTENT_DIGEST, signed.content_digest)
        .header(SIGNATURE_INPUT, signed.signature_input)
        .header(SIGNATURE, signed.signature)
        .body(r#"{"k":"w"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}
