use axum::{
    Router,
    routing::{delete, get, post},
};
use http::{HeaderName, HeaderValue, Method, header};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::extractors::{USER_EMAIL_HEADER, USER_ID_HEADER, USER_ROLE_HEADER};
use crate::handlers;
use crate::state::AppState;

/// Router の構築
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins());

    let router = Router::new()
        .route("/api/health", get(handlers::health_check))
        // 二要素認証
        .route("/api/2fa/enable", post(handlers::enable_2fa))
        .route("/api/2fa/qr-code", get(handlers::qr_code))
        .route("/api/2fa/verify-setup", post(handlers::verify_setup))
        .route("/api/2fa/disable", post(handlers::disable_2fa))
        .route("/api/2fa/verify", post(handlers::verify_2fa))
        .route("/api/2fa/status", get(handlers::status))
        // バックアップコード
        .route(
            "/api/2fa/backup-codes/generate",
            post(handlers::generate_backup_codes),
        )
        .route(
            "/api/2fa/backup-codes/remaining",
            get(handlers::remaining_backup_codes),
        )
        // 信頼済みデバイス
        .route("/api/2fa/devices", get(handlers::list_devices))
        .route("/api/2fa/devices/verify", post(handlers::verify_device))
        .route("/api/2fa/devices/{device_id}", delete(handlers::revoke_device))
        // 監査
        .route("/api/2fa/audit", get(handlers::list_audit_events))
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri().path(),
                )
            },
        ));

    match cors {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

/// 許可オリジンが設定されている場合のみ CORS を有効化
fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(origin = %origin, error = %e, "不正なCORSオリジンを無視");
                None
            }
        })
        .collect();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([
                header::CONTENT_TYPE,
                HeaderName::from_static(USER_ID_HEADER),
                HeaderName::from_static(USER_EMAIL_HEADER),
                HeaderName::from_static(USER_ROLE_HEADER),
            ]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use time::OffsetDateTime;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::config::Config;
    use crate::models::{AuditEventKind, AuditOutcome};
    use crate::repositories::memory::MemoryStore;
    use crate::services::TotpService;
    use crate::services::audit::RecordingAuditSink;
    use crate::services::auth::StaticCredentials;
    use crate::state::StateParts;

    const ENCRYPTION_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";
    const PASSWORD: &str = "correct horse battery";

    struct TestApp {
        router: Router,
        store: Arc<MemoryStore>,
        audit: Arc<RecordingAuditSink>,
        totp: TotpService,
    }

    fn test_config(store_timeout_ms: u64) -> Config {
        envy::from_iter([
            ("DATABASE_URL".to_string(), "postgres://localhost/factorgate".to_string()),
            ("TOTP_ISSUER".to_string(), "Governance".to_string()),
            ("ENCRYPTION_KEY".to_string(), ENCRYPTION_KEY.to_string()),
            ("STORE_TIMEOUT_MS".to_string(), store_timeout_ms.to_string()),
        ])
        .unwrap()
    }

    fn test_app_with(store_timeout_ms: u64) -> TestApp {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(RecordingAuditSink::new());
        let state = AppState::from_parts(
            test_config(store_timeout_ms),
            StateParts {
                profiles: store.clone(),
                devices: store.clone(),
                audit_events: store.clone(),
                credentials: Arc::new(StaticCredentials {
                    password: Some(PASSWORD.to_string()),
                }),
                audit_sink: audit.clone(),
            },
        )
        .unwrap();

        TestApp {
            router: create_router(state),
            store,
            audit,
            totp: TotpService::new("Governance".to_string(), ENCRYPTION_KEY, 6, 30).unwrap(),
        }
    }

    fn test_app() -> TestApp {
        test_app_with(1000)
    }

    fn current_code(app: &TestApp, secret: &str) -> String {
        let now = OffsetDateTime::now_utc().unix_timestamp() as u64;
        app.totp.compute_totp(secret, now).unwrap()
    }

    fn request(method: Method, uri: &str, user_id: Option<Uuid>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("user-agent", "router-test")
            .header("x-forwarded-for", "192.0.2.10");
        if let Some(user_id) = user_id {
            builder = builder
                .header(USER_ID_HEADER, user_id.to_string())
                .header(USER_EMAIL_HEADER, "owner@example.com");
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    /// 有効化まで進め、enable のレスポンスを返す
    async fn enable(app: &TestApp, user_id: Uuid) -> Value {
        let (status, started) = send(app, request(Method::POST, "/api/2fa/enable", Some(user_id), None)).await;
        assert_eq!(status, StatusCode::OK);

        let code = current_code(app, started["totp_secret"].as_str().unwrap());
        let (status, body) = send(
            app,
            request(
                Method::POST,
                "/api/2fa/verify-setup",
                Some(user_id),
                Some(json!({ "totp_code": code })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["enabled_at"].is_string());
        started
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app();
        let (status, body) = send(&app, request(Method::GET, "/api/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthorized() {
        let app = test_app();
        let (status, body) = send(&app, request(Method::GET, "/api/2fa/status", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_enable_and_qr_code() {
        let app = test_app();
        let user_id = Uuid::new_v4();

        let (status, _) = send(&app, request(Method::GET, "/api/2fa/qr-code", Some(user_id), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, request(Method::POST, "/api/2fa/enable", Some(user_id), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backup_codes"].as_array().unwrap().len(), 10);
        assert!(
            body["provisioning_uri"]
                .as_str()
                .unwrap()
                .starts_with("otpauth://totp/")
        );

        let response = app
            .router
            .clone()
            .oneshot(request(Method::GET, "/api/2fa/qr-code", Some(user_id), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");

        let (status, body) = send(&app, request(Method::GET, "/api/2fa/status", Some(user_id), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], false);
        assert_eq!(body["setup_started"], true);
    }

    #[tokio::test]
    async fn test_wrong_setup_code_is_generic_bad_request() {
        let app = test_app();
        let user_id = Uuid::new_v4();
        send(&app, request(Method::POST, "/api/2fa/enable", Some(user_id), None)).await;

        let (status, body) = send(
            &app,
            request(
                Method::POST,
                "/api/2fa/verify-setup",
                Some(user_id),
                Some(json!({ "totp_code": "000000" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "認証コードが正しくありません");
        assert_eq!(
            app.audit
                .count(AuditEventKind::EnrollmentVerified, AuditOutcome::Failure),
            1
        );
    }

    #[tokio::test]
    async fn test_full_two_factor_flow() {
        let app = test_app();
        let user_id = Uuid::new_v4();
        let started = enable(&app, user_id).await;
        let backup_code = started["backup_codes"][0].as_str().unwrap().to_string();

        // 有効化後の再登録は不可
        let (status, _) = send(&app, request(Method::POST, "/api/2fa/enable", Some(user_id), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // バックアップコードでログインし、デバイスを信頼
        let (status, body) = send(
            &app,
            request(
                Method::POST,
                "/api/2fa/verify",
                Some(user_id),
                Some(json!({
                    "backup_code": backup_code,
                    "trust_device": true,
                    "device_name": "Work laptop",
                    "device_fingerprint": "fp-laptop",
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["verified"], true);
        assert_eq!(body["method"], "backup_code");
        assert_eq!(body["backup_codes_remaining"], 9);
        assert_eq!(body["backup_codes_low"], false);
        let device_token = body["device_token"].as_str().unwrap().to_string();
        assert!(body["device_expires_at"].is_string());

        // 同じバックアップコードは拒否
        let (status, body) = send(
            &app,
            request(
                Method::POST,
                "/api/2fa/verify",
                Some(user_id),
                Some(json!({ "backup_code": backup_code })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["verified"], false);

        // TOTP でもログインできる
        let code = current_code(&app, started["totp_secret"].as_str().unwrap());
        let (status, body) = send(
            &app,
            request(
                Method::POST,
                "/api/2fa/verify",
                Some(user_id),
                Some(json!({ "totp_code": code })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["method"], "totp");
        assert!(body.get("device_token").is_none());

        // 信頼済みデバイス
        let (status, body) = send(
            &app,
            request(
                Method::POST,
                "/api/2fa/devices/verify",
                Some(user_id),
                Some(json!({ "device_token": device_token, "device_fingerprint": "fp-laptop" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["trusted"], true);

        let (status, body) = send(
            &app,
            request(
                Method::POST,
                "/api/2fa/devices/verify",
                Some(user_id),
                Some(json!({ "device_token": device_token, "device_fingerprint": "fp-other" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["trusted"], false);

        let (status, body) = send(&app, request(Method::GET, "/api/2fa/devices", Some(user_id), None)).await;
        assert_eq!(status, StatusCode::OK);
        let devices = body["devices"].as_array().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0]["device_name"], "Work laptop");
        assert_eq!(devices[0]["is_expired"], false);
        assert!(devices[0].get("device_fingerprint").is_none());

        let (status, body) = send(
            &app,
            request(Method::GET, "/api/2fa/backup-codes/remaining", Some(user_id), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["remaining"], 9);
        assert_eq!(body["total"], 10);

        // 無効化で信頼済みデバイスも失効
        let (status, _) = send(
            &app,
            request(
                Method::POST,
                "/api/2fa/disable",
                Some(user_id),
                Some(json!({ "confirmation_password": PASSWORD })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(
            &app,
            request(
                Method::POST,
                "/api/2fa/devices/verify",
                Some(user_id),
                Some(json!({ "device_token": device_token, "device_fingerprint": "fp-laptop" })),
            ),
        )
        .await;
        assert_eq!(body["trusted"], false);

        let (_, body) = send(&app, request(Method::GET, "/api/2fa/status", Some(user_id), None)).await;
        assert_eq!(body["enabled"], false);
    }

    #[tokio::test]
    async fn test_device_issue_failure_keeps_verification() {
        let app = test_app();
        let user_id = Uuid::new_v4();
        let started = enable(&app, user_id).await;
        let backup_code = started["backup_codes"][0].as_str().unwrap().to_string();

        app.store.set_device_inserts_failing(true);
        let (status, body) = send(
            &app,
            request(
                Method::POST,
                "/api/2fa/verify",
                Some(user_id),
                Some(json!({
                    "backup_code": backup_code,
                    "trust_device": true,
                    "device_fingerprint": "fp-phone",
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["verified"], true);
        assert_eq!(body["method"], "backup_code");
        assert_eq!(body["backup_codes_remaining"], 9);
        assert!(body["device_token"].is_null());

        app.store.set_device_inserts_failing(false);
        let (status, body) = send(
            &app,
            request(Method::GET, "/api/2fa/backup-codes/remaining", Some(user_id), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["remaining"], 9);
    }

    #[tokio::test]
    async fn test_remaining_without_two_factor_is_zero() {
        let app = test_app();
        let (status, body) = send(
            &app,
            request(Method::GET, "/api/2fa/backup-codes/remaining", Some(Uuid::new_v4()), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["remaining"], 0);
        assert_eq!(body["low"], false);
    }

    #[tokio::test]
    async fn test_disable_without_confirmation() {
        let app = test_app();
        let user_id = Uuid::new_v4();
        enable(&app, user_id).await;

        let (status, _) = send(
            &app,
            request(Method::POST, "/api/2fa/disable", Some(user_id), Some(json!({}))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            request(
                Method::POST,
                "/api/2fa/disable",
                Some(user_id),
                Some(json!({ "confirmation_password": "guess" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "確認情報が正しくありません");
    }

    #[tokio::test]
    async fn test_regenerate_backup_codes() {
        let app = test_app();
        let user_id = Uuid::new_v4();
        let started = enable(&app, user_id).await;

        let (status, body) = send(
            &app,
            request(Method::POST, "/api/2fa/backup-codes/generate", Some(user_id), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backup_codes"].as_array().unwrap().len(), 10);

        let old_code = started["backup_codes"][0].clone();
        let (status, _) = send(
            &app,
            request(
                Method::POST,
                "/api/2fa/verify",
                Some(user_id),
                Some(json!({ "backup_code": old_code })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_revoke_device_scoping() {
        let app = test_app();
        let user_id = Uuid::new_v4();

        let (status, _) = send(
            &app,
            request(
                Method::DELETE,
                &format!("/api/2fa/devices/{}", Uuid::new_v4()),
                Some(user_id),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_verify_before_enable_is_rejected() {
        let app = test_app();
        let user_id = Uuid::new_v4();

        let (status, _) = send(
            &app,
            request(
                Method::POST,
                "/api/2fa/verify",
                Some(user_id),
                Some(json!({ "totp_code": "123456" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            request(Method::POST, "/api/2fa/verify", Some(user_id), Some(json!({}))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let app = test_app_with(50);
        let user_id = Uuid::new_v4();
        let started = enable(&app, user_id).await;
        let code = current_code(&app, started["totp_secret"].as_str().unwrap());

        app.store.set_latency(Duration::from_millis(300));
        let (status, body) = send(
            &app,
            request(
                Method::POST,
                "/api/2fa/verify",
                Some(user_id),
                Some(json!({ "totp_code": code })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.get("verified").is_none());

        app.store.set_latency(Duration::ZERO);
        app.store.set_unavailable(true);
        let (status, _) = send(
            &app,
            request(
                Method::POST,
                "/api/2fa/verify",
                Some(user_id),
                Some(json!({ "totp_code": code })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_audit_listing_requires_capability_for_others() {
        let app = test_app();
        let user_id = Uuid::new_v4();
        let other = Uuid::new_v4();

        let (status, body) = send(&app, request(Method::GET, "/api/2fa/audit", Some(user_id), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["events"].is_array());

        let uri = format!("/api/2fa/audit?user_id={}", other);
        let (status, _) = send(&app, request(Method::GET, &uri, Some(user_id), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let mut admin_request = request(Method::GET, &uri, Some(user_id), None);
        admin_request
            .headers_mut()
            .insert(USER_ROLE_HEADER, HeaderValue::from_static("auditor"));
        let (status, _) = send(&app, admin_request).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn test_cors_layer_only_with_origins() {
        assert!(cors_layer(&[]).is_none());
        assert!(cors_layer(&["https://portal.example.com".to_string()]).is_some());
    }
}
