use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode, header},
};
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use smpl_server::{
    build_router,
    catalog::{Catalog, seed_catalog},
    config::{Config, TwilioConfig},
    database::{DatabaseClient, DatabaseError, DbResult},
    memory::MemoryDatabase,
    models::{Category, Service, User, UserService},
    provider::{AuthProvider, ConsoleProvider, TwilioVerify},
    session::SessionSigner,
    state::State,
};
use tower::ServiceExt;
use uuid::Uuid;

const SECRET: &str = "0123456789abcdef0123456789abcdef";
const PHONE: &str = "+15551234567";

fn test_config() -> Config {
    Config::from_lookup(|key| {
        let value = match key {
            "AUTH_PROVIDER" => "console",
            "STORAGE_BACKEND" => "memory",
            "SESSION_SECRET" => SECRET,
            "SECRETS_DIR" => "/nonexistent",
            "COOKIE_SECURE" => "false",
            _ => return None,
        };
        Some(value.to_string())
    })
    .expect("test config")
}

/// Memory storage whose ping and selection writes can be made to fail.
#[derive(Default)]
struct FaultyDatabase {
    inner: MemoryDatabase,
    ping_fails: AtomicBool,
    writes_fail: AtomicBool,
}

impl FaultyDatabase {
    fn outage() -> DatabaseError {
        DatabaseError::Redis(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection refused",
        )))
    }

    fn check_writes(&self) -> DbResult<()> {
        if self.writes_fail.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }

        Ok(())
    }
}

#[async_trait]
impl DatabaseClient for FaultyDatabase {
    async fn ping(&self) -> DbResult<()> {
        if self.ping_fails.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }

        self.inner.ping().await
    }

    async fn find_user_by_phone(&self, phone_number: &str) -> DbResult<Option<User>> {
        self.inner.find_user_by_phone(phone_number).await
    }

    async fn get_user(&self, user_id: Uuid) -> DbResult<Option<User>> {
        self.inner.get_user(user_id).await
    }

    async fn create_user(&self, phone_number: &str, now: DateTime<Utc>) -> DbResult<User> {
        self.inner.create_user(phone_number, now).await
    }

    async fn record_login(&self, user_id: Uuid, at: DateTime<Utc>) -> DbResult<User> {
        self.inner.record_login(user_id, at).await
    }

    async fn upsert_category(&self, category: &Category) -> DbResult<()> {
        self.inner.upsert_category(category).await
    }

    async fn upsert_service(&self, service: &Service) -> DbResult<()> {
        self.inner.upsert_service(service).await
    }

    async fn list_categories(&self) -> DbResult<Vec<Category>> {
        self.inner.list_categories().await
    }

    async fn get_category(&self, category_id: &str) -> DbResult<Option<Category>> {
        self.inner.get_category(category_id).await
    }

    async fn list_services(&self, category_id: Option<&str>) -> DbResult<Vec<Service>> {
        self.inner.list_services(category_id).await
    }

    async fn get_services(&self, service_ids: &[String]) -> DbResult<Vec<Service>> {
        self.inner.get_services(service_ids).await
    }

    async fn list_user_services(&self, user_id: Uuid) -> DbResult<Vec<UserService>> {
        self.inner.list_user_services(user_id).await
    }

    async fn add_user_services(
        &self,
        user_id: Uuid,
        service_ids: &[String],
        at: DateTime<Utc>,
    ) -> DbResult<Vec<UserService>> {
        self.check_writes()?;
        self.inner.add_user_services(user_id, service_ids, at).await
    }

    async fn remove_user_services(&self, user_id: Uuid, service_ids: &[String]) -> DbResult<usize> {
        self.check_writes()?;
        self.inner.remove_user_services(user_id, service_ids).await
    }

    async fn replace_user_services(
        &self,
        user_id: Uuid,
        add: &[String],
        remove: &[String],
        at: DateTime<Utc>,
    ) -> DbResult<Vec<UserService>> {
        self.check_writes()?;
        self.inner.replace_user_services(user_id, add, remove, at).await
    }
}

async fn app_with(database: Arc<dyn DatabaseClient>, provider: Arc<dyn AuthProvider>) -> Router {
    seed_catalog(database.as_ref(), &Catalog::bundled().expect("catalog"))
        .await
        .expect("seed catalog");

    let state = State::with_parts(test_config(), database, provider).expect("state");

    build_router(state)
}

async fn test_app() -> (Router, Arc<ConsoleProvider>) {
    let provider = Arc::new(ConsoleProvider::new());
    let app = app_with(Arc::new(MemoryDatabase::new()), provider.clone()).await;

    (app, provider)
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    cookie: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Value) {
    let mut request = Request::builder().method(method).uri(uri);

    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }

    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();

    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };

    (status, headers, json)
}

/// Signs in through the public endpoints and returns the session cookie pair.
async fn sign_in(app: &Router, provider: &ConsoleProvider) -> (String, Value) {
    let (status, _, _) = call(
        app,
        Method::POST,
        "/api/auth/send-code",
        None,
        Some(json!({ "phoneNumber": "(555) 123-4567" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let code = provider.pending_code(PHONE).unwrap();
    let (status, headers, body) = call(
        app,
        Method::POST,
        "/api/auth/verify-code",
        None,
        Some(json!({ "phoneNumber": PHONE, "code": code })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let set_cookie = headers[header::SET_COOKIE].to_str().unwrap();
    assert!(set_cookie.contains("HttpOnly"));
    let cookie = set_cookie.split(';').next().unwrap().to_string();

    (cookie, body)
}

#[tokio::test]
async fn health_reports_ok() {
    let (app, _) = test_app().await;

    let (status, _, body) = call(&app, Method::GET, "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn health_reports_database_outage() {
    let database = Arc::new(FaultyDatabase::default());
    let app = app_with(database.clone(), Arc::new(ConsoleProvider::new())).await;
    database.ping_fails.store(true, Ordering::SeqCst);

    let (status, _, body) = call(&app, Method::GET, "/health", None, None).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unavailable");
}

#[tokio::test]
async fn provider_outage_hides_upstream_detail() {
    let twilio = TwilioVerify::new(TwilioConfig {
        account_sid: "AC0000000000000000000000000000000".to_string(),
        verify_service_sid: "VA0000000000000000000000000000000".to_string(),
        auth_token: "token".to_string(),
        base_url: "http://127.0.0.1:1".to_string(),
    })
    .unwrap();
    let app = app_with(Arc::new(MemoryDatabase::new()), Arc::new(twilio)).await;

    let (status, _, body) = call(
        &app,
        Method::POST,
        "/api/auth/send-code",
        None,
        Some(json!({ "phoneNumber": PHONE })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "Verification provider unavailable");

    let body = body.to_string();
    assert!(!body.contains("127.0.0.1"));
    assert!(!body.contains("VA0000000000000000000000000000000"));
}

#[tokio::test]
async fn send_code_validates_input() {
    let (app, _) = test_app().await;

    let (status, _, body) = call(
        &app,
        Method::POST,
        "/api/auth/send-code",
        None,
        Some(json!({ "phoneNumber": "call me maybe" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid phone number");

    let (status, _, body) = call(
        &app,
        Method::POST,
        "/api/auth/send-code",
        None,
        Some(json!({ "phone": PHONE })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Malformed payload");
}

#[tokio::test]
async fn send_code_is_rate_limited() {
    let (app, _) = test_app().await;

    for _ in 0..3 {
        let (status, _, body) = call(
            &app,
            Method::POST,
            "/api/auth/send-code",
            None,
            Some(json!({ "phoneNumber": "555-123-4567" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phoneNumber"], PHONE);
    }

    let (status, headers, _) = call(
        &app,
        Method::POST,
        "/api/auth/send-code",
        None,
        Some(json!({ "phoneNumber": PHONE })),
    )
    .await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = headers[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0 && retry_after <= 600);
}

#[tokio::test]
async fn wrong_code_is_rejected() {
    let (app, provider) = test_app().await;

    call(
        &app,
        Method::POST,
        "/api/auth/send-code",
        None,
        Some(json!({ "phoneNumber": PHONE })),
    )
    .await;
    let code = provider.pending_code(PHONE).unwrap();
    let wrong = if code == "000000" { "111111" } else { "000000" };

    let (status, headers, _) = call(
        &app,
        Method::POST,
        "/api/auth/verify-code",
        None,
        Some(json!({ "phoneNumber": PHONE, "code": wrong })),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(headers.get(header::SET_COOKIE).is_none());

    let (status, _, _) = call(
        &app,
        Method::POST,
        "/api/auth/verify-code",
        None,
        Some(json!({ "phoneNumber": PHONE, "code": "12" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sign_in_then_session() {
    let (app, provider) = test_app().await;

    let (cookie, body) = sign_in(&app, &provider).await;
    assert_eq!(body["isNewUser"], true);
    assert_eq!(body["user"]["phoneNumber"], PHONE);

    let (status, _, session) =
        call(&app, Method::GET, "/api/auth/session", Some(&cookie), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["user"]["id"], body["user"]["id"]);

    let (_, again) = sign_in(&app, &provider).await;
    assert_eq!(again["isNewUser"], false);
    assert_eq!(again["user"]["id"], body["user"]["id"]);
}

#[tokio::test]
async fn user_routes_require_session() {
    let (app, _) = test_app().await;

    for (method, uri) in [
        (Method::GET, "/api/auth/session"),
        (Method::GET, "/api/user/services"),
        (Method::GET, "/api/user/progress"),
        (Method::DELETE, "/api/user/services/netflix"),
    ] {
        let (status, _, body) = call(&app, method, uri, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
        assert_eq!(body["error"], "Not signed in");
    }

    let forged = "smpl_session=3f2a1d6e-2c1b-4b55-9a55-5b3e0e1b9a77.9999999999.deadbeef";
    let (status, _, _) = call(&app, Method::GET, "/api/user/progress", Some(forged), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn session_for_missing_user_is_rejected() {
    let (app, _) = test_app().await;
    let signer = SessionSigner::new(SECRET, chrono::Duration::days(1), false).unwrap();
    let token = signer.issue(Uuid::new_v4(), Utc::now());
    let cookie = format!("smpl_session={token}");

    let (status, _, body) =
        call(&app, Method::GET, "/api/user/progress", Some(&cookie), None).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Not signed in");
}

#[tokio::test]
async fn logout_clears_cookie() {
    let (app, _) = test_app().await;

    let (status, headers, _) = call(&app, Method::POST, "/api/auth/logout", None, None).await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    let set_cookie = headers[header::SET_COOKIE].to_str().unwrap();
    assert!(set_cookie.starts_with("smpl_session=;"));
    assert!(set_cookie.contains("Max-Age=0"));
}

#[tokio::test]
async fn catalog_endpoints() {
    let (app, _) = test_app().await;

    let (status, _, categories) = call(&app, Method::GET, "/api/categories", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let categories = categories.as_array().unwrap();
    assert_eq!(categories.len(), 4);
    assert_eq!(categories[0]["id"], "streaming");
    assert_eq!(categories[0]["services"][0]["id"], "netflix");

    let (status, _, internet) =
        call(&app, Method::GET, "/api/categories/internet", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(internet["name"], "Internet");
    assert_eq!(internet["services"].as_array().unwrap().len(), 4);

    let (status, _, _) = call(&app, Method::GET, "/api/categories/groceries", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, services) = call(
        &app,
        Method::GET,
        "/api/services?categoryId=phone-carriers",
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let services = services.as_array().unwrap();
    assert!(!services.is_empty());
    assert!(services.iter().all(|s| s["categoryId"] == "phone-carriers"));
}

#[tokio::test]
async fn selections_drive_progress() {
    let (app, provider) = test_app().await;
    let (cookie, _) = sign_in(&app, &provider).await;
    let cookie = Some(cookie.as_str());

    let (status, _, progress) = call(&app, Method::GET, "/api/user/progress", cookie, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["completionPercentage"], 0);
    assert_eq!(progress["nextCategoryId"], "streaming");

    let (status, _, outcome) = call(
        &app,
        Method::POST,
        "/api/user/services",
        cookie,
        Some(json!({ "serviceIds": ["netflix", "hulu", "netflix"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["added"], json!(["netflix", "hulu"]));
    assert_eq!(outcome["alreadySelected"], json!([]));

    let (_, _, progress) = call(&app, Method::GET, "/api/user/progress", cookie, None).await;
    assert_eq!(progress["completionPercentage"], 25);
    assert_eq!(progress["categories"][0]["status"], "completed");
    assert_eq!(progress["categories"][0]["selectedServices"], 2);
    assert_eq!(progress["estimatedMonthlySpendCents"], 1549 + 999);

    let (status, _, selection) = call(
        &app,
        Method::PUT,
        "/api/user/categories/internet/services",
        cookie,
        Some(json!({ "serviceIds": ["xfinity"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(selection["added"], json!(["xfinity"]));

    let (_, _, progress) = call(&app, Method::GET, "/api/user/progress", cookie, None).await;
    assert_eq!(progress["completionPercentage"], 50);
    assert_eq!(progress["completedCategories"], 2);
    assert_eq!(progress["nextCategoryId"], "insurance");

    let (status, _, removed) = call(
        &app,
        Method::DELETE,
        "/api/user/services/xfinity",
        cookie,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(removed["removed"], true);

    let (_, _, selected) = call(&app, Method::GET, "/api/user/services", cookie, None).await;
    let selected: Vec<&str> = selected
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["service"]["id"].as_str().unwrap())
        .collect();
    assert_eq!(selected.len(), 2);
    assert!(selected.contains(&"netflix") && selected.contains(&"hulu"));
}

#[tokio::test]
async fn unknown_services_are_rejected() {
    let (app, provider) = test_app().await;
    let (cookie, _) = sign_in(&app, &provider).await;

    let (status, _, body) = call(
        &app,
        Method::POST,
        "/api/user/services",
        Some(&cookie),
        Some(json!({ "serviceIds": ["netflix", "blockbuster"] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Unknown services: blockbuster");

    let (status, _, _) = call(
        &app,
        Method::PUT,
        "/api/user/categories/streaming/services",
        Some(&cookie),
        Some(json!({ "serviceIds": ["geico"] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, _, selected) = call(&app, Method::GET, "/api/user/services", Some(&cookie), None).await;
    assert_eq!(selected, json!([]));
}

#[tokio::test]
async fn failed_category_update_keeps_previous_selections() {
    let database = Arc::new(FaultyDatabase::default());
    let provider = Arc::new(ConsoleProvider::new());
    let app = app_with(database.clone(), provider.clone()).await;
    let (cookie, _) = sign_in(&app, &provider).await;
    let cookie = Some(cookie.as_str());

    let (status, _, _) = call(
        &app,
        Method::PUT,
        "/api/user/categories/streaming/services",
        cookie,
        Some(json!({ "serviceIds": ["netflix", "hulu"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    database.writes_fail.store(true, Ordering::SeqCst);
    let (status, _, body) = call(
        &app,
        Method::PUT,
        "/api/user/categories/streaming/services",
        cookie,
        Some(json!({ "serviceIds": ["max"] })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Internal server error");

    database.writes_fail.store(false, Ordering::SeqCst);
    let (_, _, selected) = call(&app, Method::GET, "/api/user/services", cookie, None).await;
    let mut selected: Vec<&str> = selected
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["service"]["id"].as_str().unwrap())
        .collect();
    selected.sort_unstable();
    assert_eq!(selected, vec!["hulu", "netflix"]);
}
