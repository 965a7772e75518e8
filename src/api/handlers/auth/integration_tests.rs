use crate::{
    api::handlers::auth::{
        AuthConfig, AuthState, NoopRateLimiter, login,
        password::hash_password,
        types::LockedResponse,
        utils::{generate_token, hash_token},
    },
    api::handlers::oauth::storage as oauth_storage,
    test_support::postgres::PostgresContainer,
    totp::repo as totp_repo,
    webauthn::repo::{self as webauthn_repo, CounterCheck},
};
use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
    routing::post,
};
use serde_json::json;
use sqlx::{Connection, PgConnection, PgPool, Row, postgres::PgPoolOptions};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/db/sql/atesti.sql"));

struct TestContext {
    _postgres: PostgresContainer,
    pool: PgPool,
}

impl TestContext {
    async fn new() -> Result<Self> {
        let postgres = match PostgresContainer::start().await {
            Ok(postgres) => postgres,
            Err(err) => {
                eprintln!("Skipping integration test: {err}");
                return Err(err);
            }
        };
        postgres.wait_until_ready().await?;
        apply_schema(&postgres.dsn()).await?;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&postgres.dsn())
            .await
            .context("failed to connect test pool")?;

        Ok(Self {
            _postgres: postgres,
            pool,
        })
    }
}

async fn apply_schema(dsn: &str) -> Result<()> {
    let mut connection = PgConnection::connect(dsn)
        .await
        .context("failed to connect for schema setup")?;

    for (index, statement) in split_sql_statements(SCHEMA_SQL).iter().enumerate() {
        sqlx::query(statement)
            .execute(&mut connection)
            .await
            .with_context(|| format!("failed to execute schema statement {}", index + 1))?;
    }

    Ok(())
}

fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("--") {
            continue;
        }
        current.push_str(line);
        current.push('\n');

        if trimmed.ends_with(';') {
            let statement = current.trim();
            if !statement.is_empty() {
                statements.push(statement.to_string());
            }
            current.clear();
        }
    }

    statements
}

async fn insert_user(pool: &PgPool, username: &str, email: &str, password: &str) -> Result<Uuid> {
    let user_id = Uuid::new_v4();
    let password_hash = hash_password(password)?;
    let query = r"
        INSERT INTO users (id, username, email, password_hash)
        VALUES ($1, $2, $3, $4)
    ";
    sqlx::query(query)
        .bind(user_id)
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .execute(pool)
        .await
        .context("insert user")?;
    Ok(user_id)
}

async fn insert_application(pool: &PgPool, client_id: &str) -> Result<()> {
    let query = r"
        INSERT INTO applications (client_id, name, redirect_uris, allowed_scopes, enabled)
        VALUES ($1, 'Test app', $2, $3, TRUE)
    ";
    sqlx::query(query)
        .bind(client_id)
        .bind(vec!["https://app.example.com/callback".to_string()])
        .bind(vec!["openid".to_string()])
        .execute(pool)
        .await
        .context("insert application")?;
    Ok(())
}

async fn failed_logins(pool: &PgPool, user_id: Uuid) -> Result<i32> {
    let row = sqlx::query("SELECT failed_logins FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .context("read failed_logins")?;
    Ok(row.get("failed_logins"))
}

fn app_router(pool: PgPool) -> Router {
    let config = AuthConfig::new("https://atesti.dev".to_string());
    let state = Arc::new(AuthState::new(config, Arc::new(NoopRateLimiter)));
    Router::new()
        .route("/v1/auth/login", post(login::login))
        .layer(Extension(state))
        .layer(Extension(pool))
}

fn login_request(identifier: &str, password: &str) -> Result<Request<Body>> {
    let payload = json!({ "identifier": identifier, "password": password }).to_string();
    Request::builder()
        .method("POST")
        .uri("/v1/auth/login")
        .header("Content-Type", "application/json")
        .body(Body::from(payload))
        .context("build login request")
}

#[tokio::test]
async fn fifth_failure_locks_the_account() -> Result<()> {
    let Ok(ctx) = TestContext::new().await else {
        return Ok(());
    };

    let email = "lockout@example.com";
    insert_user(&ctx.pool, "lockout", email, "correct-horse").await?;
    let app = app_router(ctx.pool.clone());

    // Four wrong passwords answer a uniform 401.
    for _ in 0..4 {
        let response = app
            .clone()
            .oneshot(login_request(email, "wrong-password")?)
            .await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // The fifth crosses the threshold and locks.
    let response = app
        .clone()
        .oneshot(login_request(email, "wrong-password")?)
        .await?;
    assert_eq!(response.status(), StatusCode::LOCKED);
    let body = to_bytes(response.into_body(), usize::MAX).await?;
    let locked: LockedResponse = serde_json::from_slice(&body)?;
    assert_eq!(locked.error, "account_locked");
    assert!(locked.retry_after_minutes >= 1 && locked.retry_after_minutes <= 30);

    // A locked account stays locked even for the correct password.
    let response = app
        .oneshot(login_request(email, "correct-horse")?)
        .await?;
    assert_eq!(response.status(), StatusCode::LOCKED);

    Ok(())
}

#[tokio::test]
async fn successful_login_resets_the_failure_counter() -> Result<()> {
    let Ok(ctx) = TestContext::new().await else {
        return Ok(());
    };

    let email = "reset@example.com";
    let user_id = insert_user(&ctx.pool, "reset", email, "correct-horse").await?;
    let app = app_router(ctx.pool.clone());

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(login_request(email, "wrong-password")?)
            .await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    assert_eq!(failed_logins(&ctx.pool, user_id).await?, 3);

    let response = app
        .oneshot(login_request(email, "correct-horse")?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(failed_logins(&ctx.pool, user_id).await?, 0);

    Ok(())
}

#[tokio::test]
async fn authorization_code_redeems_exactly_once_under_race() -> Result<()> {
    let Ok(ctx) = TestContext::new().await else {
        return Ok(());
    };

    let user_id = insert_user(&ctx.pool, "oauth", "oauth@example.com", "correct-horse").await?;
    insert_application(&ctx.pool, "client-1").await?;

    let code = generate_token()?;
    let code_hash = hash_token(&code);
    oauth_storage::insert_authorization_code(
        &ctx.pool,
        &code_hash,
        "client-1",
        user_id,
        "https://app.example.com/callback",
        "openid",
        None,
        None,
    )
    .await?;

    // Both redemptions hit the same guarded UPDATE; the database picks the
    // winner.
    let (first, second) = tokio::join!(
        oauth_storage::consume_authorization_code(&ctx.pool, &code_hash),
        oauth_storage::consume_authorization_code(&ctx.pool, &code_hash),
    );
    let winners = [first?, second?];
    assert_eq!(winners.iter().filter(|result| result.is_some()).count(), 1);

    // The code stays dead afterwards.
    let replayed = oauth_storage::consume_authorization_code(&ctx.pool, &code_hash).await?;
    assert!(replayed.is_none());

    Ok(())
}

#[tokio::test]
async fn backup_code_burns_exactly_once() -> Result<()> {
    let Ok(ctx) = TestContext::new().await else {
        return Ok(());
    };

    let user_id = insert_user(&ctx.pool, "backup", "backup@example.com", "correct-horse").await?;
    let batch_id = Uuid::new_v4();
    let hashes = vec!["hash-one".to_string(), "hash-two".to_string()];
    totp_repo::replace_backup_codes(&ctx.pool, user_id, batch_id, &hashes).await?;

    let unused = totp_repo::list_unused_backup_codes(&ctx.pool, user_id).await?;
    assert_eq!(unused.len(), 2);
    let (code_id, _) = unused[0];

    assert!(totp_repo::consume_backup_code(&ctx.pool, code_id).await?);
    assert!(!totp_repo::consume_backup_code(&ctx.pool, code_id).await?);

    let unused = totp_repo::list_unused_backup_codes(&ctx.pool, user_id).await?;
    assert_eq!(unused.len(), 1);

    Ok(())
}

#[tokio::test]
async fn sign_count_must_move_forward() -> Result<()> {
    let Ok(ctx) = TestContext::new().await else {
        return Ok(());
    };

    let user_id = insert_user(&ctx.pool, "passkey", "passkey@example.com", "correct-horse").await?;
    let credential_id = vec![1u8, 2, 3, 4];
    webauthn_repo::create_credential(
        &ctx.pool,
        user_id,
        &credential_id,
        Some("laptop"),
        &json!({}),
        5,
        false,
    )
    .await?;

    // Equal or lower counts never pass.
    assert_eq!(
        webauthn_repo::update_counter_checked(&ctx.pool, &credential_id, 5).await?,
        CounterCheck::Replay
    );
    assert_eq!(
        webauthn_repo::update_counter_checked(&ctx.pool, &credential_id, 4).await?,
        CounterCheck::Replay
    );
    assert_eq!(
        webauthn_repo::update_counter_checked(&ctx.pool, &credential_id, 6).await?,
        CounterCheck::Updated
    );
    assert_eq!(
        webauthn_repo::update_counter_checked(&ctx.pool, &credential_id, 6).await?,
        CounterCheck::Replay
    );

    // Counterless authenticators report zero forever and stay accepted,
    // but once a counter moves it can never fall back to zero.
    let counterless_id = vec![9u8, 9, 9, 9];
    webauthn_repo::create_credential(
        &ctx.pool,
        user_id,
        &counterless_id,
        None,
        &json!({}),
        0,
        false,
    )
    .await?;
    assert_eq!(
        webauthn_repo::update_counter_checked(&ctx.pool, &counterless_id, 0).await?,
        CounterCheck::Updated
    );
    assert_eq!(
        webauthn_repo::update_counter_checked(&ctx.pool, &counterless_id, 1).await?,
        CounterCheck::Updated
    );
    assert_eq!(
        webauthn_repo::update_counter_checked(&ctx.pool, &counterless_id, 0).await?,
        CounterCheck::Replay
    );

    Ok(())
}
