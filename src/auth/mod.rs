use crate::billing::ledger::CreditLedger;
use crate::database::users;
use crate::errors::{ReelPipeError, Result};
use crate::AppState;
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set, TransactionTrait};
use serde::{Deserialize, Serialize};

/// Bearer-token claims issued by the external auth service. `sub` is the
/// user id; expiry is enforced on decode.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub exp: i64,
    pub iat: i64,
}

pub fn issue_token(secret: &str, sub: &str, email: &str, expires_in_seconds: i64) -> Result<String> {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: sub.to_string(),
        email: email.to_string(),
        name: None,
        exp: now + expires_in_seconds,
        iat: now,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ReelPipeError::Config(format!("Failed to sign token: {e}")))
}

pub fn verify_token(secret: &str, token: &str) -> Result<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| ReelPipeError::Unauthorized)
}

/// Paths that skip bearer auth: health, the public counter, the theme list
/// and the signature-authenticated payment webhook.
fn is_public_path(path: &str) -> bool {
    path == "/api/health"
        || path == "/api/video-count"
        || path == "/api/themes"
        || path == "/api/billing/webhook"
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, StatusCode> {
    let path = request.uri().path();
    if is_public_path(path) {
        return Ok(next.run(request).await);
    }

    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let claims =
        verify_token(&state.config.jwt_secret, token).map_err(|_| StatusCode::UNAUTHORIZED)?;

    // First verified request creates the user row and its welcome credit.
    provision_user(&state.db, &claims, state.config.welcome_credits)
        .await
        .map_err(|e| {
            tracing::error!("Failed to provision user {}: {}", claims.sub, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}

/// Get-or-create the user. Creation inserts the user row, the balance row
/// and the welcome-credit ledger entry in one transaction.
pub async fn provision_user(
    db: &DatabaseConnection,
    claims: &Claims,
    welcome_credits: i64,
) -> Result<users::Model> {
    if let Some(user) = users::Entity::find_by_id(&claims.sub).one(db).await? {
        return Ok(user);
    }

    let now = chrono::Utc::now().timestamp_micros();
    let txn = db.begin().await?;

    let user = users::ActiveModel {
        id: Set(claims.sub.clone()),
        email: Set(claims.email.clone()),
        name: Set(claims
            .name
            .clone()
            .unwrap_or_else(|| claims.email.clone())),
        auth_provider: Set("oauth".to_string()),
        password_hash: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    };

    let inserted = match user.insert(&txn).await {
        Ok(model) => model,
        Err(e) => {
            txn.rollback().await?;
            // A concurrent request provisioned the same user; read it back.
            if matches!(e.sql_err(), Some(sea_orm::SqlErr::UniqueConstraintViolation(_))) {
                return users::Entity::find_by_id(&claims.sub)
                    .one(db)
                    .await?
                    .ok_or(ReelPipeError::Unauthorized);
            }
            return Err(e.into());
        }
    };

    if welcome_credits > 0 {
        CreditLedger::apply_delta(&txn, &claims.sub, welcome_credits, "Welcome credit", now)
            .await?;
    }
    txn.commit().await?;

    tracing::info!("Provisioned new user {} ({})", inserted.id, inserted.email);
    Ok(inserted)
}
