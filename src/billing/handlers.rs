use crate::auth::Claims;
use crate::errors::ReelPipeError;
use crate::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Extension, Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-payment-signature";
/// Reject signatures older than five minutes.
const SIGNATURE_TOLERANCE_SECONDS: i64 = 300;

/// Credit pack price table in cents.
pub const CREDIT_PRICES: &[(i64, i64)] = &[(2, 100), (5, 225), (10, 400), (25, 875)];

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/balance", get(get_balance))
        .route("/checkout-session", post(create_checkout_session))
        .route("/webhook", post(payment_webhook))
        .route("/prices", get(get_credit_prices))
}

async fn get_balance(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>, StatusCode> {
    let credits = state.ledger.get_balance(&claims.sub).await.map_err(|e| {
        tracing::error!("Failed to read balance for {}: {}", claims.sub, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(serde_json::json!({ "credits": credits })))
}

#[derive(Deserialize)]
struct CheckoutRequest {
    credits: i64,
}

/// Create a checkout session at the payment provider and hand back its URL.
async fn create_checkout_session(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(provider_url) = state.config.billing.provider_url.clone() else {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": "Payment provider is not configured"})),
        ));
    };

    let Some((credits, price_cents)) = CREDIT_PRICES
        .iter()
        .find(|(credits, _)| *credits == request.credits)
        .copied()
    else {
        let available: Vec<i64> = CREDIT_PRICES.iter().map(|(c, _)| *c).collect();
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("Unsupported credit pack size. Available: {available:?}"),
            })),
        ));
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| {
            tracing::error!("Failed to build HTTP client: {}", e);
            internal_error()
        })?;

    let frontend = &state.config.billing.frontend_url;
    let payload = serde_json::json!({
        "mode": "payment",
        "client_reference_id": claims.sub,
        "customer_email": claims.email,
        "amount_cents": price_cents,
        "product_name": format!("ReelPipe video credits ({credits} credits)"),
        "metadata": {
            "user_id": claims.sub,
            "credits": credits.to_string(),
        },
        "success_url": format!("{frontend}/billing/success?session_id={{CHECKOUT_SESSION_ID}}"),
        "cancel_url": format!("{frontend}/billing/cancel"),
    });

    let response = client
        .post(format!("{provider_url}/v1/checkout/sessions"))
        .json(&payload)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| {
            tracing::error!("Checkout session creation failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Payment processing error"})),
            )
        })?;

    let session: Value = response.json().await.map_err(|e| {
        tracing::error!("Checkout session response unreadable: {}", e);
        internal_error()
    })?;
    let url = session.get("url").and_then(|u| u.as_str()).ok_or_else(|| {
        tracing::error!("Checkout session response missing url");
        internal_error()
    })?;

    tracing::info!("Created checkout session for user {}", claims.sub);
    Ok(Json(serde_json::json!({ "url": url })))
}

/// Payment provider callback. Signature-authenticated; grants are keyed on
/// the session id, so replays credit exactly once.
async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(secret) = state.config.billing.webhook_secret.clone() else {
        tracing::error!("Webhook secret not configured");
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": "Webhook not configured"})),
        ));
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| bad_request("Missing signature"))?;

    let now = chrono::Utc::now().timestamp();
    if !verify_signature(&secret, signature, &body, now) {
        tracing::error!("Webhook signature verification failed");
        return Err(bad_request("Invalid signature"));
    }

    let event: Value =
        serde_json::from_slice(&body).map_err(|_| bad_request("Invalid payload"))?;
    let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match event_type {
        "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
            let session = event
                .get("data")
                .and_then(|d| d.get("object"))
                .ok_or_else(|| bad_request("Malformed event"))?;
            let user_id = session
                .get("client_reference_id")
                .and_then(|u| u.as_str())
                .unwrap_or("");
            let session_id = session.get("id").and_then(|i| i.as_str()).unwrap_or("");
            let credits: i64 = session
                .get("metadata")
                .and_then(|m| m.get("credits"))
                .and_then(|c| c.as_str())
                .and_then(|c| c.parse().ok())
                .unwrap_or(0);

            if user_id.is_empty() || session_id.is_empty() || credits <= 0 {
                tracing::error!("Webhook: missing user_id or credits in session");
                return Err(bad_request("Malformed session"));
            }

            let description = format!("Purchased {credits} credits");
            match state
                .ledger
                .grant(user_id, credits, &description, Some(session_id))
                .await
            {
                Ok(_) => {
                    tracing::info!("Webhook: granted {} credits to user {}", credits, user_id);
                    // Mirror so duplicate deliveries can be observed in the KV layer too.
                    state
                        .kv
                        .set_if_absent(
                            &format!("processed_session:{session_id}"),
                            &"1",
                            Some(crate::billing::ledger::MARKER_TTL_SECONDS),
                        )
                        .await;
                }
                Err(ReelPipeError::DuplicateEvent(_)) => {
                    tracing::info!("Webhook: session {} already processed", session_id);
                }
                Err(e) => {
                    tracing::error!("Webhook grant failed: {}", e);
                    return Err((
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(serde_json::json!({"error": "Error processing webhook"})),
                    ));
                }
            }
        }
        "checkout.session.async_payment_failed" => {
            tracing::warn!("Webhook: async payment failed");
        }
        other => {
            tracing::info!("Webhook: unhandled event type: {}", other);
        }
    }

    Ok(Json(serde_json::json!({"status": "success"})))
}

async fn get_credit_prices() -> Json<Value> {
    let baseline_per_credit = CREDIT_PRICES[0].1 as f64 / CREDIT_PRICES[0].0 as f64;
    let packages: Vec<Value> = CREDIT_PRICES
        .iter()
        .map(|(credits, price_cents)| {
            let price_dollars = *price_cents as f64 / 100.0;
            let savings = if *credits > CREDIT_PRICES[0].0 {
                let single_price = *credits as f64 * baseline_per_credit / 100.0;
                (((single_price - price_dollars) / single_price) * 100.0).round() as i64
            } else {
                0
            };
            serde_json::json!({
                "credits": credits,
                "price_cents": price_cents,
                "price_dollars": price_dollars,
                "savings_percent": savings,
                "popular": *credits == 10,
            })
        })
        .collect();
    Json(serde_json::json!({ "packages": packages }))
}

/// `t=<unix>,v1=<hex hmac-sha256(secret, "{t}.{body}")>`, rejected outside
/// the timestamp tolerance.
pub fn verify_signature(secret: &str, header: &str, body: &[u8], now: i64) -> bool {
    let mut timestamp = None;
    let mut provided = None;
    for part in header.split(',') {
        if let Some(t) = part.trim().strip_prefix("t=") {
            timestamp = t.parse::<i64>().ok();
        } else if let Some(v) = part.trim().strip_prefix("v1=") {
            provided = Some(v.to_string());
        }
    }
    let (Some(timestamp), Some(provided)) = (timestamp, provided) else {
        return false;
    };
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECONDS {
        return false;
    }

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    // Byte-wise comparison; both sides are fixed-length hex.
    expected.len() == provided.len()
        && expected
            .bytes()
            .zip(provided.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

pub fn sign_payload(secret: &str, body: &[u8], timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

fn bad_request(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": message})),
    )
}

fn internal_error() -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": "Internal server error"})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_round_trip() {
        let body = br#"{"type":"checkout.session.completed"}"#;
        let now = 1_700_000_000;
        let header = sign_payload("whsec_test", body, now);
        assert!(verify_signature("whsec_test", &header, body, now));
    }

    #[test]
    fn test_signature_rejects_tampered_body() {
        let now = 1_700_000_000;
        let header = sign_payload("whsec_test", b"original", now);
        assert!(!verify_signature("whsec_test", &header, b"tampered", now));
    }

    #[test]
    fn test_signature_rejects_wrong_secret() {
        let now = 1_700_000_000;
        let header = sign_payload("whsec_test", b"body", now);
        assert!(!verify_signature("whsec_other", &header, b"body", now));
    }

    #[test]
    fn test_signature_rejects_stale_timestamp() {
        let signed_at = 1_700_000_000;
        let header = sign_payload("whsec_test", b"body", signed_at);
        assert!(!verify_signature(
            "whsec_test",
            &header,
            b"body",
            signed_at + SIGNATURE_TOLERANCE_SECONDS + 1
        ));
    }

    #[test]
    fn test_signature_rejects_malformed_header() {
        assert!(!verify_signature("s", "not-a-signature", b"body", 0));
        assert!(!verify_signature("s", "t=abc,v1=00", b"body", 0));
    }
}
