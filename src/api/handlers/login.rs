use super::valid_email;
use crate::{
    broker::{envelope::ReplyStatus, rpc::RpcClient, CallError},
    store::normalize_email,
    verifier::LoginRequest,
};
use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, instrument, warn};
use utoipa::ToSchema;

/// Login requests go through the broker; `timeout` bounds how long a caller
/// waits for the verification reply.
pub struct LoginClient {
    rpc: Arc<RpcClient>,
    timeout: Duration,
}

impl LoginClient {
    #[must_use]
    pub fn new(rpc: Arc<RpcClient>, timeout: Duration) -> Self {
        Self { rpc, timeout }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Credentials {
    #[serde(alias = "username")]
    email: String,
    password: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct LoginResponse {
    /// `success`, `error` or `pending`
    status: String,
    message: String,
}

fn respond(
    status: StatusCode,
    outcome: &str,
    message: impl Into<String>,
) -> (StatusCode, Json<LoginResponse>) {
    (
        status,
        Json(LoginResponse {
            status: outcome.to_string(),
            message: message.into(),
        }),
    )
}

#[utoipa::path(
    post,
    path= "/login",
    request_body = Credentials,
    responses (
        (status = 200, description = "Credentials verified", body = LoginResponse),
        (status = 400, description = "Missing or invalid payload", body = LoginResponse),
        (status = 401, description = "Credentials rejected", body = LoginResponse),
        (status = 503, description = "Login service unavailable", body = LoginResponse),
        (status = 504, description = "No verification reply yet; the outcome is unknown", body = LoginResponse),
    ),
    tag= "login"
)]
// axum handler for login
#[instrument(skip_all)]
pub async fn login(
    client: Extension<Arc<LoginClient>>,
    payload: Option<Json<Credentials>>,
) -> impl IntoResponse {
    let credentials = match payload {
        Some(Json(payload)) => payload,
        None => return respond(StatusCode::BAD_REQUEST, "error", "Missing payload"),
    };

    let email = normalize_email(&credentials.email);
    if !valid_email(&email) || credentials.password.is_empty() {
        return respond(StatusCode::BAD_REQUEST, "error", "Invalid email or password");
    }

    debug!(%email, "login requested");

    let request = LoginRequest {
        email,
        password: credentials.password,
    };

    match client.0.rpc.call(&request, client.0.timeout).await {
        Ok(reply) => match reply.status {
            ReplyStatus::Success => respond(StatusCode::OK, "success", reply.message),
            ReplyStatus::Error => respond(StatusCode::UNAUTHORIZED, "error", reply.message),
        },
        // Not a denial: the verifier may still answer.
        Err(CallError::Timeout(timeout)) => {
            warn!(?timeout, "login verification timed out");
            respond(
                StatusCode::GATEWAY_TIMEOUT,
                "pending",
                "Login verification is still pending, please try again",
            )
        }
        Err(err) => {
            error!("login request failed: {err}");
            respond(
                StatusCode::SERVICE_UNAVAILABLE,
                "error",
                "Login service unavailable",
            )
        }
    }
}
