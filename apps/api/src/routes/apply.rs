use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::identity::RequestSignals;
use crate::models::application::ApplicationStatus;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ApplyRequest {
    /// Opaque reference to the candidate's CV, handed through to the
    /// scoring capability untouched.
    pub cv_ref: String,
    /// Optional client-side device signal; absence weakens dedup but never
    /// rejects the request.
    pub device_signal: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApplyResponse {
    pub application_id: Uuid,
    pub status: ApplicationStatus,
}

/// POST /api/v1/jobs/:id/apply
///
/// The public apply endpoint. No account, no cookie: identity is derived
/// from request metadata only. Callers see exactly one of accepted /
/// rejected-duplicate / rejected-capped here, or a retryable 503 when the
/// ledger cannot safely evaluate the attempt.
pub async fn handle_apply(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(req): Json<ApplyRequest>,
) -> Result<Json<ApplyResponse>, AppError> {
    if req.cv_ref.trim().is_empty() {
        return Err(AppError::Validation("cv_ref must not be empty".to_string()));
    }

    let signals = extract_signals(&headers, connect_info.map(|c| c.0), req.device_signal);
    let decision = state.engine.decide(job_id, &signals, &req.cv_ref).await?;

    Ok(Json(ApplyResponse {
        application_id: decision.application_id,
        status: decision.status,
    }))
}

/// Collects the weak identity signals from the request. Proxy headers win
/// over the peer address; everything is optional.
fn extract_signals(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    device_signal: Option<String>,
) -> RequestSignals {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let source_addr = forwarded.or_else(|| peer.map(|p| p.to_string()));

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    RequestSignals {
        source_addr,
        user_agent,
        device_signal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_header_wins_over_peer_address() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        let peer: SocketAddr = "192.0.2.1:4444".parse().unwrap();

        let signals = extract_signals(&headers, Some(peer), None);
        assert_eq!(signals.source_addr.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn falls_back_to_peer_address() {
        let peer: SocketAddr = "192.0.2.1:4444".parse().unwrap();
        let signals = extract_signals(&HeaderMap::new(), Some(peer), None);
        assert_eq!(signals.source_addr.as_deref(), Some("192.0.2.1:4444"));
    }

    #[test]
    fn missing_signals_are_none_not_errors() {
        let signals = extract_signals(&HeaderMap::new(), None, None);
        assert!(signals.source_addr.is_none());
        assert!(signals.user_agent.is_none());
        assert!(signals.device_signal.is_none());
    }
}
