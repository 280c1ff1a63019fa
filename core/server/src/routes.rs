use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use rollcall_sync::{
    CheckInResult, NewRegistration, OnlineCheckIn, RecordStatus, RegistrationResult, SyncRequest,
    SyncResponse,
};

use super::{error::AppError, state::AppState};

type Payload<T> = Result<Json<T>, JsonRejection>;

pub async fn sync_handler(
    State(state): State<Arc<AppState>>,
    payload: Payload<SyncRequest>,
) -> Result<Json<SyncResponse>, AppError> {
    let Json(request) = payload?;
    let response = state.reconciler.reconcile(request).await?;
    Ok(Json(response))
}

pub async fn register_handler(
    State(state): State<Arc<AppState>>,
    payload: Payload<NewRegistration>,
) -> Result<(StatusCode, Json<RegistrationResult>), AppError> {
    let Json(registration) = payload?;
    let result = state.desk.register(registration).await?;
    Ok((status_for_record(&result.status), Json(result)))
}

pub async fn check_in_handler(
    State(state): State<Arc<AppState>>,
    payload: Payload<OnlineCheckIn>,
) -> Result<(StatusCode, Json<CheckInResult>), AppError> {
    let Json(check_in) = payload?;
    let result = state.desk.check_in(check_in).await?;
    Ok((status_for_record(&result.status), Json(result)))
}

fn status_for_record(status: &RecordStatus) -> StatusCode {
    match status {
        RecordStatus::Created => StatusCode::CREATED,
        _ => StatusCode::OK,
    }
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub store: String,
    pub encryption: bool,
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Health>) {
    let reachable = match state.store.ping() {
        Ok(_) => true,
        Err(e) => {
            warn!("Health check could not reach store: {}", e);
            false
        }
    };
    let health = Health {
        status: if reachable { "ok" } else { "unavailable" },
        store: state.store.name().to_string(),
        encryption: state.cipher.is_available(),
    };
    let status = if reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}
