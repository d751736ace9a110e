use crate::errors::Error;
use crate::lifecycle::LifecycleManager;
use crate::model::{ClaimRequest, DeviceListResponse, DeviceView};
use crate::store::DeviceStore;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DeviceStore>,
    pub lifecycle: Arc<LifecycleManager>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceQuery {
    owner: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/devices/claim", post(claim_device))
        .route("/api/v1/devices/:device_id", get(get_device))
        .with_state(state)
}

async fn list_devices(
    State(state): State<AppState>,
    Query(params): Query<DeviceQuery>,
) -> Result<Json<DeviceListResponse>, AppError> {
    let records = state.store.list_owned_by(&params.owner).await?;
    let data: Vec<DeviceView> = records.into_iter().map(DeviceView::from).collect();

    Ok(Json(DeviceListResponse {
        total: data.len(),
        data,
    }))
}

async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceView>, AppError> {
    let record = state
        .store
        .get(&device_id.to_lowercase())
        .await?
        .ok_or(Error::UnknownDevice(device_id))?;

    Ok(Json(record.into()))
}

async fn claim_device(
    State(state): State<AppState>,
    Json(request): Json<ClaimRequest>,
) -> Result<Json<DeviceView>, AppError> {
    let record = state.lifecycle.claim(&request.code, &request.user).await?;
    Ok(Json(record.into()))
}

pub struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::UnknownDevice(_) | Error::NoMatchingDevice => StatusCode::NOT_FOUND,
            Error::AlreadyClaimed(_) | Error::AmbiguousCode => StatusCode::CONFLICT,
            Error::InvalidCode(_) | Error::InvalidOwner(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            error: err.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("API error: {}", self.error);
            return (
                self.status,
                "Internal server error".to_string(),
            )
                .into_response();
        }
        warn!("Rejected request: {}", self.error);
        (self.status, self.error.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceRecord;
    use crate::store::memory::MemoryDeviceStore;
    use chrono::Utc;
    use protocol::bus::MemoryPublisher;

    fn state() -> (Arc<MemoryDeviceStore>, AppState) {
        let store = Arc::new(MemoryDeviceStore::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let state = AppState {
            store: store.clone(),
            lifecycle: Arc::new(LifecycleManager::new(store.clone(), publisher)),
        };
        (store, state)
    }

    fn claim(code: &str, user: &str) -> Json<ClaimRequest> {
        Json(ClaimRequest {
            code: code.to_string(),
            user: user.to_string(),
        })
    }

    #[tokio::test]
    async fn test_claim_then_list_by_owner() {
        let (store, state) = state();
        store.put(DeviceRecord::parked("ab12", "c0ffee".repeat(5), Utc::now()));

        let Json(view) = claim_device(State(state.clone()), claim("c0ffee", "alice"))
            .await
            .unwrap_or_else(|e| panic!("claim failed: {}", e.error));
        assert!(view.associated);
        assert_eq!(view.owner.as_deref(), Some("alice"));

        let Json(listing) = list_devices(
            State(state),
            Query(DeviceQuery {
                owner: "alice".to_string(),
            }),
        )
        .await
        .unwrap_or_else(|e| panic!("listing failed: {}", e.error));
        assert_eq!(listing.total, 1);
        assert_eq!(listing.data[0].device_id, "ab12");
    }

    #[tokio::test]
    async fn test_claim_errors_map_to_status() {
        let (store, state) = state();
        store.put(DeviceRecord::parked("ab12", "c0ffee".repeat(5), Utc::now()));

        let cases = [
            ("c0f", StatusCode::BAD_REQUEST),
            ("deadbeef", StatusCode::NOT_FOUND),
        ];
        for (code, status) in cases {
            let err = claim_device(State(state.clone()), claim(code, "alice"))
                .await
                .err()
                .unwrap();
            assert_eq!(err.status(), status);
        }

        assert!(claim_device(State(state.clone()), claim("c0ffee", "alice"))
            .await
            .is_ok());
        // Already claimed devices drop out of the code lookup entirely.
        let err = claim_device(State(state), claim("c0ffee", "bob"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_found() {
        let (_store, state) = state();
        let err = get_device(State(state), Path("ffff".to_string()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_device_view_hides_code() {
        let (store, state) = state();
        store.put(DeviceRecord::parked("ab12", "c0ffee".repeat(5), Utc::now()));

        let Json(view) = get_device(State(state), Path("AB12".to_string()))
            .await
            .unwrap_or_else(|e| panic!("lookup failed: {}", e.error));
        assert!(!view.associated);
        assert!(view.owner.is_none());
    }

    #[test]
    fn test_store_failures_are_server_errors() {
        let err = AppError::from(Error::Database(sqlx::Error::PoolTimedOut));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            AppError::from(Error::AlreadyClaimed("ab12".to_string())).status(),
            StatusCode::CONFLICT
        );
    }
}
