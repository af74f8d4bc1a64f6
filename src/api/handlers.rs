//! Request handlers for the API endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use super::types::{
    ErrorResponse, LoadpointResponse, ModeRequest, SettingsRequest, StateResponse,
};
use super::AppState;
use crate::core::types::ChargeMode;

/// Returns the charge mode and the latest published values.
///
/// `GET /state` → 200 + `StateResponse` JSON
pub async fn get_state(State(state): State<Arc<AppState>>) -> Json<StateResponse> {
    let snapshot = state.state.read().clone();

    Json(StateResponse {
        mode: state.handle.mode().to_string(),
        site: snapshot.site,
        loadpoints: snapshot.loadpoints,
    })
}

/// Returns one loadpoint's published values and settings.
///
/// `GET /loadpoints/{id}` → 200 + `LoadpointResponse`, 404 when unknown
pub async fn get_loadpoint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<usize>,
) -> impl IntoResponse {
    let Some(handle) = state.handle.loadpoints().get(id) else {
        return Err(not_found(id));
    };

    let values = state
        .state
        .read()
        .loadpoints
        .get(id)
        .cloned()
        .unwrap_or_default();

    Ok(Json(LoadpointResponse {
        title: handle.title().to_string(),
        values,
        settings: handle.settings().read().clone(),
    }))
}

/// Changes the charge mode; a change triggers an immediate control cycle.
///
/// `POST /mode` → 200, 400 on an unknown mode
pub async fn set_mode(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ModeRequest>,
) -> impl IntoResponse {
    match request.mode.parse::<ChargeMode>() {
        Ok(mode) => {
            state.handle.set_mode(mode);
            Ok(StatusCode::OK)
        }
        Err(error) => Err((StatusCode::BAD_REQUEST, Json(ErrorResponse { error }))),
    }
}

/// Applies a partial settings update to one loadpoint.
///
/// `POST /loadpoints/{id}/settings` → 200 + updated settings, 404 when
/// unknown, 400 on invalid values
pub async fn set_loadpoint_settings(
    State(state): State<Arc<AppState>>,
    Path(id): Path<usize>,
    Json(request): Json<SettingsRequest>,
) -> impl IntoResponse {
    let Some(handle) = state.handle.loadpoints().get(id) else {
        return Err(not_found(id));
    };

    if let Some(phases) = request.phases {
        if let Err(error) = handle.set_phases(phases) {
            return Err((StatusCode::BAD_REQUEST, Json(ErrorResponse { error })));
        }
    }
    if let Some(amps) = request.min_current {
        handle.set_min_current(amps);
    }
    if let Some(amps) = request.max_current {
        handle.set_max_current(amps);
    }
    if let Some(priority) = request.priority {
        handle.set_priority(priority);
    }
    if let Some(soc) = request.limit_soc {
        handle.set_limit_soc((soc > 0.0).then_some(soc));
    }
    if let Some(kwh) = request.limit_energy {
        handle.set_limit_energy((kwh > 0.0).then_some(kwh));
    }

    Ok(Json(handle.settings().read().clone()))
}

fn not_found(id: usize) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("no loadpoint {id}"),
        }),
    )
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use parking_lot::RwLock;
    use tower::util::ServiceExt;

    use super::*;
    use crate::api::{router, SiteState};
    use crate::config::Config;
    use crate::core::clock::Clock;
    use crate::core::loadpoint::Loadpoint;
    use crate::core::site::Site;
    use crate::device::registry::DriverRegistry;

    /// Builds a site from the demo preset, without running it.
    fn make_test_state() -> Arc<AppState> {
        let cfg = Config::demo();
        let registry = DriverRegistry::builtin();

        let grid_ref = &cfg.site.meters.grid;
        let grid = registry
            .meter(&cfg.meters[grid_ref].kind, &cfg.meters[grid_ref].params)
            .unwrap();

        let lp_cfg = &cfg.loadpoints[0];
        let charger = registry
            .charger(
                &cfg.chargers[&lp_cfg.charger].kind,
                &cfg.chargers[&lp_cfg.charger].params,
            )
            .unwrap();
        let loadpoint = Loadpoint::new(
            Clock::manual(),
            lp_cfg.to_core(),
            cfg.site.voltage,
            charger,
            None,
            None,
            Vec::new(),
        );

        let site = Site::new(
            cfg.site.to_core().unwrap(),
            grid,
            None,
            None,
            vec![loadpoint],
        );

        Arc::new(AppState {
            state: Arc::new(RwLock::new(SiteState::default())),
            handle: site.handle(),
        })
    }

    #[tokio::test]
    async fn state_returns_200_with_mode() {
        let state = make_test_state();
        let app = router(state);

        let req = Request::builder()
            .uri("/state")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["mode"], "pv");
    }

    #[tokio::test]
    async fn unknown_loadpoint_returns_404() {
        let state = make_test_state();
        let app = router(state);

        let req = Request::builder()
            .uri("/loadpoints/7")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn set_mode_round_trips() {
        let state = make_test_state();
        let app = router(state.clone());

        let req = Request::builder()
            .method("POST")
            .uri("/mode")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"mode":"now"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.handle.mode(), ChargeMode::Now);
    }

    #[tokio::test]
    async fn set_mode_rejects_unknown() {
        let state = make_test_state();
        let app = router(state);

        let req = Request::builder()
            .method("POST")
            .uri("/mode")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"mode":"turbo"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn settings_update_applies_and_clears_limits() {
        let state = make_test_state();
        let app = router(state.clone());

        let req = Request::builder()
            .method("POST")
            .uri("/loadpoints/0/settings")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"max_current":20,"limit_soc":80.0,"priority":2}"#,
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let settings = state.handle.loadpoints()[0].settings();
        assert_eq!(settings.read().max_current, 20);
        assert_eq!(settings.read().limit_soc, Some(80.0));
        assert_eq!(settings.read().priority, 2);

        let app = router(state.clone());
        let req = Request::builder()
            .method("POST")
            .uri("/loadpoints/0/settings")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"limit_soc":0.0}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(settings.read().limit_soc, None);
    }

    #[tokio::test]
    async fn settings_update_rejects_bad_phases() {
        let state = make_test_state();
        let app = router(state);

        let req = Request::builder()
            .method("POST")
            .uri("/loadpoints/0/settings")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"phases":5}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
