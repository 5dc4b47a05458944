//! Route table of the Garden API.
//!
//! | Route | Method | Operation |
//! |-------|--------|-----------|
//! | `/ping` | GET | health check |
//! | `/capacity` | GET | host capacity |
//! | `/containers` | GET, POST | list (query = property filter), create |
//! | `/containers/{handle}` | DELETE | destroy |
//! | `/containers/{handle}/info` | GET | info |
//! | `/containers/{handle}/metrics` | GET | metrics |
//! | `/containers/{handle}/stop` | POST | stop |
//! | `/containers/{handle}/properties[/{key}]` | GET, PUT, DELETE | properties |
//! | `/containers/{handle}/limits[/{kind}]` | GET, PUT | limits |
//! | `/containers/{handle}/net_in` | POST | `NetIn` |
//! | `/containers/{handle}/net_out` | GET, POST | `NetOut` |
//! | `/containers/{handle}/processes` | POST | run |
//! | `/containers/{handle}/processes/{id}/output` | GET | attach (NDJSON) |
//! | `/containers/{handle}/processes/{id}/signal` | POST | signal |
//! | `/containers/{handle}/processes/{id}/tty` | PUT | resize |
//! | `/containers/{handle}/files?path=` | GET, PUT | stream out / in (tar) |
//! | `/bulk/info`, `/bulk/metrics` | POST | bulk lookups |

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers::{self, AppState};

/// Creates the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(handlers::ping))
        .route("/capacity", get(handlers::capacity))
        .route(
            "/containers",
            get(handlers::list_containers).post(handlers::create_container),
        )
        .route("/containers/{handle}", delete(handlers::destroy_container))
        .route("/containers/{handle}/info", get(handlers::info))
        .route("/containers/{handle}/metrics", get(handlers::metrics))
        .route("/containers/{handle}/stop", post(handlers::stop))
        // Properties
        .route("/containers/{handle}/properties", get(handlers::properties))
        .route(
            "/containers/{handle}/properties/{key}",
            get(handlers::property)
                .put(handlers::set_property)
                .delete(handlers::remove_property),
        )
        // Limits
        .route("/containers/{handle}/limits", get(handlers::limits))
        .route("/containers/{handle}/limits/memory", put(handlers::limit_memory))
        .route("/containers/{handle}/limits/cpu", put(handlers::limit_cpu))
        .route("/containers/{handle}/limits/disk", put(handlers::limit_disk))
        .route("/containers/{handle}/limits/bandwidth", put(handlers::limit_bandwidth))
        // Networking
        .route("/containers/{handle}/net_in", post(handlers::net_in))
        .route(
            "/containers/{handle}/net_out",
            get(handlers::net_out_rules).post(handlers::net_out),
        )
        // Processes
        .route("/containers/{handle}/processes", post(handlers::run))
        .route("/containers/{handle}/processes/{id}/output", get(handlers::attach))
        .route("/containers/{handle}/processes/{id}/signal", post(handlers::signal))
        .route("/containers/{handle}/processes/{id}/tty", put(handlers::set_tty))
        // Files
        .route(
            "/containers/{handle}/files",
            get(handlers::stream_out)
                .put(handlers::stream_in)
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/bulk/info", post(handlers::bulk_info))
        .route("/bulk/metrics", post(handlers::bulk_metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use garden_common::config::GardenConfig;
    use garden_common::error::WireError;
    use garden_common::types::{ContainerInfo, CreateResponse, ListResponse, RunResponse};
    use garden_runtime::engine::Garden;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    fn make_test_state(depot: &std::path::Path) -> AppState {
        let config = GardenConfig {
            depot_dir: depot.to_path_buf(),
            cgroup_root: PathBuf::from("/proc/garden-no-cgroup"),
            port_pool_start: 0,
            port_pool_size: 0,
            ..GardenConfig::default()
        };
        AppState {
            garden: Arc::new(Garden::new(config).unwrap()),
        }
    }

    fn json_request(method: &str, uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        response.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[tokio::test]
    async fn test_ping_endpoint() {
        let depot = tempfile::tempdir().unwrap();
        let app = create_router(make_test_state(depot.path()));

        let response = app.oneshot(empty_request("GET", "/ping")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_create_list_and_destroy() {
        let depot = tempfile::tempdir().unwrap();
        let app = create_router(make_test_state(depot.path()));

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/containers",
                &serde_json::json!({"handle": "web", "properties": {"role": "web"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: CreateResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(created.handle.as_str(), "web");

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/containers?role=web"))
            .await
            .unwrap();
        let list: ListResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(list.handles.len(), 1);

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/containers?role=db"))
            .await
            .unwrap();
        let list: ListResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(list.handles.is_empty());

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/containers/web/info"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let info: ContainerInfo = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(info.properties["role"], "web");

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", "/containers/web"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(empty_request("DELETE", "/containers/web"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_handle_error_body() {
        let depot = tempfile::tempdir().unwrap();
        let app = create_router(make_test_state(depot.path()));

        let response = app
            .oneshot(empty_request("DELETE", "/containers/asdf"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let wire: WireError = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(
            wire,
            WireError::ContainerNotFound {
                handle: "asdf".into()
            }
        );
    }

    #[tokio::test]
    async fn test_missing_property_error_body() {
        let depot = tempfile::tempdir().unwrap();
        let app = create_router(make_test_state(depot.path()));
        let _ = app
            .clone()
            .oneshot(json_request("POST", "/containers", &serde_json::json!({"handle": "p"})))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/containers/p/properties/foo"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let wire: WireError = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(wire, WireError::PropertyNotFound { key: "foo".into() });

        let _ = app.oneshot(empty_request("DELETE", "/containers/p")).await.unwrap();
    }

    #[tokio::test]
    async fn test_process_output_is_streamed_as_ndjson() {
        let depot = tempfile::tempdir().unwrap();
        let app = create_router(make_test_state(depot.path()));
        let _ = app
            .clone()
            .oneshot(json_request("POST", "/containers", &serde_json::json!({"handle": "r"})))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/containers/r/processes",
                &serde_json::json!({"spec": {"path": "sh", "args": ["-c", "echo hi; exit 3"]}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let run: RunResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();

        let response = app
            .clone()
            .oneshot(empty_request(
                "GET",
                &format!("/containers/r/processes/{}/output", run.process_id),
            ))
            .await
            .unwrap();
        assert_eq!(response.headers()["content-type"], handlers::NDJSON);
        let body = body_bytes(response).await;
        let lines: Vec<serde_json::Value> = body
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).unwrap())
            .collect();
        let last = lines.last().unwrap();
        assert_eq!(last["type"], "exited");
        assert_eq!(last["status"], 3);

        let _ = app.oneshot(empty_request("DELETE", "/containers/r")).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let depot = tempfile::tempdir().unwrap();
        let app = create_router(make_test_state(depot.path()));

        let request = Request::builder()
            .method("POST")
            .uri("/containers")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert!(response.status().is_client_error());
    }
}
