// ABOUTME: Single-port protocol multiplexer for plain HTTP, WebSockets and gRPC.
// ABOUTME: Routes each request by content-type and path to the tonic or the axum router.

use std::convert::Infallible;

use axum::body::Body;
use axum::http::{header, Request};
use axum::response::Response;
use axum::Router;
use tower::ServiceExt;

/// True for requests addressed to the gRPC service. Decided from the request
/// head alone; the body is never touched.
pub fn is_grpc_request<B>(req: &Request<B>) -> bool {
    let grpc_content = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/grpc"));
    let service_path = req
        .uri()
        .path()
        .strip_prefix('/')
        .is_some_and(|p| p.starts_with(lookout_proto::SERVICE_NAME));
    grpc_content && service_path
}

/// Combine the gRPC and HTTP routers behind one service. The result is
/// served by `axum::serve`, which speaks HTTP/1.1 (with upgrades) and h2c on
/// the same listener.
pub fn multiplex(grpc: Router, http: Router) -> Router {
    Router::new().fallback_service(tower::service_fn(move |req: Request<Body>| {
        let grpc = grpc.clone();
        let http = http.clone();
        async move {
            let response: Response = if is_grpc_request(&req) {
                grpc.oneshot(req).await?
            } else {
                http.oneshot(req).await?
            };
            Ok::<_, Infallible>(response)
        }
    }))
}
