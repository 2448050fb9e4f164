use crate::key_resolver::{resolve_client_ip, RequestInfo};
use crate::slow_down::SlowDown;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;
use uuid::Uuid;

/// Slow-down filter for an axum router.
pub async fn slow_down_middleware(
    State(slow_down): State<SlowDown>,
    request: Request,
    next: Next,
) -> Response {
    slow_down
        .run(request, move |request| next.run(request))
        .await
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = client_ip(&RequestInfo::from_request(&request));

    info!(
        target: "slow_down::http",
        request_id = %request_id,
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let response = next.run(request).await;

    info!(
        target: "slow_down::http",
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = %response.status(),
        "Request completed"
    );

    response
}

fn client_ip(info: &RequestInfo) -> String {
    resolve_client_ip(info).unwrap_or_else(|_| "unknown".to_string())
}
