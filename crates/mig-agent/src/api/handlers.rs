use std::sync::Arc;

use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;

use crate::controllers::SharedState;

#[handler]
pub async fn healthz() -> &'static str {
    "ok"
}

/// Ready once the Reporter has published the node's MIG status.
#[handler]
pub async fn readyz(shared: Data<&Arc<SharedState>>) -> (StatusCode, &'static str) {
    if shared.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "MIG status not reported yet")
    }
}
