mod dev_proxy;
mod guard;
mod middleware;
mod public;

pub use dev_proxy::DevProxy;
pub use guard::{SSR_FETCH_HEADER, SSR_TOKEN_HEADER, check_data_request, is_same_origin};
pub use middleware::RequestContext;
pub use public::{DATA_PREFIX, build_router};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::application::error::ErrorReport;

fn health_response(renderer_open: bool) -> Response {
    if renderer_open {
        return StatusCode::NO_CONTENT.into_response();
    }
    let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
    ErrorReport::from_message(
        "infra::http::health",
        StatusCode::SERVICE_UNAVAILABLE,
        "render engine pool is closed",
    )
    .attach(&mut response);
    response
}
