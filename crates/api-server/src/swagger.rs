//! OpenAPI specification and Swagger UI configuration.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Ad Serve API",
        version = "0.1.0",
        description = "Ad unit targeting with campaign deduplication, ad unit administration and operational probes.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Targeting", description = "Eligible ad units for a set of targeting criteria"),
        (name = "Ad units", description = "Read, upsert and delete indexed ad units"),
        (name = "Operations", description = "Health, readiness, and liveness probes"),
    ),
    paths(
        crate::rest::query_get,
        crate::rest::query_post,
        crate::rest::get_ad,
        crate::rest::upsert_ad,
        crate::rest::delete_ad,
        crate::rest::health_check,
        crate::rest::readiness,
        crate::rest::liveness,
    ),
    components(schemas(
        adserve_core::AdUnit,
        adserve_core::types::AdUnits,
        adserve_core::SearchQuery,
        adserve_core::Status,
        adserve_core::Delivery,
        crate::rest::ErrorResponse,
        crate::rest::DeleteResponse,
        crate::rest::HealthResponse,
    ))
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_routes() {
        let doc = ApiDoc::openapi();
        for path in ["/query", "/ads", "/ads/{id}", "/health", "/ready", "/live"] {
            assert!(doc.paths.paths.contains_key(path), "{path} missing");
        }
    }
}
