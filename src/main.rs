use std::env;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use banner_crawler::api;
use banner_crawler::{ChromeLauncher, GeoTable, ProxyDescriptor};
use dotenv::dotenv;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::start_scrape,
        api::get_scrape_status,
        api::list_locations,
        api::download_image,
        api::health
    ),
    components(
        schemas(
            api::ScrapeRequest,
            api::ScrapeResponse,
            api::ScrapeSession,
            api::SessionStatus,
            api::ProgressEntry,
            api::LocationInfo,
            api::HealthResponse,
            api::ErrorResponse,
            banner_crawler::crawler::ScrapeResult,
            banner_crawler::crawler::BannerCandidate,
            banner_crawler::crawler::Category,
            banner_crawler::crawler::PageLabel,
            banner_crawler::controller::AttemptSummary,
            banner_crawler::controller::AttemptOutcome,
            banner_crawler::browser::ConnectionMode
        )
    ),
    tags(
        (name = "scrape", description = "Banner scrape sessions"),
        (name = "download", description = "Banner image download"),
        (name = "system", description = "Service status")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    if ProxyDescriptor::from_env("US").is_none() {
        tracing::warn!("⚠️ No proxy configured (PROXY_URL or PROXY_HOST/PROXY_PORT); blocked sites will not be retried");
    }

    let state = Arc::new(api::AppState::new(Arc::new(ChromeLauncher::new()), GeoTable::default()));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(SwaggerUi::new("/banner-crawler-swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/api/scrape", post(api::start_scrape))
        .route("/api/scrape/:id", get(api::get_scrape_status))
        .route("/api/locations", get(api::list_locations))
        .route("/api/download", get(api::download_image))
        .route("/api/health", get(api::health))
        .layer(cors)
        .with_state(state);

    let port = env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🚀 Banner crawler listening on {}", addr);
    tracing::info!("📖 Swagger UI at http://{}/banner-crawler-swagger", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
