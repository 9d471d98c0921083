pub mod api;
pub mod app;
pub mod billing;
pub mod cloudinary;
pub mod config;
pub mod csv_export;
pub mod error;
pub mod migrate;
pub mod mongo_ext;
pub mod report;
pub mod util;

use axum::{extract::DefaultBodyLimit, routing, Router};
use tower_http::{
    cors::CorsLayer,
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};

use crate::{
    api::v1::{
        account, auth, expense, export, membership, payment, plan, receipt, report as reports,
    },
    app::AppState,
    cloudinary::MAX_IMAGE_BYTES,
};

fn api_v1() -> Router<AppState> {
    Router::new()
        .nest(
            "/auth",
            Router::new()
                .route("/login", routing::post(auth::login))
                .route("/register", routing::post(auth::register))
                .route("/refresh", routing::post(auth::refresh_access_token))
                .route("/logout", routing::post(auth::logout))
                .route("/profile", routing::get(auth::profile)),
        )
        .nest(
            "/users",
            Router::new()
                .route("/", routing::get(account::index).post(account::create))
                .route(
                    "/:id",
                    routing::get(account::show)
                        .put(account::update)
                        .delete(account::delete),
                )
                .route(
                    "/:id/image",
                    routing::post(account::upload_image)
                        .delete(account::delete_image)
                        // multipart framing on top of the image itself
                        .layer(DefaultBodyLimit::max(MAX_IMAGE_BYTES + 64 * 1024)),
                ),
        )
        .nest(
            "/plans",
            Router::new()
                .route("/", routing::get(plan::index).post(plan::create))
                .route(
                    "/:id",
                    routing::get(plan::show)
                        .put(plan::update)
                        .delete(plan::delete),
                ),
        )
        .nest(
            "/memberships",
            Router::new()
                .route(
                    "/",
                    routing::get(membership::index).post(membership::create),
                )
                .route("/request", routing::post(membership::request))
                .route("/refresh-status", routing::post(membership::refresh_status))
                .route(
                    "/:id",
                    routing::get(membership::show)
                        .put(membership::update)
                        .delete(membership::delete),
                )
                .route("/:id/approve", routing::post(membership::approve))
                .route("/:id/renew", routing::post(membership::renew)),
        )
        .nest(
            "/payments",
            Router::new()
                .route("/", routing::get(payment::index))
                .route("/archive", routing::post(payment::archive))
                .route(
                    "/:id",
                    routing::get(payment::show).delete(payment::delete),
                ),
        )
        .nest(
            "/receipts",
            Router::new()
                .route("/", routing::get(receipt::index))
                .route(
                    "/:id",
                    routing::get(receipt::show).delete(receipt::delete),
                ),
        )
        .nest(
            "/expenses",
            Router::new()
                .route("/", routing::get(expense::index).post(expense::create))
                .route(
                    "/:id",
                    routing::get(expense::show)
                        .put(expense::update)
                        .delete(expense::delete),
                ),
        )
        .nest(
            "/reports",
            Router::new()
                .route("/revenue", routing::get(reports::revenue))
                .route("/expenses", routing::get(reports::expenses))
                .route("/summary", routing::get(reports::summary)),
        )
        .nest(
            "/export",
            Router::new()
                .route("/payments.csv", routing::get(export::payments))
                .route("/expenses.csv", routing::get(export::expenses))
                .route("/members.csv", routing::get(export::members)),
        )
        .nest(
            "/me",
            Router::new()
                .route("/membership", routing::get(membership::mine))
                .route("/payments", routing::get(payment::mine))
                .route("/receipts", routing::get(receipt::mine)),
        )
}

/// The API under `/api/v1`, with the dashboard assets in `public_dir` as the
/// fallback for every other path.
pub fn router(app_state: AppState, public_dir: &str) -> Router {
    let spa = ServeDir::new(public_dir)
        .fallback(ServeFile::new(format!("{public_dir}/index.html")));

    Router::new()
        .nest("/api/v1", api_v1())
        .fallback_service(spa)
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
