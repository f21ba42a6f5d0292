use std::{env, time::Duration};

use axum::http::{header, HeaderName, Method};
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Preflight responses may be cached by browsers for 12 hours.
const CORS_MAX_AGE: Duration = Duration::from_secs(12 * 60 * 60);

/// Reads `key` from the process environment. Unset and empty values both count as missing.
pub fn get_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},hyper=warn,reqwest=warn,tower_http=info",
            level.trim().to_lowercase()
        ))
    });

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(DefaultOnFailure::new().level(Level::ERROR))
}

/// Any origin, the given methods and request headers, 12h preflight cache.
///
/// Credentials are not allowed: a wildcard origin combined with credentials is
/// refused by browsers, so the policy stays fully anonymous.
pub fn cors_layer(methods: Vec<Method>, headers: Vec<HeaderName>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(methods)
        .allow_headers(headers)
        .expose_headers([header::CONTENT_LENGTH, header::CONTENT_TYPE])
        .max_age(CORS_MAX_AGE)
}
