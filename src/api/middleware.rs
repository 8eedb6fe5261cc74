use axum::{
    body::Body,
    http::{Request, Uri},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use tracing::Span;

pub async fn enrich_current_span_middleware(req: Request<Body>, next: Next) -> Response {
    let uri: &Uri = req.uri();

    let host = req
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("UNKNOWN");

    let current_span = Span::current();

    current_span.record("http.uri", uri.path());
    current_span.record("http.host", host);
    if let Some(query) = uri.query() {
        current_span.record("http.query", query);
    }

    next.run(req).await
}

/// Redirect `/api/games/` to `/api/games`. Static game folders are left
/// alone: `/games/<slug>/` is how their `index.html` gets served.
pub async fn strip_trailing_slash(req: Request<Body>, next: Next) -> Response {
    let uri = req.uri();
    let path = uri.path();

    if path == "/" || path.starts_with("/games/") {
        return next.run(req).await;
    }

    match path.strip_suffix('/') {
        Some(stripped) => {
            let target = match uri.query() {
                Some(query) => format!("{stripped}?{query}"),
                None => stripped.to_string(),
            };
            Redirect::permanent(&target).into_response()
        }
        None => next.run(req).await,
    }
}
