use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Bearer key guarding the admin routes.
#[derive(Clone)]
pub struct AdminKey(pub Arc<String>);

pub async fn admin_auth(
    State(key): State<AdminKey>,
    req: Request<Body>,
    next: Next<Body>,
) -> Result<Response, StatusCode> {
    let auth_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok());

    match auth_header.and_then(|auth| auth.strip_prefix("Bearer ")) {
        Some(token) if !key.0.is_empty() && token == key.0.as_str() => Ok(next.run(req).await),
        _ => {
            tracing::warn!(uri = %req.uri(), "Rejected admin request without valid key");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Router};
    use tower::ServiceExt;

    fn app() -> Router {
        let key = AdminKey(Arc::new("admin-key".to_string()));
        Router::new()
            .route("/admin/ping", post(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(key, admin_auth))
    }

    async fn call(header: Option<&str>) -> StatusCode {
        let mut builder = Request::builder().method("POST").uri("/admin/ping");
        if let Some(value) = header {
            builder = builder.header("Authorization", value);
        }
        app()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_valid_bearer_key_passes() {
        assert_eq!(call(Some("Bearer admin-key")).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_or_wrong_key_rejected() {
        assert_eq!(call(None).await, StatusCode::UNAUTHORIZED);
        assert_eq!(call(Some("Bearer nope")).await, StatusCode::UNAUTHORIZED);
        assert_eq!(call(Some("admin-key")).await, StatusCode::UNAUTHORIZED);
    }
}
