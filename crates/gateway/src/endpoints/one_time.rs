//! # /once/{*path}
//!
//! 使い捨てルートの配信。勝者のリクエストのみ登録済みハンドラに渡し、
//! 処理後にスロットを片付ける。
//!
//! 登録時と異なるメソッドは405（`Allow` ヘッダ付き）で返し、スロットは消費しない。

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use tower::ServiceExt;

use crate::config::GatewayState;
use crate::error::{ApiError, GatewayError};
use crate::one_time::Rejection;

const MSG_GONE: &str = "Upload URL has expired or already been used";
const MSG_METHOD_NOT_ALLOWED: &str = "HTTP method not allowed for this one-time route";

pub async fn handle_one_time(State(state): State<Arc<GatewayState>>, req: Request) -> Response {
    let path = req.uri().path().to_string();

    let claim = match state.one_time.dispatch(&path, req.method()) {
        Ok(claim) => claim,
        Err(Rejection::Gone) => {
            return ApiError::new(GatewayError::Gone(path), MSG_GONE, state.expose_errors)
                .into_response();
        }
        Err(Rejection::MethodNotAllowed { allowed }) => {
            let error = ApiError::new(
                GatewayError::MethodNotAllowed(req.method().to_string()),
                MSG_METHOD_NOT_ALLOWED,
                state.expose_errors,
            );
            return ([(header::ALLOW, allowed.to_string())], error).into_response();
        }
    };

    tracing::debug!(path = %path, "使い捨てルートを処理");
    let response = claim
        .handler()
        .oneshot(req)
        .await
        .unwrap_or_else(|never| match never {});
    state.one_time.cleanup(&path);
    response
}
