//! # POST {UPLOAD_PATH}
//!
//! 拡張子ごとの件数を受け取り、許可された分のアップロードURLを返す。

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::Method;
use axum::Json;
use filegate_types::*;

use crate::broker::Stage;
use crate::config::GatewayState;
use crate::error::{ApiError, GatewayError};

const MSG_METHOD: &str = "HTTP method not allowed. (To uploading a file, use POST method)";
const MSG_EXTRACT: &str = "Failed to extract upload info";
const MSG_AUTH: &str = "Failed to check upload permission";
const MSG_LINK: &str = "Failed to create upload link";

/// アップロードURL発行。
///
/// レスポンスの `tokens2urls` は拡張子 → URLリスト。拒否された拡張子は含まれない。
#[tracing::instrument(skip_all, fields(method = %method))]
pub async fn handle_upload(
    method: Method,
    State(state): State<Arc<GatewayState>>,
    body: Bytes,
) -> Result<Json<LinkResponse<UploadLinks>>, ApiError> {
    let fail = |error: GatewayError, summary: &'static str| {
        ApiError::new(error, summary, state.expose_errors)
    };

    if method != Method::POST {
        return Err(fail(
            GatewayError::MethodNotAllowed(method.to_string()),
            MSG_METHOD,
        ));
    }

    let payload: UploadPayload = serde_json::from_slice(&body)
        .map_err(|e| fail(GatewayError::BadRequest(e.to_string()), MSG_EXTRACT))?;
    let req = UploadAccessReq::from_payload(payload)
        .map_err(|e| fail(GatewayError::BadRequest(e.to_string()), MSG_EXTRACT))?;

    let links = state.broker.upload_links(req).await.map_err(|e| {
        let summary = match e.stage {
            Stage::Request => MSG_EXTRACT,
            Stage::Authorization => MSG_AUTH,
            Stage::Issuance => MSG_LINK,
        };
        fail(e.error, summary)
    })?;

    Ok(Json(LinkResponse {
        status_code: 200,
        message: "OK".to_string(),
        tokens2urls: Some(links),
    }))
}
