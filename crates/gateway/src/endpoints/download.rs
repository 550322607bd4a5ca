//! # GET {DOWNLOAD_PATH}

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::Method;
use axum::Json;
use filegate_types::*;

use crate::broker::Stage;
use crate::config::GatewayState;
use crate::error::{ApiError, GatewayError};

const MSG_METHOD: &str = "HTTP method not allowed. (To downloading a file, use GET method)";
const MSG_EXTRACT: &str = "Failed to extract download info";
const MSG_AUTH: &str = "Failed to check download permission";
const MSG_LINK: &str = "Failed to create download link";

/// ダウンロードURL発行。
///
/// リクエストボディはGETでもJSON。要求された全トークンがレスポンスに現れ、
/// 拒否されたトークンのURLは空文字列になる。
#[tracing::instrument(skip_all, fields(method = %method))]
pub async fn handle_download(
    method: Method,
    State(state): State<Arc<GatewayState>>,
    body: Bytes,
) -> Result<Json<LinkResponse<DownloadLinks>>, ApiError> {
    let fail = |error: GatewayError, summary: &'static str| {
        ApiError::new(error, summary, state.expose_errors)
    };

    if method != Method::GET {
        return Err(fail(
            GatewayError::MethodNotAllowed(method.to_string()),
            MSG_METHOD,
        ));
    }

    let payload: DownloadPayload = serde_json::from_slice(&body)
        .map_err(|e| fail(GatewayError::BadRequest(e.to_string()), MSG_EXTRACT))?;
    let req = DownloadAccessReq::from_payload(payload);

    let links = state.broker.download_links(req).await.map_err(|e| {
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
