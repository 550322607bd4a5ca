//! # Gatewayエンドポイント
//!
//! - `{UPLOAD_PATH}` — アップロードURL発行（POSTのみ）
//! - `{DOWNLOAD_PATH}` — ダウンロードURL発行（GETのみ）
//! - `/once/{*path}` — 使い捨てルート
//! - `GET /health` — 死活監視
//!
//! アップロード・ダウンロードは全メソッドを受け付け、ハンドラ内でメソッドを検査する。
//! 誤ったメソッドにもJSONエンベロープで405を返すため。

pub mod download;
pub mod one_time;
pub mod upload;


pub use download::handle_download;
pub use one_time::handle_one_time;
pub use upload::handle_upload;

use std::sync::Arc;

use axum::routing::{any, get};
use axum::Router;

use crate::config::GatewayState;
use crate::one_time::ONE_TIME_PREFIX;

/// ルーターを構築する。
pub fn build_router(state: Arc<GatewayState>, upload_path: &str, download_path: &str) -> Router {
    Router::new()
        .route(upload_path, any(handle_upload))
        .route(download_path, any(handle_download))
        .route(&format!("{ONE_TIME_PREFIX}/{{*path}}"), any(handle_one_time))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}
