//! # Gateway エラー型
//!
//! 全エンドポイントで共通のエラー型と、クライアント向けJSONエンベロープへの変換。

use axum::http::StatusCode;
use axum::Json;
use filegate_types::LinkResponse;

use crate::auth::AuthError;
use crate::storage::StorageError;

/// Gatewayエラー型。いずれもリクエストを終了させ、Gateway内部では再試行しない。
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// 内部エラー（認可サービス・ストレージの障害、期限超過）
    #[error("内部エラー: {0}")]
    Internal(String),
    /// トークンに一致するユーザーが存在しない
    #[error("認証に失敗: {0}")]
    Unauthorized(String),
    /// ユーザーは存在するが権限がない
    #[error("権限がありません: {0}")]
    Forbidden(String),
    /// 不正なリクエスト（ペイロードのパース失敗等）
    #[error("不正なリクエスト: {0}")]
    BadRequest(String),
    /// エンドポイントに対して誤ったHTTPメソッド
    #[error("許可されていないHTTPメソッド: {0}")]
    MethodNotAllowed(String),
    /// 使い捨てルートが既に使用済み・期限切れ
    #[error("使用済みのルート: {0}")]
    Gone(String),
}

impl GatewayError {
    /// HTTPステータスへの対応付け。
    ///
    /// 認可呼び出し由来のUnauthorized/Forbiddenは既存クライアントとの互換のため
    /// アップロード・ダウンロードとも500として返す。
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Internal(_)
            | GatewayError::Unauthorized(_)
            | GatewayError::Forbidden(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::Gone(_) => StatusCode::GONE,
        }
    }
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Internal(msg) => GatewayError::Internal(msg),
            AuthError::Unauthorized(msg) => GatewayError::Unauthorized(msg),
            AuthError::Forbidden(msg) => GatewayError::Forbidden(msg),
        }
    }
}

impl From<StorageError> for GatewayError {
    fn from(err: StorageError) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

/// クライアントへ返すエラー。
///
/// 本番では失敗箇所ごとの固定メッセージのみを返し、
/// 開発モードでは詳細なエラー内容も併せて返す。
#[derive(Debug)]
pub struct ApiError {
    error: GatewayError,
    summary: &'static str,
    expose_detail: bool,
}

impl ApiError {
    /// エラーを記録し、クライアント向けエラーを構築する。
    pub fn new(error: GatewayError, summary: &'static str, expose_detail: bool) -> Self {
        match &error {
            GatewayError::Internal(_) => tracing::error!(error = %error, "{summary}"),
            _ => tracing::debug!(error = %error, "{summary}"),
        }
        Self {
            error,
            summary,
            expose_detail,
        }
    }

    pub fn error(&self) -> &GatewayError {
        &self.error
    }

    fn message(&self) -> String {
        if self.expose_detail {
            format!("{}: {}", self.summary, self.error)
        } else {
            self.summary.to_string()
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.error.status();
        let body = LinkResponse::<()> {
            status_code: status.as_u16(),
            message: self.message(),
            tokens2urls: None,
        };
        (status, Json(body)).into_response()
    }
}
