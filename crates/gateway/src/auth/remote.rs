//! # 認可サービスクライアント
//!
//! 認可サービスへHTTP/JSONで問い合わせる [`Authorizer`] 実装。
//!
//! - `POST {endpoint}/is-allowed-download`
//! - `POST {endpoint}/is-allowed-upload`
//!
//! 各問い合わせは `max_query_time` 以内に往復を終える必要があり、
//! 超過した場合は通信を破棄して内部エラーとする。

use std::time::Duration;

use filegate_types::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{AuthError, Authorizer};

/// 認可サービスへの問い合わせクライアント。
pub struct RemoteAuthorizer {
    /// 認可サービスのベースURL（末尾スラッシュなし）
    endpoint: String,
    /// HTTPクライアント
    http_client: reqwest::Client,
    /// 1回の問い合わせに許される最大往復時間
    max_query_time: Duration,
}

impl RemoteAuthorizer {
    /// 認可サービスクライアントを構築する。
    pub fn new(endpoint: &str, max_query_time: Duration) -> anyhow::Result<Self> {
        tracing::info!(auth_server = %endpoint, "認可サービスへの接続を設定");
        let http_client = reqwest::Client::builder()
            .timeout(max_query_time)
            .build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http_client,
            max_query_time,
        })
    }

    /// JSONリクエストを送信し、期限内に応答をデコードする。
    async fn query<Req, Res>(&self, path: &str, body: &Req) -> Result<Res, AuthError>
    where
        Req: Serialize + Sync,
        Res: DeserializeOwned,
    {
        let url = format!("{}{}", self.endpoint, path);
        let call = async {
            let response = self
                .http_client
                .post(&url)
                .json(body)
                .send()
                .await
                .map_err(|e| AuthError::Internal(format!("HTTP送信失敗: {e}")))?;

            let status = response.status();
            let response_body = response
                .text()
                .await
                .map_err(|e| AuthError::Internal(format!("レスポンス読み取り失敗: {e}")))?;

            if !status.is_success() {
                return Err(AuthError::Internal(format!(
                    "認可サービスがエラーを返しました: HTTP {} - {}",
                    status, response_body
                )));
            }

            serde_json::from_str(&response_body)
                .map_err(|e| AuthError::Internal(format!("レスポンスのパースに失敗: {e}")))
        };

        tokio::time::timeout(self.max_query_time, call)
            .await
            .map_err(|_| {
                AuthError::Internal(format!(
                    "認可サービスが{}ミリ秒以内に応答しませんでした",
                    self.max_query_time.as_millis()
                ))
            })?
    }
}

/// ワイヤ上のステータスコードをデコードする。
///
/// 未知のコードは認可サービスとの契約不一致であり、推測で判定を返すことはできない。
/// エラーを記録してプロセスを停止する。
fn status_or_abort(code: i32, errmsg: &str) -> AuthStatus {
    match AuthStatus::try_from(code) {
        Ok(status) => status,
        Err(unknown) => {
            tracing::error!(status_code = code, errmsg = %errmsg, "{unknown}");
            std::process::abort();
        }
    }
}

/// OK以外のステータスをエラー種別に変換する。
fn check_status(status: AuthStatus, errmsg: &str, action: &str) -> Result<(), AuthError> {
    match status {
        AuthStatus::Ok => Ok(()),
        AuthStatus::ErrForbidden => Err(AuthError::Forbidden(format!(
            "このユーザーの{action}は禁止されています: {errmsg}"
        ))),
        AuthStatus::ErrUnauthorized => Err(AuthError::Unauthorized(format!(
            "認証トークンに一致するユーザーがいません: {errmsg}"
        ))),
        AuthStatus::ErrInternal => Err(AuthError::Internal(format!(
            "{action}権限の確認に失敗: {errmsg}"
        ))),
    }
}

/// 認可サービスの応答を [`AllowType`] に変換する。解釈できない拡張子は捨てる。
fn to_allow_types(file_types: Vec<AuthFileType>) -> Vec<AllowType> {
    file_types
        .into_iter()
        .filter_map(|ft| match FileExtension::parse(&ft.file_type) {
            Ok(file_type) => Some(AllowType {
                file_type,
                is_allow: ft.is_allow,
                max_size: ft.max_size,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "認可サービスが不正な拡張子を返しました");
                None
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl Authorizer for RemoteAuthorizer {
    async fn is_allowed_download(
        &self,
        req: &DownloadAccessReq,
    ) -> Result<AllowDownload, AuthError> {
        if req.object_tokens.is_empty() {
            return Ok(AllowDownload::new());
        }

        let body = AuthDownloadRequest {
            auth_token: req.auth_token.to_string(),
            object_tokens: req.object_tokens.iter().map(ToString::to_string).collect(),
        };
        let reply: AuthDownloadReply = self.query("/is-allowed-download", &body).await?;
        check_status(
            status_or_abort(reply.status_code, &reply.errmsg),
            &reply.errmsg,
            "ダウンロード",
        )?;

        Ok(reply
            .files
            .into_iter()
            .map(|(token, allowed)| (Token::new(token), allowed))
            .collect())
    }

    async fn is_allowed_upload(&self, req: &UploadAccessReq) -> Result<Vec<AllowType>, AuthError> {
        let body = AuthUploadRequest {
            auth_token: req.auth_token.to_string(),
            object_types: req
                .object_types
                .iter()
                .map(|(ext, &count)| (ext.to_string(), u64::from(count)))
                .collect(),
        };
        let reply: AuthUploadReply = self.query("/is-allowed-upload", &body).await?;
        check_status(
            status_or_abort(reply.status_code, &reply.errmsg),
            &reply.errmsg,
            "アップロード",
        )?;

        Ok(to_allow_types(reply.file_types))
    }
}
