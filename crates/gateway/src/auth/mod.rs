//! # 認可クライアント
//!
//! アップロード・ダウンロード要求を認可サービスに問い合わせ、可否を判定するトレイト。
//!
//! 現在の実装:
//! - `remote` — 認可サービスへHTTP/JSONで問い合わせる（本番用）
//! - `memory` — 固定ポリシーで判定するインメモリ実装（テスト・開発用）

pub mod memory;
pub mod remote;

pub use memory::StaticAuthorizer;
pub use remote::RemoteAuthorizer;

use filegate_types::{AllowDownload, AllowType, DownloadAccessReq, UploadAccessReq};

/// 認可判定のエラー種別。Gatewayが分岐に使うのはこの3種類のみ。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// 通信障害・認可サービス内部エラー・期限超過
    #[error("認可サービスの内部エラー: {0}")]
    Internal(String),
    /// 認証トークンに一致するユーザーが存在しない
    #[error("一致するユーザーが存在しません: {0}")]
    Unauthorized(String),
    /// ユーザーは存在するがアップロード/ダウンロード権限がない
    #[error("アクセスが禁止されています: {0}")]
    Forbidden(String),
}

/// 認可クライアントのトレイト。
///
/// Gatewayはこのトレイトにのみ依存し、具体的な実装を知らない。
/// 呼び出し側から見て冪等（サーバー側のポリシーが変わらない限り同じ結果を返す）。
#[async_trait::async_trait]
pub trait Authorizer: Send + Sync {
    /// 各オブジェクトトークンについて、`auth_token` のクライアントがダウンロード可能かを返す。
    ///
    /// 返却マップに含まれないトークンは呼び出し側で拒否として扱われる。
    async fn is_allowed_download(
        &self,
        req: &DownloadAccessReq,
    ) -> Result<AllowDownload, AuthError>;

    /// 各拡張子について、アップロード可否と最大サイズを返す。
    async fn is_allowed_upload(&self, req: &UploadAccessReq) -> Result<Vec<AllowType>, AuthError>;
}
