//! # リンク発行（ストレージクライアント）
//!
//! オブジェクトストアへの期限付きアクセスURLを発行する抽象インターフェース。
//! 署名とURLの失効はストレージ側が担い、Gatewayは発行を依頼するのみ。
//!
//! 現在の実装:
//! - `s3` — S3互換ストレージの署名付きURL（AWS S3, MinIO, Cloudflare R2等）
//! - `memory` — 署名付きURL風の文字列を返すテスト用実装

pub mod memory;
#[cfg(feature = "vendor-aws")]
pub mod s3;

pub use memory::MemoryLinkIssuer;
#[cfg(feature = "vendor-aws")]
pub use self::s3::S3LinkIssuer;

use std::time::Duration;

use filegate_types::{FileExtension, Token};

/// ストレージ操作の失敗。呼び出し側でラップして報告し、再試行はしない。
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// 署名付きURLの生成に失敗
    #[error("署名付きURL生成失敗 (key={key}): {reason}")]
    Presign { key: String, reason: String },
    /// 期限が不正（0秒等）
    #[error("不正な有効期限: {0:?}")]
    InvalidExpiry(Duration),
}

/// アップロード対象の1ファイル。
#[derive(Debug, Clone)]
pub struct UploadObject {
    /// 拡張子を除いたファイル名。衝突しないようGatewayが毎回新規に生成する。
    pub file_name: String,
    pub extension: FileExtension,
    /// アップロードするユーザーの認証トークン。オブジェクトのメタデータとして保存される。
    pub uploaded_by: Token,
    /// 認可サービスが返した最大サイズ（KB）。参考値。
    pub max_size: u64,
}

impl UploadObject {
    /// ストレージ上のキー（`{file_name}.{extension}`）。
    pub fn key(&self) -> String {
        format!("{}.{}", self.file_name, self.extension)
    }
}

/// ダウンロード対象の1ファイル。
#[derive(Debug, Clone)]
pub struct DownloadObject {
    /// ストレージ上のキー。クライアントが指定したオブジェクトトークンをそのまま使う。
    pub file_name: String,
}

/// リンク発行のトレイト。
///
/// 返却するURLは要求された1操作（アップロードはPUT、ダウンロードはGET）のみを許可し、
/// `expires_in` 経過後はストレージ側で無効化されなければならない。
#[async_trait::async_trait]
pub trait LinkIssuer: Send + Sync {
    /// 1ファイル分のアップロードURLを発行する。
    async fn issue_upload_link(
        &self,
        object: &UploadObject,
        expires_in: Duration,
    ) -> Result<String, StorageError>;

    /// 1ファイル分のダウンロードURLを発行する。
    async fn issue_download_link(
        &self,
        object: &DownloadObject,
        expires_in: Duration,
    ) -> Result<String, StorageError>;
}

/// 有効期限を署名に使う秒数へ変換する。端数は切り上げる。
pub(crate) fn expiry_secs(expires_in: Duration) -> Result<u32, StorageError> {
    if expires_in.is_zero() {
        return Err(StorageError::InvalidExpiry(expires_in));
    }
    let secs = expires_in.as_secs() + u64::from(expires_in.subsec_nanos() > 0);
    u32::try_from(secs).map_err(|_| StorageError::InvalidExpiry(expires_in))
}
