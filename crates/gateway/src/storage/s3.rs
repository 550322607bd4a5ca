//! # S3互換 リンク発行実装
//!
//! AWS S3, MinIO, Cloudflare R2 等のS3互換APIで署名付きURLを発行する。
//! アップロードは署名付きPUT、ダウンロードは署名付きGET。
//!
//! アップロードURLにはアップロード者をユーザー定義メタデータとして署名込みで埋め込む。
//! クライアントが値を書き換えると署名が一致せず、ストレージに拒否される。

use std::collections::HashMap;
use std::time::Duration;

use super::{expiry_secs, DownloadObject, LinkIssuer, StorageError, UploadObject};
use crate::config::S3Settings;

/// アップロード者を記録するメタデータ（署名付きURLのクエリとして渡す）
pub const UPLOADED_BY_METADATA: &str = "x-amz-meta-created-by";

/// S3互換ストレージによるリンク発行実装。
pub struct S3LinkIssuer {
    /// 内部通信用バケット
    bucket_internal: s3::Bucket,
    /// クライアント向けバケット（署名付きURL生成用）。
    /// Docker内部ホスト名と外部ホスト名が異なる場合に使用。
    /// Noneの場合はbucket_internalを使用する。
    bucket_public: Option<s3::Bucket>,
}

impl S3LinkIssuer {
    pub fn new(bucket_internal: s3::Bucket, bucket_public: Option<s3::Bucket>) -> Self {
        Self {
            bucket_internal,
            bucket_public,
        }
    }

    /// S3互換バケットを初期化する。
    fn init_bucket(
        endpoint: &str,
        region: Option<&str>,
        access_key: &str,
        secret_key: &str,
        bucket_name: &str,
    ) -> anyhow::Result<s3::Bucket> {
        // AWS S3エンドポイント（s3.REGION.amazonaws.com）からリージョンを自動検出。
        // 非AWSエンドポイントではus-east-1をフォールバックとして使用。
        let detected_region = region.map(str::to_string).unwrap_or_else(|| {
            endpoint
                .find("s3.")
                .and_then(|start| {
                    let rest = &endpoint[start + 3..];
                    rest.find(".amazonaws.com").map(|end| rest[..end].to_string())
                })
                .unwrap_or_else(|| "us-east-1".to_string())
        });
        let region = s3::Region::Custom {
            region: detected_region,
            endpoint: endpoint.to_string(),
        };

        let credentials = s3::creds::Credentials::new(
            Some(access_key),
            Some(secret_key),
            None,
            None,
            None,
        )?;

        let bucket = s3::Bucket::new(bucket_name, region, credentials)?.with_path_style();

        Ok(*bucket)
    }

    /// 設定から構築する。
    pub fn from_settings(settings: &S3Settings) -> anyhow::Result<Self> {
        let bucket_internal = Self::init_bucket(
            &settings.endpoint,
            settings.region.as_deref(),
            &settings.access_key,
            &settings.secret_key,
            &settings.bucket,
        )?;

        let bucket_public = settings
            .public_endpoint
            .as_deref()
            .map(|public_ep| {
                tracing::info!(
                    s3_public_endpoint = %public_ep,
                    "クライアント向けS3エンドポイントを設定"
                );
                Self::init_bucket(
                    public_ep,
                    settings.region.as_deref(),
                    &settings.access_key,
                    &settings.secret_key,
                    &settings.bucket,
                )
            })
            .transpose()?;

        tracing::info!(bucket = %settings.bucket, endpoint = %settings.endpoint, "S3ストレージを初期化");
        Ok(Self::new(bucket_internal, bucket_public))
    }

    /// クライアントに渡すURLの署名に使うバケット。
    fn client_bucket(&self) -> &s3::Bucket {
        self.bucket_public.as_ref().unwrap_or(&self.bucket_internal)
    }
}

#[async_trait::async_trait]
impl LinkIssuer for S3LinkIssuer {
    async fn issue_upload_link(
        &self,
        object: &UploadObject,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        let key = object.key();
        let secs = expiry_secs(expires_in)?;
        let metadata = HashMap::from([(
            UPLOADED_BY_METADATA.to_string(),
            object.uploaded_by.to_string(),
        )]);

        self.client_bucket()
            .presign_put(&key, secs, None, Some(metadata))
            .await
            .map_err(|e| StorageError::Presign {
                key,
                reason: e.to_string(),
            })
    }

    async fn issue_download_link(
        &self,
        object: &DownloadObject,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        let secs = expiry_secs(expires_in)?;

        self.client_bucket()
            .presign_get(&object.file_name, secs, None)
            .await
            .map_err(|e| StorageError::Presign {
                key: object.file_name.clone(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filegate_types::{FileExtension, Token};

    fn settings() -> S3Settings {
        S3Settings {
            endpoint: "http://localhost:9000".to_string(),
            public_endpoint: Some("http://files.example.com".to_string()),
            region: None,
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            bucket: "file-transfer".to_string(),
        }
    }

    /// 署名付きURLがローカル計算のみで生成され、公開エンドポイントを指すことを確認
    #[tokio::test]
    async fn test_presigned_urls_use_public_endpoint() {
        let issuer = S3LinkIssuer::from_settings(&settings()).unwrap();

        let upload = issuer
            .issue_upload_link(
                &UploadObject {
                    file_name: "abc".to_string(),
                    extension: FileExtension::parse("png").unwrap(),
                    uploaded_by: Token::from("user-1"),
                    max_size: 10,
                },
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert!(upload.starts_with("http://files.example.com"));
        assert!(upload.contains("file-transfer/abc.png"));
        assert!(upload.contains("X-Amz-Expires=60"));
        assert!(upload.contains("x-amz-meta-created-by=user-1"));

        let download = issuer
            .issue_download_link(
                &DownloadObject {
                    file_name: "report.pdf".to_string(),
                },
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert!(download.contains("file-transfer/report.pdf"));
        assert!(download.contains("X-Amz-Expires=30"));
        assert!(!download.contains(UPLOADED_BY_METADATA));
    }

    #[tokio::test]
    async fn test_zero_expiry_is_rejected() {
        let issuer = S3LinkIssuer::from_settings(&settings()).unwrap();
        let result = issuer
            .issue_download_link(
                &DownloadObject {
                    file_name: "a".to_string(),
                },
                Duration::ZERO,
            )
            .await;
        assert!(matches!(result, Err(StorageError::InvalidExpiry(_))));
    }
}
