//! # テスト用リンク発行
//!
//! ストレージへの接続なしで署名付きURL風の文字列を返す。
//! 発行したリンクを記録し、指定回数以降の発行を失敗させることができる。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use filegate_types::Token;

use super::{expiry_secs, DownloadObject, LinkIssuer, StorageError, UploadObject};

/// 発行済みリンクの記録。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssuedLink {
    Upload {
        key: String,
        max_size: u64,
        uploaded_by: Token,
    },
    Download { key: String },
}

/// インメモリのリンク発行実装。
pub struct MemoryLinkIssuer {
    base_url: String,
    /// この回数だけ成功した後は失敗する
    fail_after: Option<usize>,
    attempts: AtomicUsize,
    issued: Mutex<Vec<IssuedLink>>,
}

impl MemoryLinkIssuer {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            fail_after: None,
            attempts: AtomicUsize::new(0),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// `n` 件の発行に成功した後、以降の発行を全て失敗させる。
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// これまでに発行したリンク。
    pub fn issued(&self) -> Vec<IssuedLink> {
        self.issued.lock().map(|v| v.clone()).unwrap_or_default()
    }

    fn record(&self, link: IssuedLink, expires_in: Duration) -> Result<String, StorageError> {
        let secs = expiry_secs(expires_in)?;
        let (op, key) = match &link {
            IssuedLink::Upload { key, .. } => ("put", key.clone()),
            IssuedLink::Download { key } => ("get", key.clone()),
        };

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some_and(|n| attempt >= n) {
            return Err(StorageError::Presign {
                key,
                reason: "mock storage failure".to_string(),
            });
        }

        if let Ok(mut issued) = self.issued.lock() {
            issued.push(link);
        }
        Ok(format!(
            "{}/{key}?op={op}&expires={secs}&sig={attempt}",
            self.base_url
        ))
    }
}

#[async_trait::async_trait]
impl LinkIssuer for MemoryLinkIssuer {
    async fn issue_upload_link(
        &self,
        object: &UploadObject,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        self.record(
            IssuedLink::Upload {
                key: object.key(),
                max_size: object.max_size,
                uploaded_by: object.uploaded_by.clone(),
            },
            expires_in,
        )
    }

    async fn issue_download_link(
        &self,
        object: &DownloadObject,
        expires_in: Duration,
    ) -> Result<String, StorageError> {
        self.record(
            IssuedLink::Download {
                key: object.file_name.clone(),
            },
            expires_in,
        )
    }
}
