//! # インメモリ認可
//!
//! 認可サービスを利用できない開発環境・テストで使用する固定ポリシーの実装。
//! `AUTH_BACKEND=dummy` の場合は [`StaticAuthorizer::allow_all`] で起動する。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use filegate_types::*;

use super::{AuthError, Authorizer};

/// 全許可時に返す最大サイズ（KB）
pub const DEFAULT_MAX_SIZE_KB: u64 = 10240;

/// 固定ポリシーによる認可実装。
pub struct StaticAuthorizer {
    /// ダウンロードを許可するオブジェクトトークン。Noneなら全許可。
    downloads: Option<HashSet<Token>>,
    /// 拡張子ごとの (可否, 最大サイズ)。Noneなら全許可。
    uploads: Option<HashMap<FileExtension, (bool, u64)>>,
    /// 常に返すエラー（障害の再現用）
    failure: Option<AuthError>,
    /// 判定前に待つ時間（期限超過の再現用）
    latency: Duration,
    /// 呼び出し回数
    calls: AtomicUsize,
}

impl StaticAuthorizer {
    /// 全てのダウンロード・アップロードを許可する。
    pub fn allow_all() -> Self {
        Self {
            downloads: None,
            uploads: None,
            failure: None,
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// 何も許可しない。
    pub fn deny_all() -> Self {
        Self {
            downloads: Some(HashSet::new()),
            uploads: Some(HashMap::new()),
            ..Self::allow_all()
        }
    }

    /// 指定したオブジェクトトークンのみダウンロードを許可する。
    pub fn with_downloads<I, T>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Token>,
    {
        self.downloads = Some(tokens.into_iter().map(Into::into).collect());
        self
    }

    /// 拡張子ごとの判定を追加する。未登録の拡張子は判定結果に含まれない。
    pub fn with_upload(mut self, ext: &str, is_allow: bool, max_size: u64) -> Self {
        if let Ok(ext) = FileExtension::parse(ext) {
            self.uploads
                .get_or_insert_with(HashMap::new)
                .insert(ext, (is_allow, max_size));
        }
        self
    }

    pub fn failing(mut self, err: AuthError) -> Self {
        self.failure = Some(err);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// これまでの呼び出し回数。
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<(), AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Authorizer for StaticAuthorizer {
    async fn is_allowed_download(
        &self,
        req: &DownloadAccessReq,
    ) -> Result<AllowDownload, AuthError> {
        self.enter().await?;
        Ok(req
            .object_tokens
            .iter()
            .map(|t| {
                let allowed = self.downloads.as_ref().map_or(true, |set| set.contains(t));
                (t.clone(), allowed)
            })
            .collect())
    }

    async fn is_allowed_upload(&self, req: &UploadAccessReq) -> Result<Vec<AllowType>, AuthError> {
        self.enter().await?;
        Ok(req
            .object_types
            .keys()
            .filter_map(|ext| match &self.uploads {
                None => Some(AllowType {
                    file_type: ext.clone(),
                    is_allow: true,
                    max_size: DEFAULT_MAX_SIZE_KB,
                }),
                Some(policy) => policy.get(ext).map(|&(is_allow, max_size)| AllowType {
                    file_type: ext.clone(),
                    is_allow,
                    max_size,
                }),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all_upload_uses_default_max_size() {
        let auth = StaticAuthorizer::allow_all();
        let req = UploadAccessReq {
            auth_token: Token::from("u"),
            object_types: [(FileExtension::parse("png").unwrap(), 2)].into_iter().collect(),
        };
        let types = auth.is_allowed_upload(&req).await.unwrap();
        assert_eq!(types.len(), 1);
        assert!(types[0].is_allow);
        assert_eq!(types[0].max_size, DEFAULT_MAX_SIZE_KB);
        assert_eq!(auth.calls(), 1);
    }

    #[tokio::test]
    async fn test_download_policy() {
        let auth = StaticAuthorizer::allow_all().with_downloads(["a"]);
        let req = DownloadAccessReq {
            auth_token: Token::from("u"),
            object_tokens: vec![Token::from("a"), Token::from("b")],
        };
        let allowed = auth.is_allowed_download(&req).await.unwrap();
        assert_eq!(allowed[&Token::from("a")], true);
        assert_eq!(allowed[&Token::from("b")], false);
    }

    #[tokio::test]
    async fn test_failure_is_returned() {
        let auth = StaticAuthorizer::allow_all().failing(AuthError::Forbidden("disabled".into()));
        let req = DownloadAccessReq {
            auth_token: Token::from("u"),
            object_tokens: vec![],
        };
        let err = auth.is_allowed_download(&req).await.unwrap_err();
        assert_eq!(err, AuthError::Forbidden("disabled".into()));
    }
}
