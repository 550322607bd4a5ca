//! # リンク発行の取りまとめ
//!
//! 1リクエスト分の処理パイプライン:
//! 1. 要求リンク数の上限チェック
//! 2. 認可サービスへの問い合わせ（1回のみ、期限付き）
//! 3. 許可された項目ごとにリンクを発行（逐次、各発行も期限付き）
//!
//! 途中で1件でも発行に失敗した場合は即座に内部エラーで打ち切る。
//! 発行済みのリンクは取り消さず、ストレージ側の期限切れに任せる。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use filegate_types::*;

use crate::auth::Authorizer;
use crate::config::Config;
use crate::error::GatewayError;
use crate::storage::{DownloadObject, LinkIssuer, UploadObject};

/// 失敗した処理段階。クライアント向けメッセージの選択に使う。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// 認可問い合わせ前の検証
    Request,
    /// 認可サービスへの問い合わせ
    Authorization,
    /// リンク発行
    Issuance,
}

/// 取りまとめ処理の失敗。
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct BrokerError {
    pub stage: Stage,
    pub error: GatewayError,
}

impl BrokerError {
    fn at(stage: Stage) -> impl FnOnce(GatewayError) -> Self {
        move |error| Self { stage, error }
    }
}

/// 期限・上限の設定。
#[derive(Debug, Clone, Copy)]
pub struct BrokerLimits {
    pub upload_expiry: Duration,
    pub download_expiry: Duration,
    /// 認可問い合わせ・リンク発行1回あたりの最大時間
    pub max_query_time: Duration,
    /// 1リクエストで発行できるリンク数の上限
    pub max_links: u64,
}

impl BrokerLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            upload_expiry: config.upload_expire_time,
            download_expiry: config.download_expire_time,
            max_query_time: config.auth_query_max_time,
            max_links: config.max_links_per_request,
        }
    }
}

/// 認可判定とリンク発行を取りまとめる。
///
/// 認可・ストレージとも具体的な実装を知らず、トレイト経由でのみ呼び出す。
pub struct LinkBroker {
    authorizer: Arc<dyn Authorizer>,
    issuer: Arc<dyn LinkIssuer>,
    limits: BrokerLimits,
}

impl LinkBroker {
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        issuer: Arc<dyn LinkIssuer>,
        limits: BrokerLimits,
    ) -> Self {
        Self {
            authorizer,
            issuer,
            limits,
        }
    }

    /// 要求された全オブジェクトトークンについてダウンロードURLを返す。
    ///
    /// 拒否されたトークン、および認可サービスの応答に含まれないトークンは
    /// 空文字列に対応付ける。
    pub async fn download_links(
        &self,
        req: DownloadAccessReq,
    ) -> Result<DownloadLinks, BrokerError> {
        check_auth_token(&req.auth_token)
            .and_then(|()| self.check_link_count(req.object_tokens.len() as u64))
            .map_err(BrokerError::at(Stage::Request))?;

        let allowed = self
            .within_deadline(
                Stage::Authorization,
                "ダウンロード権限の問い合わせ",
                self.authorizer.is_allowed_download(&req),
            )
            .await?;

        let mut links = DownloadLinks::new();
        for token in &req.object_tokens {
            if !allowed.get(token).copied().unwrap_or(false) {
                links.insert(token.to_string(), String::new());
                continue;
            }

            let object = DownloadObject {
                file_name: token.to_string(),
            };
            let url = self
                .within_deadline(
                    Stage::Issuance,
                    "ダウンロードURLの発行",
                    self.issuer
                        .issue_download_link(&object, self.limits.download_expiry),
                )
                .await?;
            links.insert(token.to_string(), url);
        }

        tracing::debug!(
            requested = req.object_tokens.len(),
            granted = links.values().filter(|url| !url.is_empty()).count(),
            "ダウンロードURLを発行"
        );
        Ok(links)
    }

    /// 許可された拡張子ごとに、要求件数分のアップロードURLを返す。
    ///
    /// 拒否された拡張子は結果に含めない。要求していない拡張子に対する判定は無視し、
    /// 同じ拡張子に複数の判定がある場合は最初のものを採用する。
    pub async fn upload_links(&self, req: UploadAccessReq) -> Result<UploadLinks, BrokerError> {
        check_auth_token(&req.auth_token)
            .and_then(|()| self.check_link_count(req.total_links()))
            .map_err(BrokerError::at(Stage::Request))?;

        let decisions = self
            .within_deadline(
                Stage::Authorization,
                "アップロード権限の問い合わせ",
                self.authorizer.is_allowed_upload(&req),
            )
            .await?;

        let mut verdicts: HashMap<&FileExtension, &AllowType> = HashMap::new();
        for decision in &decisions {
            if !req.object_types.contains_key(&decision.file_type) {
                tracing::debug!(extension = %decision.file_type, "要求していない拡張子の判定を無視");
                continue;
            }
            verdicts.entry(&decision.file_type).or_insert(decision);
        }

        let mut links = UploadLinks::new();
        for (ext, &count) in &req.object_types {
            let decision = match verdicts.get(ext) {
                Some(decision) if decision.is_allow => decision,
                _ => continue,
            };
            // 最大サイズは現状参考値。発行先に渡して記録するのみ。
            tracing::debug!(
                extension = %ext,
                count,
                max_size_kb = decision.max_size,
                "アップロードURLを発行"
            );

            let mut urls = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let object = UploadObject {
                    file_name: uuid::Uuid::new_v4().to_string(),
                    extension: ext.clone(),
                    uploaded_by: req.auth_token.clone(),
                    max_size: decision.max_size,
                };
                let url = self
                    .within_deadline(
                        Stage::Issuance,
                        "アップロードURLの発行",
                        self.issuer
                            .issue_upload_link(&object, self.limits.upload_expiry),
                    )
                    .await?;
                urls.push(url);
            }
            links.insert(ext.to_string(), urls);
        }

        Ok(links)
    }

    fn check_link_count(&self, requested: u64) -> Result<(), GatewayError> {
        if requested > self.limits.max_links {
            return Err(GatewayError::BadRequest(format!(
                "要求リンク数が上限を超えています: {requested} (上限: {})",
                self.limits.max_links
            )));
        }
        Ok(())
    }

    /// 外部呼び出しを期限付きで実行する。期限超過は内部エラー。
    async fn within_deadline<T, E, F>(
        &self,
        stage: Stage,
        action: &str,
        call: F,
    ) -> Result<T, BrokerError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<GatewayError>,
    {
        let result = match tokio::time::timeout(self.limits.max_query_time, call).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(GatewayError::Internal(format!(
                "{action}が{}ミリ秒以内に完了しませんでした",
                self.limits.max_query_time.as_millis()
            ))),
        };
        result.map_err(BrokerError::at(stage))
    }
}

fn check_auth_token(token: &Token) -> Result<(), GatewayError> {
    if token.is_empty() {
        return Err(GatewayError::BadRequest(
            "認証トークンが指定されていません".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthError, StaticAuthorizer};
    use crate::storage::memory::IssuedLink;
    use crate::storage::MemoryLinkIssuer;
    use std::collections::HashSet;

    fn limits() -> BrokerLimits {
        BrokerLimits {
            upload_expiry: Duration::from_secs(600),
            download_expiry: Duration::from_secs(300),
            max_query_time: Duration::from_secs(2),
            max_links: 100,
        }
    }

    fn broker(
        auth: StaticAuthorizer,
        issuer: MemoryLinkIssuer,
    ) -> (LinkBroker, Arc<StaticAuthorizer>, Arc<MemoryLinkIssuer>) {
        let auth = Arc::new(auth);
        let issuer = Arc::new(issuer);
        let broker = LinkBroker::new(auth.clone(), issuer.clone(), limits());
        (broker, auth, issuer)
    }

    fn download_req(tokens: &[&str]) -> DownloadAccessReq {
        DownloadAccessReq {
            auth_token: Token::from("user-1"),
            object_tokens: tokens.iter().map(|&t| Token::from(t)).collect(),
        }
    }

    fn upload_req(types: &[(&str, u32)]) -> UploadAccessReq {
        UploadAccessReq {
            auth_token: Token::from("user-1"),
            object_types: types
                .iter()
                .map(|&(ext, n)| (FileExtension::parse(ext).unwrap(), n))
                .collect(),
        }
    }

    // -----------------------------------------------------------------------
    // ダウンロード
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_download_partial_allow() {
        let (broker, auth, issuer) = broker(
            StaticAuthorizer::allow_all().with_downloads(["a"]),
            MemoryLinkIssuer::new("http://mock-storage"),
        );

        let links = broker.download_links(download_req(&["a", "b"])).await.unwrap();
        assert_eq!(links.len(), 2);
        assert!(!links["a"].is_empty());
        assert_eq!(links["b"], "");
        assert_eq!(auth.calls(), 1);
        assert_eq!(
            issuer.issued(),
            vec![IssuedLink::Download {
                key: "a".to_string()
            }]
        );
    }

    /// 認可サービスの応答に含まれないトークンは拒否扱いになることを確認
    #[tokio::test]
    async fn test_download_missing_decision_is_denied() {
        struct PartialAuthorizer;

        #[async_trait::async_trait]
        impl Authorizer for PartialAuthorizer {
            async fn is_allowed_download(
                &self,
                _req: &DownloadAccessReq,
            ) -> Result<AllowDownload, AuthError> {
                Ok([(Token::from("a"), true), (Token::from("zzz"), true)]
                    .into_iter()
                    .collect())
            }

            async fn is_allowed_upload(
                &self,
                _req: &UploadAccessReq,
            ) -> Result<Vec<AllowType>, AuthError> {
                Ok(vec![])
            }
        }

        let issuer = Arc::new(MemoryLinkIssuer::new("http://mock-storage"));
        let broker = LinkBroker::new(Arc::new(PartialAuthorizer), issuer.clone(), limits());

        let links = broker
            .download_links(download_req(&["a", "b", "c"]))
            .await
            .unwrap();
        let keys: Vec<_> = links.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(links["b"], "");
        assert_eq!(links["c"], "");
        // 要求していないトークンには発行しない
        assert_eq!(issuer.issued().len(), 1);
    }

    #[tokio::test]
    async fn test_download_empty_tokens() {
        let (broker, auth, issuer) = broker(
            StaticAuthorizer::allow_all(),
            MemoryLinkIssuer::new("http://mock-storage"),
        );
        let links = broker.download_links(download_req(&[])).await.unwrap();
        assert!(links.is_empty());
        assert_eq!(auth.calls(), 1);
        assert!(issuer.issued().is_empty());
    }

    #[tokio::test]
    async fn test_auth_errors_stop_before_issuance() {
        for err in [
            AuthError::Internal("down".into()),
            AuthError::Unauthorized("who".into()),
            AuthError::Forbidden("no".into()),
        ] {
            let (broker, _, issuer) = broker(
                StaticAuthorizer::allow_all().failing(err.clone()),
                MemoryLinkIssuer::new("http://mock-storage"),
            );
            let failure = broker.download_links(download_req(&["a"])).await.unwrap_err();
            assert_eq!(failure.stage, Stage::Authorization);
            assert_eq!(failure.error.status().as_u16(), 500, "{err}");

            let failure = broker
                .upload_links(upload_req(&[("png", 1)]))
                .await
                .unwrap_err();
            assert_eq!(failure.stage, Stage::Authorization);
            assert_eq!(failure.error.status().as_u16(), 500, "{err}");

            assert!(issuer.issued().is_empty());
        }
    }

    /// 認可問い合わせが期限を超えた場合、URLを1件も発行せず内部エラーになることを確認
    #[tokio::test]
    async fn test_auth_deadline_exceeded() {
        let auth = Arc::new(StaticAuthorizer::allow_all().with_latency(Duration::from_millis(500)));
        let issuer = Arc::new(MemoryLinkIssuer::new("http://mock-storage"));
        let broker = LinkBroker::new(
            auth.clone(),
            issuer.clone(),
            BrokerLimits {
                max_query_time: Duration::from_millis(50),
                ..limits()
            },
        );

        let failure = broker.download_links(download_req(&["a"])).await.unwrap_err();
        assert_eq!(failure.stage, Stage::Authorization);
        assert!(matches!(failure.error, GatewayError::Internal(_)));

        let failure = broker
            .upload_links(upload_req(&[("png", 2)]))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, GatewayError::Internal(_)));

        assert!(issuer.issued().is_empty());
    }

    /// 発行途中で失敗した場合は打ち切り、以降の発行を行わないことを確認
    #[tokio::test]
    async fn test_issuer_failure_aborts_fan_out() {
        let (broker, _, issuer) = broker(
            StaticAuthorizer::allow_all(),
            MemoryLinkIssuer::new("http://mock-storage").failing_after(1),
        );
        let failure = broker
            .download_links(download_req(&["a", "b", "c"]))
            .await
            .unwrap_err();
        assert_eq!(failure.stage, Stage::Issuance);
        assert!(matches!(failure.error, GatewayError::Internal(_)));
        assert_eq!(issuer.issued().len(), 1);
    }

    #[tokio::test]
    async fn test_link_cap_checked_before_authorization() {
        let auth = Arc::new(StaticAuthorizer::allow_all());
        let broker = LinkBroker::new(
            auth.clone(),
            Arc::new(MemoryLinkIssuer::new("http://mock-storage")),
            BrokerLimits {
                max_links: 2,
                ..limits()
            },
        );

        let failure = broker
            .upload_links(upload_req(&[("png", 2), ("pdf", 1)]))
            .await
            .unwrap_err();
        assert_eq!(failure.stage, Stage::Request);
        assert!(matches!(failure.error, GatewayError::BadRequest(_)));

        let failure = broker
            .download_links(download_req(&["a", "b", "c"]))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, GatewayError::BadRequest(_)));

        assert_eq!(auth.calls(), 0);
        assert!(broker.upload_links(upload_req(&[("png", 2)])).await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_auth_token_is_bad_request() {
        let (broker, auth, _) = broker(
            StaticAuthorizer::allow_all(),
            MemoryLinkIssuer::new("http://mock-storage"),
        );
        let req = DownloadAccessReq {
            auth_token: Token::from(""),
            object_tokens: vec![Token::from("a")],
        };
        let failure = broker.download_links(req).await.unwrap_err();
        assert_eq!(failure.stage, Stage::Request);
        assert!(matches!(failure.error, GatewayError::BadRequest(_)));
        assert_eq!(auth.calls(), 0);
    }

    // -----------------------------------------------------------------------
    // アップロード
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_upload_count_matches_request() {
        let (broker, _, issuer) = broker(
            StaticAuthorizer::allow_all().with_upload("png", true, 10240),
            MemoryLinkIssuer::new("http://mock-storage"),
        );

        let links = broker.upload_links(upload_req(&[("png", 2)])).await.unwrap();
        assert_eq!(links.len(), 1);
        let urls = &links["png"];
        assert_eq!(urls.len(), 2);
        assert_ne!(urls[0], urls[1]);

        let issued = issuer.issued();
        assert_eq!(issued.len(), 2);
        let keys: HashSet<_> = issued
            .iter()
            .map(|link| match link {
                IssuedLink::Upload {
                    key,
                    max_size,
                    uploaded_by,
                } => {
                    assert_eq!(*max_size, 10240);
                    assert_eq!(uploaded_by.as_str(), "user-1");
                    assert!(key.ends_with(".png"));
                    key.clone()
                }
                other => panic!("unexpected link: {other:?}"),
            })
            .collect();
        assert_eq!(keys.len(), 2);
    }

    /// 拒否された拡張子・判定のない拡張子は結果に含まれず、発行もされないことを確認
    #[tokio::test]
    async fn test_upload_denied_types_are_omitted() {
        let (broker, _, issuer) = broker(
            StaticAuthorizer::deny_all()
                .with_upload("png", true, 100)
                .with_upload("exe", false, 0),
            MemoryLinkIssuer::new("http://mock-storage"),
        );

        let links = broker
            .upload_links(upload_req(&[("png", 1), ("exe", 3), ("pdf", 2)]))
            .await
            .unwrap();
        assert_eq!(links.keys().collect::<Vec<_>>(), vec!["png"]);
        assert_eq!(links["png"].len(), 1);
        assert_eq!(issuer.issued().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_first_decision_wins_and_unrequested_ignored() {
        struct NoisyAuthorizer;

        #[async_trait::async_trait]
        impl Authorizer for NoisyAuthorizer {
            async fn is_allowed_download(
                &self,
                _req: &DownloadAccessReq,
            ) -> Result<AllowDownload, AuthError> {
                Ok(AllowDownload::new())
            }

            async fn is_allowed_upload(
                &self,
                _req: &UploadAccessReq,
            ) -> Result<Vec<AllowType>, AuthError> {
                let ext = |s: &str| FileExtension::parse(s).unwrap();
                Ok(vec![
                    AllowType {
                        file_type: ext("png"),
                        is_allow: false,
                        max_size: 1,
                    },
                    AllowType {
                        file_type: ext("png"),
                        is_allow: true,
                        max_size: 1,
                    },
                    AllowType {
                        file_type: ext("gif"),
                        is_allow: true,
                        max_size: 1,
                    },
                    AllowType {
                        file_type: ext("pdf"),
                        is_allow: true,
                        max_size: 1,
                    },
                ])
            }
        }

        let issuer = Arc::new(MemoryLinkIssuer::new("http://mock-storage"));
        let broker = LinkBroker::new(Arc::new(NoisyAuthorizer), issuer.clone(), limits());

        let links = broker
            .upload_links(upload_req(&[("png", 1), ("pdf", 2)]))
            .await
            .unwrap();
        assert_eq!(links.keys().collect::<Vec<_>>(), vec!["pdf"]);
        assert_eq!(links["pdf"].len(), 2);
        assert_eq!(issuer.issued().len(), 2);
    }
}
