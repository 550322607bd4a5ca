//! # Filegate Gateway
//!
//! 認可サービスの判定に基づき、オブジェクトストアへの期限付きリンクを発行するGateway。
//!
//! ## 役割
//! - 認可サービスへの権限問い合わせ（期限付き）
//! - 許可された項目ごとの署名付きURL発行
//! - 使い捨てルートの配信
//!
//! ## API エンドポイント
//! - `POST {UPLOAD_PATH}` — アップロードURL発行
//! - `GET {DOWNLOAD_PATH}` — ダウンロードURL発行
//! - `/once/{*path}` — 使い捨てルート
//! - `GET /health` — 死活監視

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use filegate_gateway::auth::{Authorizer, RemoteAuthorizer, StaticAuthorizer};
use filegate_gateway::broker::{BrokerLimits, LinkBroker};
use filegate_gateway::config::{self, AuthBackend, Config, GatewayState};
use filegate_gateway::endpoints;
use filegate_gateway::one_time::OneTimeRoutes;
use filegate_gateway::storage::LinkIssuer;

/// 期限切れ使い捨てルートの掃除間隔の上限
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 開発モード（またはAPP_MODE未設定）では .env を読み込む
    let app_mode = std::env::var("APP_MODE").ok();
    let dotenv = config::loads_dotenv(app_mode.as_deref()).then(dotenvy::dotenv);

    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.min_log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(Err(e)) = dotenv {
        tracing::warn!(error = %e, ".envファイルを読み込めませんでした");
    }

    let authorizer: Arc<dyn Authorizer> = match &config.auth_backend {
        AuthBackend::Remote { addr } => {
            Arc::new(RemoteAuthorizer::new(addr, config.auth_query_max_time)?)
        }
        AuthBackend::Dummy => {
            tracing::warn!("AUTH_BACKEND=dummy: 全てのリクエストを許可します（開発環境用）");
            Arc::new(StaticAuthorizer::allow_all())
        }
    };
    let issuer = build_issuer(&config)?;

    let state = Arc::new(GatewayState {
        broker: LinkBroker::new(authorizer, issuer, BrokerLimits::from_config(&config)),
        one_time: OneTimeRoutes::new(Some(config.one_time_route_ttl)),
        expose_errors: config.dev_mode,
    });

    // 未使用のまま期限切れになった使い捨てルートを定期的に削除する
    let sweep_state = Arc::clone(&state);
    let sweep_every =
        (config.one_time_route_ttl / 2).clamp(Duration::from_secs(1), MAX_SWEEP_INTERVAL);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            sweep_state.one_time.sweep_expired();
        }
    });

    let app = endpoints::build_router(state, &config.upload_path, &config.download_path);

    let addr = format!("0.0.0.0:{}", config.server_port);
    tracing::info!(
        upload_path = %config.upload_path,
        download_path = %config.download_path,
        dev_mode = config.dev_mode,
        "Gatewayを {} で起動します",
        addr
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(feature = "vendor-aws")]
fn build_issuer(config: &Config) -> anyhow::Result<Arc<dyn LinkIssuer>> {
    Ok(Arc::new(filegate_gateway::storage::S3LinkIssuer::from_settings(&config.s3)?))
}

#[cfg(not(feature = "vendor-aws"))]
fn build_issuer(_config: &Config) -> anyhow::Result<Arc<dyn LinkIssuer>> {
    anyhow::bail!("ストレージ実装が有効になっていません（vendor-aws featureを有効にしてください）")
}
