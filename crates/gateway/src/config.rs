//! # Gateway設定・共有状態
//!
//! 環境変数からの設定読み込みとGatewayの共有状態の定義。
//! 設定値の検証は起動時に一度だけ行い、不正な値は起動エラーとする。

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::broker::LinkBroker;
use crate::one_time::OneTimeRoutes;

/// 署名付きURLに指定できる有効期限の上限（7日、秒）
pub const MAX_PRESIGN_EXPIRY_SECS: u64 = 604_800;

const DEFAULT_UPLOAD_PATH: &str = "/upload";
const DEFAULT_DOWNLOAD_PATH: &str = "/download";
const DEFAULT_MAX_LINKS_PER_REQUEST: u64 = 100;
const DEFAULT_ONE_TIME_ROUTE_TTL_SECS: u64 = 600;
const DEFAULT_LOG_LEVEL: &str = "info";

/// 認可判定の問い合わせ先。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthBackend {
    /// 認可サービスへHTTPで問い合わせる
    Remote { addr: String },
    /// 全て許可するインメモリ実装（開発用）
    Dummy,
}

/// S3互換ストレージの接続設定。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    /// 内部通信用エンドポイント
    pub endpoint: String,
    /// クライアントに渡すURLのエンドポイント。Noneなら`endpoint`を使う。
    pub public_endpoint: Option<String>,
    /// リージョン。Noneならエンドポイントから推定する。
    pub region: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
}

/// Gateway設定。
#[derive(Debug, Clone)]
pub struct Config {
    /// `APP_MODE=development` の場合true。エラー詳細をクライアントに返す。
    pub dev_mode: bool,
    /// `RUST_LOG` 未設定時に使うログレベル
    pub min_log_level: String,
    pub server_port: u16,
    pub upload_path: String,
    pub download_path: String,
    pub auth_backend: AuthBackend,
    /// 認可問い合わせ・リンク発行1回あたりの最大時間
    pub auth_query_max_time: Duration,
    pub upload_expire_time: Duration,
    pub download_expire_time: Duration,
    /// 1リクエストで発行できるリンク数の上限
    pub max_links_per_request: u64,
    /// 使い捨てルートが未使用のまま有効でいられる時間
    pub one_time_route_ttl: Duration,
    pub s3: S3Settings,
}

/// `APP_MODE` が開発モード（または未設定）かどうか。`.env` の読み込み判定に使う。
pub fn loads_dotenv(app_mode: Option<&str>) -> bool {
    matches!(app_mode, None | Some("") | Some("development"))
}

impl Config {
    /// プロセスの環境変数から読み込む。
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 任意の変数ソースから読み込む。空文字列は未設定として扱う。
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let dev_mode = get("APP_MODE").as_deref() == Some("development");
        let min_log_level = get("MIN_LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        let server_port: u16 = parse_required(&get, "SERVER_PORT")?;

        let upload_path = route_path(&get, "UPLOAD_PATH", DEFAULT_UPLOAD_PATH)?;
        let download_path = route_path(&get, "DOWNLOAD_PATH", DEFAULT_DOWNLOAD_PATH)?;
        if upload_path == download_path {
            bail!("UPLOAD_PATHとDOWNLOAD_PATHが同じです: {upload_path}");
        }

        let auth_backend = match get("AUTH_BACKEND").as_deref().unwrap_or("remote") {
            "remote" => AuthBackend::Remote {
                addr: get("AUTH_SERVER_ADDR")
                    .context("AUTH_SERVER_ADDRが設定されていません")?,
            },
            "dummy" => AuthBackend::Dummy,
            other => bail!("AUTH_BACKENDが不正です: {other}（remote または dummy）"),
        };

        let auth_query_max_time = positive_secs(&get, "AUTH_QUERY_MAX_TIME", None)?;
        let upload_expire_time = positive_secs(&get, "UPLOAD_EXPIRE_TIME", None)
            .and_then(presign_limit("UPLOAD_EXPIRE_TIME"))?;
        let download_expire_time = positive_secs(&get, "DOWNLOAD_EXPIRE_TIME", None)
            .and_then(presign_limit("DOWNLOAD_EXPIRE_TIME"))?;

        let max_links_per_request = match get("MAX_LINKS_PER_REQUEST") {
            Some(raw) => parse_value::<u64>("MAX_LINKS_PER_REQUEST", &raw)?,
            None => DEFAULT_MAX_LINKS_PER_REQUEST,
        };
        if max_links_per_request == 0 {
            bail!("MAX_LINKS_PER_REQUESTは1以上である必要があります");
        }

        let one_time_route_ttl = positive_secs(
            &get,
            "ONE_TIME_ROUTE_TTL",
            Some(DEFAULT_ONE_TIME_ROUTE_TTL_SECS),
        )?;

        let s3 = S3Settings {
            endpoint: get("S3_ENDPOINT").unwrap_or_else(|| "http://localhost:9000".to_string()),
            public_endpoint: get("S3_PUBLIC_ENDPOINT"),
            region: get("S3_REGION"),
            access_key: get("S3_ACCESS_KEY").unwrap_or_else(|| "minioadmin".to_string()),
            secret_key: get("S3_SECRET_KEY").unwrap_or_else(|| "minioadmin".to_string()),
            bucket: get("S3_BUCKET_NAME").unwrap_or_else(|| "file-transfer".to_string()),
        };

        Ok(Self {
            dev_mode,
            min_log_level,
            server_port,
            upload_path,
            download_path,
            auth_backend,
            auth_query_max_time,
            upload_expire_time,
            download_expire_time,
            max_links_per_request,
            one_time_route_ttl,
            s3,
        })
    }
}

fn parse_value<T>(key: &str, raw: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("{key}のパースに失敗 ({raw:?}): {e}"))
}

fn parse_required<T, G>(get: &G, key: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let raw = get(key).with_context(|| format!("{key}が設定されていません"))?;
    parse_value(key, &raw)
}

/// 秒数を読み込む。0以下は拒否する。
fn positive_secs<G>(get: &G, key: &str, default: Option<u64>) -> anyhow::Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    let secs: i64 = match (get(key), default) {
        (Some(raw), _) => parse_value(key, &raw)?,
        (None, Some(secs)) => i64::try_from(secs)?,
        (None, None) => bail!("{key}が設定されていません"),
    };
    if secs <= 0 {
        bail!("{key}は正の秒数である必要があります: {secs}");
    }
    Ok(Duration::from_secs(secs.unsigned_abs()))
}

fn presign_limit(key: &'static str) -> impl Fn(Duration) -> anyhow::Result<Duration> {
    move |d| {
        if d.as_secs() > MAX_PRESIGN_EXPIRY_SECS {
            bail!(
                "{key}は{MAX_PRESIGN_EXPIRY_SECS}秒以下である必要があります: {}",
                d.as_secs()
            );
        }
        Ok(d)
    }
}

fn route_path<G>(get: &G, key: &str, default: &str) -> anyhow::Result<String>
where
    G: Fn(&str) -> Option<String>,
{
    let path = get(key).unwrap_or_else(|| default.to_string());
    if !path.starts_with('/') || path.starts_with("/once") || path == "/health" {
        bail!("{key}が不正です: {path}");
    }
    // ルーターがパラメータ・ワイルドカードとして解釈する文字は起動時に拒否する
    if path.contains(['{', '}', ':', '*']) {
        bail!("{key}にルート構文の文字（{{ }} : *）は使えません: {path}");
    }
    Ok(path)
}

// ---------------------------------------------------------------------------
// 共有状態
// ---------------------------------------------------------------------------

/// Gatewayの共有状態。
pub struct GatewayState {
    /// 認可判定とリンク発行
    pub broker: LinkBroker,
    /// 使い捨てルート
    pub one_time: OneTimeRoutes,
    /// エラー詳細をクライアントに返すか
    pub expose_errors: bool,
}
