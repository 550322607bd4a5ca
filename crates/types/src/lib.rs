//! # Filegate 共有型定義
//!
//! リンク発行ゲートウェイ・認可サービス・クライアント間で受け渡すデータ構造。
//!
//! ## 構成
//! - 識別子: [`Token`], [`FileExtension`]
//! - 認可判定の入出力: [`UploadAccessReq`], [`DownloadAccessReq`], [`AllowType`], [`AllowDownload`]
//! - ゲートウェイHTTP契約: [`UploadPayload`], [`DownloadPayload`], [`LinkResponse`]
//! - 認可RPC契約: [`AuthUploadRequest`], [`AuthDownloadRequest`] とその応答

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// 識別子
// ---------------------------------------------------------------------------

/// 不透明なトークン（認証トークン、またはストレージ上のオブジェクト参照）。
///
/// 内部構造を仮定しない。比較は値の等価性のみ。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// 正規化済みのファイル拡張子タグ（例: `png`, `pdf`）。
///
/// 認可スコープとストレージキーの接尾辞の両方に使われるため、
/// 比較の前に必ず正規化されている（小文字、先頭ドットなし）。
/// [`FileExtension::parse`] 以外からは構築できない。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileExtension(String);

/// 拡張子として受け付けられない文字列。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("不正なファイル拡張子: {0:?}")]
pub struct InvalidExtension(pub String);

impl FileExtension {
    /// 生の拡張子文字列を正規化する。
    ///
    /// 前後の空白と先頭のドットを取り除き、小文字化する。
    /// 結果が空、またはASCII英数字以外を含む場合は拒否する。
    pub fn parse(raw: &str) -> Result<Self, InvalidExtension> {
        let normalized = raw.trim().trim_start_matches('.').to_ascii_lowercase();
        if normalized.is_empty() || !normalized.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(InvalidExtension(raw.to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FileExtension {
    type Error = InvalidExtension;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FileExtension> for String {
    fn from(value: FileExtension) -> Self {
        value.0
    }
}

// ---------------------------------------------------------------------------
// 認可判定の入出力
// ---------------------------------------------------------------------------

/// アップロード権限の問い合わせ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAccessReq {
    /// 認証トークン（JWT等、認可サービスとの取り決めによる）
    pub auth_token: Token,
    /// 拡張子ごとのアップロード希望数。0件の拡張子は含まれない。
    pub object_types: BTreeMap<FileExtension, u32>,
}

impl UploadAccessReq {
    /// HTTPペイロードから問い合わせを構築する。
    ///
    /// 正規化後に同じ拡張子となるキーは件数を合算する。
    /// 0件のキーは省略と同じ扱いで、拡張子の検査もしない。
    pub fn from_payload(payload: UploadPayload) -> Result<Self, InvalidExtension> {
        let mut object_types: BTreeMap<FileExtension, u32> = BTreeMap::new();
        for (raw, count) in payload.object_types {
            if count == 0 {
                continue;
            }
            let ext = FileExtension::parse(&raw)?;
            let entry = object_types.entry(ext).or_insert(0);
            *entry = entry.saturating_add(count);
        }
        Ok(Self {
            auth_token: payload.auth_token,
            object_types,
        })
    }

    /// 要求されたリンクの総数。
    pub fn total_links(&self) -> u64 {
        self.object_types.values().map(|&c| u64::from(c)).sum()
    }
}

/// ダウンロード権限の問い合わせ。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadAccessReq {
    /// 認証トークン
    pub auth_token: Token,
    /// ダウンロード対象オブジェクトのトークン（重複なし、初出順）
    pub object_tokens: Vec<Token>,
}

impl DownloadAccessReq {
    /// HTTPペイロードから問い合わせを構築する。重複トークンは初出のみ残す。
    pub fn from_payload(payload: DownloadPayload) -> Self {
        let mut seen = HashSet::new();
        let object_tokens = payload
            .object_tokens
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();
        Self {
            auth_token: payload.auth_token,
            object_tokens,
        }
    }
}

/// 拡張子ごとのアップロード可否。認可サービスのみが生成する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowType {
    pub file_type: FileExtension,
    pub is_allow: bool,
    /// 1ファイルあたりの最大サイズ（KB）。現状は参考値で、ゲートウェイでは強制しない。
    pub max_size: u64,
}

/// オブジェクトトークンごとのダウンロード可否。
/// 含まれないトークンは拒否として扱う。
pub type AllowDownload = HashMap<Token, bool>;

// ---------------------------------------------------------------------------
// ゲートウェイHTTP契約
// ---------------------------------------------------------------------------

/// アップロードエンドポイントのリクエストボディ。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPayload {
    #[serde(rename = "auth-token")]
    pub auth_token: Token,
    /// 拡張子（未正規化）→ 件数
    #[serde(rename = "object-types")]
    pub object_types: HashMap<String, u32>,
}

/// ダウンロードエンドポイントのリクエストボディ。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadPayload {
    #[serde(rename = "auth-token")]
    pub auth_token: Token,
    #[serde(rename = "object-tokens")]
    pub object_tokens: Vec<Token>,
}

/// ゲートウェイの共通レスポンス。
///
/// ダウンロード: `tokens2urls` はトークン → URL（拒否は空文字列）。
/// アップロード: `tokens2urls` は拡張子 → URLリスト（拒否された拡張子は含まれない）。
/// エラー時は `tokens2urls` が `null` になる。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkResponse<T> {
    #[serde(rename = "status-code")]
    pub status_code: u16,
    pub message: String,
    #[serde(rename = "tokens2urls")]
    pub tokens2urls: Option<T>,
}

/// ダウンロードレスポンスの `tokens2urls`。
pub type DownloadLinks = BTreeMap<String, String>;

/// アップロードレスポンスの `tokens2urls`。
pub type UploadLinks = BTreeMap<String, Vec<String>>;

// ---------------------------------------------------------------------------
// 認可RPC契約
// ---------------------------------------------------------------------------

/// 認可サービスの判定ステータス。ワイヤ上は整数で運ばれる。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Ok,
    ErrForbidden,
    ErrUnauthorized,
    ErrInternal,
}

/// [`AuthStatus`] に該当しないステータスコード。
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("未知の認可ステータスコード: {0}")]
pub struct UnknownAuthStatus(pub i32);

impl TryFrom<i32> for AuthStatus {
    type Error = UnknownAuthStatus;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(AuthStatus::Ok),
            1 => Ok(AuthStatus::ErrForbidden),
            2 => Ok(AuthStatus::ErrUnauthorized),
            3 => Ok(AuthStatus::ErrInternal),
            other => Err(UnknownAuthStatus(other)),
        }
    }
}

impl From<AuthStatus> for i32 {
    fn from(status: AuthStatus) -> Self {
        match status {
            AuthStatus::Ok => 0,
            AuthStatus::ErrForbidden => 1,
            AuthStatus::ErrUnauthorized => 2,
            AuthStatus::ErrInternal => 3,
        }
    }
}

/// `POST /is-allowed-download` リクエスト。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthDownloadRequest {
    pub auth_token: String,
    pub object_tokens: Vec<String>,
}

/// `POST /is-allowed-download` レスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthDownloadReply {
    /// [`AuthStatus`] の整数表現
    pub status_code: i32,
    #[serde(default)]
    pub errmsg: String,
    /// オブジェクトトークン → 可否（status_codeがOKの場合のみ意味を持つ）
    #[serde(default)]
    pub files: HashMap<String, bool>,
}

/// `POST /is-allowed-upload` リクエスト。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUploadRequest {
    pub auth_token: String,
    /// 拡張子 → 件数
    pub object_types: BTreeMap<String, u64>,
}

/// `POST /is-allowed-upload` レスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUploadReply {
    pub status_code: i32,
    #[serde(default)]
    pub errmsg: String,
    #[serde(default)]
    pub file_types: Vec<AuthFileType>,
}

/// 拡張子ごとの判定結果（ワイヤ形式）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFileType {
    pub file_type: String,
    /// KB単位
    pub max_size: u64,
    pub is_allow: bool,
}
