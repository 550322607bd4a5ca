//! # Filegate Gateway
//!
//! 認可サービスの判定に基づき、オブジェクトストアへの期限付きリンクを発行する。
//!
//! ## 構成
//! - [`auth`] — 認可クライアント（[`auth::Authorizer`]）
//! - [`storage`] — リンク発行（[`storage::LinkIssuer`]）
//! - [`broker`] — 認可判定とリンク発行の取りまとめ
//! - [`one_time`] — 使い捨てルートの登録簿
//! - [`endpoints`] — HTTPエンドポイント
//! - [`config`] / [`error`] — 設定・共有状態とエラー型

pub mod auth;
pub mod broker;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod one_time;
pub mod storage;
