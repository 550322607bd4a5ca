//! # 使い捨てルート
//!
//! 最初の1回だけ処理を受け付けるパスの管理。
//!
//! パスごとのスロットが生存フラグを持ち、`dispatch` は1回の compare-and-swap で
//! フラグを「有効」から「使用済み」に倒す。同じパスに同時に何件のリクエストが来ても
//! 勝者は1件だけで、残りは Gone となる。ロックはパス単位（DashMapのシャード）で、
//! 無関係なパス同士は直列化されない。
//!
//! 登録時のHTTPメソッドと異なるリクエストはフラグに触れずに拒否する。
//! プリフライトや誤ったメソッドのリクエストでスロットが消費されることはない。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::Method;
use axum::routing::MethodRouter;
use dashmap::DashMap;

/// 使い捨てルートを配信するパスの接頭辞
pub const ONE_TIME_PREFIX: &str = "/once";

struct Slot {
    /// true = 未使用
    live: AtomicBool,
    /// 受け付けるHTTPメソッド
    method: Method,
    handler: MethodRouter,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// `dispatch` が使用権を渡さなかった理由。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// 未登録・使用済み・期限切れ
    Gone,
    /// 登録時と異なるメソッド。スロットは有効なまま残る。
    MethodNotAllowed { allowed: Method },
}

/// `dispatch` に勝った呼び出し側だけが受け取るハンドラ。
pub struct Claim {
    slot: Arc<Slot>,
}

impl Claim {
    /// 登録されたハンドラ。
    pub fn handler(&self) -> MethodRouter {
        self.slot.handler.clone()
    }
}

/// 使い捨てルートの登録簿。
pub struct OneTimeRoutes {
    slots: DashMap<String, Arc<Slot>>,
    /// `register` で使う既定の有効期間。Noneなら期限なし。
    default_ttl: Option<Duration>,
}

impl OneTimeRoutes {
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            slots: DashMap::new(),
            default_ttl,
        }
    }

    /// パスを有効な状態で登録する。既存の登録は置き換えられ、再び有効になる。
    ///
    /// `path` はリクエストURIのパスと完全一致で照合される（例: `/once/3f2a`）。
    /// `method` 以外のリクエストは使用権を得られない。
    pub fn register(&self, path: impl Into<String>, method: Method, handler: MethodRouter) {
        self.insert(path.into(), method, handler, self.default_ttl);
    }

    /// 有効期間を指定して登録する。
    pub fn register_with_ttl(
        &self,
        path: impl Into<String>,
        method: Method,
        handler: MethodRouter,
        ttl: Duration,
    ) {
        self.insert(path.into(), method, handler, Some(ttl));
    }

    fn insert(&self, path: String, method: Method, handler: MethodRouter, ttl: Option<Duration>) {
        tracing::debug!(
            path = %path,
            method = %method,
            ttl_secs = ttl.map(|t| t.as_secs()),
            "使い捨てルートを登録"
        );
        let slot = Slot {
            live: AtomicBool::new(true),
            method,
            handler,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.slots.insert(path, Arc::new(slot));
    }

    /// パスの使用権を取得する。勝者1件のみ `Ok` を受け取る。
    ///
    /// 未登録・使用済み・期限切れのパスは [`Rejection::Gone`]。
    /// メソッドが異なる場合は [`Rejection::MethodNotAllowed`] で、フラグは変更しない。
    pub fn dispatch(&self, path: &str, method: &Method) -> Result<Claim, Rejection> {
        // シャードのロックを保持したままCASしないよう、Arcを複製してから操作する
        let slot = self
            .slots
            .get(path)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(Rejection::Gone)?;
        if slot.is_expired(Instant::now()) || !slot.live.load(Ordering::Acquire) {
            return Err(Rejection::Gone);
        }
        if slot.method != *method {
            return Err(Rejection::MethodNotAllowed {
                allowed: slot.method.clone(),
            });
        }
        slot.live
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Rejection::Gone)?;
        Ok(Claim { slot })
    }

    /// 使用済みのスロットを取り除く。処理中に再登録された有効なスロットは残す。
    pub fn cleanup(&self, path: &str) {
        self.slots
            .remove_if(path, |_, slot| !slot.live.load(Ordering::Acquire));
    }

    /// 期限切れのスロットを取り除き、取り除いた件数を返す。
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now));
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            tracing::debug!(removed, "期限切れの使い捨てルートを削除");
        }
        removed
    }

    /// 登録中のスロット数（使用済みで未削除のものを含む）。
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::put;

    fn handler() -> MethodRouter {
        put(|| async { "ok" })
    }

    fn wins(routes: &OneTimeRoutes, path: &str) -> bool {
        routes.dispatch(path, &Method::PUT).is_ok()
    }

    #[test]
    fn test_dispatch_once() {
        let routes = OneTimeRoutes::new(None);
        routes.register("/once/a", Method::PUT, handler());

        assert!(wins(&routes, "/once/a"));
        assert!(matches!(
            routes.dispatch("/once/a", &Method::PUT),
            Err(Rejection::Gone)
        ));
        assert!(matches!(
            routes.dispatch("/once/unknown", &Method::PUT),
            Err(Rejection::Gone)
        ));
    }

    /// 異なるメソッドのリクエストが先に来てもスロットが消費されないことを確認
    #[test]
    fn test_wrong_method_keeps_slot_live() {
        let routes = OneTimeRoutes::new(None);
        routes.register("/once/a", Method::PUT, handler());

        for method in [Method::GET, Method::HEAD, Method::OPTIONS] {
            assert_eq!(
                routes.dispatch("/once/a", &method).err(),
                Some(Rejection::MethodNotAllowed {
                    allowed: Method::PUT
                })
            );
        }
        assert!(wins(&routes, "/once/a"));

        // 使用済みになった後は、メソッドが異なっても Gone
        assert_eq!(
            routes.dispatch("/once/a", &Method::GET).err(),
            Some(Rejection::Gone)
        );
    }

    /// 同一パスへのN件の同時dispatchで勝者がちょうど1件であることを確認
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dispatch_has_single_winner() {
        const N: usize = 64;
        let routes = Arc::new(OneTimeRoutes::new(None));
        routes.register("/once/race", Method::PUT, handler());
        let barrier = Arc::new(tokio::sync::Barrier::new(N));

        let tasks: Vec<_> = (0..N)
            .map(|_| {
                let routes = Arc::clone(&routes);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    wins(&routes, "/once/race")
                })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_cleanup_removes_consumed_slot() {
        let routes = OneTimeRoutes::new(None);
        routes.register("/once/a", Method::PUT, handler());

        // 未使用のスロットはcleanupで消えない
        routes.cleanup("/once/a");
        assert_eq!(routes.len(), 1);

        assert!(wins(&routes, "/once/a"));
        routes.cleanup("/once/a");
        assert!(routes.is_empty());
    }

    /// 処理中に再登録されたスロットがcleanupで消されないことを確認
    #[test]
    fn test_cleanup_keeps_reregistered_slot() {
        let routes = OneTimeRoutes::new(None);
        routes.register("/once/a", Method::PUT, handler());
        let claim = routes.dispatch("/once/a", &Method::PUT);
        assert!(claim.is_ok());

        routes.register("/once/a", Method::PUT, handler());
        routes.cleanup("/once/a");
        assert_eq!(routes.len(), 1);
        assert!(wins(&routes, "/once/a"));
    }

    #[test]
    fn test_expired_slot_never_wins() {
        let routes = OneTimeRoutes::new(None);
        routes.register_with_ttl("/once/a", Method::PUT, handler(), Duration::ZERO);
        routes.register_with_ttl("/once/b", Method::PUT, handler(), Duration::from_secs(3600));

        assert!(!wins(&routes, "/once/a"));
        assert_eq!(routes.sweep_expired(), 1);
        assert_eq!(routes.len(), 1);
        assert!(wins(&routes, "/once/b"));
    }

    #[test]
    fn test_default_ttl_applies_to_register() {
        let routes = OneTimeRoutes::new(Some(Duration::ZERO));
        routes.register("/once/a", Method::PUT, handler());
        assert!(!wins(&routes, "/once/a"));
        assert_eq!(routes.sweep_expired(), 1);
        assert!(routes.is_empty());
    }
}
