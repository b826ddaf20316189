//! Clock and timer helpers that work in the browser and on native hosts

use chrono::Utc;

/// Current unix time in seconds
pub fn now_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

/// Suspend the current task for `ms` milliseconds
///
/// Uses the browser timer queue on wasm and the tokio timer elsewhere, so
/// paused-clock tests can advance it deterministically.
pub async fn sleep_ms(ms: u64) {
    #[cfg(target_arch = "wasm32")]
    {
        use gloo_timers::future::TimeoutFuture;
        TimeoutFuture::new(ms.min(u32::MAX as u64) as u32).await;
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }
}
