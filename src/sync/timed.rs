//! Bounded waits on async primitives from plain OS threads.
//!
//! The engine tasks are ordinary threads; these helpers drive an
//! `embassy_sync` future to completion on the calling thread and race it
//! against an `async_io_mini` timer.

use core::future::Future;
use core::time::Duration;

use async_io_mini::Timer;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use futures_lite::future;

/// Take `mutex`, giving up after `timeout`.
pub fn lock_within<M: RawMutex, T>(
    mutex: &Mutex<M, T>,
    timeout: Duration,
) -> Option<MutexGuard<'_, M, T>> {
    if let Ok(guard) = mutex.try_lock() {
        return Some(guard);
    }
    future::block_on(future::or(async { Some(mutex.lock().await) }, async {
        Timer::after(timeout).await;
        None
    }))
}

/// Run `fut` to completion unless `timeout` elapses first.
/// Returns `true` if the future finished.
pub fn wait_within<F: Future<Output = ()>>(fut: F, timeout: Duration) -> bool {
    future::block_on(future::or(
        async {
            fut.await;
            true
        },
        async {
            Timer::after(timeout).await;
            false
        },
    ))
}

/// Block the calling thread for `period`.
pub fn sleep(period: Duration) {
    future::block_on(async {
        Timer::after(period).await;
    });
}
