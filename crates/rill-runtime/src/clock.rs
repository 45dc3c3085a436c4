//! Time source for windows, watermarks and checkpoint scheduling
//!
//! Every component that needs the current time or a timer receives a
//! [`SharedClock`]. Production topologies use [`SystemClock`]; tests inject a
//! [`MockClock`] and move time explicitly so window output is deterministic.

use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Millisecond clock with a timer capability.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in epoch milliseconds.
    fn now_ms(&self) -> i64;

    /// Resolve once the clock reaches `deadline_ms`.
    fn sleep_until(&self, deadline_ms: i64) -> BoxFuture<'static, ()>;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall clock backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn sleep_until(&self, deadline_ms: i64) -> BoxFuture<'static, ()> {
        let wait = deadline_ms - self.now_ms();
        Box::pin(async move {
            if wait > 0 {
                tokio::time::sleep(Duration::from_millis(wait as u64)).await;
            }
        })
    }
}

/// Manually driven clock.
///
/// Time only moves through [`set`](MockClock::set) and
/// [`add`](MockClock::add); pending `sleep_until` futures wake as soon as the
/// clock passes their deadline.
pub struct MockClock {
    now: watch::Sender<i64>,
}

impl MockClock {
    pub fn new(start_ms: i64) -> Arc<Self> {
        let (now, _) = watch::channel(start_ms);
        Arc::new(Self { now })
    }

    pub fn set(&self, ms: i64) {
        self.now.send_replace(ms);
    }

    pub fn add(&self, ms: i64) {
        self.now.send_modify(|now| *now += ms);
    }

    /// Rewind to `start_ms`, used between test cases sharing a clock.
    pub fn reset_clock(&self, start_ms: i64) {
        self.set(start_ms);
    }
}

impl fmt::Debug for MockClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockClock")
            .field("now", &*self.now.borrow())
            .finish()
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> i64 {
        *self.now.borrow()
    }

    fn sleep_until(&self, deadline_ms: i64) -> BoxFuture<'static, ()> {
        let mut rx = self.now.subscribe();
        Box::pin(async move {
            loop {
                if *rx.borrow_and_update() >= deadline_ms {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Clock dropped: time never moves again.
                    futures::future::pending::<()>().await;
                }
            }
        })
    }
}

/// First multiple of `interval` strictly after `now`.
pub fn next_aligned(now: i64, interval: i64) -> i64 {
    if interval <= 0 {
        return now;
    }
    (now.div_euclid(interval) + 1) * interval
}
