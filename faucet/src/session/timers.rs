use std::future::Future;
use std::time::Duration;
use tokio::task::AbortHandle;

use super::state::MinerSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Max session duration reached
    SessionTimeout,
    /// No connection bound for too long
    IdleClose,
    /// Closed session may be forgotten
    Eviction,
}

/// A scheduled task that is aborted when the handle is dropped
#[derive(Debug)]
pub struct TimerHandle {
    abort: AbortHandle,
    generation: u64,
}

impl TimerHandle {
    /// Spawn `fire` after `delay`
    pub fn schedule<F>(delay: Duration, generation: u64, fire: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire.await;
        });
        Self { abort: task.abort_handle(), generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// Timers owned by an active session
#[derive(Debug, Default)]
pub struct SessionTimers {
    pub session_timeout: Option<TimerHandle>,
    pub idle_close: Option<TimerHandle>,
}

impl SessionTimers {
    pub fn clear(&mut self) {
        self.session_timeout = None;
        self.idle_close = None;
    }

    pub fn slot(&mut self, kind: TimerKind) -> Option<&mut Option<TimerHandle>> {
        match kind {
            TimerKind::SessionTimeout => Some(&mut self.session_timeout),
            TimerKind::IdleClose => Some(&mut self.idle_close),
            TimerKind::Eviction => None,
        }
    }
}

/// Active-index entry: the session plus the timers it owns
#[derive(Debug)]
pub struct TrackedSession {
    pub session: MinerSession,
    pub timers: SessionTimers,
}

/// Closed-index entry kept for late claims until evicted
#[derive(Debug)]
pub struct ClosedSession {
    pub session: MinerSession,
    pub eviction: Option<TimerHandle>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let _handle = TimerHandle::schedule(Duration::from_secs(5), 1, async move {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_timer_never_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let handle = TimerHandle::schedule(Duration::from_secs(5), 1, async move {
            flag.store(true, Ordering::SeqCst);
        });
        drop(handle);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_clear_drops_all() {
        let mut timers = SessionTimers::default();
        timers.session_timeout = Some(TimerHandle::schedule(Duration::from_secs(60), 1, async {}));
        timers.idle_close = Some(TimerHandle::schedule(Duration::from_secs(60), 2, async {}));
        assert_eq!(timers.slot(TimerKind::IdleClose).unwrap().as_ref().unwrap().generation(), 2);
        timers.clear();
        assert!(timers.session_timeout.is_none() && timers.idle_close.is_none());
        assert!(timers.slot(TimerKind::Eviction).is_none());
    }
}
