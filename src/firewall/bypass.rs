//! Captive-portal bypass countdown.
//!
//! At most one window is live device-wide. The countdown runs as a task on
//! the ambient tokio runtime and reports progress through a broadcast
//! channel; on expiry it runs the revert callback on the blocking pool.
//! Starting a new window always cancels the previous one first, and the
//! cancelled window's callback is dropped, never run.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::AppError;

/// Callback run once when a window expires, with the exempted uid.
pub type RevertFn = Arc<dyn Fn(u32) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassEvent {
    Armed { uid: u32, duration: Duration },
    Tick { uid: u32, remaining: Duration },
    Expired { uid: u32 },
    Cancelled { uid: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BypassWindow {
    pub target_uid: u32,
    pub armed_at: Instant,
    pub duration: Duration,
    pub cancelled: bool,
}

impl BypassWindow {
    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.armed_at.elapsed())
    }
}

struct ActiveWindow {
    window: BypassWindow,
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    active: Option<ActiveWindow>,
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct BypassScheduler {
    slot: Arc<Mutex<Slot>>,
    events: broadcast::Sender<BypassEvent>,
    tick: Duration,
}

impl BypassScheduler {
    pub fn new(tick: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
            events,
            tick,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BypassEvent> {
        self.events.subscribe()
    }

    /// The live window, if any.
    pub fn active(&self) -> Option<BypassWindow> {
        lock(&self.slot).active.as_ref().map(|a| a.window.clone())
    }

    /// Arm a window for `uid`, superseding any live one.
    ///
    /// Returns the superseded window. Fails when called outside a tokio runtime.
    pub fn start(
        &self,
        uid: u32,
        duration: Duration,
        on_expire: RevertFn,
    ) -> Result<Option<BypassWindow>, AppError> {
        let handle = Handle::try_current().map_err(|e| {
            AppError::Scheduler(format!("no async runtime for the bypass countdown: {e}"))
        })?;

        let mut slot = lock(&self.slot);
        let superseded = slot.active.take().map(|active| self.retire(active));

        slot.generation += 1;
        let generation = slot.generation;
        let window = BypassWindow {
            target_uid: uid,
            armed_at: Instant::now(),
            duration,
            cancelled: false,
        };
        let task = handle.spawn(run_countdown(
            Arc::clone(&self.slot),
            self.events.clone(),
            generation,
            uid,
            duration,
            self.tick,
            on_expire,
        ));
        slot.active = Some(ActiveWindow {
            window,
            generation,
            task,
        });
        let _ = self.events.send(BypassEvent::Armed { uid, duration });
        tracing::info!("Captive bypass armed for uid {uid} ({}s)", duration.as_secs());

        Ok(superseded)
    }

    /// Stop the live window without running its callback. Idempotent.
    pub fn cancel(&self) -> Option<BypassWindow> {
        let active = lock(&self.slot).active.take()?;
        Some(self.retire(active))
    }

    fn retire(&self, active: ActiveWindow) -> BypassWindow {
        active.task.abort();
        let mut window = active.window;
        window.cancelled = true;
        let _ = self.events.send(BypassEvent::Cancelled {
            uid: window.target_uid,
        });
        tracing::info!("Captive bypass for uid {} cancelled", window.target_uid);
        window
    }
}

async fn run_countdown(
    slot: Arc<Mutex<Slot>>,
    events: broadcast::Sender<BypassEvent>,
    generation: u64,
    uid: u32,
    duration: Duration,
    tick: Duration,
    on_expire: RevertFn,
) {
    let armed_at = Instant::now();
    let deadline = armed_at + duration;
    let mut ticker = tokio::time::interval_at(armed_at + tick, tick);
    let expiry = tokio::time::sleep_until(deadline);
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            biased;
            _ = &mut expiry => break,
            _ = ticker.tick() => {
                let current = lock(&slot).generation == generation;
                if !current {
                    return;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                let _ = events.send(BypassEvent::Tick { uid, remaining });
            }
        }
    }

    // Expiry and cancel race for the slot; whoever takes the window wins.
    let owned = {
        let mut guard = lock(&slot);
        match &guard.active {
            Some(active) if active.generation == generation => {
                guard.active = None;
                true
            }
            _ => false,
        }
    };
    if !owned {
        return;
    }

    if let Err(e) = tokio::task::spawn_blocking(move || on_expire(uid)).await {
        tracing::error!("Captive bypass revert for uid {uid} failed: {e}");
    }
    tracing::info!("Captive bypass for uid {uid} expired");
    let _ = events.send(BypassEvent::Expired { uid });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const FIVE_MINUTES: Duration = Duration::from_secs(300);

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, RevertFn) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let revert: RevertFn = Arc::new(move |uid| sink.lock().unwrap().push(uid));
        (calls, revert)
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_ticks_then_expires() {
        let scheduler = BypassScheduler::new(Duration::from_secs(30));
        let mut events = scheduler.subscribe();
        let (calls, revert) = recorder();

        assert!(scheduler.start(10091, FIVE_MINUTES, revert).unwrap().is_none());

        assert_eq!(
            events.recv().await.unwrap(),
            BypassEvent::Armed { uid: 10091, duration: FIVE_MINUTES }
        );
        let mut ticks = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                BypassEvent::Tick { remaining, .. } => ticks.push(remaining.as_secs()),
                BypassEvent::Expired { uid } => {
                    assert_eq!(uid, 10091);
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(ticks, vec![270, 240, 210, 180, 150, 120, 90, 60, 30]);
        assert_eq!(*calls.lock().unwrap(), vec![10091]);
        assert!(scheduler.active().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_supersedes_first() {
        let scheduler = BypassScheduler::new(Duration::from_secs(30));
        let (calls, revert) = recorder();

        scheduler.start(10091, FIVE_MINUTES, Arc::clone(&revert)).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        let superseded = scheduler.start(20000, FIVE_MINUTES, revert).unwrap().unwrap();

        assert_eq!(superseded.target_uid, 10091);
        assert!(superseded.cancelled);
        assert_eq!(scheduler.active().unwrap().target_uid, 20000);

        let mut events = scheduler.subscribe();
        loop {
            if let BypassEvent::Expired { uid } = events.recv().await.unwrap() {
                assert_eq!(uid, 20000);
                break;
            }
        }
        // Only the second window's callback ever ran.
        assert_eq!(*calls.lock().unwrap(), vec![20000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent_and_drops_callback() {
        let scheduler = BypassScheduler::new(Duration::from_secs(30));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let revert: RevertFn = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(scheduler.cancel().is_none());
        scheduler.start(10091, FIVE_MINUTES, revert).unwrap();

        let cancelled = scheduler.cancel().unwrap();
        assert!(cancelled.cancelled);
        assert_eq!(cancelled.target_uid, 10091);
        assert!(scheduler.cancel().is_none());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_counts_down() {
        let scheduler = BypassScheduler::new(Duration::from_secs(30));
        let (_calls, revert) = recorder();
        scheduler.start(10091, FIVE_MINUTES, revert).unwrap();

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(scheduler.active().unwrap().remaining(), Duration::from_secs(200));
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let scheduler = BypassScheduler::new(Duration::from_secs(30));
        let (_calls, revert) = recorder();
        let err = scheduler.start(10091, FIVE_MINUTES, revert).unwrap_err();
        assert_eq!(err.kind(), "Scheduler");
        assert!(scheduler.active().is_none());
    }
}
