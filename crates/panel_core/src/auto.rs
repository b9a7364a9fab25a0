use std::{fmt, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{info, warn};

use shared::domain::CurrencyPair;

use crate::PanelEvent;

/// Delay between rotation steps.
pub const ROTATION_PERIOD: Duration = Duration::from_millis(5000);

/// Scroll speed applied once before the rotation begins, so every slot is
/// readable regardless of what the panel was set to before.
pub const BASELINE_SCROLL_SPEED: u32 = 50;

pub fn default_rotation_pairs() -> Vec<CurrencyPair> {
    [
        ("USD", "VND"),
        ("EUR", "VND"),
        ("GBP", "VND"),
        ("JPY", "VND"),
        ("CNY", "VND"),
        ("AUD", "VND"),
    ]
    .into_iter()
    .map(|(base, target)| CurrencyPair::new(base, target))
    .collect()
}

/// One position in the rotation schedule: time first, weather second, then
/// the configured currency pairs in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplaySlot {
    Time,
    Weather,
    Exchange(CurrencyPair),
}

impl fmt::Display for DisplaySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplaySlot::Time => write!(f, "time"),
            DisplaySlot::Weather => write!(f, "weather"),
            DisplaySlot::Exchange(pair) => write!(f, "{pair}"),
        }
    }
}

/// The commands the sequencer needs from the rest of the system. Splitting
/// this out keeps the rotation logic testable without a backend.
#[async_trait]
pub trait DisplayDispatcher: Send + Sync {
    async fn set_scroll_speed(&self, speed: u32) -> Result<()>;
    async fn show_time(&self) -> Result<()>;
    async fn show_weather(&self) -> Result<()>;
    async fn show_exchange(&self, pair: &CurrencyPair) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum AutoRotationError {
    #[error("auto rotation is already running")]
    AlreadyRunning,
    #[error("failed to set baseline scroll speed: {0}")]
    Baseline(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoStatus {
    pub running: bool,
    pub step: usize,
    pub slot: DisplaySlot,
}

/// Owned rotation sequencer. A single spawned task walks the schedule and
/// awaits every display command inline, so a slow command can never overlap
/// the next one. The step only advances when the command succeeded; a failed
/// slot is retried on the next tick.
pub struct AutoRotation {
    dispatcher: Arc<dyn DisplayDispatcher>,
    pairs: Vec<CurrencyPair>,
    period: Duration,
    events: broadcast::Sender<PanelEvent>,
    inner: Mutex<RotationState>,
}

struct RotationState {
    step: usize,
    task: Option<JoinHandle<()>>,
}

impl AutoRotation {
    pub fn new(
        dispatcher: Arc<dyn DisplayDispatcher>,
        pairs: Vec<CurrencyPair>,
        period: Duration,
        events: broadcast::Sender<PanelEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            pairs,
            period,
            events,
            inner: Mutex::new(RotationState {
                step: 0,
                task: None,
            }),
        })
    }

    /// Slots in one full cycle: time, weather, then every pair.
    pub fn schedule_len(&self) -> usize {
        2 + self.pairs.len()
    }

    /// Maps a step counter onto its slot. Steps wrap around the schedule,
    /// so step `schedule_len()` shows the same slot as step 0.
    pub fn slot_for_step(&self, step: usize) -> DisplaySlot {
        match step % self.schedule_len() {
            0 => DisplaySlot::Time,
            1 => DisplaySlot::Weather,
            n => DisplaySlot::Exchange(self.pairs[n - 2].clone()),
        }
    }

    /// Applies the baseline scroll speed, then spawns the rotation task.
    /// Step 0 runs immediately; each later step waits out the period. A
    /// failed baseline call leaves the rotation stopped.
    pub async fn start(self: &Arc<Self>) -> Result<(), AutoRotationError> {
        let mut guard = self.inner.lock().await;
        if guard.task.is_some() {
            return Err(AutoRotationError::AlreadyRunning);
        }

        self.dispatcher
            .set_scroll_speed(BASELINE_SCROLL_SPEED)
            .await
            .map_err(AutoRotationError::Baseline)?;

        guard.step = 0;
        let rotation = Arc::clone(self);
        guard.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(rotation.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                rotation.run_step().await;
            }
        }));
        drop(guard);

        info!(
            schedule_len = self.schedule_len(),
            period_ms = self.period.as_millis() as u64,
            "auto rotation started"
        );
        self.emit_status(true, 0);
        Ok(())
    }

    /// Aborts the rotation task and resets the step, so the next start
    /// begins at the top of the schedule. Idempotent.
    pub async fn stop(&self) {
        let mut guard = self.inner.lock().await;
        let was_running = guard.task.is_some();
        if let Some(task) = guard.task.take() {
            task.abort();
        }
        guard.step = 0;
        drop(guard);

        if was_running {
            info!("auto rotation stopped");
        }
        self.emit_status(false, 0);
    }

    pub async fn status(&self) -> AutoStatus {
        let guard = self.inner.lock().await;
        AutoStatus {
            running: guard.task.is_some(),
            step: guard.step,
            slot: self.slot_for_step(guard.step),
        }
    }

    async fn run_step(self: &Arc<Self>) {
        let step = self.inner.lock().await.step;
        let slot = self.slot_for_step(step);
        self.emit_status(true, step);

        let outcome = match &slot {
            DisplaySlot::Time => self.dispatcher.show_time().await,
            DisplaySlot::Weather => self.dispatcher.show_weather().await,
            DisplaySlot::Exchange(pair) => self.dispatcher.show_exchange(pair).await,
        };

        match outcome {
            Ok(()) => {
                let mut guard = self.inner.lock().await;
                guard.step = (guard.step + 1) % self.schedule_len();
            }
            Err(error) => {
                warn!(%error, step, slot = %slot, "auto step failed, retrying the same slot next tick");
                let _ = self.events.send(PanelEvent::Notice {
                    text: format!("auto step '{slot}' failed: {error}"),
                });
            }
        }
    }

    fn emit_status(&self, running: bool, step: usize) {
        let _ = self.events.send(PanelEvent::AutoStatusChanged(AutoStatus {
            running,
            step,
            slot: self.slot_for_step(step),
        }));
    }
}

#[cfg(test)]
#[path = "tests/auto_tests.rs"]
mod tests;
