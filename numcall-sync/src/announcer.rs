//! Periodic spoken summary of every category.

use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use crate::category::Category;
use crate::config::{self, ConfigError};
use crate::protocol::ClientMessage;
use crate::reconciler::Reconciler;
use crate::speech::Speaker;

/// `"DRS: 7, 9. Override: none. Check Date: none"`.
///
/// `None` when every category is empty.
pub fn compose_summary(columns: &[(Category, Vec<&str>)]) -> Option<String> {
    if columns.iter().all(|(_, values)| values.is_empty()) {
        return None;
    }
    let parts: Vec<String> = columns
        .iter()
        .map(|(category, values)| {
            let listed = if values.is_empty() {
                "none".to_string()
            } else {
                values.join(", ")
            };
            format!("{}: {listed}", category.name())
        })
        .collect();
    Some(parts.join(". "))
}

/// Repeating timer owned by the station loop.
///
/// Reconfiguring restarts the schedule from now; nothing else does.
pub struct Announcer {
    period: Duration,
    interval: Interval,
}

impl Announcer {
    /// Fire every `minutes` (at least one).
    pub fn new(minutes: u32) -> Result<Self, ConfigError> {
        Ok(Self::with_period(config::repeat_interval(minutes)?))
    }

    /// Fire every `period`; the first fire is one period from now.
    pub fn with_period(period: Duration) -> Self {
        Self {
            period,
            interval: schedule(period),
        }
    }

    pub fn reconfigure(&mut self, minutes: u32) -> Result<(), ConfigError> {
        let period = config::repeat_interval(minutes)?;
        self.restart(period);
        log::info!("Repeat interval set to {minutes} min");
        Ok(())
    }

    pub fn restart(&mut self, period: Duration) {
        self.period = period;
        self.interval = schedule(period);
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next fire. Cancel-safe.
    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// Speak the summary of `mirror` unless muted.
    ///
    /// Returns the `repeat-message` to send, or `None` when there is
    /// nothing to announce.
    pub fn fire(&self, mirror: &Reconciler, speaker: &mut dyn Speaker) -> Option<ClientMessage> {
        let text = compose_summary(&mirror.columns())?;
        if mirror.is_muted() {
            log::debug!("Summary muted: {text}");
        } else {
            speaker.speak(&text);
        }
        Some(ClientMessage::RepeatMessage { text })
    }
}

fn schedule(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
