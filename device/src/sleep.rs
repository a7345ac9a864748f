use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time;
use tracing::info;

pub const SECS_PER_HOUR: u64 = 3600;

/// Seconds until the next multiple of `boundary_secs`, in `[1, boundary_secs]`.
/// Exactly on a boundary waits a full period rather than zero.
pub fn next_wake_delay(now_secs: u64, boundary_secs: u64) -> u64 {
    let boundary = boundary_secs.max(1);
    (boundary - now_secs % boundary).clamp(1, boundary)
}

/// Periodic wake alignment: every `period_secs`, shifted by `offset_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeSchedule {
    pub period_secs: u64,
    pub offset_secs: u64,
}

impl WakeSchedule {
    pub fn delay_from(&self, now_secs: u64) -> u64 {
        let period = self.period_secs.max(1);
        let shifted = now_secs.wrapping_sub(self.offset_secs % period).wrapping_add(period);
        next_wake_delay(shifted, period)
    }
}

/// Seconds left until the top of the next hour.
pub fn low_battery_delay(now_secs: u64) -> u64 {
    next_wake_delay(now_secs, SECS_PER_HOUR)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    PowerOn,
    PinReset,
    Software,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSource {
    /// Timer, or a rising edge from the wake controller, whichever is first.
    TimerOrWakePin,
    TimerOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Timer,
    WakePin,
}

/// Board services the node needs around power management.
#[allow(async_fn_in_trait)]
pub trait Platform {
    fn reset_reason(&self) -> ResetReason;

    /// Suspends everything until the duration elapses or, if allowed, the
    /// wake controller signals. Execution resumes right after the call.
    async fn deep_sleep(&mut self, duration: Duration, source: WakeSource) -> WakeReason;

    /// Tells the external wake controller it may cut power.
    fn release_power(&mut self);
}

/// Signal line from the external wake controller. A pulse only reaches a
/// sleep that is already in progress; pulses while awake are lost, as on the
/// real line.
#[derive(Debug, Clone, Default)]
pub struct WakeLine(Arc<Notify>);

impl WakeLine {
    pub fn pulse(&self) {
        self.0.notify_waiters();
    }
}

/// Host stand-in: sleeps on the tokio timer and treats a [`WakeLine`] as the
/// wake controller's signal line.
pub struct HostPlatform {
    reset_reason: ResetReason,
    wake: WakeLine,
}

impl HostPlatform {
    pub fn from_env() -> Self {
        let reset_reason = match env::var("NODE_RESET_REASON").as_deref() {
            Ok("pin") => ResetReason::PinReset,
            Ok("software") => ResetReason::Software,
            _ => ResetReason::PowerOn,
        };
        HostPlatform {
            reset_reason,
            wake: WakeLine::default(),
        }
    }

    pub fn wake_line(&self) -> WakeLine {
        self.wake.clone()
    }
}

impl Platform for HostPlatform {
    fn reset_reason(&self) -> ResetReason {
        self.reset_reason
    }

    async fn deep_sleep(&mut self, duration: Duration, source: WakeSource) -> WakeReason {
        info!(?duration, ?source, "Entering deep sleep");
        match source {
            WakeSource::TimerOnly => {
                time::sleep(duration).await;
                WakeReason::Timer
            }
            WakeSource::TimerOrWakePin => {
                tokio::select! {
                    _ = time::sleep(duration) => WakeReason::Timer,
                    _ = self.wake.0.notified() => WakeReason::WakePin,
                }
            }
        }
    }

    fn release_power(&mut self) {
        info!("Signalling wake controller that work is done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_always_within_one_boundary() {
        for boundary in [1u64, 60, 300, 3600] {
            for now in (0..3 * boundary + 7).chain([u64::MAX - 1, u64::MAX]) {
                let delay = next_wake_delay(now, boundary);
                assert!(
                    (1..=boundary).contains(&delay),
                    "now={now} boundary={boundary} delay={delay}"
                );
                assert_eq!((now as u128 + delay as u128) % boundary as u128, 0);
            }
        }
    }

    #[test]
    fn exactly_on_a_boundary_waits_a_full_period() {
        assert_eq!(next_wake_delay(7200, 3600), 3600);
        assert_eq!(next_wake_delay(0, 300), 300);
    }

    #[test]
    fn zero_boundary_does_not_divide_by_zero() {
        assert_eq!(next_wake_delay(12345, 0), 1);
    }

    #[test]
    fn schedule_wakes_five_minutes_past_the_hour() {
        let schedule = WakeSchedule {
            period_secs: 3600,
            offset_secs: 300,
        };
        // 12:08:31 -> 13:05:00
        let now = 12 * 3600 + 8 * 60 + 31;
        assert_eq!(schedule.delay_from(now), 3389);
        // 12:04:00 -> 12:05:00
        assert_eq!(schedule.delay_from(12 * 3600 + 4 * 60), 60);
        // Exactly 12:05:00 -> 13:05:00
        assert_eq!(schedule.delay_from(12 * 3600 + 300), 3600);
        // Before the first offset of the epoch.
        assert_eq!(schedule.delay_from(0), 300);
    }

    #[test]
    fn low_battery_sleeps_to_the_top_of_the_hour() {
        assert_eq!(low_battery_delay(12 * 3600 + 5 * 60), 3300);
        assert_eq!(low_battery_delay(13 * 3600), 3600);
    }

    #[tokio::test(start_paused = true)]
    async fn wake_line_cuts_sleep_short() {
        let mut platform = HostPlatform::from_env();
        let wake = platform.wake_line();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(10)).await;
            wake.pulse();
        });

        let started = time::Instant::now();
        let reason = platform
            .deep_sleep(Duration::from_secs(600), WakeSource::TimerOrWakePin)
            .await;
        assert_eq!(reason, WakeReason::WakePin);
        assert!(started.elapsed() < Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn pulse_while_awake_does_not_cut_the_next_sleep_short() {
        let mut platform = HostPlatform::from_env();
        platform.wake_line().pulse();
        time::sleep(Duration::from_secs(60)).await;

        let started = time::Instant::now();
        let reason = platform
            .deep_sleep(Duration::from_secs(3000), WakeSource::TimerOrWakePin)
            .await;
        assert_eq!(reason, WakeReason::Timer);
        assert!(started.elapsed() >= Duration::from_secs(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn low_battery_sleep_ignores_the_wake_line() {
        let mut platform = HostPlatform::from_env();
        let wake = platform.wake_line();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(10)).await;
            wake.pulse();
        });

        let reason = platform
            .deep_sleep(Duration::from_secs(60), WakeSource::TimerOnly)
            .await;
        assert_eq!(reason, WakeReason::Timer);
    }
}
