use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
#[cfg(target_os = "linux")]
use tracing::warn;

/// Milestones and keep-alive pulses for the process supervisor.
pub trait Liveness: Send + Sync {
    fn ready(&self);

    fn alive(&self);

    fn stopping(&self);
}

/// Reports to systemd through `sd_notify`. A no-op off Linux or when the
/// process was not started by systemd.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemdNotifier;

#[cfg(target_os = "linux")]
impl SystemdNotifier {
    fn notify(state: sd_notify::NotifyState<'_>, label: &'static str) {
        if let Err(err) = sd_notify::notify(false, &[state]) {
            warn!(error = %err, state = label, "systemd notify failed");
        }
    }
}

#[cfg(target_os = "linux")]
impl Liveness for SystemdNotifier {
    fn ready(&self) {
        Self::notify(sd_notify::NotifyState::Ready, "ready");
    }

    fn alive(&self) {
        Self::notify(sd_notify::NotifyState::Watchdog, "watchdog");
    }

    fn stopping(&self) {
        Self::notify(sd_notify::NotifyState::Stopping, "stopping");
    }
}

#[cfg(not(target_os = "linux"))]
impl Liveness for SystemdNotifier {
    fn ready(&self) {}

    fn alive(&self) {}

    fn stopping(&self) {}
}

/// Ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLiveness;

impl Liveness for NoLiveness {
    fn ready(&self) {}

    fn alive(&self) {}

    fn stopping(&self) {}
}

/// Pulse interval while a loop sleeps for a long time.
pub const SLEEP_PULSE: Duration = Duration::from_secs(30);

/// Sleeps for `duration` in [`SLEEP_PULSE`] steps, pulsing `liveness` after
/// each step. Returns false when shutdown was requested first.
pub async fn sleep_with_pulses(
    duration: Duration,
    liveness: &dyn Liveness,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if *shutdown.borrow() {
            return false;
        }
        let step = remaining.min(SLEEP_PULSE);
        tokio::select! {
            _ = sleep(step) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
        }
        remaining = remaining.saturating_sub(step);
        liveness.alive();
    }
    true
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Pulses(AtomicUsize);

    impl Liveness for Pulses {
        fn ready(&self) {}

        fn alive(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn stopping(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn long_sleep_pulses_every_step() {
        let pulses = Pulses::default();
        let (_tx, mut rx) = watch::channel(false);

        assert!(sleep_with_pulses(Duration::from_secs(95), &pulses, &mut rx).await);
        assert_eq!(pulses.0.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cuts_sleep_short() {
        let pulses = Pulses::default();
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).expect("send");

        assert!(!sleep_with_pulses(Duration::from_secs(3_600), &pulses, &mut rx).await);
        assert_eq!(pulses.0.load(Ordering::SeqCst), 0);
    }
}
