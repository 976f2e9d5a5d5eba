//! Attach and wait configuration.
//!
//! [`AttachConfig`] is built once by the node agent and handed to the
//! [`AttachmentCoordinator`](crate::attacher::AttachmentCoordinator) and
//! [`InlineVolumeManager`](crate::inline::InlineVolumeManager) at
//! construction.
//!
//! Environment variables read by [`AttachConfig::from_env`]:
//! - `RKL_CSI_ATTACH_TIMEOUT_SECS`: deadline for the inline attach wait.
//!   Defaults to `120`, capped at one day.
//! - `RKL_CSI_ATTACH_POLL_INTERVAL_MS`: fixed poll interval while waiting for
//!   an attachment. Defaults to `5000`.
//! - `RKL_CSI_DEFAULT_CAPACITY_BYTES`: capacity requested when provisioning an
//!   inline volume that has no bound claim. Defaults to `0` (driver default).

use std::time::Duration;

pub const ENV_ATTACH_TIMEOUT_SECS: &str = "RKL_CSI_ATTACH_TIMEOUT_SECS";
pub const ENV_POLL_INTERVAL_MS: &str = "RKL_CSI_ATTACH_POLL_INTERVAL_MS";
pub const ENV_DEFAULT_CAPACITY_BYTES: &str = "RKL_CSI_DEFAULT_CAPACITY_BYTES";

const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on any attach wait, whatever the caller asks for.
pub const MAX_ATTACH_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// How the coordinator spaces out observations of an attachment record.
///
/// Both variants are bounded: `Poll` by the caller's deadline, `Backoff` by
/// its step count as well.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitPolicy {
    /// Observe every `interval` until the deadline.
    Poll { interval: Duration },
    /// Start at `initial`, multiply by `factor` after each observation, give up
    /// after `steps` observations.
    Backoff {
        initial: Duration,
        factor: f64,
        steps: u32,
    },
}

impl WaitPolicy {
    /// 10s initial interval, factor 1.2, 10 steps.
    pub const fn default_backoff() -> Self {
        Self::Backoff {
            initial: Duration::from_secs(10),
            factor: 1.2,
            steps: 10,
        }
    }

    /// The sequence of sleeps between observations. `None` means the policy
    /// has run out of attempts.
    pub(crate) fn schedule(&self) -> WaitSchedule {
        WaitSchedule {
            policy: *self,
            taken: 0,
        }
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::Poll {
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

pub(crate) struct WaitSchedule {
    policy: WaitPolicy,
    taken: u32,
}

impl Iterator for WaitSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = match self.policy {
            WaitPolicy::Poll { interval } => interval,
            WaitPolicy::Backoff {
                initial,
                factor,
                steps,
            } => {
                if self.taken >= steps {
                    return None;
                }
                initial.mul_f64(factor.max(1.0).powi(self.taken as i32))
            }
        };
        self.taken = self.taken.saturating_add(1);
        Some(delay)
    }
}

/// Timeouts and defaults for node-side attach coordination.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachConfig {
    /// Deadline for the inline attach wait. Always finite.
    pub attach_timeout: Duration,
    /// Spacing of observations while waiting.
    pub wait: WaitPolicy,
    /// Capacity requested when provisioning without a bound claim.
    pub default_capacity_bytes: u64,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            attach_timeout: DEFAULT_ATTACH_TIMEOUT,
            wait: WaitPolicy::default(),
            default_capacity_bytes: 0,
        }
    }
}

impl AttachConfig {
    /// Build a configuration from the `RKL_CSI_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup. Unparsable or zero
    /// durations keep their defaults so the wait is never unbounded.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(secs) = parse_nonzero(&lookup, ENV_ATTACH_TIMEOUT_SECS) {
            config.attach_timeout = Duration::from_secs(secs).min(MAX_ATTACH_TIMEOUT);
        }
        if let Some(ms) = parse_nonzero(&lookup, ENV_POLL_INTERVAL_MS) {
            config.wait = WaitPolicy::Poll {
                interval: Duration::from_millis(ms),
            };
        }
        if let Some(bytes) = lookup(ENV_DEFAULT_CAPACITY_BYTES).and_then(|v| v.parse().ok()) {
            config.default_capacity_bytes = bytes;
        }
        config
    }

    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }
}

fn parse_nonzero<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_bounded() {
        let config = AttachConfig::default();
        assert_eq!(config.attach_timeout, Duration::from_secs(120));
        assert_eq!(
            config.wait,
            WaitPolicy::Poll {
                interval: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn lookup_overrides_and_ignores_zero() {
        let vars = HashMap::from([
            (ENV_ATTACH_TIMEOUT_SECS, "0"),
            (ENV_POLL_INTERVAL_MS, "250"),
            (ENV_DEFAULT_CAPACITY_BYTES, "1048576"),
        ]);
        let config = AttachConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.attach_timeout, DEFAULT_ATTACH_TIMEOUT);
        assert_eq!(
            config.wait,
            WaitPolicy::Poll {
                interval: Duration::from_millis(250)
            }
        );
        assert_eq!(config.default_capacity_bytes, 1024 * 1024);
    }

    #[test]
    fn huge_timeout_is_capped() {
        let max = u64::MAX.to_string();
        let config = AttachConfig::from_lookup(|k| (k == ENV_ATTACH_TIMEOUT_SECS).then(|| max.clone()));
        assert_eq!(config.attach_timeout, MAX_ATTACH_TIMEOUT);
    }

    #[test]
    fn backoff_schedule_is_finite_and_grows() {
        let delays: Vec<_> = WaitPolicy::default_backoff().schedule().collect();
        assert_eq!(delays.len(), 10);
        assert_eq!(delays[0], Duration::from_secs(10));
        assert!((delays[1].as_secs_f64() - 12.0).abs() < 1e-6);
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn poll_schedule_repeats_interval() {
        let interval = Duration::from_millis(10);
        let mut schedule = WaitPolicy::Poll { interval }.schedule();
        for _ in 0..100 {
            assert_eq!(schedule.next(), Some(interval));
        }
    }
}
