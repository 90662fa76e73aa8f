//! Fade Engine (§4.2): interpolates channel values through time and writes
//! them into the Output Engine's base layer. Never touches OE's overrides.

pub mod easing;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::model::{Channel, Easing, UniverseId};
use crate::output::OutputEngine;

pub const TICK_INTERVAL: Duration = Duration::from_millis(25); // 40 Hz

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeOrigin {
    Cue,
    Manual,
    PreviewCommit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FadeKey {
    pub universe: UniverseId,
    pub channel: Channel,
}

#[derive(Debug, Clone)]
struct Fade {
    start_value: u8,
    target_value: u8,
    started_at: Instant,
    duration: Duration,
    easing: Easing,
    #[allow(dead_code)]
    origin: FadeOrigin,
}

impl Fade {
    fn value_at(&self, now: Instant) -> (u8, bool) {
        let elapsed = now.saturating_duration_since(self.started_at);
        let t = if self.duration.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f64() / self.duration.as_secs_f64()).clamp(0.0, 1.0)
        };
        let e = easing::apply(self.easing, t);
        let start = self.start_value as f64;
        let target = self.target_value as f64;
        let v = (start + (target - start) * e).round().clamp(0.0, 255.0) as u8;
        (v, t >= 1.0)
    }
}

pub struct FadeEngine {
    active: Mutex<HashMap<FadeKey, Fade>>,
    output: Arc<OutputEngine>,
    shutdown_token: CancellationToken,
}

impl FadeEngine {
    pub fn new(output: Arc<OutputEngine>) -> Arc<Self> {
        Arc::new(FadeEngine {
            active: Mutex::new(HashMap::new()),
            output,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Starts (or immediately replaces) a fade for `(universe, channel)`.
    /// `from` defaults to the current base value. A zero duration sets the
    /// base value and retires synchronously without entering the active set.
    pub fn start_fade(
        &self,
        universe: UniverseId,
        channel: Channel,
        from: Option<u8>,
        to: u8,
        duration: Duration,
        easing: Easing,
        origin: FadeOrigin,
    ) {
        let start_value = from.unwrap_or_else(|| self.output.base_value(universe, channel).unwrap_or(0));

        if duration.is_zero() {
            self.output.set_base(universe, channel, to as i32);
            let mut active = self.active.lock().unwrap();
            active.remove(&FadeKey { universe, channel });
            return;
        }

        let fade = Fade {
            start_value,
            target_value: to,
            started_at: Instant::now(),
            duration,
            easing,
            origin,
        };

        let mut active = self.active.lock().unwrap();
        active.insert(FadeKey { universe, channel }, fade);
    }

    /// Removes every active fade matching `predicate`, leaving the base
    /// value at whatever was last interpolated.
    pub fn cancel_fades<F>(&self, predicate: F)
    where
        F: Fn(FadeKey) -> bool,
    {
        let mut active = self.active.lock().unwrap();
        active.retain(|key, _| !predicate(*key));
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    pub fn is_active(&self, universe: UniverseId, channel: Channel) -> bool {
        self.active
            .lock()
            .unwrap()
            .contains_key(&FadeKey { universe, channel })
    }

    /// Drains and clears every active fade without writing further values.
    pub fn stop(&self) {
        self.shutdown_token.cancel();
        self.active.lock().unwrap().clear();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Runs the tick loop until cancelled. A panic unwinding out of a single
    /// easing computation must not stop the loop (§4.2 failure semantics);
    /// `catch_unwind` around the per-fade step enforces that.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = self.shutdown_token.cancelled() => break,
            }
            self.tick_once();
        }
    }

    fn tick_once(&self) {
        let now = Instant::now();
        let snapshot: Vec<(FadeKey, Fade)> = {
            let active = self.active.lock().unwrap();
            active.iter().map(|(k, v)| (*k, v.clone())).collect()
        };

        let mut completed = Vec::new();
        for (key, fade) in snapshot {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| fade.value_at(now)));
            let (value, done) = match result {
                Ok(r) => r,
                Err(_) => {
                    tracing::error!(?key, "fade tick panicked, dropping this fade");
                    completed.push(key);
                    continue;
                }
            };
            self.output.set_base(key.universe, key.channel, value as i32);
            if done {
                completed.push(key);
            }
        }

        if !completed.is_empty() {
            let mut active = self.active.lock().unwrap();
            for key in completed {
                active.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChangeBus;
    use crate::config::Config;

    async fn setup() -> (Arc<OutputEngine>, Arc<FadeEngine>) {
        let mut config = Config::default();
        config.universe_count = 1;
        config.artnet_broadcast = Some("127.0.0.1".parse().unwrap());
        let output = OutputEngine::new(config, ChangeBus::new()).await.unwrap();
        let fade = FadeEngine::new(output.clone());
        (output, fade)
    }

    #[tokio::test]
    async fn linear_monotonicity_within_tolerance() {
        let (output, fade) = setup().await;
        fade.start_fade(1, 1, Some(0), 100, Duration::from_millis(1000), Easing::Linear, FadeOrigin::Manual);

        tokio::time::sleep(Duration::from_millis(500)).await;
        fade.tick_once();
        let v = output.base_value(1, 1).unwrap();
        assert!((v as i32 - 50).abs() <= 2, "got {v}");
    }

    #[tokio::test]
    async fn supersession_keeps_only_latest_fade() {
        let (output, fade) = setup().await;
        fade.start_fade(1, 1, Some(0), 200, Duration::from_secs(10), Easing::Linear, FadeOrigin::Manual);
        assert_eq!(fade.active_count(), 1);

        fade.start_fade(1, 1, Some(0), 50, Duration::from_secs(10), Easing::Linear, FadeOrigin::Manual);
        assert_eq!(fade.active_count(), 1);

        // Immediately after supersession, interpolation should progress
        // toward the new target, not the old one.
        tokio::time::sleep(Duration::from_millis(50)).await;
        fade.tick_once();
        let v = output.base_value(1, 1).unwrap();
        assert!(v < 50 || v == 0, "expected progress toward 50, got {v}");
    }

    #[tokio::test]
    async fn zero_duration_fade_is_immediate() {
        let (output, fade) = setup().await;
        fade.start_fade(1, 1, Some(0), 77, Duration::ZERO, Easing::Linear, FadeOrigin::Manual);
        assert_eq!(output.base_value(1, 1).unwrap(), 77);
        assert_eq!(fade.active_count(), 0);
    }

    #[tokio::test]
    async fn cancel_fades_leaves_last_value_in_place() {
        let (output, fade) = setup().await;
        fade.start_fade(1, 1, Some(0), 255, Duration::from_secs(10), Easing::Linear, FadeOrigin::Manual);
        tokio::time::sleep(Duration::from_millis(50)).await;
        fade.tick_once();
        let mid_value = output.base_value(1, 1).unwrap();

        fade.cancel_fades(|k| k.universe == 1 && k.channel == 1);
        assert_eq!(fade.active_count(), 0);
        assert_eq!(output.base_value(1, 1).unwrap(), mid_value);
    }
}
