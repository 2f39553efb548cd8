//! Tempo hysteresis and the hand-offs around it.
//!
//! Raw estimates arrive in a [`TempoSlot`] (latest value wins). Once per tick
//! the [`TempoStabilizer`] compares the latest estimate with the accepted
//! tempo and, when the change exceeds the hysteresis threshold, publishes a
//! new [`StableTempo`] through [`SharedTempo`].

use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{timeline::Shutdown, HueTempoError, Result};

const TEMPO_WAIT_POLL: Duration = Duration::from_millis(50);

/// Overwritable single-value hand-off for raw BPM estimates.
#[derive(Clone, Default)]
pub struct TempoSlot {
    latest: Arc<Mutex<Option<f32>>>,
}

impl TempoSlot {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces whatever estimate is currently stored.
    pub fn publish(&self, bpm: f32) -> Result<()> {
        *self.lock()? = Some(bpm);
        Ok(())
    }

    /// Returns the most recent estimate without consuming it.
    pub fn latest(&self) -> Result<Option<f32>> {
        Ok(*self.lock()?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<f32>>> {
        self.latest
            .lock()
            .map_err(|_| HueTempoError::msg("tempo slot has been poisoned"))
    }
}

impl fmt::Debug for TempoSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempoSlot").finish()
    }
}

/// An accepted tempo together with the inter-beat sleep derived from it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StableTempo {
    pub accepted_bpm: f32,
    /// Seconds to sleep after the pulse. Negative when the beat period is
    /// shorter than the pulse itself.
    pub interval_secs: f32,
}

impl StableTempo {
    /// Derives the inter-beat sleep for `bpm`, leaving `slack` for the pulse.
    pub fn from_bpm(bpm: f32, slack: Duration) -> Self {
        let beats_per_second = bpm / 60.0;
        Self {
            accepted_bpm: bpm,
            interval_secs: 1.0 / beats_per_second - slack.as_secs_f32(),
        }
    }

    /// The sleep as a [`Duration`], floored at zero. Intervals too long to
    /// represent saturate at [`Duration::MAX`].
    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f32(self.interval_secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Whether a light holding the pulse for `slack` can keep up.
    pub fn is_reachable(&self, slack: Duration) -> bool {
        self.interval_secs >= slack.as_secs_f32()
    }
}

/// Shared, thread-safe view over the accepted tempo.
///
/// The pair is stored as one value so readers always observe an interval
/// together with the tempo it was computed from.
#[derive(Clone, Default)]
pub struct SharedTempo {
    inner: Arc<(Mutex<Option<StableTempo>>, Condvar)>,
}

impl SharedTempo {
    /// Creates a view with no accepted tempo yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current tempo, or `None` before the first acceptance.
    pub fn snapshot(&self) -> Result<Option<StableTempo>> {
        Ok(*self.lock()?)
    }

    pub(crate) fn publish(&self, tempo: StableTempo) -> Result<()> {
        *self.lock()? = Some(tempo);
        self.inner.1.notify_all();
        Ok(())
    }

    /// Blocks until a tempo has been accepted or `shutdown` fires. Returns
    /// `None` only on shutdown.
    pub fn wait_for_tempo(&self, shutdown: &Shutdown) -> Result<Option<StableTempo>> {
        let (_, cvar) = &*self.inner;
        let mut current = self.lock()?;

        loop {
            if let Some(tempo) = *current {
                return Ok(Some(tempo));
            }
            if shutdown.is_triggered() {
                return Ok(None);
            }
            current = cvar
                .wait_timeout(current, TEMPO_WAIT_POLL)
                .map_err(|_| HueTempoError::msg("shared tempo has been poisoned"))?
                .0;
        }
    }

    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let inner = self.inner.clone();
        let _ = std::thread::spawn(move || {
            let _guard = inner.0.lock();
            panic!("shared tempo poisoned on purpose");
        })
        .join();
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<StableTempo>>> {
        self.inner
            .0
            .lock()
            .map_err(|_| HueTempoError::msg("shared tempo has been poisoned"))
    }
}

impl fmt::Debug for SharedTempo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTempo")
            .field("current", &self.snapshot().ok().flatten())
            .finish()
    }
}

/// Outcome of evaluating one raw estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Evaluation {
    /// Non-positive or non-finite estimate; dropped.
    Rejected,
    /// Within the hysteresis band, or no estimate available yet.
    Unchanged,
    Accepted(StableTempo),
}

/// Applies the hysteresis rule and owns the write path to [`SharedTempo`].
#[derive(Debug)]
pub struct TempoStabilizer {
    hysteresis_bpm: f32,
    slack: Duration,
    accepted_bpm: f32,
    shared: SharedTempo,
}

impl TempoStabilizer {
    /// `slack` is the time the light spends on per beat.
    pub fn new(hysteresis_bpm: f32, slack: Duration, shared: SharedTempo) -> Self {
        Self {
            hysteresis_bpm,
            slack,
            accepted_bpm: 0.0,
            shared,
        }
    }

    /// The tempo currently accepted, `0.0` before the first acceptance.
    pub fn accepted_bpm(&self) -> f32 {
        self.accepted_bpm
    }

    /// Returns a handle to the tempo this stabilizer publishes.
    pub fn shared(&self) -> SharedTempo {
        self.shared.clone()
    }

    /// Compares `sample` with the accepted tempo and republishes the interval
    /// when the change exceeds the hysteresis threshold.
    pub fn evaluate(&mut self, sample: f32) -> Result<Evaluation> {
        if !sample.is_finite() || sample <= 0.0 {
            debug!(sample, "dropping malformed tempo sample");
            return Ok(Evaluation::Rejected);
        }

        let delta = (sample - self.accepted_bpm).abs();
        if delta <= self.hysteresis_bpm {
            return Ok(Evaluation::Unchanged);
        }

        let tempo = StableTempo::from_bpm(sample, self.slack);
        info!(
            from = self.accepted_bpm,
            to = sample,
            interval_secs = tempo.interval_secs,
            "retiming light pulse"
        );
        if !tempo.is_reachable(self.slack) {
            warn!(
                bpm = sample,
                interval_secs = tempo.interval_secs,
                "tempo may exceed the light's physical beat rate"
            );
        }

        self.shared.publish(tempo)?;
        self.accepted_bpm = sample;
        Ok(Evaluation::Accepted(tempo))
    }

    /// Evaluates the latest estimate in `slot`, if any.
    pub fn tick(&mut self, slot: &TempoSlot) -> Result<Evaluation> {
        match slot.latest()? {
            Some(sample) => self.evaluate(sample),
            None => Ok(Evaluation::Unchanged),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    const SLACK: Duration = Duration::from_millis(100);

    fn stabilizer() -> TempoStabilizer {
        TempoStabilizer::new(1.0, SLACK, SharedTempo::new())
    }

    fn accepted_interval(evaluation: Evaluation) -> f32 {
        match evaluation {
            Evaluation::Accepted(tempo) => tempo.interval_secs,
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    #[test]
    fn accepts_change_beyond_threshold() {
        let mut stabilizer = stabilizer();
        stabilizer.evaluate(120.0).unwrap();

        let interval = accepted_interval(stabilizer.evaluate(121.5).unwrap());
        assert!((interval - 0.3938).abs() < 1e-3);
        assert_eq!(stabilizer.accepted_bpm(), 121.5);
    }

    #[test]
    fn small_changes_never_retime() {
        let mut stabilizer = stabilizer();
        stabilizer.evaluate(120.0).unwrap();
        let before = stabilizer.shared().snapshot().unwrap();

        for sample in [120.5, 119.2, 121.0, 119.0, 120.9, 120.0] {
            assert_eq!(stabilizer.evaluate(sample).unwrap(), Evaluation::Unchanged);
        }

        assert_eq!(stabilizer.shared().snapshot().unwrap(), before);
        assert_eq!(stabilizer.accepted_bpm(), 120.0);
    }

    #[test]
    fn non_positive_samples_are_rejected() {
        let mut stabilizer = stabilizer();
        assert_eq!(stabilizer.evaluate(0.0).unwrap(), Evaluation::Rejected);
        assert_eq!(stabilizer.shared().snapshot().unwrap(), None);

        stabilizer.evaluate(100.0).unwrap();
        let before = stabilizer.shared().snapshot().unwrap();
        for sample in [0.0, -5.0, f32::NAN, f32::NEG_INFINITY] {
            assert_eq!(stabilizer.evaluate(sample).unwrap(), Evaluation::Rejected);
        }
        assert_eq!(stabilizer.shared().snapshot().unwrap(), before);
        assert_eq!(stabilizer.accepted_bpm(), 100.0);
    }

    #[test]
    fn unreachable_rate_is_still_published() {
        let mut stabilizer = stabilizer();
        let tempo = match stabilizer.evaluate(400.0).unwrap() {
            Evaluation::Accepted(tempo) => tempo,
            other => panic!("expected acceptance, got {other:?}"),
        };

        assert!(!tempo.is_reachable(SLACK));
        assert!((tempo.interval_secs - 0.05).abs() < 1e-4);
        assert_eq!(stabilizer.shared().snapshot().unwrap(), Some(tempo));
    }

    #[test]
    fn negative_interval_floors_to_zero_sleep() {
        let tempo = StableTempo::from_bpm(900.0, SLACK);
        assert!(tempo.interval_secs < 0.0);
        assert_eq!(tempo.interval(), Duration::ZERO);
    }

    #[test]
    fn vanishingly_slow_tempo_saturates_the_interval() {
        let mut stabilizer = stabilizer();
        let tempo = match stabilizer.evaluate(1e-20).unwrap() {
            Evaluation::Accepted(tempo) => tempo,
            other => panic!("expected acceptance, got {other:?}"),
        };

        assert_eq!(tempo.interval(), Duration::MAX);
        assert_eq!(
            StableTempo::from_bpm(f32::MIN_POSITIVE / 4.0, SLACK).interval(),
            Duration::MAX
        );
    }

    #[test]
    fn ticks_follow_the_latest_sample() {
        let slot = TempoSlot::new();
        let mut stabilizer = stabilizer();

        assert_eq!(stabilizer.tick(&slot).unwrap(), Evaluation::Unchanged);

        let expected = [
            (118.0, Some(0.4085)),
            (118.4, None),
            (122.0, Some(0.3918)),
            (122.3, None),
        ];
        for (sample, interval) in expected {
            slot.publish(sample).unwrap();
            let evaluation = stabilizer.tick(&slot).unwrap();
            match interval {
                Some(expected) => {
                    assert!((accepted_interval(evaluation) - expected).abs() < 1e-3)
                }
                None => assert_eq!(evaluation, Evaluation::Unchanged),
            }
        }

        let tempo = stabilizer.shared().snapshot().unwrap().unwrap();
        assert_eq!(tempo.accepted_bpm, 122.0);
    }

    #[test]
    fn samples_between_ticks_coalesce() {
        let slot = TempoSlot::new();
        let mut stabilizer = stabilizer();

        for sample in [90.0, 140.0, 128.0] {
            slot.publish(sample).unwrap();
        }
        stabilizer.tick(&slot).unwrap();
        assert_eq!(stabilizer.accepted_bpm(), 128.0);

        assert_eq!(stabilizer.tick(&slot).unwrap(), Evaluation::Unchanged);
    }

    #[test]
    fn readers_never_observe_torn_pairs() {
        let shared = SharedTempo::new();
        let mut stabilizer = TempoStabilizer::new(1.0, SLACK, shared.clone());
        let shutdown = Shutdown::new();

        let reader_shutdown = shutdown.clone();
        let reader = thread::spawn(move || {
            let mut observed = 0;
            while !reader_shutdown.is_triggered() || observed == 0 {
                if let Some(tempo) = shared.snapshot().unwrap() {
                    let expected = StableTempo::from_bpm(tempo.accepted_bpm, SLACK);
                    assert_eq!(tempo, expected);
                    observed += 1;
                }
            }
            observed
        });

        for step in 0..2000 {
            let bpm = if step % 2 == 0 { 90.0 } else { 150.0 };
            stabilizer.evaluate(bpm).unwrap();
        }
        shutdown.trigger();

        assert!(reader.join().unwrap() > 0);
    }

    #[test]
    fn waiting_reader_wakes_on_first_acceptance() {
        let shared = SharedTempo::new();
        let shutdown = Shutdown::new();
        let mut stabilizer = TempoStabilizer::new(1.0, SLACK, shared.clone());

        let waiter = {
            let shared = shared.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || shared.wait_for_tempo(&shutdown).unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        stabilizer.evaluate(120.0).unwrap();

        let tempo = waiter.join().unwrap().expect("tempo should arrive");
        assert_eq!(tempo.accepted_bpm, 120.0);
    }

    #[test]
    fn waiting_reader_returns_none_on_shutdown() {
        let shared = SharedTempo::new();
        let shutdown = Shutdown::new();
        shutdown.trigger();

        assert_eq!(shared.wait_for_tempo(&shutdown).unwrap(), None);
    }
}
