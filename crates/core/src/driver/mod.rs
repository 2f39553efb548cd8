use std::{sync::Arc, time::Duration};

use tracing::{info, warn};

use crate::{
    config::PulseConfig,
    tempo::SharedTempo,
    timeline::{Clock, Shutdown},
    Result,
};

/// Highest brightness the bridge accepts.
pub const MAX_BRIGHTNESS: u8 = 254;

/// Anything that can switch a light. `transition_ticks` is in units of 100 ms.
pub trait LightActuator: Send {
    fn pulse(&mut self, on: bool, brightness: u8, transition_ticks: u16) -> Result<()>;
}

impl<A: LightActuator + ?Sized> LightActuator for Box<A> {
    fn pulse(&mut self, on: bool, brightness: u8, transition_ticks: u16) -> Result<()> {
        (**self).pulse(on, brightness, transition_ticks)
    }
}

/// Actuator that only logs, for running without a bridge.
#[derive(Debug, Clone)]
pub struct DryRunLights {
    light_id: String,
}

impl DryRunLights {
    /// Creates an actuator that logs pulses for `light_id`.
    pub fn new(light_id: impl Into<String>) -> Self {
        Self {
            light_id: light_id.into(),
        }
    }
}

impl LightActuator for DryRunLights {
    fn pulse(&mut self, on: bool, brightness: u8, transition_ticks: u16) -> Result<()> {
        info!(light = %self.light_id, on, brightness, transition_ticks, "pulse");
        Ok(())
    }
}

/// Fixed per-beat pulse: dim, bright, off.
#[derive(Debug, Clone, PartialEq)]
pub struct PulseShape {
    pub dim_brightness: u8,
    pub full_brightness: u8,
    pub dim_hold: Duration,
    pub on_hold: Duration,
    pub transition_ticks: u16,
}

impl Default for PulseShape {
    fn default() -> Self {
        Self::from(&PulseConfig::default())
    }
}

impl From<&PulseConfig> for PulseShape {
    fn from(config: &PulseConfig) -> Self {
        Self {
            dim_brightness: config.dim_brightness,
            full_brightness: config.full_brightness,
            dim_hold: config.dim_hold(),
            on_hold: config.on_hold(),
            transition_ticks: config.transition_ticks,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverStats {
    pub beats: u64,
    pub failures: u64,
}

/// Pulses a light once per beat at the currently accepted tempo.
pub struct BeatDriver<A> {
    actuator: A,
    shape: PulseShape,
    tempo: SharedTempo,
    clock: Arc<dyn Clock>,
    stats: DriverStats,
}

impl<A: LightActuator> BeatDriver<A> {
    /// Creates a driver. Nothing is pulsed until [`run`](Self::run).
    pub fn new(actuator: A, shape: PulseShape, tempo: SharedTempo, clock: Arc<dyn Clock>) -> Self {
        Self {
            actuator,
            shape,
            tempo,
            clock,
            stats: DriverStats::default(),
        }
    }

    /// Returns the beats and failures counted so far.
    pub fn stats(&self) -> DriverStats {
        self.stats
    }

    /// Waits for the first accepted tempo, then beats until shutdown.
    pub fn run(&mut self, shutdown: &Shutdown) -> Result<DriverStats> {
        let Some(first) = self.tempo.wait_for_tempo(shutdown)? else {
            return Ok(self.stats);
        };
        info!(bpm = first.accepted_bpm, "starting beat loop");

        while !shutdown.is_triggered() {
            if !self.beat(shutdown)? {
                break;
            }
        }

        info!(
            beats = self.stats.beats,
            failures = self.stats.failures,
            "beat loop stopped"
        );
        Ok(self.stats)
    }

    /// Emits one pulse and sleeps for the current interval. Returns `false`
    /// once shutdown interrupts a wait.
    pub fn beat(&mut self, shutdown: &Shutdown) -> Result<bool> {
        let shape = self.shape.clone();

        self.actuate(true, shape.dim_brightness);
        if !self.clock.sleep(shape.dim_hold, shutdown) {
            return Ok(false);
        }
        self.actuate(true, shape.full_brightness);
        if !self.clock.sleep(shape.on_hold, shutdown) {
            return Ok(false);
        }
        self.actuate(false, 0);
        self.stats.beats += 1;

        let tempo = match self.tempo.snapshot()? {
            Some(tempo) => tempo,
            None => match self.tempo.wait_for_tempo(shutdown)? {
                Some(tempo) => tempo,
                None => return Ok(false),
            },
        };
        Ok(self.clock.sleep(tempo.interval(), shutdown))
    }

    fn actuate(&mut self, on: bool, brightness: u8) {
        let brightness = brightness.min(MAX_BRIGHTNESS);
        if let Err(err) = self
            .actuator
            .pulse(on, brightness, self.shape.transition_ticks)
        {
            self.stats.failures += 1;
            warn!(%err, on, brightness, "light pulse failed");
        }
    }
}

impl<A> std::fmt::Debug for BeatDriver<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeatDriver")
            .field("shape", &self.shape)
            .field("tempo", &self.tempo)
            .field("stats", &self.stats)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use std::thread;

    use super::testing::{Call, RecordingLights};
    use super::*;
    use crate::{
        tempo::{StableTempo, TempoStabilizer},
        timeline::VirtualClock,
    };

    const SLACK: Duration = Duration::from_millis(100);
    const BEAT: [Call; 3] = [(true, 51, 1), (true, 254, 1), (false, 0, 1)];

    fn tempo_at(bpm: f32) -> SharedTempo {
        let shared = SharedTempo::new();
        TempoStabilizer::new(1.0, SLACK, shared.clone())
            .evaluate(bpm)
            .unwrap();
        shared
    }

    fn beat_sleeps(interval: Duration) -> Vec<Duration> {
        vec![Duration::from_millis(20), SLACK, interval]
    }

    #[test]
    fn emits_fixed_shape_then_sleeps_interval() {
        let lights = RecordingLights::default();
        let clock = Arc::new(VirtualClock::with_budget(6));
        let shared = tempo_at(120.0);
        let interval = shared.snapshot().unwrap().unwrap().interval();

        let mut driver =
            BeatDriver::new(lights.clone(), PulseShape::default(), shared, clock.clone());
        let stats = driver.run(&Shutdown::new()).unwrap();

        assert_eq!(stats, DriverStats { beats: 2, failures: 0 });
        assert_eq!(lights.calls(), [BEAT, BEAT].concat());
        assert_eq!(clock.sleeps(), [beat_sleeps(interval), beat_sleeps(interval)].concat());
        assert!((interval.as_secs_f32() - 0.4).abs() < 1e-3);
    }

    #[test]
    fn failed_pulses_do_not_disturb_cadence() {
        let lights = RecordingLights {
            fail_first: 3,
            ..Default::default()
        };
        let clock = Arc::new(VirtualClock::with_budget(9));
        let shared = tempo_at(100.0);
        let interval = shared.snapshot().unwrap().unwrap().interval();

        let mut driver =
            BeatDriver::new(lights.clone(), PulseShape::default(), shared, clock.clone());
        let stats = driver.run(&Shutdown::new()).unwrap();

        assert_eq!(stats, DriverStats { beats: 3, failures: 3 });
        assert_eq!(lights.calls(), [BEAT, BEAT, BEAT].concat());
        assert_eq!(
            clock.sleeps(),
            [beat_sleeps(interval), beat_sleeps(interval), beat_sleeps(interval)].concat()
        );
    }

    #[test]
    fn waits_for_first_tempo_without_sleeping() {
        let lights = RecordingLights::default();
        let clock = Arc::new(VirtualClock::with_budget(3));
        let shared = SharedTempo::new();
        let shutdown = Shutdown::new();

        let handle = {
            let mut driver = BeatDriver::new(
                lights.clone(),
                PulseShape::default(),
                shared.clone(),
                clock.clone(),
            );
            let shutdown = shutdown.clone();
            thread::spawn(move || driver.run(&shutdown).unwrap())
        };

        thread::sleep(Duration::from_millis(100));
        assert!(clock.sleeps().is_empty());
        assert!(lights.calls().is_empty());

        TempoStabilizer::new(1.0, SLACK, shared)
            .evaluate(150.0)
            .unwrap();
        let stats = handle.join().unwrap();

        assert_eq!(stats.beats, 1);
        assert!(clock.sleeps().iter().all(|sleep| !sleep.is_zero()));
    }

    #[test]
    fn shutdown_before_first_tempo_returns_quietly() {
        let lights = RecordingLights::default();
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let mut driver = BeatDriver::new(
            lights.clone(),
            PulseShape::default(),
            SharedTempo::new(),
            Arc::new(VirtualClock::new()),
        );

        assert_eq!(driver.run(&shutdown).unwrap(), DriverStats::default());
        assert!(lights.calls().is_empty());
    }

    /// Publishes a new tempo while the light is held on.
    struct RetimingClock {
        inner: VirtualClock,
        shared: SharedTempo,
    }

    impl Clock for RetimingClock {
        fn sleep(&self, duration: Duration, shutdown: &Shutdown) -> bool {
            if duration == SLACK {
                self.shared
                    .publish(StableTempo::from_bpm(60.0, SLACK))
                    .unwrap();
            }
            self.inner.sleep(duration, shutdown)
        }
    }

    #[test]
    fn interval_is_read_after_the_pulse() {
        let shared = tempo_at(120.0);
        let clock = Arc::new(RetimingClock {
            inner: VirtualClock::with_budget(3),
            shared: shared.clone(),
        });

        let mut driver = BeatDriver::new(
            RecordingLights::default(),
            PulseShape::default(),
            shared,
            clock.clone(),
        );
        driver.run(&Shutdown::new()).unwrap();

        let sleeps = clock.inner.sleeps();
        assert!((sleeps[2].as_secs_f32() - 0.9).abs() < 1e-3);
    }

    #[test]
    fn brightness_is_clamped_to_bridge_range() {
        let lights = RecordingLights::default();
        let shape = PulseShape {
            full_brightness: u8::MAX,
            ..PulseShape::default()
        };
        let mut driver = BeatDriver::new(
            lights.clone(),
            shape,
            tempo_at(120.0),
            Arc::new(VirtualClock::with_budget(3)),
        );
        driver.run(&Shutdown::new()).unwrap();

        assert_eq!(lights.calls()[1], (true, MAX_BRIGHTNESS, 1));
    }
}
