use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tracing::{error, info};

use crate::{
    audio::TempoSource,
    config::AppConfig,
    driver::{BeatDriver, DriverStats, LightActuator, PulseShape},
    tempo::{SharedTempo, TempoSlot, TempoStabilizer},
    timeline::{Clock, Scheduler, Shutdown},
    Result,
};

/// Everything the three loops need besides their collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub tick: Duration,
    pub hysteresis_bpm: f32,
    pub pulse: PulseShape,
}

impl SessionSettings {
    /// Builds the settings from the tempo and pulse sections of `config`.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            tick: config.tempo.tick(),
            hysteresis_bpm: config.tempo.hysteresis_bpm,
            pulse: PulseShape::from(&config.pulse),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// A running sampler, stabilizer and beat driver.
#[derive(Debug)]
pub struct BeatSession {
    scheduler: Scheduler,
    slot: TempoSlot,
    tempo: SharedTempo,
    stats: Arc<Mutex<DriverStats>>,
}

impl BeatSession {
    /// Spawns the three loops. They run until [`BeatSession::stop`] or until
    /// the [`Shutdown`] returned by [`BeatSession::shutdown`] is triggered.
    pub fn start<S, A>(
        settings: SessionSettings,
        source: S,
        actuator: A,
        clock: Arc<dyn Clock>,
    ) -> Result<Self>
    where
        S: TempoSource + 'static,
        A: LightActuator + 'static,
    {
        let mut scheduler = Scheduler::new();
        let slot = TempoSlot::new();
        let tempo = SharedTempo::new();
        let stats = Arc::new(Mutex::new(DriverStats::default()));

        {
            let slot = slot.clone();
            let clock = clock.clone();
            let mut source = source;
            scheduler.spawn("tempo-sampler", move |shutdown| {
                sample_loop(&mut source, &slot, clock.as_ref(), &shutdown)
            })?;
        }

        {
            let slot = slot.clone();
            let mut stabilizer = TempoStabilizer::new(
                settings.hysteresis_bpm,
                settings.pulse.on_hold,
                tempo.clone(),
            );
            scheduler.spawn_periodic("tempo-stabilizer", settings.tick, clock.clone(), move || {
                stabilizer.tick(&slot).map(|_| ())
            })?;
        }

        {
            let mut driver = BeatDriver::new(actuator, settings.pulse, tempo.clone(), clock);
            let stats = stats.clone();
            scheduler.spawn("beat-driver", move |shutdown| {
                let result = driver.run(&shutdown).unwrap_or_else(|err| {
                    error!(%err, "beat driver failed, stopping session");
                    shutdown.trigger();
                    driver.stats()
                });
                *stats.lock().unwrap_or_else(PoisonError::into_inner) = result;
            })?;
        }

        info!("beat session started");
        Ok(Self {
            scheduler,
            slot,
            tempo,
            stats,
        })
    }

    /// Handle that stops the session when triggered, e.g. from a signal
    /// handler.
    pub fn shutdown(&self) -> Shutdown {
        self.scheduler.shutdown()
    }

    /// Returns an observer view of the accepted tempo.
    pub fn tempo(&self) -> SharedTempo {
        self.tempo.clone()
    }

    /// The most recent raw estimate, accepted or not.
    pub fn latest_sample(&self) -> Result<Option<f32>> {
        self.slot.latest()
    }

    /// Signals every loop to stop and waits for them.
    pub fn stop(mut self) -> DriverStats {
        info!("stopping beat session");
        self.scheduler.stop();
        self.stats()
    }

    /// Blocks until the session is shut down from elsewhere.
    pub fn wait(mut self) -> DriverStats {
        self.scheduler.join();
        self.stats()
    }

    fn stats(&self) -> DriverStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Samples back-to-back, publishing every estimate. A failed capture is
/// logged and retried after the source's retry delay.
fn sample_loop(
    source: &mut dyn TempoSource,
    slot: &TempoSlot,
    clock: &dyn Clock,
    shutdown: &Shutdown,
) {
    while !shutdown.is_triggered() {
        match source.sample() {
            Ok(bpm) => {
                if let Err(err) = slot.publish(bpm) {
                    error!(%err, "cannot publish tempo sample");
                    break;
                }
            }
            Err(err) => {
                error!(%err, "tempo sampling failed");
                if !clock.sleep(source.retry_delay(), shutdown) {
                    break;
                }
            }
        }
    }
}
