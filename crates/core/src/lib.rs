//! Core library for Hue Tempo.
//!
//! A sampler thread estimates the tempo of the music in the room, a
//! stabilizer decides when that estimate has moved far enough to retime the
//! light, and a beat driver pulses a Hue light once per beat at the accepted
//! tempo. [`BeatSession`] wires the three together.

pub mod analysis;
pub mod audio;
pub mod bridge;
pub mod config;
pub mod driver;
pub mod error;
pub mod session;
pub mod tempo;
pub mod timeline;

pub use analysis::{TempoEstimate, TempoEstimator};
pub use audio::{list_input_devices, InputDevice, MicrophoneTempoSource, ScriptedTempoSource, TempoSource};
pub use bridge::{BridgeApi, BridgeCredentials, CredentialCache, HttpBridge, HueLight, LightInfo};
pub use config::{AppConfig, AudioConfig, BridgeConfig, PulseConfig, TempoConfig};
pub use driver::{BeatDriver, DriverStats, DryRunLights, LightActuator, PulseShape};
pub use error::{HueTempoError, Result};
pub use session::{BeatSession, SessionSettings};
pub use tempo::{Evaluation, SharedTempo, StableTempo, TempoSlot, TempoStabilizer};
pub use timeline::{Clock, Scheduler, Shutdown, SystemClock, VirtualClock};
