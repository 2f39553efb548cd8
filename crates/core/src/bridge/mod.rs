//! Minimal Hue bridge contract: find the bridge, obtain a username, switch a
//! light.

mod client;
mod credentials;

use std::{
    thread,
    time::{Duration, Instant},
};

use tracing::{info, warn};

pub use client::HttpBridge;
pub use credentials::{BridgeCredentials, CachedCredentials, CredentialCache};

use crate::{config::BridgeConfig, driver::LightActuator, HueTempoError, Result};

/// Bootstrap operations, separated from the transport so the bootstrap
/// policy can run against a fake bridge.
pub trait BridgeApi {
    /// Address of the first bridge on the local network.
    fn discover(&self) -> Result<String>;
    /// Whether something answering like a bridge lives at `address`.
    fn is_bridge(&self, address: &str) -> bool;
    /// One pairing attempt. Fails with
    /// [`HueTempoError::LinkButtonNotPressed`] until the button is pressed.
    fn register(&self, address: &str) -> Result<String>;
    /// `Ok(false)` when the bridge reports the username as unauthorized.
    fn is_authorized(&self, address: &str, username: &str) -> Result<bool>;
}

/// State of one light as reported by the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct LightInfo {
    pub id: String,
    pub name: String,
    pub on: bool,
    pub brightness: Option<u8>,
    pub reachable: bool,
}

/// How long to keep asking for the link button.
#[derive(Debug, Clone, Copy)]
pub struct PairingPolicy {
    pub timeout: Duration,
    pub poll: Duration,
}

impl From<&BridgeConfig> for PairingPolicy {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            timeout: config.pairing_timeout(),
            poll: config.pairing_poll(),
        }
    }
}

/// Registers with the bridge, retrying while the link button is unpressed.
pub fn pair(api: &impl BridgeApi, address: &str, policy: PairingPolicy) -> Result<String> {
    let started = Instant::now();
    let mut prompted = false;

    loop {
        match api.register(address) {
            Ok(username) => {
                info!(address, "paired with bridge");
                return Ok(username);
            }
            Err(HueTempoError::LinkButtonNotPressed) if started.elapsed() < policy.timeout => {
                if !prompted {
                    info!("press the link button on the Hue bridge");
                    prompted = true;
                }
                thread::sleep(policy.poll);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Resolves working credentials, reusing the cache where it still holds and
/// rewriting it whenever anything changed.
pub fn bootstrap(
    api: &impl BridgeApi,
    cache: &CredentialCache,
    policy: PairingPolicy,
) -> Result<BridgeCredentials> {
    let cached = cache.load()?.unwrap_or_default();

    let address = match cached.address.as_deref() {
        Some(address) if api.is_bridge(address) => address.to_string(),
        Some(address) => {
            warn!(address, "cached bridge address is not answering, rediscovering");
            api.discover()?
        }
        None => api.discover()?,
    };
    info!(%address, "using bridge");

    let username = match cached.username.as_deref() {
        Some(username) if api.is_authorized(&address, username)? => username.to_string(),
        Some(_) => {
            warn!("cached username was rejected, pairing again");
            pair(api, &address, policy)?
        }
        None => pair(api, &address, policy)?,
    };

    let credentials = BridgeCredentials { address, username };
    let unchanged = cached.address.as_deref() == Some(credentials.address.as_str())
        && cached.username.as_deref() == Some(credentials.username.as_str());
    if !unchanged {
        cache.store(&credentials)?;
        info!(path = ?cache.path(), "saved bridge credentials");
    }

    Ok(credentials)
}

/// Bootstraps against the real bridge described by `config`.
pub fn connect(config: &BridgeConfig) -> Result<(HttpBridge, BridgeCredentials)> {
    let bridge = HttpBridge::new(config)?;
    let cache = CredentialCache::new(&config.cache_path);
    let credentials = bootstrap(&bridge, &cache, PairingPolicy::from(config))?;
    Ok((bridge, credentials))
}

/// A single bridge light driven through the REST API.
#[derive(Debug, Clone)]
pub struct HueLight {
    bridge: HttpBridge,
    credentials: BridgeCredentials,
    light_id: String,
}

impl HueLight {
    /// Creates a handle for `light_id` on an already paired bridge.
    pub fn new(bridge: HttpBridge, credentials: BridgeCredentials, light_id: impl Into<String>) -> Self {
        Self {
            bridge,
            credentials,
            light_id: light_id.into(),
        }
    }

    /// Checks that the light exists and warns if the bridge cannot reach it.
    pub fn verify(&self) -> Result<LightInfo> {
        let lights = self.bridge.lights(&self.credentials)?;
        let light = lights.get(&self.light_id).cloned().ok_or_else(|| {
            HueTempoError::Bridge(format!("light `{}` is not known to the bridge", self.light_id))
        })?;
        if !light.reachable {
            warn!(light = %light.id, name = %light.name, "light is not reachable");
        }
        Ok(light)
    }
}

impl LightActuator for HueLight {
    fn pulse(&mut self, on: bool, brightness: u8, transition_ticks: u16) -> Result<()> {
        self.bridge.set_light_state(
            &self.credentials,
            &self.light_id,
            on,
            brightness,
            transition_ticks,
        )
    }
}
