use std::collections::BTreeMap;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BridgeApi, BridgeCredentials, LightInfo};
use crate::{config::BridgeConfig, HueTempoError, Result};

const ERROR_UNAUTHORIZED_USER: i32 = 1;
const ERROR_LINK_BUTTON_NOT_PRESSED: i32 = 101;

#[derive(Deserialize, Debug, Clone)]
struct DiscoveredBridge {
    #[serde(rename = "internalipaddress")]
    ip: String,
    #[serde(default)]
    id: String,
}

#[derive(Serialize)]
struct RegisterBody<'a> {
    devicetype: &'a str,
}

#[derive(Deserialize, Debug)]
struct RegisterSuccess {
    username: String,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    #[serde(rename = "type")]
    error_type: i32,
    description: String,
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum ResponseItem<T> {
    Success { success: T },
    Error { error: ApiError },
}

#[derive(Deserialize, Debug)]
struct WireLight {
    name: String,
    state: WireLightState,
}

#[derive(Deserialize, Debug)]
struct WireLightState {
    on: bool,
    #[serde(default)]
    bri: Option<u8>,
    #[serde(default)]
    reachable: bool,
}

/// `GET /api/<user>/lights` answers with an object on success and an array
/// of errors otherwise.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum LightsResponse {
    Lights(BTreeMap<String, WireLight>),
    Errors(Vec<ResponseItem<serde_json::Value>>),
}

#[derive(Serialize, Debug, PartialEq)]
struct LightStateBody {
    on: bool,
    bri: u8,
    transitiontime: u16,
}

/// Blocking client for the bridge's local REST API.
#[derive(Debug, Clone)]
pub struct HttpBridge {
    client: Client,
    discovery_url: String,
    device_type: String,
}

impl HttpBridge {
    /// Creates a client using the request timeout and discovery settings of
    /// `config`.
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            discovery_url: config.discovery_url.clone(),
            device_type: config.device_type.clone(),
        })
    }

    /// Every light known to the bridge, keyed by id.
    pub fn lights(&self, credentials: &BridgeCredentials) -> Result<BTreeMap<String, LightInfo>> {
        let response: LightsResponse = self
            .client
            .get(lights_url(credentials))
            .send()?
            .error_for_status()?
            .json()?;

        match response {
            LightsResponse::Lights(lights) => Ok(into_light_info(lights)),
            LightsResponse::Errors(items) => Err(bridge_error(&items)),
        }
    }

    /// Sets on/off, brightness and transition time of one light. An error
    /// item in the bridge's reply is reported as [`HueTempoError::Bridge`].
    pub fn set_light_state(
        &self,
        credentials: &BridgeCredentials,
        light_id: &str,
        on: bool,
        brightness: u8,
        transition_ticks: u16,
    ) -> Result<()> {
        let url = format!("{}/{light_id}/state", lights_url(credentials));
        let body = LightStateBody {
            on,
            bri: brightness,
            transitiontime: transition_ticks,
        };

        let items: Vec<ResponseItem<serde_json::Value>> = self
            .client
            .put(url)
            .json(&body)
            .send()?
            .error_for_status()?
            .json()?;

        match first_error(&items) {
            Some(error) => Err(HueTempoError::Bridge(error.description.clone())),
            None => Ok(()),
        }
    }
}

impl BridgeApi for HttpBridge {
    fn discover(&self) -> Result<String> {
        debug!(url = %self.discovery_url, "discovering bridges");
        let bridges: Vec<DiscoveredBridge> = self
            .client
            .get(&self.discovery_url)
            .send()?
            .error_for_status()?
            .json()?;

        let bridge = bridges.into_iter().next().ok_or(HueTempoError::DiscoveryFailed)?;
        debug!(address = %bridge.ip, id = %bridge.id, "bridge discovered");
        Ok(bridge.ip)
    }

    fn is_bridge(&self, address: &str) -> bool {
        let url = format!("http://{address}/api/0/config");
        self.client
            .get(url)
            .send()
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }

    fn register(&self, address: &str) -> Result<String> {
        let body = RegisterBody {
            devicetype: &self.device_type,
        };
        let items: Vec<ResponseItem<RegisterSuccess>> = self
            .client
            .post(format!("http://{address}/api"))
            .json(&body)
            .send()?
            .json()?;

        parse_registration(items)
    }

    fn is_authorized(&self, address: &str, username: &str) -> Result<bool> {
        let credentials = BridgeCredentials {
            address: address.to_string(),
            username: username.to_string(),
        };
        let response: LightsResponse = self
            .client
            .get(lights_url(&credentials))
            .send()?
            .error_for_status()?
            .json()?;

        parse_authorization(response)
    }
}

fn lights_url(credentials: &BridgeCredentials) -> String {
    format!(
        "http://{}/api/{}/lights",
        credentials.address, credentials.username
    )
}

fn first_error<T>(items: &[ResponseItem<T>]) -> Option<&ApiError> {
    items.iter().find_map(|item| match item {
        ResponseItem::Error { error } => Some(error),
        ResponseItem::Success { .. } => None,
    })
}

fn bridge_error<T>(items: &[ResponseItem<T>]) -> HueTempoError {
    match first_error(items) {
        Some(error) => HueTempoError::Bridge(error.description.clone()),
        None => HueTempoError::Bridge("unexpected response from bridge".to_string()),
    }
}

fn parse_registration(items: Vec<ResponseItem<RegisterSuccess>>) -> Result<String> {
    match items.into_iter().next() {
        Some(ResponseItem::Success { success }) => Ok(success.username),
        Some(ResponseItem::Error { error }) if error.error_type == ERROR_LINK_BUTTON_NOT_PRESSED => {
            Err(HueTempoError::LinkButtonNotPressed)
        }
        Some(ResponseItem::Error { error }) => Err(HueTempoError::Bridge(error.description)),
        None => Err(HueTempoError::Bridge("empty response from bridge".to_string())),
    }
}

fn parse_authorization(response: LightsResponse) -> Result<bool> {
    match response {
        LightsResponse::Lights(_) => Ok(true),
        LightsResponse::Errors(items) => match first_error(&items) {
            Some(error) if error.error_type == ERROR_UNAUTHORIZED_USER => Ok(false),
            _ => Err(bridge_error(&items)),
        },
    }
}

fn into_light_info(lights: BTreeMap<String, WireLight>) -> BTreeMap<String, LightInfo> {
    lights
        .into_iter()
        .map(|(id, light)| {
            let info = LightInfo {
                id: id.clone(),
                name: light.name,
                on: light.state.on,
                brightness: light.state.bri,
                reachable: light.state.reachable,
            };
            (id, info)
        })
        .collect()
}
