/// Result alias that carries the custom [`HueTempoError`] type.
pub type Result<T> = std::result::Result<T, HueTempoError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum HueTempoError {
    /// Free-form failure that does not warrant a dedicated variant.
    #[error("{0}")]
    Message(String),
    /// Input rejected before any processing took place.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Audio backend failure (device missing, stream could not be built, ...).
    #[error("audio error: {0}")]
    Audio(String),
    /// Transport level failure while talking to the bridge.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    /// The bridge answered but refused the request.
    #[error("bridge error: {0}")]
    Bridge(String),
    #[error("no Hue bridge could be discovered on the local network")]
    DiscoveryFailed,
    #[error("link button not pressed; press the button on the Hue bridge and retry")]
    LinkButtonNotPressed,
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),
}

impl HueTempoError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub(crate) fn audio(err: impl std::fmt::Display) -> Self {
        Self::Audio(err.to_string())
    }
}

impl From<&str> for HueTempoError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for HueTempoError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
