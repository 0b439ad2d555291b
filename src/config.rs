use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub overlay: OverlaySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub base_url: String,
    /// Bearer token sent with every request; omit for open gateways.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Seconds to wait between consecutive sends. The receiving gateway
    /// throttles aggressive senders, so keep this above a couple of seconds
    /// for real campaigns.
    pub inter_item_delay_seconds: f64,
}

/// Static overlay definition; the CLI turns this into the per-recipient
/// overlay function. `text` supports the same `{name}` token as the message
/// template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlaySettings {
    pub enabled: bool,
    pub text: String,
    pub x: i32,
    pub y: i32,
    pub font_size: u32,
    pub color: String,
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gateway: GatewaySettings {
                base_url: "http://localhost:3000".to_string(),
                api_key: None,
                timeout_seconds: default_timeout_seconds(),
            },
            dispatch: DispatchSettings::default(),
            overlay: OverlaySettings::default(),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        DispatchSettings {
            inter_item_delay_seconds: 5.0,
        }
    }
}

impl Default for OverlaySettings {
    fn default() -> Self {
        OverlaySettings {
            enabled: false,
            text: "For {name}".to_string(),
            x: 24,
            y: 48,
            font_size: 32,
            color: "#ffffff".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file: {path}"))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse configuration file: {path}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write configuration file: {path}"))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.gateway.base_url)
            .with_context(|| format!("invalid gateway base URL: {}", self.gateway.base_url))?;
        if self.dispatch.inter_item_delay_seconds < 0.0
            || !self.dispatch.inter_item_delay_seconds.is_finite()
        {
            bail!(
                "inter_item_delay_seconds must be a non-negative number, got {}",
                self.dispatch.inter_item_delay_seconds
            );
        }
        if self.overlay.enabled && self.overlay.text.trim().is_empty() {
            bail!("overlay is enabled but overlay.text is blank");
        }
        Ok(())
    }
}
