use crate::campaign::{MediaRef, OverlayConfig};
use crate::config::GatewaySettings;
use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use url::Url;

/// One outbound send, fully rendered for a single recipient.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayRequest {
    pub recipient: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay: Option<OverlayConfig>,
}

/// Gateway verdict for one request. `accepted == false` means the gateway
/// was reachable but refused the message; transport-level failures surface
/// as `Err` from `send_message` instead.
#[derive(Debug, Clone)]
pub struct GatewayReply {
    pub accepted: bool,
    pub detail: Option<String>,
}

/// Transport seam between the dispatch loop and the delivery service.
/// Object-safe with boxed futures so engines hold `Arc<dyn MessageGateway>`
/// and tests substitute scripted fakes.
pub trait MessageGateway: Send + Sync {
    fn send_message<'a>(
        &'a self,
        request: &'a GatewayRequest,
    ) -> Pin<Box<dyn Future<Output = Result<GatewayReply>> + Send + 'a>>;
}

#[derive(Debug, Deserialize)]
struct WireReply {
    status: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Production transport: posts JSON to the configured gateway, `send` for
/// plain text and `send-media` when a media handle rides along.
pub struct HttpGateway {
    client: Client,
    message_endpoint: Url,
    media_endpoint: Url,
    api_key: Option<String>,
}

impl HttpGateway {
    pub fn new(settings: &GatewaySettings) -> Result<Self> {
        let mut base = Url::parse(&settings.base_url)
            .with_context(|| format!("invalid gateway base URL: {}", settings.base_url))?;
        // Url::join resolves against the parent of a path with no trailing
        // slash, which would eat the last segment of the configured base.
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .user_agent(concat!("blastline/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            message_endpoint: base.join("send")?,
            media_endpoint: base.join("send-media")?,
            api_key: settings.api_key.clone().filter(|k| !k.is_empty()),
        })
    }
}

impl MessageGateway for HttpGateway {
    fn send_message<'a>(
        &'a self,
        request: &'a GatewayRequest,
    ) -> Pin<Box<dyn Future<Output = Result<GatewayReply>> + Send + 'a>> {
        Box::pin(async move {
            let endpoint = if request.media.is_some() {
                &self.media_endpoint
            } else {
                &self.message_endpoint
            };

            let mut call = self.client.post(endpoint.clone()).json(request);
            if let Some(key) = &self.api_key {
                call = call.bearer_auth(key);
            }

            let response = call
                .send()
                .await
                .with_context(|| format!("gateway unreachable at {endpoint}"))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Ok(GatewayReply {
                    accepted: false,
                    detail: Some(format!("HTTP {status}: {}", truncate(&body, 200))),
                });
            }

            let reply: WireReply = response
                .json()
                .await
                .context("gateway returned an unparsable reply")?;
            Ok(GatewayReply {
                accepted: reply.status,
                detail: reply.message,
            })
        })
    }
}

/// Rehearsal transport: accepts everything and logs what would have gone out.
pub struct DryRunGateway;

impl MessageGateway for DryRunGateway {
    fn send_message<'a>(
        &'a self,
        request: &'a GatewayRequest,
    ) -> Pin<Box<dyn Future<Output = Result<GatewayReply>> + Send + 'a>> {
        Box::pin(async move {
            log::info!(
                "[dry-run] to {}: {:?}{}{}",
                request.recipient,
                truncate(&request.message, 80),
                if request.media.is_some() { " +media" } else { "" },
                if request.overlay.is_some() {
                    " +overlay"
                } else {
                    ""
                },
            );
            Ok(GatewayReply {
                accepted: true,
                detail: None,
            })
        })
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
