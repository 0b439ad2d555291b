pub mod campaign;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod roster;
pub mod template;

pub use campaign::{
    AttemptOutcome, AttemptRecord, CampaignConfig, CampaignSnapshot, CampaignState, CampaignStats,
    MediaRef, OverlayConfig, OverlayFn,
};
pub use config::Config;
pub use engine::CampaignEngine;
pub use gateway::{DryRunGateway, GatewayReply, GatewayRequest, HttpGateway, MessageGateway};
pub use roster::{infer_recipients, RecipientRecord};
pub use template::MessageRenderer;
