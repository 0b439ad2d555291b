use crate::roster::RecipientRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle of one campaign run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CampaignState {
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
}

impl CampaignState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignState::Stopped | CampaignState::Completed)
    }
}

impl fmt::Display for CampaignState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CampaignState::Idle => "idle",
            CampaignState::Running => "running",
            CampaignState::Paused => "paused",
            CampaignState::Stopped => "stopped",
            CampaignState::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Terminal (or in-flight) disposition of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    /// Dispatch has started, gateway reply not yet in.
    Pending,
    /// Gateway accepted the message.
    Sent,
    /// Gateway was reachable but rejected the request.
    Failed,
    /// Transport-level error (network, malformed reply).
    Errored,
}

/// One entry in the per-run audit log. `sequence` is 1-based and matches the
/// recipient's position in the dispatch order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub sequence: usize,
    pub recipient_label: String,
    pub outcome: AttemptOutcome,
    pub at: DateTime<Utc>,
}

/// Running counters for one campaign run. `sent + failed <= total` holds at
/// every observable point; `total` is fixed when the run starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignStats {
    pub sent: u64,
    pub failed: u64,
    pub total: u64,
}

impl CampaignStats {
    pub fn processed(&self) -> u64 {
        self.sent + self.failed
    }
}

/// Whole-percent progress, rounded half-up the way the dashboard displays it.
pub fn progress_percent(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((processed as f64 / total as f64) * 100.0).round() as u8
}

/// Audit log and stats aggregator for one run. The dispatch loop is the only
/// writer; observers get cloned snapshots. The log is append-only and
/// front-inserted so the most recent attempt is always first.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchLedger {
    stats: CampaignStats,
    progress: u8,
    current_index: usize,
    attempts: Vec<AttemptRecord>,
}

impl DispatchLedger {
    pub fn for_total(total: u64) -> Self {
        Self {
            stats: CampaignStats {
                total,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Record that dispatch of item `sequence` has begun.
    pub fn begin_attempt(&mut self, sequence: usize, recipient_label: String) {
        self.current_index = sequence.saturating_sub(1);
        self.attempts.insert(
            0,
            AttemptRecord {
                sequence,
                recipient_label,
                outcome: AttemptOutcome::Pending,
                at: Utc::now(),
            },
        );
    }

    /// Settle the pending attempt for `sequence` and bump the counters.
    /// Exactly one terminal outcome lands per item.
    pub fn close_attempt(&mut self, sequence: usize, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Sent => self.stats.sent += 1,
            AttemptOutcome::Failed | AttemptOutcome::Errored => self.stats.failed += 1,
            AttemptOutcome::Pending => {}
        }
        if let Some(record) = self.attempts.iter_mut().find(|r| r.sequence == sequence) {
            record.outcome = outcome;
        }
    }

    pub fn publish_progress(&mut self, processed: usize, total: usize) {
        self.progress = progress_percent(processed, total);
    }

    pub fn stats(&self) -> CampaignStats {
        self.stats
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }
}

/// Opaque media handle passed through to the gateway, plus the coarse type
/// hint the gateway routes on.
#[derive(Clone, Serialize, Deserialize)]
pub struct MediaRef {
    pub handle: String,
    pub type_hint: String,
}

impl fmt::Debug for MediaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The handle is routinely a multi-megabyte base64 payload.
        f.debug_struct("MediaRef")
            .field("type_hint", &self.type_hint)
            .field("handle_len", &self.handle.len())
            .finish()
    }
}

/// Personalized text/graphic layer composited onto the shared media asset
/// for one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayConfig {
    pub text: String,
    pub x: i32,
    pub y: i32,
    pub font_size: u32,
    pub color: String,
}

/// Pure per-recipient overlay builder supplied by the caller; keeps the
/// dispatch core decoupled from any visual editor.
pub type OverlayFn = dyn Fn(&RecipientRecord) -> OverlayConfig + Send + Sync;

/// Read-only configuration for one campaign run.
#[derive(Clone)]
pub struct CampaignConfig {
    pub message_template: String,
    pub media: Option<MediaRef>,
    pub overlay: Option<Arc<OverlayFn>>,
    pub inter_item_delay: Duration,
}

impl CampaignConfig {
    pub fn text(message_template: impl Into<String>, inter_item_delay: Duration) -> Self {
        Self {
            message_template: message_template.into(),
            media: None,
            overlay: None,
            inter_item_delay,
        }
    }
}

impl fmt::Debug for CampaignConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CampaignConfig")
            .field("message_template", &self.message_template)
            .field("media", &self.media)
            .field("overlay", &self.overlay.as_ref().map(|_| "<fn>"))
            .field("inter_item_delay", &self.inter_item_delay)
            .finish()
    }
}

/// Point-in-time view of a run, cheap to clone out to a UI.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignSnapshot {
    pub state: CampaignState,
    pub stats: CampaignStats,
    pub progress: u8,
    pub current_index: usize,
    pub attempts: Vec<AttemptRecord>,
}
