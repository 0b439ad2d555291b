use crate::campaign::{
    AttemptOutcome, AttemptRecord, CampaignConfig, CampaignSnapshot, CampaignState, CampaignStats,
    DispatchLedger,
};
use crate::gateway::{GatewayRequest, MessageGateway};
use crate::roster::RecipientRecord;
use crate::template::MessageRenderer;
use anyhow::{bail, Result};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound on how long the paused loop sleeps before re-checking its
/// signals.
const PAUSE_POLL: Duration = Duration::from_millis(250);

/// Everything one run owns: lifecycle state, the audit ledger, and the two
/// control signals the loop listens to. Each `start()` allocates a fresh one
/// and swaps it in, so a straggling in-flight send from a stopped run can
/// only ever write into its own orphaned allocation.
struct RunState {
    state: RwLock<CampaignState>,
    ledger: Mutex<DispatchLedger>,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl RunState {
    fn new(state: CampaignState, total: u64) -> Arc<Self> {
        let (paused, _) = watch::channel(false);
        Arc::new(Self {
            state: RwLock::new(state),
            ledger: Mutex::new(DispatchLedger::for_total(total)),
            paused,
            cancel: CancellationToken::new(),
        })
    }
}

/// Campaign dispatch engine: owns the lifecycle of one campaign at a time
/// and drives the throttled send loop as a background tokio task. Construct
/// one engine per campaign context (individual blast, group broadcast);
/// instances are fully independent.
pub struct CampaignEngine {
    gateway: Arc<dyn MessageGateway>,
    current: RwLock<Arc<RunState>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CampaignEngine {
    pub fn new(gateway: Arc<dyn MessageGateway>) -> Self {
        Self {
            gateway,
            current: RwLock::new(RunState::new(CampaignState::Idle, 0)),
            worker: Mutex::new(None),
        }
    }

    /// Begin a run. Valid from `Idle`, `Stopped`, or `Completed`; rejects an
    /// empty roster or a blank template without touching state. Resets stats
    /// and the audit log, transitions to `Running`, and spawns the dispatch
    /// loop — the call returns once the loop is launched, not when it ends.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, config: CampaignConfig, recipients: Vec<RecipientRecord>) -> Result<()> {
        if recipients.is_empty() {
            bail!("cannot start a campaign with an empty recipient list");
        }
        if config.message_template.trim().is_empty() {
            bail!("cannot start a campaign with a blank message template");
        }

        let run = {
            let mut current = self.current.write().unwrap();
            let state = *current.state.read().unwrap();
            if matches!(state, CampaignState::Running | CampaignState::Paused) {
                bail!("a campaign is already {state}; stop it before starting another");
            }
            let run = RunState::new(CampaignState::Running, recipients.len() as u64);
            *current = run.clone();
            run
        };

        log::info!(
            "campaign starting: {} recipients, {:.1}s between sends",
            recipients.len(),
            config.inter_item_delay.as_secs_f64()
        );

        let gateway = self.gateway.clone();
        let handle = tokio::spawn(dispatch_loop(run, gateway, config, recipients));
        *self.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// `Running -> Paused`. The in-flight send is not cancelled; pausing
    /// only keeps the loop from beginning the next item.
    pub fn pause(&self) -> Result<()> {
        let run = self.run();
        let mut state = run.state.write().unwrap();
        match *state {
            CampaignState::Running => {
                *state = CampaignState::Paused;
                // send_replace: a plain send is dropped when the loop is not
                // currently subscribed (it only listens between items).
                run.paused.send_replace(true);
                log::info!("campaign paused");
                Ok(())
            }
            other => bail!("cannot pause a campaign that is {other}"),
        }
    }

    /// `Paused -> Running`.
    pub fn resume(&self) -> Result<()> {
        let run = self.run();
        let mut state = run.state.write().unwrap();
        match *state {
            CampaignState::Paused => {
                *state = CampaignState::Running;
                run.paused.send_replace(false);
                log::info!("campaign resumed");
                Ok(())
            }
            other => bail!("cannot resume a campaign that is {other}"),
        }
    }

    /// `Running | Paused -> Stopped`, effective immediately. The loop sees
    /// the cancellation at its next suspension point; an in-flight send is
    /// allowed to finish and its result is still recorded.
    pub fn stop(&self) -> Result<()> {
        let run = self.run();
        {
            let mut state = run.state.write().unwrap();
            match *state {
                CampaignState::Running | CampaignState::Paused => {
                    *state = CampaignState::Stopped;
                }
                other => bail!("cannot stop a campaign that is {other}"),
            }
        }
        run.cancel.cancel();
        log::info!("campaign stop requested");
        Ok(())
    }

    pub fn state(&self) -> CampaignState {
        *self.run().state.read().unwrap()
    }

    pub fn stats(&self) -> CampaignStats {
        self.run().ledger.lock().unwrap().stats()
    }

    pub fn progress(&self) -> u8 {
        self.run().ledger.lock().unwrap().progress()
    }

    pub fn current_index(&self) -> usize {
        self.run().ledger.lock().unwrap().current_index()
    }

    /// Audit log, most recent attempt first.
    pub fn attempts(&self) -> Vec<AttemptRecord> {
        self.run().ledger.lock().unwrap().attempts().to_vec()
    }

    /// Eventually-consistent view of the whole run for UI consumption.
    pub fn snapshot(&self) -> CampaignSnapshot {
        let run = self.run();
        let state = *run.state.read().unwrap();
        let ledger = run.ledger.lock().unwrap();
        CampaignSnapshot {
            state,
            stats: ledger.stats(),
            progress: ledger.progress(),
            current_index: ledger.current_index(),
            attempts: ledger.attempts().to_vec(),
        }
    }

    /// Wait for the background dispatch task to finish. After `stop()` this
    /// also waits out the in-flight send, so the final snapshot includes its
    /// result.
    pub async fn join(&self) {
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn run(&self) -> Arc<RunState> {
        self.current.read().unwrap().clone()
    }
}

async fn dispatch_loop(
    run: Arc<RunState>,
    gateway: Arc<dyn MessageGateway>,
    config: CampaignConfig,
    recipients: Vec<RecipientRecord>,
) {
    let total = recipients.len();
    let renderer = MessageRenderer::new();

    for (index, recipient) in recipients.iter().enumerate() {
        if run.cancel.is_cancelled() {
            break;
        }
        wait_while_paused(&run).await;
        if run.cancel.is_cancelled() {
            break;
        }

        let sequence = index + 1;
        let message = renderer.render(&config.message_template, &recipient.display_name);
        let overlay = config.overlay.as_ref().map(|build| build(recipient));

        run.ledger
            .lock()
            .unwrap()
            .begin_attempt(sequence, recipient.label());

        let request = GatewayRequest {
            recipient: recipient.identifier.clone(),
            message,
            media: config.media.clone(),
            overlay,
        };

        let outcome = match gateway.send_message(&request).await {
            Ok(reply) if reply.accepted => {
                log::debug!("{sequence}/{total} delivered to {}", recipient.identifier);
                AttemptOutcome::Sent
            }
            Ok(reply) => {
                log::warn!(
                    "{sequence}/{total} rejected for {}: {}",
                    recipient.identifier,
                    reply.detail.as_deref().unwrap_or("no detail")
                );
                AttemptOutcome::Failed
            }
            Err(e) => {
                log::error!(
                    "{sequence}/{total} transport error for {}: {e:#}",
                    recipient.identifier
                );
                AttemptOutcome::Errored
            }
        };

        {
            let mut ledger = run.ledger.lock().unwrap();
            ledger.close_attempt(sequence, outcome);
            ledger.publish_progress(sequence, total);
        }

        if sequence < total && !config.inter_item_delay.is_zero() {
            tokio::select! {
                _ = run.cancel.cancelled() => {}
                _ = tokio::time::sleep(config.inter_item_delay) => {}
            }
        }
    }

    finish(&run);
}

/// Block while the run is paused, waking on resume, cancellation, or the
/// poll interval, whichever comes first.
async fn wait_while_paused(run: &RunState) {
    let mut paused = run.paused.subscribe();
    loop {
        if run.cancel.is_cancelled() || !*paused.borrow() {
            return;
        }
        tokio::select! {
            _ = run.cancel.cancelled() => return,
            changed = tokio::time::timeout(PAUSE_POLL, paused.changed()) => {
                let _ = changed;
            }
        }
    }
}

fn finish(run: &RunState) {
    // stop() already moved the state to Stopped; the cancellation flag wins
    // over Completed.
    if run.cancel.is_cancelled() {
        let stats = run.ledger.lock().unwrap().stats();
        log::info!(
            "campaign stopped after {} of {} attempts ({} sent, {} failed)",
            stats.processed(),
            stats.total,
            stats.sent,
            stats.failed
        );
        return;
    }

    let mut state = run.state.write().unwrap();
    if matches!(*state, CampaignState::Running | CampaignState::Paused) {
        *state = CampaignState::Completed;
    }
    drop(state);

    let stats = run.ledger.lock().unwrap().stats();
    log::info!(
        "campaign completed: {} sent, {} failed of {}",
        stats.sent,
        stats.failed,
        stats.total
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayReply;
    use anyhow::anyhow;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Scripted gateway: alternates accept/reject, or errors on marked
    /// calls, and can be gated on a semaphore so tests control exactly how
    /// far the loop advances.
    struct StubGateway {
        calls: AtomicUsize,
        gate: Option<Arc<Semaphore>>,
        script: fn(usize) -> Result<GatewayReply>,
    }

    impl StubGateway {
        fn accepting() -> Self {
            Self::scripted(|_| Ok(accepted()))
        }

        fn scripted(script: fn(usize) -> Result<GatewayReply>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gate: None,
                script,
            }
        }

        fn gated(gate: Arc<Semaphore>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gate: Some(gate),
                script: |_| Ok(accepted()),
            }
        }
    }

    fn accepted() -> GatewayReply {
        GatewayReply {
            accepted: true,
            detail: None,
        }
    }

    fn rejected() -> GatewayReply {
        GatewayReply {
            accepted: false,
            detail: Some("rejected".to_string()),
        }
    }

    impl MessageGateway for StubGateway {
        fn send_message<'a>(
            &'a self,
            _request: &'a GatewayRequest,
        ) -> Pin<Box<dyn Future<Output = Result<GatewayReply>> + Send + 'a>> {
            Box::pin(async move {
                if let Some(gate) = &self.gate {
                    gate.acquire().await.unwrap().forget();
                }
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                (self.script)(call)
            })
        }
    }

    fn roster(n: usize) -> Vec<RecipientRecord> {
        (0..n)
            .map(|i| RecipientRecord::new(format!("98765432{i:02}"), format!("Contact {i}")))
            .collect()
    }

    fn config() -> CampaignConfig {
        CampaignConfig::text("Hi {name}", Duration::ZERO)
    }

    async fn wait_until(engine: &CampaignEngine, pred: impl Fn(&CampaignEngine) -> bool) {
        for _ in 0..500 {
            if pred(engine) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within 2.5s");
    }

    #[tokio::test]
    async fn test_completed_run_records_every_recipient() {
        let engine = CampaignEngine::new(Arc::new(StubGateway::accepting()));
        engine.start(config(), roster(5)).unwrap();
        engine.join().await;

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, CampaignState::Completed);
        assert_eq!(snapshot.stats.sent, 5);
        assert_eq!(snapshot.stats.failed, 0);
        assert_eq!(snapshot.stats.total, 5);
        assert_eq!(snapshot.attempts.len(), 5);
        assert_eq!(snapshot.progress, 100);
    }

    #[tokio::test]
    async fn test_alternating_gateway_splits_stats_and_orders_log() {
        let gateway = StubGateway::scripted(|call| {
            if call % 2 == 0 {
                Ok(accepted())
            } else {
                Ok(rejected())
            }
        });
        let engine = CampaignEngine::new(Arc::new(gateway));
        engine.start(config(), roster(4)).unwrap();
        engine.join().await;

        let stats = engine.stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.processed(), 4);

        // Front-inserted log: newest first, sequences 4..1.
        let attempts = engine.attempts();
        let sequences: Vec<usize> = attempts.iter().map(|a| a.sequence).collect();
        assert_eq!(sequences, vec![4, 3, 2, 1]);
        assert_eq!(attempts[3].outcome, AttemptOutcome::Sent);
        assert_eq!(attempts[2].outcome, AttemptOutcome::Failed);
    }

    #[tokio::test]
    async fn test_transport_error_is_recorded_not_propagated() {
        let gateway = StubGateway::scripted(|call| {
            if call == 1 {
                Err(anyhow!("connection reset"))
            } else {
                Ok(accepted())
            }
        });
        let engine = CampaignEngine::new(Arc::new(gateway));
        engine.start(config(), roster(3)).unwrap();
        engine.join().await;

        assert_eq!(engine.state(), CampaignState::Completed);
        let stats = engine.stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.failed, 1);

        let attempts = engine.attempts();
        let errored = attempts.iter().find(|a| a.sequence == 2).unwrap();
        assert_eq!(errored.outcome, AttemptOutcome::Errored);
    }

    #[tokio::test]
    async fn test_start_rejects_empty_roster() {
        let engine = CampaignEngine::new(Arc::new(StubGateway::accepting()));
        assert!(engine.start(config(), Vec::new()).is_err());
        assert_eq!(engine.state(), CampaignState::Idle);
    }

    #[tokio::test]
    async fn test_start_rejects_blank_template() {
        let engine = CampaignEngine::new(Arc::new(StubGateway::accepting()));
        let blank = CampaignConfig::text("   ", Duration::ZERO);
        assert!(engine.start(blank, roster(2)).is_err());
        assert_eq!(engine.state(), CampaignState::Idle);
    }

    #[tokio::test]
    async fn test_start_while_running_is_rejected() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = CampaignEngine::new(Arc::new(StubGateway::gated(gate.clone())));
        engine.start(config(), roster(2)).unwrap();

        // The loop is blocked inside the first send; a second start must
        // fail and leave the run alone.
        assert!(engine.start(config(), roster(2)).is_err());
        assert_eq!(engine.state(), CampaignState::Running);

        engine.stop().unwrap();
        gate.add_permits(4);
        engine.join().await;
    }

    #[tokio::test]
    async fn test_stop_halts_before_next_item() {
        let engine = CampaignEngine::new(Arc::new(StubGateway::accepting()));
        engine
            .start(
                CampaignConfig::text("Hi {name}", Duration::from_secs(60)),
                roster(6),
            )
            .unwrap();

        // Item 1 settles, then the loop sits in the inter-item delay.
        wait_until(&engine, |e| e.stats().processed() == 1).await;
        engine.stop().unwrap();
        assert_eq!(engine.state(), CampaignState::Stopped);

        // The delay races the cancellation token, so this returns promptly
        // instead of sleeping out the remaining minute.
        engine.join().await;

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, CampaignState::Stopped);
        assert_eq!(snapshot.stats.processed(), 1);
        assert!(snapshot.attempts.iter().all(|a| a.sequence <= 1));
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_send_finish() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = CampaignEngine::new(Arc::new(StubGateway::gated(gate.clone())));
        engine.start(config(), roster(3)).unwrap();

        // First item is in flight (Pending logged, gateway blocked).
        wait_until(&engine, |e| !e.attempts().is_empty()).await;
        engine.stop().unwrap();

        // Release the gate; the in-flight result must still be recorded.
        gate.add_permits(3);
        engine.join().await;

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, CampaignState::Stopped);
        assert_eq!(snapshot.stats.sent, 1);
        assert_eq!(snapshot.attempts.len(), 1);
        assert_eq!(snapshot.attempts[0].outcome, AttemptOutcome::Sent);
    }

    #[tokio::test]
    async fn test_pause_blocks_next_item_and_resume_continues() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = CampaignEngine::new(Arc::new(StubGateway::gated(gate.clone())));
        engine.start(config(), roster(4)).unwrap();

        // Item 1 is in flight (Pending logged, gateway blocked); pause now,
        // before the loop can reach item 2's pause check.
        wait_until(&engine, |e| !e.attempts().is_empty()).await;
        engine.pause().unwrap();
        assert_eq!(engine.state(), CampaignState::Paused);

        // Releasing permits settles the in-flight item, but the loop must
        // hold at the pause point and start nothing new.
        gate.add_permits(4);
        wait_until(&engine, |e| e.stats().processed() == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.stats().processed(), 1);
        assert_eq!(engine.attempts().len(), 1);
        assert_eq!(engine.stats().total, 4);

        engine.resume().unwrap();
        engine.join().await;

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, CampaignState::Completed);
        assert_eq!(snapshot.stats.sent, 4);
        // No drops, no duplicates: every sequence exactly once.
        let mut sequences: Vec<usize> = snapshot.attempts.iter().map(|a| a.sequence).collect();
        sequences.sort_unstable();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_repeated_pause_resume_cycles_keep_totals() {
        let engine = CampaignEngine::new(Arc::new(StubGateway::accepting()));
        engine
            .start(
                CampaignConfig::text("Hi {name}", Duration::from_millis(5)),
                roster(8),
            )
            .unwrap();

        for _ in 0..3 {
            // The run may complete while we are cycling; both operations are
            // allowed to fail once it has.
            if engine.pause().is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            if engine.resume().is_err() {
                break;
            }
        }
        engine.join().await;

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.state, CampaignState::Completed);
        assert_eq!(snapshot.stats.total, 8);
        assert_eq!(snapshot.stats.processed(), 8);
        assert_eq!(snapshot.attempts.len(), 8);
    }

    #[tokio::test]
    async fn test_restart_after_completion_resets_run() {
        let engine = CampaignEngine::new(Arc::new(StubGateway::accepting()));
        engine.start(config(), roster(3)).unwrap();
        engine.join().await;
        assert_eq!(engine.state(), CampaignState::Completed);

        engine.start(config(), roster(3)).unwrap();
        // Immediately after start the previous log is gone and stats are
        // reset to the new total.
        assert_eq!(engine.stats().total, 3);
        engine.join().await;

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.stats.sent, 3);
        assert_eq!(snapshot.attempts.len(), 3);
    }

    #[tokio::test]
    async fn test_restart_after_stop_is_allowed() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = CampaignEngine::new(Arc::new(StubGateway::gated(gate.clone())));
        engine.start(config(), roster(4)).unwrap();
        gate.add_permits(1);
        wait_until(&engine, |e| e.stats().processed() == 1).await;
        engine.stop().unwrap();
        gate.add_permits(8);
        engine.join().await;

        engine.start(config(), roster(2)).unwrap();
        engine.join().await;
        assert_eq!(engine.state(), CampaignState::Completed);
        assert_eq!(engine.stats().total, 2);
    }

    #[tokio::test]
    async fn test_pause_and_stop_from_terminal_states_fail() {
        let engine = CampaignEngine::new(Arc::new(StubGateway::accepting()));
        assert!(engine.pause().is_err());
        assert!(engine.resume().is_err());
        assert!(engine.stop().is_err());

        engine.start(config(), roster(1)).unwrap();
        engine.join().await;
        assert!(engine.pause().is_err());
        assert!(engine.stop().is_err());
    }

    #[tokio::test]
    async fn test_overlay_function_is_applied_per_recipient() {
        use crate::campaign::OverlayConfig;

        struct CapturingGateway {
            overlays: Mutex<Vec<Option<String>>>,
        }
        impl MessageGateway for CapturingGateway {
            fn send_message<'a>(
                &'a self,
                request: &'a GatewayRequest,
            ) -> Pin<Box<dyn Future<Output = Result<GatewayReply>> + Send + 'a>> {
                Box::pin(async move {
                    self.overlays
                        .lock()
                        .unwrap()
                        .push(request.overlay.as_ref().map(|o| o.text.clone()));
                    Ok(accepted())
                })
            }
        }

        let gateway = Arc::new(CapturingGateway {
            overlays: Mutex::new(Vec::new()),
        });
        let engine = CampaignEngine::new(gateway.clone());

        let mut config = config();
        config.overlay = Some(Arc::new(|r: &RecipientRecord| OverlayConfig {
            text: format!("For {}", r.display_name),
            x: 0,
            y: 0,
            font_size: 24,
            color: "#000000".to_string(),
        }));

        engine.start(config, roster(2)).unwrap();
        engine.join().await;

        let overlays = gateway.overlays.lock().unwrap();
        assert_eq!(
            *overlays,
            vec![
                Some("For Contact 0".to_string()),
                Some("For Contact 1".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_while_running() {
        let engine = CampaignEngine::new(Arc::new(StubGateway::accepting()));
        engine
            .start(
                CampaignConfig::text("Hi {name}", Duration::from_millis(2)),
                roster(5),
            )
            .unwrap();

        let mut last = 0;
        while !engine.state().is_terminal() {
            let progress = engine.progress();
            assert!(progress >= last);
            last = progress;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        engine.join().await;
        assert_eq!(engine.progress(), 100);
    }
}
