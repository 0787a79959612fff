use crate::context::AgentContext;
use crate::gate::Outcome;
use crate::hub::PushOutcome;
use crate::state::RunStatistics;
use crate::telemetry;
use protocol::command::Command;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const TICK: Duration = Duration::from_millis(500);
pub const RECONNECT_PROBES: u32 = 3;
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy)]
struct Cadence {
    interval: Duration,
    last: Option<Instant>,
}

impl Cadence {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    fn due(&self, now: Instant) -> bool {
        match self.last {
            Some(last) => now.duration_since(last) >= self.interval,
            None => true,
        }
    }

    fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

/// Drives the agent: telemetry push, command pull and health check, each on
/// its own cadence, strictly one after another.
///
/// The shutdown path (final save and summary) runs exactly once, either at the
/// end of [`SyncScheduler::run`] or when the scheduler is dropped.
pub struct SyncScheduler {
    ctx: AgentContext,
    started: Instant,
    push: Cadence,
    pull: Cadence,
    health: Cadence,
    maintenance: Cadence,
    finished: bool,
}

impl SyncScheduler {
    pub fn new(ctx: AgentContext) -> Self {
        let intervals = &ctx.config.intervals;
        let push = Cadence::new(intervals.status_update());
        let pull = Cadence::new(intervals.command_check());
        let health = Cadence::new(intervals.health_check());
        Self {
            ctx,
            started: Instant::now(),
            push,
            pull,
            health,
            maintenance: Cadence::new(MAINTENANCE_INTERVAL),
            finished: false,
        }
    }

    pub fn stats(&self) -> &RunStatistics {
        self.ctx.state.stats()
    }

    /// Controller reachability is required; the server only gets a warning
    /// since the agent keeps retrying it anyway.
    pub async fn startup_checks(&mut self) -> anyhow::Result<()> {
        let config = &self.ctx.config;
        tracing::info!(url = %config.moonraker_url, "checking controller");
        if !self.ctx.controller.check_connection().await {
            anyhow::bail!("controller unreachable at {}", config.moonraker_url);
        }
        tracing::info!(url = %config.server_url, "checking server");
        if !self.ctx.hub.probe().await {
            tracing::warn!(url = %config.server_url, "server not answering, will keep trying");
        }
        let info = self.ctx.controller.printer_info().await;
        if let Some(state) = info.get("state").and_then(|value| value.as_str()) {
            tracing::info!(state, "printer state");
        }
        Ok(())
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> RunStatistics {
        let config = &self.ctx.config;
        tracing::info!(
            printer = %config.printer_name,
            server = %config.server_url,
            controller = %config.moonraker_url,
            version = telemetry::CLIENT_VERSION,
            "agent running"
        );
        while !shutdown.is_cancelled() {
            self.tick().await;
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(TICK) => {}
            }
        }
        self.finish();
        self.ctx.state.stats().clone()
    }

    async fn tick(&mut self) {
        let now = Instant::now();
        if self.push.due(now) {
            self.push_status().await;
            self.push.mark(now);
        }
        if self.pull.due(now) {
            self.pull_commands().await;
            self.pull.mark(now);
        }
        if self.health.due(now) {
            self.health_check().await;
            self.health.mark(now);
        }
    }

    pub(crate) async fn push_status(&mut self) {
        let image = self.capture_image().await;
        let snapshot = telemetry::collect(
            self.ctx.controller.as_ref(),
            &self.ctx.config,
            self.started.elapsed(),
            image,
        )
        .await;
        if !self.replay_pending().await {
            self.ctx.state.stats_mut().updates_failed += 1;
            tracing::warn!("buffered updates still queued, buffering status update");
            self.ctx.state.enqueue_pending(snapshot);
            return;
        }
        match self.ctx.hub.push(&snapshot).await {
            PushOutcome::Delivered => {
                self.ctx.state.stats_mut().updates_sent += 1;
                self.ctx.state.mark_update_delivered();
                tracing::debug!(status = snapshot.status.as_str(), "status pushed");
            }
            PushOutcome::Rejected(message) => {
                self.ctx.state.stats_mut().updates_failed += 1;
                tracing::warn!(reason = ?message, "server rejected status update");
            }
            PushOutcome::Unconfirmed(reason) => {
                self.ctx.state.stats_mut().updates_failed += 1;
                tracing::warn!(reason = %reason, "status update not delivered, buffering");
                self.ctx.state.enqueue_pending(snapshot);
            }
        }
    }

    /// Sends buffered updates oldest first, ahead of the live snapshot.
    /// Returns false when the queue could not be cleared.
    ///
    /// An unreachable server leaves the queue untouched. Once the server has
    /// answered for the oldest entry the queue is drained, and entries after
    /// the first failed resend are lost.
    async fn replay_pending(&mut self) -> bool {
        let Some(oldest) = self.ctx.state.pending().next().cloned() else {
            return true;
        };
        let first = self.ctx.hub.push(&oldest.data).await;
        if let PushOutcome::Unconfirmed(reason) = &first {
            tracing::warn!(
                pending = self.ctx.state.pending_len(),
                reason = %reason,
                "server unreachable, keeping buffered updates"
            );
            return false;
        }
        let drained = self.ctx.state.drain_pending();
        let total = drained.len();
        let mut replayed = 0usize;
        if first == PushOutcome::Delivered {
            replayed += 1;
            for entry in drained.iter().skip(1) {
                match self.ctx.hub.push(&entry.data).await {
                    PushOutcome::Delivered => replayed += 1,
                    outcome => {
                        tracing::warn!(
                            queued_at = %entry.timestamp,
                            outcome = ?outcome,
                            "replay stopped"
                        );
                        break;
                    }
                }
            }
        } else {
            tracing::warn!(
                queued_at = %oldest.timestamp,
                outcome = ?first,
                "server refused oldest buffered update"
            );
        }
        let dropped = total - replayed;
        let stats = self.ctx.state.stats_mut();
        stats.pending_replayed += replayed as u64;
        stats.pending_dropped += dropped as u64;
        if dropped > 0 {
            tracing::warn!(replayed, dropped, "buffered updates lost during replay");
            false
        } else {
            tracing::info!(replayed, "buffered updates delivered");
            true
        }
    }

    async fn capture_image(&mut self) -> Option<String> {
        if !self.ctx.camera.should_capture(0) {
            return None;
        }
        let frame = self.ctx.camera.capture_snapshot(0).await?;
        self.ctx.hub.upload_image(frame).await
    }

    pub(crate) async fn pull_commands(&mut self) {
        let commands = match self.ctx.hub.fetch_commands().await {
            Ok(commands) => commands,
            Err(err) => {
                tracing::warn!(error = %format_args!("{err:#}"), "command check failed");
                return;
            }
        };
        for raw in commands {
            self.ctx.state.stats_mut().commands_received += 1;
            let command = Command::parse(raw);
            let outcome = self
                .ctx
                .gate
                .process(command, self.ctx.controller.as_ref(), self.ctx.files.as_ref())
                .await;
            let stats = self.ctx.state.stats_mut();
            if let Outcome::Executed { success, downloaded } = outcome {
                if success {
                    stats.commands_executed += 1;
                }
                if downloaded {
                    stats.files_downloaded += 1;
                }
            }
        }
    }

    pub(crate) async fn health_check(&mut self) {
        if self.ctx.controller.check_connection().await {
            tracing::info!("controller ok");
        } else {
            tracing::warn!("controller disconnected, reconnecting");
            self.ctx.state.stats_mut().reconnections += 1;
            let mut reconnected = false;
            for probe in 1..=RECONNECT_PROBES {
                tokio::time::sleep(RECONNECT_DELAY).await;
                if self.ctx.controller.check_connection().await {
                    tracing::info!(probe, "controller reconnected");
                    reconnected = true;
                    break;
                }
            }
            if !reconnected {
                tracing::error!(probes = RECONNECT_PROBES, "controller still unreachable");
            }
        }

        let now = Instant::now();
        if self.maintenance.due(now) {
            self.ctx.files.cleanup_old_files();
            self.maintenance.mark(now);
        }

        self.log_stats("health check");
        self.ctx.state.save();
    }

    fn log_stats(&self, message: &str) {
        let stats = self.ctx.state.stats();
        tracing::info!(
            uptime = %telemetry::format_uptime(self.started.elapsed()),
            updates_sent = stats.updates_sent,
            updates_failed = stats.updates_failed,
            commands_received = stats.commands_received,
            commands_executed = stats.commands_executed,
            reconnections = stats.reconnections,
            pending = self.ctx.state.pending_len(),
            "{message}"
        );
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.ctx.state.save();
        self.log_stats("agent stopped");
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.finish();
    }
}
