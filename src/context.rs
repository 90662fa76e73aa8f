//! Composition root (§9 Design Note "Shared module state → explicit
//! composition root"). `AppContext` owns one instance of each subsystem,
//! constructed once in `main`, and drives the shutdown sequence in reverse
//! construction order (§5 "Cancellation and shutdown").

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::bus::ChangeBus;
use crate::config::Config;
use crate::fade::FadeEngine;
use crate::output::OutputEngine;
use crate::playback::PlaybackService;
use crate::preview::PreviewSessionManager;
use crate::repository::Repository;

pub struct AppContext {
    pub config: Config,
    pub bus: ChangeBus,
    pub repository: Arc<dyn Repository>,
    pub output: Arc<OutputEngine>,
    pub fade: Arc<FadeEngine>,
    pub playback: Arc<PlaybackService>,
    pub preview: Arc<PreviewSessionManager>,
}

impl AppContext {
    pub async fn new(config: Config, repository: Arc<dyn Repository>) -> anyhow::Result<Arc<Self>> {
        let bus = ChangeBus::new();
        let output = OutputEngine::new(config.clone(), bus.clone()).await?;
        let fade = FadeEngine::new(output.clone());
        let playback = PlaybackService::new(repository.clone(), fade.clone(), bus.clone(), config.clone());
        let preview = PreviewSessionManager::new(output.clone(), repository.clone(), bus.clone(), config.clone());

        Ok(Arc::new(AppContext {
            config,
            bus,
            repository,
            output,
            fade,
            playback,
            preview,
        }))
    }

    /// Spawns the Output Engine's and Fade Engine's run loops. Intended to
    /// be called once from `main` right after construction.
    pub fn spawn_run_loops(&self) {
        tokio::spawn(self.output.clone().run());
        tokio::spawn(self.fade.clone().run());
    }

    /// Runs the global shutdown sequence (§5): stop accepting API work is the
    /// caller's responsibility (it stops routing before calling this); from
    /// here: stop PB (cancel outstanding auto-follow/throttle tasks) → stop
    /// FE → emit all-zero DMX → stop OE → drain the Change Bus and close its
    /// subscribers. Each step gets `operation_timeout`; total budget is
    /// `shutdown_timeout`, logged (not enforced) if exceeded.
    pub async fn shutdown(&self) {
        let budget = self.config.shutdown_timeout;
        let step = self.config.operation_timeout;
        let started = std::time::Instant::now();

        with_timeout(step, "playback shutdown", async { self.playback.stop() }).await;
        with_timeout(step, "fade shutdown", async { self.fade.stop() }).await;
        with_timeout(step, "output shutdown (final zero frame)", self.output.shutdown()).await;
        with_timeout(step, "change bus drain", self.bus.close_all()).await;

        let elapsed = started.elapsed();
        if elapsed > budget {
            warn!(elapsed_ms = elapsed.as_millis() as u64, "shutdown exceeded its budget");
        }
    }
}

async fn with_timeout<F: std::future::Future<Output = ()>>(duration: Duration, label: &str, fut: F) {
    if tokio::time::timeout(duration, fut).await.is_err() {
        warn!(step = label, "shutdown step did not finish within its timeout, continuing");
    }
}
