//! Playback Service (§4.3): sequences scenes through the Fade Engine and
//! publishes throttled status updates for each cue list's state machine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{ChangeBus, CueListPlaybackStatus, CueRef, Event};
use crate::config::Config;
use crate::error::PlaybackError;
use crate::fade::{FadeEngine, FadeOrigin};
use crate::model::{CueList, Easing};
use crate::repository::Repository;

struct CachedCueList {
    cue_list: CueList,
    cached_at: Instant,
}

struct Transition {
    started_at: Instant,
    duration: Duration,
}

struct CueListState {
    current_index: Option<usize>,
    is_playing: bool,
    transition: Option<Transition>,
    last_updated: SystemTime,
    warnings: Vec<String>,
    follow_token: Option<CancellationToken>,
}

impl CueListState {
    fn new() -> Self {
        CueListState {
            current_index: None,
            is_playing: false,
            transition: None,
            last_updated: SystemTime::now(),
            warnings: Vec::new(),
            follow_token: None,
        }
    }

    fn fade_progress(&self, now: Instant) -> f64 {
        match &self.transition {
            None => 1.0,
            Some(t) if t.duration.is_zero() => 1.0,
            Some(t) => {
                let elapsed = now.saturating_duration_since(t.started_at);
                (elapsed.as_secs_f64() / t.duration.as_secs_f64()).clamp(0.0, 1.0)
            }
        }
    }
}

struct ThrottleState {
    last_sent: Option<Instant>,
    scheduled: bool,
}

pub struct PlaybackService {
    states: Mutex<HashMap<String, CueListState>>,
    cache: Mutex<HashMap<String, CachedCueList>>,
    throttle: Mutex<HashMap<String, ThrottleState>>,
    repository: Arc<dyn Repository>,
    fade: Arc<FadeEngine>,
    bus: ChangeBus,
    config: Config,
    shutdown_token: CancellationToken,
}

impl PlaybackService {
    pub fn new(repository: Arc<dyn Repository>, fade: Arc<FadeEngine>, bus: ChangeBus, config: Config) -> Arc<Self> {
        Arc::new(PlaybackService {
            states: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            throttle: Mutex::new(HashMap::new()),
            repository,
            fade,
            bus,
            config,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Cancels every outstanding auto-follow and status-throttle task (§5
    /// shutdown ordering: "stop PB"). Does not touch already-published
    /// state; in-flight navigation calls still complete normally.
    pub fn stop(&self) {
        self.shutdown_token.cancel();
        let mut states = self.states.lock().unwrap();
        for state in states.values_mut() {
            if let Some(token) = state.follow_token.take() {
                token.cancel();
            }
        }
    }

    /// Returns the current status, creating a default (not-playing) state
    /// record on first query for a cue list, per §3's lazy-creation rule.
    pub async fn status(self: &Arc<Self>, cue_list_id: &str) -> Result<CueListPlaybackStatus, PlaybackError> {
        let cue_list = self.load_cue_list(cue_list_id).await?;
        let now = Instant::now();
        let mut states = self.states.lock().unwrap();
        let state = states.entry(cue_list_id.to_string()).or_insert_with(CueListState::new);
        Ok(build_status(cue_list_id, state, &cue_list, now))
    }

    pub async fn start(self: &Arc<Self>, cue_list_id: &str, from_index: usize) -> Result<(), PlaybackError> {
        let cue_list = self.load_cue_list(cue_list_id).await?;
        if cue_list.is_empty() {
            return Err(PlaybackError::EmptyCueList(cue_list_id.to_string()));
        }
        if from_index >= cue_list.len() {
            return Err(PlaybackError::InvalidIndex {
                cue_list_id: cue_list_id.to_string(),
                index: from_index,
                len: cue_list.len(),
            });
        }
        self.transition_to(cue_list_id, &cue_list, from_index, None).await
    }

    pub async fn next(self: &Arc<Self>, cue_list_id: &str, fade_in_override: Option<Duration>) -> Result<(), PlaybackError> {
        let cue_list = self.load_cue_list(cue_list_id).await?;
        if cue_list.is_empty() {
            return Err(PlaybackError::EmptyCueList(cue_list_id.to_string()));
        }
        let current = self.current_index(cue_list_id);
        let target = match current {
            None => 0,
            Some(i) if i + 1 < cue_list.len() => i + 1,
            Some(_) if cue_list.loop_ => 0,
            Some(_) => return Err(PlaybackError::AtBoundary(cue_list_id.to_string())),
        };
        self.transition_to(cue_list_id, &cue_list, target, fade_in_override).await
    }

    pub async fn previous(self: &Arc<Self>, cue_list_id: &str, fade_in_override: Option<Duration>) -> Result<(), PlaybackError> {
        let cue_list = self.load_cue_list(cue_list_id).await?;
        if cue_list.is_empty() {
            return Err(PlaybackError::EmptyCueList(cue_list_id.to_string()));
        }
        let current = self.current_index(cue_list_id);
        let target = match current {
            None | Some(0) if cue_list.loop_ => cue_list.len() - 1,
            None | Some(0) => return Err(PlaybackError::AtBoundary(cue_list_id.to_string())),
            Some(i) => i - 1,
        };
        self.transition_to(cue_list_id, &cue_list, target, fade_in_override).await
    }

    pub async fn go_to(self: &Arc<Self>, cue_list_id: &str, index: usize, fade_in_override: Option<Duration>) -> Result<(), PlaybackError> {
        let cue_list = self.load_cue_list(cue_list_id).await?;
        if index >= cue_list.len() {
            return Err(PlaybackError::InvalidIndex {
                cue_list_id: cue_list_id.to_string(),
                index,
                len: cue_list.len(),
            });
        }
        self.transition_to(cue_list_id, &cue_list, index, fade_in_override).await
    }

    pub async fn stop(self: &Arc<Self>, cue_list_id: &str) {
        self.cancel_follow(cue_list_id);
        {
            let mut states = self.states.lock().unwrap();
            let state = states.entry(cue_list_id.to_string()).or_insert_with(CueListState::new);
            state.is_playing = false;
            state.last_updated = SystemTime::now();
        }
        self.publish_status(cue_list_id).await;
    }

    /// Fades every intensity channel of every patched fixture to zero.
    /// Does not touch any cue list's `is_playing` flag (§4.3).
    pub async fn fade_to_black(self: &Arc<Self>, duration: Duration) {
        let fixtures = self.repository.list_fixtures().await;
        for fixture in &fixtures {
            for channel in fixture.intensity_channels() {
                self.fade
                    .start_fade(fixture.universe, channel, None, 0, duration, Easing::Linear, FadeOrigin::Manual);
            }
        }
    }

    pub fn invalidate_cache(&self, cue_list_id: &str) {
        self.cache.lock().unwrap().remove(cue_list_id);
    }

    /// Drops all in-memory state for a cue list (state machine + cache).
    pub fn cleanup(&self, cue_list_id: &str) {
        self.cancel_follow(cue_list_id);
        self.states.lock().unwrap().remove(cue_list_id);
        self.cache.lock().unwrap().remove(cue_list_id);
        self.throttle.lock().unwrap().remove(cue_list_id);
    }

    fn current_index(&self, cue_list_id: &str) -> Option<usize> {
        self.states.lock().unwrap().get(cue_list_id).and_then(|s| s.current_index)
    }

    async fn load_cue_list(&self, cue_list_id: &str) -> Result<CueList, PlaybackError> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(cue_list_id) {
                if entry.cached_at.elapsed() < self.config.cue_cache_ttl {
                    return Ok(entry.cue_list.clone());
                }
            }
        }
        let cue_list = self
            .repository
            .get_cue_list(cue_list_id)
            .await
            .ok_or_else(|| PlaybackError::NotFound(cue_list_id.to_string()))?;
        self.cache.lock().unwrap().insert(
            cue_list_id.to_string(),
            CachedCueList {
                cue_list: cue_list.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(cue_list)
    }

    async fn transition_to(
        self: &Arc<Self>,
        cue_list_id: &str,
        cue_list: &CueList,
        target: usize,
        fade_in_override: Option<Duration>,
    ) -> Result<(), PlaybackError> {
        self.cancel_follow(cue_list_id);

        let cue = &cue_list.cues[target];
        let easing = cue.easing.unwrap_or(Easing::Linear);
        let fade_in = fade_in_override.unwrap_or_else(|| Duration::from_millis(cue.fade_in_ms));

        let mut warnings = Vec::new();
        self.program_scene(cue_list, target, fade_in, easing, &mut warnings).await;

        {
            let mut states = self.states.lock().unwrap();
            let state = states.entry(cue_list_id.to_string()).or_insert_with(CueListState::new);
            state.current_index = Some(target);
            state.is_playing = true;
            state.transition = Some(Transition {
                started_at: Instant::now(),
                duration: fade_in,
            });
            state.last_updated = SystemTime::now();
            state.warnings = warnings;
        }

        self.schedule_follow(cue_list_id, cue_list, target);
        self.publish_status(cue_list_id).await;
        Ok(())
    }

    /// Programs fades for every fixture-channel in the target cue's scene.
    /// Scenes are additive overlays (§9 Open Questions): channels the scene
    /// does not mention are left untouched. A fixture deleted since cache
    /// population is skipped and recorded as a warning, not an abort (§4.3).
    async fn program_scene(&self, cue_list: &CueList, index: usize, fade_in: Duration, easing: Easing, warnings: &mut Vec<String>) {
        let cue = &cue_list.cues[index];
        let Some(scene) = self.repository.get_scene(&cue.scene_id).await else {
            warnings.push(format!("scene {} not found for cue {}", cue.scene_id, cue.id));
            return;
        };

        for fv in &scene.fixture_values {
            let Some(fixture) = self.repository.get_fixture(&fv.fixture_id).await else {
                warnings.push(format!("fixture {} no longer exists, skipped", fv.fixture_id));
                continue;
            };

            for (offset_idx, value) in fv.channel_values.iter().enumerate() {
                let Some(value) = value else { continue };
                let Some(channel_def) = fixture.channels.get(offset_idx) else {
                    continue;
                };
                let Some(addr) = fixture.address(channel_def.offset) else {
                    continue;
                };
                self.fade
                    .start_fade(fixture.universe, addr, None, *value, fade_in, easing, FadeOrigin::Cue);
            }
        }
    }

    fn cancel_follow(&self, cue_list_id: &str) {
        let mut states = self.states.lock().unwrap();
        if let Some(state) = states.get_mut(cue_list_id) {
            if let Some(token) = state.follow_token.take() {
                token.cancel();
            }
        }
    }

    /// Schedules an automatic `next()` per the target cue's `follow_ms`
    /// (SPEC_FULL §10), cancellable by any subsequent navigation or `stop`.
    fn schedule_follow(self: &Arc<Self>, cue_list_id: &str, cue_list: &CueList, index: usize) {
        let Some(follow_ms) = cue_list.cues[index].follow_ms else {
            return;
        };
        let fade_in_ms = cue_list.cues[index].fade_in_ms;
        let total_delay = Duration::from_millis(fade_in_ms) + Duration::from_millis(follow_ms);

        let token = CancellationToken::new();
        {
            let mut states = self.states.lock().unwrap();
            if let Some(state) = states.get_mut(cue_list_id) {
                state.follow_token = Some(token.clone());
            }
        }

        let this = Arc::clone(self);
        let cue_list_id = cue_list_id.to_string();
        let shutdown = self.shutdown_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(total_delay) => {
                    if let Err(e) = this.next(&cue_list_id, None).await {
                        debug!(cue_list_id = %cue_list_id, error = %e, "auto-follow next() did not apply");
                    }
                }
                _ = token.cancelled() => {}
                _ = shutdown.cancelled() => {}
            }
        });
    }

    /// Publishes a status update, coalesced under the configured throttle
    /// window; the final state of a burst is always delivered.
    async fn publish_status(self: &Arc<Self>, cue_list_id: &str) {
        enum Action {
            EmitNow,
            AlreadyScheduled,
            ScheduleIn(Duration),
        }

        let now = Instant::now();
        let action = {
            let mut throttle = self.throttle.lock().unwrap();
            let entry = throttle.entry(cue_list_id.to_string()).or_insert_with(|| ThrottleState {
                last_sent: None,
                scheduled: false,
            });
            if entry.scheduled {
                Action::AlreadyScheduled
            } else {
                let ready = entry
                    .last_sent
                    .map_or(true, |t| now.saturating_duration_since(t) >= self.config.playback_status_throttle);
                if ready {
                    entry.last_sent = Some(now);
                    Action::EmitNow
                } else {
                    entry.scheduled = true;
                    let wait = self
                        .config
                        .playback_status_throttle
                        .saturating_sub(now.saturating_duration_since(entry.last_sent.unwrap()));
                    Action::ScheduleIn(wait)
                }
            }
        };

        match action {
            Action::EmitNow => self.emit_status_now(cue_list_id).await,
            Action::AlreadyScheduled => {}
            Action::ScheduleIn(wait) => {
                let this = Arc::clone(self);
                let id = cue_list_id.to_string();
                let shutdown = self.shutdown_token.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.cancelled() => return,
                    }
                    {
                        let mut throttle = this.throttle.lock().unwrap();
                        if let Some(entry) = throttle.get_mut(&id) {
                            entry.scheduled = false;
                            entry.last_sent = Some(Instant::now());
                        }
                    }
                    this.emit_status_now(&id).await;
                });
            }
        }
    }

    async fn emit_status_now(self: &Arc<Self>, cue_list_id: &str) {
        let cue_list = match self.load_cue_list(cue_list_id).await {
            Ok(c) => c,
            Err(e) => {
                warn!(cue_list_id, error = %e, "could not reload cue list to publish status");
                return;
            }
        };
        let now = Instant::now();
        let status = {
            let states = self.states.lock().unwrap();
            let Some(state) = states.get(cue_list_id) else {
                return;
            };
            build_status(cue_list_id, state, &cue_list, now)
        };
        self.bus.publish(Event::CueListPlaybackUpdated(status)).await;
    }
}

fn build_status(cue_list_id: &str, state: &CueListState, cue_list: &CueList, now: Instant) -> CueListPlaybackStatus {
    let cue_ref = |i: usize| -> Option<CueRef> {
        cue_list.cues.get(i).map(|c| CueRef {
            id: c.id.clone(),
            cue_number: c.cue_number,
        })
    };

    CueListPlaybackStatus {
        cue_list_id: cue_list_id.to_string(),
        current_index: state.current_index,
        is_playing: state.is_playing,
        fade_progress: state.fade_progress(now),
        current_cue: state.current_index.and_then(cue_ref),
        next_cue: state.current_index.and_then(|i| cue_ref(i + 1)),
        previous_cue: state.current_index.and_then(|i| if i > 0 { cue_ref(i - 1) } else { None }),
        last_updated_unix_ms: unix_ms(state.last_updated),
        warnings: state.warnings.clone(),
    }
}

fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ChangeBus, TopicKind};
    use crate::model::{ChannelDefinition, ChannelRole, Cue, Fixture, FixtureValue, Scene};
    use crate::output::OutputEngine;
    use crate::repository::sqlite::SqliteRepository;

    fn fixture(id: &str, universe: u16, start: u16) -> Fixture {
        Fixture {
            id: id.into(),
            name: id.into(),
            universe,
            start_channel: start,
            channels: vec![
                ChannelDefinition { offset: 0, role: ChannelRole::Color(crate::model::ColorComponent::Red), name: "r".into() },
                ChannelDefinition { offset: 1, role: ChannelRole::Color(crate::model::ColorComponent::Green), name: "g".into() },
                ChannelDefinition { offset: 2, role: ChannelRole::Color(crate::model::ColorComponent::Blue), name: "b".into() },
            ],
        }
    }

    fn scene(id: &str, fixture_id: &str, values: [u8; 3]) -> Scene {
        Scene {
            id: id.into(),
            name: id.into(),
            fixture_values: vec![FixtureValue {
                fixture_id: fixture_id.into(),
                channel_values: values.iter().map(|v| Some(*v)).collect(),
            }],
        }
    }

    fn two_cue_list(loop_: bool) -> CueList {
        CueList {
            id: "cl1".into(),
            name: "Main".into(),
            loop_,
            cues: vec![
                Cue { id: "c1".into(), scene_id: "s1".into(), cue_number: 1.0, fade_in_ms: 1000, fade_out_ms: 0, follow_ms: None, easing: None },
                Cue { id: "c2".into(), scene_id: "s2".into(), cue_number: 2.0, fade_in_ms: 1000, fade_out_ms: 0, follow_ms: None, easing: None },
            ],
        }
    }

    async fn setup() -> (Arc<SqliteRepository>, Arc<OutputEngine>, Arc<FadeEngine>, Arc<PlaybackService>) {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        repo.insert_fixture(&fixture("f1", 1, 1)).unwrap();
        repo.insert_scene(&scene("s1", "f1", [0, 0, 255])).unwrap();
        repo.insert_scene(&scene("s2", "f1", [255, 0, 0])).unwrap();
        repo.insert_cue_list(&two_cue_list(false)).unwrap();

        let mut config = Config::default();
        config.universe_count = 1;
        config.artnet_broadcast = Some("127.0.0.1".parse().unwrap());
        config.playback_status_throttle = Duration::from_millis(100);
        let bus = ChangeBus::new();
        let output = OutputEngine::new(config.clone(), bus.clone()).await.unwrap();
        let fade = FadeEngine::new(output.clone());
        let pb = PlaybackService::new(repo.clone(), fade.clone(), bus, config);
        (repo, output, fade, pb)
    }

    #[tokio::test]
    async fn start_programs_fade_and_publishes() {
        let (_, output, fade, pb) = setup().await;
        let bus_sub = pb.bus.subscribe(TopicKind::CueListPlaybackUpdated, None).await;

        pb.start("cl1", 0).await.unwrap();
        assert!(fade.is_active(1, 3)); // blue channel fading in

        let ev = bus_sub.recv().await.unwrap();
        match ev {
            Event::CueListPlaybackUpdated(s) => {
                assert_eq!(s.current_index, Some(0));
                assert!(s.is_playing);
            }
            _ => panic!("wrong event"),
        }
        let _ = output.read_effective(1);
    }

    #[tokio::test]
    async fn empty_cue_list_rejected() {
        let (repo, _output, fade, _pb) = setup().await;
        repo.insert_cue_list(&CueList {
            id: "empty".into(),
            name: "Empty".into(),
            loop_: false,
            cues: vec![],
        })
        .unwrap();
        let bus = ChangeBus::new();
        let pb2 = PlaybackService::new(repo, fade, bus, Config::default());
        let err = pb2.start("empty", 0).await.unwrap_err();
        assert!(matches!(err, PlaybackError::EmptyCueList(_)));
    }

    #[tokio::test]
    async fn boundary_without_loop_fails_and_state_unchanged() {
        let (_, _output, _fade, pb) = setup().await;
        pb.go_to("cl1", 1, None).await.unwrap();
        let before = pb.status("cl1").await.unwrap();
        let err = pb.next("cl1", None).await.unwrap_err();
        assert!(matches!(err, PlaybackError::AtBoundary(_)));
        let after = pb.status("cl1").await.unwrap();
        assert_eq!(before.current_index, after.current_index);
    }

    #[tokio::test]
    async fn invalid_index_rejected() {
        let (_, _output, _fade, pb) = setup().await;
        let err = pb.go_to("cl1", 9, None).await.unwrap_err();
        assert!(matches!(err, PlaybackError::InvalidIndex { .. }));
    }

    #[tokio::test]
    async fn missing_cue_list_is_not_found() {
        let (_, _output, _fade, pb) = setup().await;
        let err = pb.start("nope", 0).await.unwrap_err();
        assert!(matches!(err, PlaybackError::NotFound(_)));
    }

    #[tokio::test]
    async fn stop_does_not_clear_dmx() {
        let (_, output, _fade, pb) = setup().await;
        pb.start("cl1", 0).await.unwrap();
        let before = output.read_effective(1).unwrap();
        pb.stop("cl1").await;
        let after = output.read_effective(1).unwrap();
        assert_eq!(before, after);
        let status = pb.status("cl1").await.unwrap();
        assert!(!status.is_playing);
    }
}
