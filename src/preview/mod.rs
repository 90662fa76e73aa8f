//! Preview Session Manager (§4.4): temporary per-project override sessions
//! used for live busking, expiring on inactivity.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{ChangeBus, Event, PreviewSessionStatus};
use crate::config::Config;
use crate::model::{Channel, UniverseId};
use crate::output::OutputEngine;
use crate::repository::Repository;

struct PreviewSession {
    project_id: String,
    #[allow(dead_code)]
    user_id: Option<String>,
    is_active: bool,
    created_at: SystemTime,
    touched: HashSet<(UniverseId, Channel)>,
    idle_token: CancellationToken,
}

pub struct PreviewSessionManager {
    sessions: Mutex<HashMap<String, PreviewSession>>,
    by_project: Mutex<HashMap<String, String>>,
    output: Arc<OutputEngine>,
    repository: Arc<dyn Repository>,
    bus: ChangeBus,
    config: Config,
}

impl PreviewSessionManager {
    pub fn new(output: Arc<OutputEngine>, repository: Arc<dyn Repository>, bus: ChangeBus, config: Config) -> Arc<Self> {
        Arc::new(PreviewSessionManager {
            sessions: Mutex::new(HashMap::new()),
            by_project: Mutex::new(HashMap::new()),
            output,
            repository,
            bus,
            config,
        })
    }

    /// Starts a new session for `project_id`, auto-cancelling any existing
    /// one first (§4.4 at-most-one-active-per-project invariant).
    pub async fn start(self: &Arc<Self>, project_id: &str, user_id: Option<String>) -> String {
        let existing = self.by_project.lock().unwrap().get(project_id).cloned();
        if let Some(existing_id) = existing {
            self.cancel(&existing_id).await;
        }

        let id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        let session = PreviewSession {
            project_id: project_id.to_string(),
            user_id,
            is_active: true,
            created_at: SystemTime::now(),
            touched: HashSet::new(),
            idle_token: token.clone(),
        };

        {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.insert(id.clone(), session);
        }
        self.by_project.lock().unwrap().insert(project_id.to_string(), id.clone());

        self.arm_timeout(id.clone(), token);
        self.publish_status(&id).await;
        id
    }

    /// Returns `false` for an unknown/invalid session, an inactive session,
    /// an unknown fixture, or a channel offset outside `[1, 512]`.
    pub async fn update_channel(self: &Arc<Self>, session_id: &str, fixture_id: &str, channel_offset: u16, value: i32) -> bool {
        if !self.is_active(session_id) {
            return false;
        }
        let Some(fixture) = self.repository.get_fixture(fixture_id).await else {
            return false;
        };
        let Some(addr) = fixture.address(channel_offset) else {
            return false;
        };

        self.output.set_override(fixture.universe, addr, value);

        {
            let mut sessions = self.sessions.lock().unwrap();
            let Some(session) = sessions.get_mut(session_id) else {
                return false;
            };
            session.touched.insert((fixture.universe, addr));
        }

        self.reset_timeout(session_id);
        true
    }

    /// Applies every non-null channel value in the scene through
    /// `update_channel`, then publishes one `DMX_OUTPUT_CHANGED` per universe
    /// actually touched (§4.4), rather than waiting for the Output Engine's
    /// next high-rate tick to notice the overrides.
    pub async fn initialize_with_scene(self: &Arc<Self>, session_id: &str, scene_id: &str) -> bool {
        if !self.is_active(session_id) {
            return false;
        }
        let Some(scene) = self.repository.get_scene(scene_id).await else {
            return false;
        };

        let mut touched_universes = HashSet::new();
        for fv in &scene.fixture_values {
            let Some(fixture) = self.repository.get_fixture(&fv.fixture_id).await else {
                continue;
            };
            for (offset_idx, value) in fv.channel_values.iter().enumerate() {
                let Some(value) = value else { continue };
                let Some(channel_def) = fixture.channels.get(offset_idx) else {
                    continue;
                };
                if self.update_channel(session_id, &fixture.id, channel_def.offset, *value as i32).await {
                    touched_universes.insert(fixture.universe);
                }
            }
        }

        for universe in touched_universes {
            if let Ok(channels) = self.output.read_effective(universe) {
                self.bus
                    .publish(Event::DmxOutputChanged {
                        universe,
                        channels: Box::new(channels),
                    })
                    .await;
            }
        }
        true
    }

    /// Retires the session and releases its overrides. The core does not
    /// persist the committed values; the caller is expected to have already
    /// written them to the base layer through the underlying scene (§4.4).
    pub async fn commit(self: &Arc<Self>, session_id: &str) {
        self.retire(session_id).await;
    }

    /// Releases the session's overrides and publishes
    /// `PREVIEW_SESSION_UPDATED(is_active=false)`, strictly after the
    /// overrides have been cleared (§5 ordering guarantees).
    pub async fn cancel(self: &Arc<Self>, session_id: &str) {
        self.retire(session_id).await;
        self.publish_status(session_id).await;
    }

    pub async fn get(self: &Arc<Self>, session_id: &str) -> Option<PreviewSessionStatus> {
        let (project_id, is_active, created_at, universes) = {
            let sessions = self.sessions.lock().unwrap();
            let session = sessions.get(session_id)?;
            let universes: HashSet<UniverseId> = session.touched.iter().map(|(u, _)| *u).collect();
            (session.project_id.clone(), session.is_active, session.created_at, universes)
        };

        let dmx_output = universes
            .into_iter()
            .filter_map(|u| self.output.read_effective(u).ok().map(|eff| (u, eff.to_vec())))
            .collect();

        Some(PreviewSessionStatus {
            id: session_id.to_string(),
            project_id,
            is_active,
            created_at_unix_ms: unix_ms(created_at),
            dmx_output,
        })
    }

    fn is_active(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|s| s.is_active)
            .unwrap_or(false)
    }

    async fn retire(&self, session_id: &str) {
        let removed = {
            let mut sessions = self.sessions.lock().unwrap();
            let Some(session) = sessions.get_mut(session_id) else {
                return;
            };
            if !session.is_active {
                return;
            }
            session.is_active = false;
            session.idle_token.cancel();
            let touched: Vec<_> = session.touched.drain().collect();
            (session.project_id.clone(), touched)
        };
        let (project_id, touched) = removed;

        for (universe, channel) in touched {
            self.output.clear_override(universe, channel);
        }

        let mut by_project = self.by_project.lock().unwrap();
        if by_project.get(&project_id).map(|id| id == session_id).unwrap_or(false) {
            by_project.remove(&project_id);
        }
    }

    async fn publish_status(self: &Arc<Self>, session_id: &str) {
        if let Some(status) = self.get(session_id).await {
            self.bus.publish(Event::PreviewSessionUpdated(status)).await;
        }
    }

    fn reset_timeout(self: &Arc<Self>, session_id: &str) {
        let new_token = CancellationToken::new();
        {
            let mut sessions = self.sessions.lock().unwrap();
            let Some(session) = sessions.get_mut(session_id) else {
                return;
            };
            session.idle_token.cancel();
            session.idle_token = new_token.clone();
        }
        self.arm_timeout(session_id.to_string(), new_token);
    }

    fn arm_timeout(self: &Arc<Self>, session_id: String, token: CancellationToken) {
        let this = Arc::clone(self);
        let timeout = self.config.preview_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    this.cancel(&session_id).await;
                }
                _ = token.cancelled() => {}
            }
        });
    }
}

fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::TopicKind;
    use crate::model::{ChannelDefinition, ChannelRole, Fixture};
    use crate::repository::sqlite::SqliteRepository;
    use std::time::Duration;

    fn fixture() -> Fixture {
        Fixture {
            id: "f1".into(),
            name: "Par".into(),
            universe: 1,
            start_channel: 1,
            channels: vec![ChannelDefinition {
                offset: 0,
                role: ChannelRole::Intensity,
                name: "intensity".into(),
            }],
        }
    }

    async fn setup(preview_timeout: Duration) -> (Arc<SqliteRepository>, Arc<OutputEngine>, Arc<PreviewSessionManager>) {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        repo.insert_fixture(&fixture()).unwrap();

        let mut config = Config::default();
        config.universe_count = 1;
        config.artnet_broadcast = Some("127.0.0.1".parse().unwrap());
        config.preview_timeout = preview_timeout;
        let bus = ChangeBus::new();
        let output = OutputEngine::new(config.clone(), bus.clone()).await.unwrap();
        let mgr = PreviewSessionManager::new(output.clone(), repo.clone(), bus, config);
        (repo, output, mgr)
    }

    #[tokio::test]
    async fn starting_twice_for_same_project_cancels_earlier() {
        let (_, output, mgr) = setup(Duration::from_secs(1800)).await;
        let first = mgr.start("proj", None).await;
        mgr.update_channel(&first, "f1", 0, 200).await;
        assert_eq!(output.read_effective(1).unwrap()[0], 200);

        let second = mgr.start("proj", None).await;
        assert_ne!(first, second);

        let first_status = mgr.get(&first).await.unwrap();
        assert!(!first_status.is_active);
        assert_eq!(output.read_effective(1).unwrap()[0], 0);
    }

    #[tokio::test]
    async fn update_channel_applies_override_and_unknown_fixture_fails() {
        let (_, output, mgr) = setup(Duration::from_secs(1800)).await;
        let session = mgr.start("proj", None).await;
        assert!(mgr.update_channel(&session, "f1", 0, 300).await);
        assert_eq!(output.read_effective(1).unwrap()[0], 255);
        assert!(!mgr.update_channel(&session, "missing-fixture", 0, 10).await);
    }

    #[tokio::test]
    async fn initialize_with_scene_publishes_one_change_per_touched_universe() {
        use crate::model::{FixtureValue, Scene};

        let (repo, output, mgr) = setup(Duration::from_secs(1800)).await;
        repo.insert_scene(&Scene {
            id: "sc1".into(),
            name: "Scene".into(),
            fixture_values: vec![FixtureValue {
                fixture_id: "f1".into(),
                channel_values: vec![Some(180)],
            }],
        })
        .unwrap();

        let sub = mgr.bus.subscribe(TopicKind::DmxOutputChanged, None).await;
        let session = mgr.start("proj", None).await;
        assert!(mgr.initialize_with_scene(&session, "sc1").await);

        assert_eq!(output.read_effective(1).unwrap()[0], 180);
        match sub.recv().await.unwrap() {
            Event::DmxOutputChanged { universe, channels } => {
                assert_eq!(universe, 1);
                assert_eq!(channels[0], 180);
            }
            _ => panic!("wrong event"),
        }
    }

    #[tokio::test]
    async fn inactive_session_rejects_update() {
        let (_, _output, mgr) = setup(Duration::from_secs(1800)).await;
        let session = mgr.start("proj", None).await;
        mgr.cancel(&session).await;
        assert!(!mgr.update_channel(&session, "f1", 0, 50).await);
    }

    #[tokio::test]
    async fn cancel_clears_overrides_and_publishes_inactive() {
        let (_, output, mgr) = setup(Duration::from_secs(1800)).await;
        let sub = mgr.bus.subscribe(TopicKind::PreviewSessionUpdated, None).await;
        let session = mgr.start("proj", None).await;
        let _ = sub.recv().await; // the start() publication

        mgr.update_channel(&session, "f1", 0, 200).await;
        mgr.cancel(&session).await;
        assert_eq!(output.read_effective(1).unwrap()[0], 0);

        let ev = sub.recv().await.unwrap();
        match ev {
            Event::PreviewSessionUpdated(s) => assert!(!s.is_active),
            _ => panic!("wrong event"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_auto_cancels_session() {
        let (_, output, mgr) = setup(Duration::from_millis(50)).await;
        let session = mgr.start("proj", None).await;
        mgr.update_channel(&session, "f1", 0, 200).await;

        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;

        let status = mgr.get(&session).await.unwrap();
        assert!(!status.is_active);
        assert_eq!(output.read_effective(1).unwrap()[0], 0);
    }
}
