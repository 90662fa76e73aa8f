use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use lacylights_core::config::Config;
use lacylights_core::context::AppContext;
use lacylights_core::model::{ChannelDefinition, ChannelRole, ColorComponent, Cue, CueList, Fixture, FixtureValue, Scene};
use lacylights_core::repository::sqlite::SqliteRepository;
use lacylights_core::{api, repository::Repository};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = Config::from_env()?;
    let repository: Arc<dyn Repository> = Arc::new(seed_demo_repository()?);

    let ctx = AppContext::new(config.clone(), repository).await?;
    ctx.spawn_run_loops();

    let app = api::build_router(ctx.clone());

    let addr: SocketAddr = config.bind_addr.parse()?;
    info!("lacylights-server starting on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    ctx.shutdown().await;
    Ok(())
}

/// Seeds the in-memory demo repository with one fixture, two scenes and a
/// two-cue list so `/api/v1/status` and `/ws/events` have something to show
/// out of the box. A real deployment swaps in a `Repository` backed by the
/// external relational store instead (§6).
fn seed_demo_repository() -> anyhow::Result<SqliteRepository> {
    let repo = SqliteRepository::open_in_memory()?;

    let fixture = Fixture {
        id: "demo-par-1".into(),
        name: "Demo Par 1".into(),
        universe: 1,
        start_channel: 1,
        channels: vec![
            ChannelDefinition {
                offset: 0,
                role: ChannelRole::Color(ColorComponent::Red),
                name: "red".into(),
            },
            ChannelDefinition {
                offset: 1,
                role: ChannelRole::Color(ColorComponent::Green),
                name: "green".into(),
            },
            ChannelDefinition {
                offset: 2,
                role: ChannelRole::Color(ColorComponent::Blue),
                name: "blue".into(),
            },
            ChannelDefinition {
                offset: 3,
                role: ChannelRole::Intensity,
                name: "intensity".into(),
            },
        ],
    };
    repo.insert_fixture(&fixture)?;

    repo.insert_scene(&Scene {
        id: "demo-scene-blue".into(),
        name: "Blue wash".into(),
        fixture_values: vec![FixtureValue {
            fixture_id: fixture.id.clone(),
            channel_values: vec![Some(0), Some(0), Some(255), Some(255)],
        }],
    })?;
    repo.insert_scene(&Scene {
        id: "demo-scene-red".into(),
        name: "Red wash".into(),
        fixture_values: vec![FixtureValue {
            fixture_id: fixture.id.clone(),
            channel_values: vec![Some(255), Some(0), Some(0), Some(255)],
        }],
    })?;

    repo.insert_cue_list(&CueList {
        id: "demo-cue-list".into(),
        name: "Demo".into(),
        loop_: true,
        cues: vec![
            Cue {
                id: "demo-cue-1".into(),
                scene_id: "demo-scene-blue".into(),
                cue_number: 1.0,
                fade_in_ms: 2000,
                fade_out_ms: 0,
                follow_ms: None,
                easing: None,
            },
            Cue {
                id: "demo-cue-2".into(),
                scene_id: "demo-scene-red".into(),
                cue_number: 2.0,
                fade_in_ms: 2000,
                fade_out_ms: 0,
                follow_ms: None,
                easing: None,
            },
        ],
    })?;

    Ok(repo)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("shutdown signal received");
}
