use anyhow::Result;
use roomrelay_client::SessionController;
use roomrelay_client::media::{LoggingSink, SyntheticSource};
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Deserialize)]
struct PeerConfig {
    #[serde(default = "default_relay_url")]
    relay_url: String,
    room_id: String,
    peer_name: String,
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:8080".to_string()
}

impl PeerConfig {
    /// `RELAY_URL`, `ROOM_ID` and `PEER_NAME` from the environment
    fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomrelay_client=debug,roomrelay_peer=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PeerConfig::load()?;
    tracing::info!(
        "Starting peer {} for room {} at {}",
        config.peer_name,
        config.room_id,
        config.relay_url
    );

    let mut session = SessionController::connect(
        &config.relay_url,
        &config.room_id,
        &config.peer_name,
        SyntheticSource::new(ssrc_base()),
        LoggingSink::default(),
    )
    .await?;
    session.start().await?;

    let interrupted = tokio::select! {
        _ = session.run() => false,
        _ = tokio::signal::ctrl_c() => true,
    };

    if interrupted {
        tracing::info!("Leaving room");
        if let Err(e) = session.leave().await {
            tracing::warn!("Leave failed: {}", e);
        }
    }

    Ok(())
}

/// SSRC base derived from the process id, distinct enough for a demo peer
fn ssrc_base() -> u32 {
    std::process::id().wrapping_mul(2654435761) & 0x7fff_fffe
}
