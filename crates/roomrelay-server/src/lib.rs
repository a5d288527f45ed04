//! Roomrelay server library
//!
//! Exposes the relay components for the binary, for tests and for embedding.

pub mod api;
pub mod engine;
pub mod error;
pub mod relay;
pub mod state;
pub mod ws;

use std::sync::Arc;

use anyhow::Result;
use engine::LocalEngine;
use relay::Relay;

/// Build the application around the in-process engine. The engine's event
/// router is spawned on the current runtime.
pub async fn create_app(config: state::Config) -> Result<(axum::Router, Arc<Relay>)> {
    config.validate()?;
    let (engine, events) = LocalEngine::new(&config)?;
    let relay = Arc::new(Relay::new(Arc::new(engine)));
    relay.spawn_event_router(events);

    let app_state = state::AppState::new(config, relay.clone());
    let router = api::create_router(app_state);
    Ok((router, relay))
}
