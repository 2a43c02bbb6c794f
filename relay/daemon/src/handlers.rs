//! Message patterns served by the daemon
//!
//! - `ping`: answers `"pong"`
//! - `echo`: answers with the request payload
//! - `sum`: adds `{"values": [..]}` and answers `{"total": n}`
//! - `stats`: uptime and peer departures seen by [`Presence`]

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use relay_core::{HandlerError, HandlerRegistry, MessageHandler, Payload, RegistryError};

use crate::components::Presence;

#[derive(Debug, Deserialize)]
struct SumRequest {
    values: Vec<i64>,
}

#[derive(Debug, Serialize)]
struct SumResponse {
    total: i64,
}

async fn sum(req: SumRequest) -> Result<SumResponse, HandlerError> {
    let total = req
        .values
        .iter()
        .try_fold(0i64, |acc, v| acc.checked_add(*v))
        .ok_or_else(|| HandlerError::new("sum overflows a 64-bit integer"))?;
    Ok(SumResponse { total })
}

/// Reports daemon uptime and presence counters
struct Stats {
    started: Instant,
    presence: Arc<Presence>,
}

#[async_trait]
impl MessageHandler for Stats {
    async fn handle(&self, _data: Payload) -> Result<Payload, HandlerError> {
        let uptime_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(json!({
            "id": self.presence.id(),
            "uptime_ms": uptime_ms,
            "departures": self.presence.departures(),
        }))
    }
}

/// Bind every daemon pattern
pub fn register(
    handlers: &mut HandlerRegistry,
    presence: Arc<Presence>,
) -> Result<(), RegistryError> {
    handlers.subscribe("ping", |_| async { Ok(json!("pong")) })?;
    handlers.subscribe("echo", |data| async move { Ok(data) })?;
    handlers.subscribe_typed("sum", sum)?;
    handlers.register(
        "stats",
        Arc::new(Stats {
            started: Instant::now(),
            presence,
        }),
    )?;
    Ok(())
}
