//! Diagnostic commands served by `meshbus-node serve`.

use meshbus_core::{MeshbusError, MultiPeerProcessor, RequestContext, Service};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

pub const COMMANDS: &[&str] = &["ping", "echo", "list_peers", "describe"];

/// Late-bound handle to the processor serving the commands. The service is
/// built before the processor that owns it.
pub type ProcessorSlot = Arc<OnceLock<Weak<MultiPeerProcessor>>>;

#[derive(Debug, Serialize)]
pub struct Description {
    pub name: String,
    pub domain: Option<String>,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub listen_addresses: Vec<String>,
    pub peer_count: usize,
    pub commands: Vec<&'static str>,
    /// Name the caller announced in its Hello.
    pub caller: Option<String>,
}

fn processor(slot: &ProcessorSlot) -> meshbus_core::Result<Arc<MultiPeerProcessor>> {
    slot.get()
        .and_then(Weak::upgrade)
        .ok_or_else(|| MeshbusError::NoConnection("Node is shutting down".to_string()))
}

pub fn diagnostic_service(slot: ProcessorSlot) -> Service {
    let started = Instant::now();
    let peers_slot = Arc::clone(&slot);
    Service::builder()
        .route("ping", |_: Value, _ctx: RequestContext| async { Ok("pong") })
        .route("echo", |args: Value, _ctx: RequestContext| async move { Ok(args) })
        .route("list_peers", move |_: Value, _ctx: RequestContext| {
            let slot = Arc::clone(&peers_slot);
            async move { Ok::<_, MeshbusError>(processor(&slot)?.client_names()) }
        })
        .route("describe", move |_: Value, ctx: RequestContext| {
            let slot = Arc::clone(&slot);
            async move {
                let node = processor(&slot)?;
                Ok::<_, MeshbusError>(Description {
                    name: node.name().to_string(),
                    domain: node.domain().map(str::to_string),
                    version: env!("CARGO_PKG_VERSION"),
                    uptime_secs: started.elapsed().as_secs(),
                    listen_addresses: node.listen_addresses().to_vec(),
                    peer_count: node.client_count(),
                    commands: COMMANDS.to_vec(),
                    caller: ctx.peer_name().map(str::to_string),
                })
            }
        })
        .build()
}
