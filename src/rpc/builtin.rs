//! Built-in `rpc.*` methods installed on every server.

use std::sync::{Arc, OnceLock};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::coerce::ParamType;
use super::registry::{MethodInfo, MethodRegistry, ParamSpec, RegistryError};

pub const PING: &str = "rpc.ping";
pub const METHODS: &str = "rpc.methods";
pub const DESCRIBE: &str = "rpc.describe";

#[derive(Debug, Clone, Serialize)]
pub struct PingReply {
    pub status: &'static str,
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
}

/// Install the built-in methods.
///
/// The method listing is captured once all built-ins are in place, so this
/// must run after every user method has been registered.
pub fn install(registry: &mut MethodRegistry) -> Result<(), RegistryError> {
    let listing: Arc<OnceLock<Vec<MethodInfo>>> = Arc::default();
    let started_at = Utc::now();

    registry.register_builtin(PING, "Check that the bridge is alive", vec![], move |_| {
        Ok(PingReply {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            started_at,
        })
    })?;

    let all = listing.clone();
    registry.register_builtin(METHODS, "List every registered method", vec![], move |_| {
        Ok(all.get().cloned().unwrap_or_default())
    })?;

    let all = listing.clone();
    registry.register_builtin(
        DESCRIBE,
        "Describe one method",
        vec![ParamSpec::required("method", ParamType::string())],
        move |args| {
            let name = args.get::<String>("method")?;
            all.get()
                .and_then(|methods| methods.iter().find(|info| info.name == name))
                .cloned()
                .ok_or_else(|| anyhow!("Unknown method: {}", name))
        },
    )?;

    // Only ever set here, right after the registry reached its final shape.
    let _ = listing.set(registry.describe());
    Ok(())
}
