use crate::protocol::{Channel, Message, MessageType};
use crate::registry::RegistryManifest;
use crate::snapshot::WorldSnapshot;
use serde_json::json;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);
static TRACE_MODE: AtomicBool = AtomicBool::new(false);

/// Initialize debug mode from environment variables
///
/// - `NETSYNC_DEBUG=1`: dump registry manifests and snapshots as JSON
/// - `NETSYNC_TRACE=1`: log a one-line summary of every message sent or received
pub fn init_debug_mode() {
    let debug = env::var("NETSYNC_DEBUG").is_ok();
    let trace = env::var("NETSYNC_TRACE").is_ok();

    set_debug_mode(debug, trace);

    if debug {
        log::info!("netsync debug mode enabled");
    }
    if trace {
        log::info!("netsync trace mode enabled");
    }
}

pub fn set_debug_mode(debug: bool, trace: bool) {
    DEBUG_MODE.store(debug, Ordering::Relaxed);
    TRACE_MODE.store(trace, Ordering::Relaxed);
}

pub fn is_debug_enabled() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

pub fn is_trace_enabled() -> bool {
    TRACE_MODE.load(Ordering::Relaxed)
}

pub fn manifest_json(manifest: &RegistryManifest) -> serde_json::Result<String> {
    serde_json::to_string_pretty(manifest)
}

/// Log a registry manifest as JSON if debug mode is enabled
pub fn log_manifest(label: &str, manifest: &RegistryManifest) {
    if !is_debug_enabled() {
        return;
    }

    match manifest_json(manifest) {
        Ok(json) => log::info!("{} manifest:\n{}", label, json),
        Err(e) => log::warn!("failed to serialize manifest to JSON: {}", e),
    }
}

/// JSON view of a snapshot. Member values are rendered with `Debug`.
pub fn snapshot_json(snapshot: &WorldSnapshot) -> serde_json::Value {
    let types: Vec<_> = snapshot
        .types()
        .iter()
        .map(|t| {
            let instances: Vec<_> = t
                .iter()
                .map(|(id, state)| {
                    let members: serde_json::Map<String, serde_json::Value> = state
                        .descriptor()
                        .members()
                        .iter()
                        .zip(state.members())
                        .map(|(m, v)| (m.name.to_string(), json!(format!("{:?}", v))))
                        .collect();
                    json!({ "id": id, "members": members })
                })
                .collect();
            json!({ "type": t.type_name(), "instances": instances })
        })
        .collect();
    json!({ "types": types })
}

/// Log a world snapshot as JSON if debug mode is enabled
pub fn log_snapshot(label: &str, snapshot: &WorldSnapshot) {
    if !is_debug_enabled() {
        return;
    }

    match serde_json::to_string_pretty(&snapshot_json(snapshot)) {
        Ok(json) => log::info!(
            "{} snapshot ({} instances):\n{}",
            label,
            snapshot.instance_count(),
            json
        ),
        Err(e) => log::warn!("failed to serialize snapshot to JSON: {}", e),
    }
}

/// Trace one message if trace mode is enabled
pub fn trace_message(direction: &str, channel: Channel, message: &Message) {
    if !is_trace_enabled() {
        return;
    }

    log::info!(
        "{} {:?}: {} ({})",
        direction,
        channel,
        message_summary(message),
        format_bytes(1 + message.body.len())
    );
}

pub fn message_summary(message: &Message) -> String {
    match message.msg_type {
        MessageType::FullState => "FullState".to_string(),
        MessageType::DeltaState => "DeltaState".to_string(),
        MessageType::RequestFullState => "RequestFullState".to_string(),
        MessageType::Rpc => match message.body.first() {
            Some(id) => format!("Rpc #{}", id),
            None => "Rpc (empty)".to_string(),
        },
        MessageType::Manifest => "Manifest".to_string(),
    }
}

/// Lowercase hex, bytes separated by spaces.
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format bytes in human-readable format (KB, MB, etc.)
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 bytes");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }

    #[test]
    fn test_message_summary_and_hex() {
        let message = Message::rpc(Bytes::from_static(&[7, 0xAB]));
        assert_eq!(message_summary(&message), "Rpc #7");
        assert_eq!(hex_dump(&message.body), "07 ab");
    }

    #[test]
    fn test_manifest_json() {
        let manifest = RegistryManifest {
            types: Vec::new(),
            enums: Vec::new(),
            customs: vec!["Fuse".to_string()],
            synchronized: Vec::new(),
            rpcs: Vec::new(),
        };
        let json = manifest_json(&manifest).unwrap();
        let parsed: RegistryManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, manifest);
    }
}
