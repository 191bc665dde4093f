pub mod asinfo;
pub mod collectinfo;
pub mod info;
pub mod pmap;
pub mod show;

use serde_json::Value;

use kvadm::NodeMap;

/// Usage information for a command.
pub struct Help {
    pub name: &'static str,
    pub description: &'static str,
    pub usage: &'static str,
}

/// Render a fan-out aggregate as a JSON object keyed by node. Per-node
/// errors stay visible as `{"error": …}` entries; the renderer contract
/// is nested string maps, not domain objects.
pub fn aggregate_json<T: serde::Serialize>(map: &NodeMap<T>) -> Value {
    let entries = map
        .iter()
        .map(|(key, result)| {
            let value = match result {
                Ok(value) => serde_json::to_value(value).unwrap_or(Value::Null),
                Err(e) => serde_json::json!({ "error": e.to_string() }),
            };
            (key.to_string(), value)
        })
        .collect();

    Value::Object(entries)
}
