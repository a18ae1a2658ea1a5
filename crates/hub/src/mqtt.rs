use serde::Deserialize;

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct StateMsg {
    pub(crate) state: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Subscription filter for device state updates.
pub(crate) const STATE_FILTER: &str = "state/+";

/// Extract the entity reference from "state/<entity>".
pub(crate) fn extract_state_entity(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 2 && parts[0] == "state" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Topic carrying ON/OFF commands for an actuator entity.
pub(crate) fn command_topic(entity: &str) -> String {
    format!("cmd/{entity}/set")
}

/// Parse a state payload.  Accepts `{"state": ...}` JSON (string, number or
/// bool) or a bare UTF-8 string.
pub(crate) fn parse_state_payload(payload: &[u8]) -> Result<String, String> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| format!("state payload is not utf-8: {e}"))?
        .trim();
    if text.is_empty() {
        return Err("empty state payload".to_string());
    }

    if text.starts_with('{') {
        let msg: StateMsg =
            serde_json::from_str(text).map_err(|e| format!("bad state json: {e}"))?;
        return match msg.state {
            serde_json::Value::String(s) => Ok(s),
            serde_json::Value::Number(n) => Ok(n.to_string()),
            serde_json::Value::Bool(b) => Ok(if b { "on" } else { "off" }.to_string()),
            serde_json::Value::Null => Ok("unknown".to_string()),
            other => Err(format!("unsupported state value {other}")),
        };
    }

    Ok(text.to_string())
}

/// True when `entity` can be embedded in a single MQTT topic level.
pub(crate) fn is_topic_safe(entity: &str) -> bool {
    !entity.is_empty() && !entity.contains(['/', '+', '#'])
}

// ===========================================================================
// Tests
// ===========================================================================
