//! Control-plane request dispatch.
//!
//! Every recognised method maps to a fixed params shape; unknown methods
//! return an error envelope without touching session state. A request gets
//! exactly one response with its id: the handler's, or a timeout error at
//! the deadline. Broadcasts triggered by a request are returned to the
//! caller so they can be published after the response is enqueued.

use crate::bridge::Matterbridge;
use crate::error::{BridgeError, Result};
use crate::frontend::{ApiMessage, BroadcastEvent, Changed};
use base64::Engine as _;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Deadline for one control-plane request.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// Run a request to completion or the deadline. Returns the response
/// envelope plus the broadcasts to publish after it.
pub async fn dispatch(
    bridge: &Arc<Matterbridge>,
    request: &ApiMessage,
) -> (ApiMessage, Vec<BroadcastEvent>) {
    match timeout(REQUEST_DEADLINE, handle(bridge, request)).await {
        Ok(Ok((response, events))) => (ApiMessage::response_to(request, response), events),
        Ok(Err(e)) => (ApiMessage::error_to(request, e.to_string()), Vec::new()),
        Err(_) => (
            ApiMessage::error_to(request, format!("Timed out after {REQUEST_DEADLINE:?}")),
            Vec::new(),
        ),
    }
}

async fn handle(
    bridge: &Arc<Matterbridge>,
    request: &ApiMessage,
) -> Result<(Value, Vec<BroadcastEvent>)> {
    let params = request.params.clone().unwrap_or_else(|| json!({}));
    match request.method.as_str() {
        "/api/login" => Ok((json!({ "valid": true }), Vec::new())),
        "/api/settings" => Ok((bridge.settings_snapshot(), Vec::new())),
        "/api/plugins" => Ok((bridge.plugins_snapshot(), Vec::new())),
        "/api/devices" => Ok((bridge.devices_snapshot(), Vec::new())),
        "/api/install" => {
            let package = require_str(&params, "packageName")?;
            bridge.install(&package).await?;
            Ok((
                json!({ "installed": package }),
                vec![BroadcastEvent::refresh(Changed::Plugins)],
            ))
        }
        "/api/uninstall" => {
            let package = require_str(&params, "packageName")?;
            bridge.uninstall(&package).await?;
            Ok((
                json!({ "uninstalled": package }),
                vec![BroadcastEvent::refresh(Changed::Plugins)],
            ))
        }
        "/api/addplugin" => {
            let name = require_str(&params, "pluginNameOrPath")?;
            let record = bridge.plugins().add(&name)?;
            Ok((
                json!(record.summary()),
                vec![BroadcastEvent::refresh(Changed::Plugins)],
            ))
        }
        "/api/removeplugin" => {
            let name = require_str(&params, "pluginName")?;
            bridge.plugins().remove(&name).await?;
            Ok((
                json!({ "removed": name }),
                vec![BroadcastEvent::refresh(Changed::Plugins)],
            ))
        }
        "/api/enableplugin" => {
            let name = require_str(&params, "pluginName")?;
            bridge.plugins().enable(&name)?;
            Ok((
                json!({ "enabled": name }),
                vec![BroadcastEvent::refresh(Changed::Plugins)],
            ))
        }
        "/api/disableplugin" => {
            let name = require_str(&params, "pluginName")?;
            bridge.plugins().disable(&name)?;
            Ok((
                json!({ "disabled": name }),
                vec![BroadcastEvent::refresh(Changed::Plugins)],
            ))
        }
        "/api/config" => {
            let name = require_str(&params, "name")?;
            let value = params.get("value").cloned().unwrap_or(Value::Null);
            let event = bridge.set_config(&name, &value)?;
            Ok((json!({ "ok": true }), event.into_iter().collect()))
        }
        "/api/shellynetconfig" => {
            let event = bridge.set_shelly_net_config(&params)?;
            Ok((json!({ "ok": true }), event.into_iter().collect()))
        }
        "/api/matter" => handle_matter(bridge, &params).await,
        "/api/uploadpackage" => {
            let filename = require_str(&params, "filename")?;
            let encoded = require_str(&params, "file")?;
            let payload = base64::engine::general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| BridgeError::UnknownMethod(format!("bad upload payload: {e}")))?;
            let name = bridge.upload_package(&filename, &payload).await?;
            Ok((
                json!({ "installed": name }),
                vec![BroadcastEvent::refresh(Changed::Plugins)],
            ))
        }
        "/api/restart" => {
            bridge.restart();
            Ok((json!({ "restarting": true }), Vec::new()))
        }
        other => Err(BridgeError::UnknownMethod(other.to_string())),
    }
}

/// Commissioning maintenance: advertise windows, fabric removal, state
/// queries, against one node or all of them.
async fn handle_matter(
    bridge: &Arc<Matterbridge>,
    params: &Value,
) -> Result<(Value, Vec<BroadcastEvent>)> {
    let id = params.get("id").and_then(Value::as_str);

    if let Some(id) = id {
        if let Some(index) = params.get("removeFabric").and_then(Value::as_u64) {
            bridge.supervisor().remove_fabric(id, index as u8)?;
        }
        if truthy(params, "startCommission") || truthy(params, "advertise") {
            bridge.supervisor().advertise(id).await?;
        }
        if truthy(params, "stopCommission") {
            bridge.supervisor().stop_advertising(id).await?;
        }
        let snapshot = bridge
            .supervisor()
            .snapshot(id)
            .ok_or_else(|| BridgeError::NotFound(id.to_string()))?;
        Ok((json!(snapshot), Vec::new()))
    } else {
        Ok((json!(bridge.matter_snapshots()), Vec::new()))
    }
}

fn truthy(params: &Value, key: &str) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn require_str(params: &Value, key: &str) -> Result<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BridgeError::UnknownMethod(format!("missing param {key}")))
}
