//! Dashboard telemetry subscription over the socket channel.

use serde_json::{Value, json};

use crate::session;

pub const TELEMETRY_PATH: &str = "/api/ws/plugins/telemetry";

/// `cmdId`s of the device status counters.
pub mod device_status {
    pub const TOTAL: i64 = 1;
    pub const ACTIVE: i64 = 2;
    pub const INACTIVE: i64 = 3;
}

/// Socket path carrying the access token in the query string. A `Bearer `
/// prefix is stripped first.
pub fn telemetry_url(access_token: &str) -> String {
    let token = session::strip_bearer(access_token);
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("token", token);
    format!("{TELEMETRY_PATH}?{}", query.finish())
}

fn device_query(active: Option<bool>) -> Value {
    let mut query = json!({
        "entityFilter": {
            "type": "entityType",
            "resolveMultiple": true,
            "entityType": "DEVICE",
        }
    });
    if let (Some(active), Some(fields)) = (active, query.as_object_mut()) {
        let filters = json!([{
            "key": { "type": "ATTRIBUTE", "key": "active" },
            "valueType": "BOOLEAN",
            "predicate": {
                "operation": "EQUAL",
                "value": { "defaultValue": active, "dynamicValue": null },
                "type": "BOOLEAN",
            }
        }]);
        fields.insert("keyFilters".to_string(), filters);
    }
    query
}

/// Entity count commands for total, active and inactive devices.
pub fn device_status_cmds() -> Value {
    json!({
        "entityCountCmds": [
            { "query": device_query(None), "cmdId": device_status::TOTAL },
            { "query": device_query(Some(true)), "cmdId": device_status::ACTIVE },
            { "query": device_query(Some(false)), "cmdId": device_status::INACTIVE },
        ]
    })
}

/// Alarm table page request; fields in `overrides` replace the defaults.
pub fn alarm_table_cmd(overrides: &Value) -> Value {
    let mut cmd = json!({
        "pageSize": 200,
        "page": 0,
        "sortProperty": "createdTime",
        "key": "dashboard_alarm_table",
        "tenantId": "",
    });
    if let (Some(base), Some(extra)) = (cmd.as_object_mut(), overrides.as_object()) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    cmd
}

/// Inbound telemetry, classified the way the dashboard consumes it.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryUpdate {
    /// Count update for one of the [`device_status`] commands.
    DeviceStatus { cmd_id: i64, data: Value },
    /// Alarm table page (`hasNext` present).
    AlarmTable { has_next: bool, data: Value },
    Other(Value),
}

impl TelemetryUpdate {
    pub fn classify(value: Value) -> Self {
        if let Some(cmd_id) = value.get("cmdId").and_then(Value::as_i64) {
            return TelemetryUpdate::DeviceStatus {
                cmd_id,
                data: value,
            };
        }
        if let Some(has_next) = value.get("hasNext").and_then(Value::as_bool) {
            return TelemetryUpdate::AlarmTable {
                has_next,
                data: value,
            };
        }
        TelemetryUpdate::Other(value)
    }
}
