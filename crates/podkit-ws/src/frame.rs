//! Wire frames.
//!
//! ```text
//! client → node   {"id": 7, "method": "subscribe", "channel": "orderbook", "params": {..}}
//! node → client   {"id": 7, "result": ..}  |  {"id": 7, "error": {"code": .., "message": ..}}
//! node → client   {"channel": "orderbook", "data": {..}}
//! ```

use podkit_core::JsonRpcError;
use serde_json::{json, Value};

use crate::channel::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Method {
    Subscribe,
    Unsubscribe,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

pub(crate) fn request(id: u64, method: Method, channel: Channel, params: Option<&Value>) -> String {
    let mut frame = json!({
        "id": id,
        "method": method.as_str(),
        "channel": channel.as_str(),
    });
    if let (Some(params), Some(obj)) = (params, frame.as_object_mut()) {
        obj.insert("params".into(), params.clone());
    }
    frame.to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    Response {
        id: u64,
        result: Result<Value, JsonRpcError>,
    },
    Push {
        channel: String,
        data: Value,
    },
}

pub(crate) fn parse(text: &str) -> Result<Inbound, String> {
    let mut value: Value = serde_json::from_str(text).map_err(|e| format!("invalid JSON: {e}"))?;
    let Some(obj) = value.as_object_mut() else {
        return Err("frame is not an object".into());
    };

    if let Some(id) = obj.get("id").filter(|v| !v.is_null()) {
        let id = id.as_u64().ok_or_else(|| format!("non-numeric id {id}"))?;
        let result = match obj.remove("error") {
            Some(err) => Err(serde_json::from_value::<JsonRpcError>(err)
                .map_err(|e| format!("invalid error object: {e}"))?),
            None => Ok(obj.remove("result").unwrap_or(Value::Null)),
        };
        return Ok(Inbound::Response { id, result });
    }

    match (obj.remove("channel"), obj.remove("data")) {
        (Some(Value::String(channel)), Some(data)) => Ok(Inbound::Push { channel, data }),
        _ => Err("frame has neither an id nor a channel/data pair".into()),
    }
}
