//! JSON messages exchanged with the uitest kit.
//!
//! Every request names an API (`Driver.click`, `PointerMatrix.create`, ...),
//! the handle of the object it is called on, and a positional argument list.
//! Responses carry either a `result` value or an `exception`.

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Module every kit call is addressed to.
pub const RPC_MODULE: &str = "com.ohos.devicetest.hypiumApiHelper";

/// Method for ordinary API calls.
pub const METHOD_CALL_API: &str = "callHypiumApi";

/// Method for starting and stopping capture streams.
pub const METHOD_CAPTURES: &str = "Captures";

pub const MESSAGE_TYPE: &str = "hypium";

/// Capture APIs understood by the `Captures` method.
pub mod capture {
    pub const START_SCREEN: &str = "startCaptureScreen";
    pub const STOP_SCREEN: &str = "stopCaptureScreen";
    pub const START_UI_ACTION: &str = "startCaptureUiAction";
    pub const STOP_UI_ACTION: &str = "stopCaptureUiAction";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcParams {
    pub api: String,
    #[serde(rename = "this", skip_serializing_if = "Option::is_none")]
    pub this: Option<String>,
    pub args: Vec<Value>,
    pub message_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub module: String,
    pub method: String,
    pub params: RpcParams,
    pub request_id: String,
}

impl RpcRequest {
    fn build(method: &str, api: &str, this: Option<&str>, args: Vec<Value>) -> Self {
        Self {
            module: RPC_MODULE.to_string(),
            method: method.to_string(),
            params: RpcParams {
                api: api.to_string(),
                this: this.map(str::to_string),
                args,
                message_type: MESSAGE_TYPE.to_string(),
            },
            request_id: request_id(),
        }
    }

    /// A `callHypiumApi` request.
    pub fn call(api: &str, this: Option<&str>, args: Vec<Value>) -> Self {
        Self::build(METHOD_CALL_API, api, this, args)
    }

    /// A `Captures` request for one of the [`capture`] APIs.
    pub fn captures(api: &str, args: Vec<Value>) -> Self {
        Self::build(METHOD_CAPTURES, api, None, args)
    }

    pub fn driver_create() -> Self {
        Self::call("Driver.create", None, vec![])
    }

    pub fn pointer_matrix_create(driver: &str, fingers: usize, max_steps: usize) -> Self {
        Self::call(
            "PointerMatrix.create",
            Some(driver),
            vec![json!(fingers), json!(max_steps)],
        )
    }

    pub fn pointer_matrix_set_point(matrix: &str, finger: usize, step: usize, x: i64, y: i64) -> Self {
        Self::call(
            "PointerMatrix.setPoint",
            Some(matrix),
            vec![json!(finger), json!(step), json!({ "x": x, "y": y })],
        )
    }

    pub fn inject_multi_pointer_action(driver: &str, matrix: &str, speed: u32) -> Self {
        Self::call(
            "Driver.injectMultiPointerAction",
            Some(driver),
            vec![json!(matrix), json!(speed)],
        )
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing plain strings and JSON values cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Local timestamp with microseconds, used to tag requests.
pub fn request_id() -> String {
    Local::now().format("%Y%m%d%H%M%S%6f").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcException {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub exception: Option<RpcException>,
}

impl RpcResponse {
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// The result value, or the exception when one is present.
    pub fn into_result(self) -> Result<Value, RpcException> {
        match self.exception {
            Some(exception) => Err(exception),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
