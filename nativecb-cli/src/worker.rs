//! Line-delimited JSON-RPC session over a [`CallbackRuntime`].
//!
//! The worker owns every callback it registers.  `drop` releases that
//! ownership, which is how a driving process simulates collection of a
//! managed callback object.

use std::collections::HashMap;
use std::sync::Arc;

use nativecb_core::{
    Callback, CallbackRuntime, FnCallback, NativeCallbackError, NativeHandle, RuntimeConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Serialize)]
pub struct Response {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn json_handle(params: &Value) -> Result<NativeHandle, String> {
    params
        .get("handle")
        .and_then(Value::as_u64)
        .map(NativeHandle::new)
        .ok_or_else(|| "missing or invalid \"handle\"".to_owned())
}

fn to_value<T: Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

type Body = fn(&[u8]) -> nativecb_core::Result<Vec<u8>>;

/// Build the callback body for a named behaviour.
fn behaviour(name: &str) -> Result<Body, String> {
    let body: Body = match name {
        "echo" => |args| Ok(args.to_vec()),
        "reverse" => |args| Ok(args.iter().rev().copied().collect()),
        "upper" => |args| Ok(args.to_ascii_uppercase()),
        "fail" => |_| Err(NativeCallbackError::InvocationError("callback failed on request".into())),
        other => return Err(format!("unknown behaviour: {other}")),
    };
    Ok(body)
}

pub struct Session {
    runtime: CallbackRuntime,
    owners: HashMap<NativeHandle, Arc<dyn Callback>>,
}

impl Session {
    pub fn new(config: RuntimeConfig) -> Result<Self, String> {
        let runtime = CallbackRuntime::new(config).map_err(|e| e.to_string())?;
        Ok(Self {
            runtime,
            owners: HashMap::new(),
        })
    }

    pub fn runtime(&self) -> &CallbackRuntime {
        &self.runtime
    }

    pub fn dispatch(&mut self, method: &str, params: &Value) -> Result<Value, String> {
        match method {
            "register" => {
                let label = params.get("label").and_then(Value::as_str).unwrap_or("worker");
                let kind = params.get("behaviour").and_then(Value::as_str).unwrap_or("echo");
                let func = behaviour(kind)?;
                let owner = FnCallback::shared(label, func);
                let handle = self.runtime.register(&owner).map_err(|e| e.to_string())?;
                self.owners.insert(handle, owner);
                log::info!("registered {label:?} ({kind}) as {handle}");
                Ok(serde_json::json!({ "handle": handle }))
            }
            "invoke" => {
                let handle = json_handle(params)?;
                let args = params.get("args").and_then(Value::as_str).unwrap_or("");
                let out = self
                    .runtime
                    .dispatch(handle, args.as_bytes())
                    .map_err(|e| e.to_string())?;
                Ok(Value::String(String::from_utf8_lossy(&out).into_owned()))
            }
            "drop" => {
                let handle = json_handle(params)?;
                let dropped = self.owners.remove(&handle).is_some();
                if dropped {
                    self.runtime.notify_collected();
                }
                Ok(Value::Bool(dropped))
            }
            "deregister" => {
                let handle = json_handle(params)?;
                let released = self.runtime.deregister(handle).map_err(|e| e.to_string())?;
                Ok(Value::Bool(released))
            }
            "is_registered" => {
                let handle = json_handle(params)?;
                Ok(Value::Bool(self.runtime.is_registered(handle)))
            }
            "sweep" => to_value(self.runtime.sweep_now()),
            "stats" => to_value(self.runtime.stats()),
            "entries" => to_value(self.runtime.entries()),
            "shutdown" => {
                let freed = self.runtime.shutdown();
                self.owners.clear();
                Ok(Value::from(freed))
            }
            "ping" => Ok(Value::String("pong".to_owned())),
            _ => Err(format!("unknown method: {method}")),
        }
    }

    /// Handle one request line and return the serialized response.
    pub fn handle_line(&mut self, line: &str) -> String {
        let resp = match serde_json::from_str::<Request>(line) {
            Ok(req) => match self.dispatch(&req.method, &req.params) {
                Ok(result) => Response {
                    id: req.id,
                    result: Some(result),
                    error: None,
                },
                Err(error) => Response {
                    id: req.id,
                    result: None,
                    error: Some(error),
                },
            },
            // Parse error -- use id=0 since we can't extract it.
            Err(e) => Response {
                id: 0,
                result: None,
                error: Some(format!("invalid JSON: {e}")),
            },
        };

        serde_json::to_string(&resp).unwrap_or_else(|_| {
            format!(r#"{{"id":{},"error":"response serialization failed"}}"#, resp.id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn session() -> Session {
        Session::new(RuntimeConfig {
            sweep_interval_ms: 10,
            idle_linger_ms: 0,
            ..RuntimeConfig::default()
        })
        .unwrap()
    }

    fn call(s: &mut Session, line: &str) -> Value {
        serde_json::from_str(&s.handle_line(line)).unwrap()
    }

    fn register(s: &mut Session, behaviour: &str) -> u64 {
        let line = format!(r#"{{"id":1,"method":"register","params":{{"behaviour":"{behaviour}"}}}}"#);
        call(s, &line)["result"]["handle"].as_u64().unwrap()
    }

    #[test]
    fn test_ping() {
        let mut s = session();
        let resp = call(&mut s, r#"{"id":7,"method":"ping"}"#);
        assert_eq!(resp["id"], 7);
        assert_eq!(resp["result"], "pong");
    }

    #[test]
    fn test_register_and_invoke() {
        let mut s = session();
        let h = register(&mut s, "reverse");
        let resp = call(
            &mut s,
            &format!(r#"{{"id":2,"method":"invoke","params":{{"handle":{h},"args":"abc"}}}}"#),
        );
        assert_eq!(resp["result"], "cba");
    }

    #[test]
    fn test_failing_callback_reports_error() {
        let mut s = session();
        let h = register(&mut s, "fail");
        let resp = call(
            &mut s,
            &format!(r#"{{"id":3,"method":"invoke","params":{{"handle":{h}}}}}"#),
        );
        assert!(resp["error"].as_str().unwrap().starts_with("InvocationError"));
        // A failed call does not release the handle.
        assert!(s.runtime().is_registered(NativeHandle::new(h)));
    }

    #[test]
    fn test_drop_releases_handle() {
        let mut s = session();
        let h = register(&mut s, "echo");
        let resp = call(&mut s, &format!(r#"{{"id":4,"method":"drop","params":{{"handle":{h}}}}}"#));
        assert_eq!(resp["result"], true);

        let start = Instant::now();
        while !s.runtime().is_empty() && start.elapsed() < Duration::from_secs(10) {
            std::thread::sleep(Duration::from_millis(10));
        }
        let resp = call(
            &mut s,
            &format!(r#"{{"id":5,"method":"invoke","params":{{"handle":{h}}}}}"#),
        );
        assert!(resp["error"].as_str().unwrap().starts_with("NotFound"));
    }

    #[test]
    fn test_stats_and_shutdown() {
        let mut s = session();
        register(&mut s, "echo");
        register(&mut s, "upper");
        let stats = call(&mut s, r#"{"id":6,"method":"stats"}"#);
        assert_eq!(stats["result"]["registered_total"], 2);

        let resp = call(&mut s, r#"{"id":7,"method":"shutdown"}"#);
        assert_eq!(resp["result"], 2);
        let resp = call(&mut s, r#"{"id":8,"method":"register"}"#);
        assert!(resp["error"].as_str().unwrap().starts_with("ShutDown"));
    }

    #[test]
    fn test_bad_requests() {
        let mut s = session();
        let resp = call(&mut s, "not json");
        assert_eq!(resp["id"], 0);
        assert!(resp["error"].as_str().unwrap().starts_with("invalid JSON"));

        let resp = call(&mut s, r#"{"id":9,"method":"frobnicate"}"#);
        assert_eq!(resp["error"], "unknown method: frobnicate");

        let resp = call(&mut s, r#"{"id":10,"method":"register","params":{"behaviour":"nope"}}"#);
        assert_eq!(resp["error"], "unknown behaviour: nope");
    }
}
