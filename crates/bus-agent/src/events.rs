/// Small positive integer naming a resource within one owner (SPEC_FULL.md
/// GLOSSARY: "Handle id"). Strictly increasing within an owner's lifetime.
pub type HandleId = u64;

/// Events the agent delivers to its owner (the bridge) as bus activity
/// happens in the background: connection loss, proxy signals/property
/// changes, inbound method invocations on a registered object, and name
/// ownership transitions. Outbound `call_method` completions are not an
/// event: the call is awaited directly by whoever invoked it.
#[derive(Debug)]
pub enum AgentEvent {
    ConnectionLost {
        conn_id: HandleId,
    },
    ProxySignal {
        proxy_id: HandleId,
        signal_name: String,
        args: serde_json::Value,
    },
    PropertiesChanged {
        proxy_id: HandleId,
        changed: serde_json::Value,
        invalidated: Vec<String>,
    },
    ObjectMethodCall {
        reg_id: HandleId,
        invocation_serial: HandleId,
        method: String,
        args: serde_json::Value,
    },
    NameAcquired {
        name_id: HandleId,
    },
    NameLost {
        name_id: HandleId,
    },
}
