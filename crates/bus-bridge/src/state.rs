use tokio::sync::Mutex;

use bus_agent::BusAgent;
use ipc_task::ChildTask;
use std::sync::Arc;

/// Everything the bridge keeps for one peer: its lazily-created Bus Agent,
/// the task pumping the agent's background events back onto the wire, and
/// the in-flight `CALL_METHOD` tasks. Dropping this (on `on_peer_closed`)
/// aborts every task in it, which is how "peer close cancels all pending
/// per-peer operations" (SPEC_FULL.md §5) is enforced without a manual
/// cancellation sweep.
pub(crate) struct PeerBridgeState {
    pub(crate) agent: Arc<BusAgent>,
    pub(crate) _agent_events: ChildTask<()>,
    pub(crate) call_tasks: Mutex<Vec<ChildTask<()>>>,
}
