use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, RwLock};
use zbus::fdo::RequestNameFlags;
use zbus::names::OwnedInterfaceName;
use zbus::zvariant::OwnedObjectPath;
use zbus::{Connection, Message, MessageStream, Proxy};

use ipc_task::ChildTask;

use crate::error::AgentError;
use crate::events::{AgentEvent, HandleId};

struct ConnectionEntry {
    connection: Connection,
    _disconnect_watcher: ChildTask<()>,
}

struct ProxyEntry {
    proxy: Proxy<'static>,
    conn_id: HandleId,
    signal_watcher: Option<ChildTask<()>>,
    props_watcher: Option<ChildTask<()>>,
}

struct RegistrationEntry {
    conn_id: HandleId,
    path: OwnedObjectPath,
    interface: OwnedInterfaceName,
    _description: serde_json::Value,
    _dispatch_watcher: ChildTask<()>,
    pending: Arc<RwLock<HashMap<HandleId, Message>>>,
}

struct OwnedNameEntry {
    conn_id: HandleId,
    name: String,
    _watcher: ChildTask<()>,
}

#[derive(Default)]
struct AgentCtx {
    aliases: HashMap<String, String>,
    connections: HashMap<HandleId, ConnectionEntry>,
    proxies: HashMap<HandleId, ProxyEntry>,
    registrations: HashMap<HandleId, RegistrationEntry>,
    owned_names: HashMap<HandleId, OwnedNameEntry>,
}

/// Per-owner registry of bus connections, proxies, and registered objects
/// (component C6). One `BusAgent` is created lazily per peer by the bridge.
///
/// Dropping a `BusAgent` drops every connection, proxy, and watcher it
/// holds, which is how the "owner dies ⇒ everything released" invariant is
/// satisfied: there is no separate cleanup pass to forget to run.
pub struct BusAgent {
    ctx: RwLock<AgentCtx>,
    next_handle: Arc<AtomicU64>,
    events_tx: mpsc::Sender<AgentEvent>,
}

impl BusAgent {
    pub fn new(events_tx: mpsc::Sender<AgentEvent>) -> Arc<Self> {
        Arc::new(Self {
            ctx: RwLock::new(AgentCtx::default()),
            next_handle: Arc::new(AtomicU64::new(1)),
            events_tx,
        })
    }

    fn alloc_handle(&self) -> HandleId {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn create_address_alias(&self, alias: impl Into<String>, real_address: impl Into<String>) {
        self.ctx.write().await.aliases.insert(alias.into(), real_address.into());
    }

    async fn resolve_address(&self, address: &str) -> String {
        self.ctx
            .read()
            .await
            .aliases
            .get(address)
            .cloned()
            .unwrap_or_else(|| address.to_owned())
    }

    /// Resolves `address` against any alias registered via
    /// [`BusAgent::create_address_alias`], connects, and attaches a
    /// background watcher that surfaces `connection_lost(conn_id)` once the
    /// connection's message stream ends.
    pub async fn new_connection(&self, address: &str, _reuse: bool) -> Result<HandleId, AgentError> {
        let resolved = self.resolve_address(address).await;

        let connection = zbus::conn::Builder::address(resolved.as_str())
            .map_err(AgentError::from)?
            .build()
            .await
            .map_err(AgentError::from)?;

        let conn_id = self.alloc_handle();
        let watcher = spawn_disconnect_watcher(connection.clone(), conn_id, self.events_tx.clone());

        self.ctx.write().await.connections.insert(
            conn_id,
            ConnectionEntry {
                connection,
                _disconnect_watcher: watcher,
            },
        );

        info!(conn_id, address = %resolved, "Bus connection established");
        Ok(conn_id)
    }

    /// Closes `conn_id` and every proxy, registration, and owned name that
    /// depended on it. Idempotent: closing twice returns `InvalidHandle` and
    /// leaves state unchanged the second time.
    pub async fn close_connection(&self, conn_id: HandleId) -> Result<(), AgentError> {
        let mut ctx = self.ctx.write().await;
        if !ctx.connections.contains_key(&conn_id) {
            return Err(AgentError::InvalidHandle);
        }

        ctx.proxies.retain(|_, p| p.conn_id != conn_id);
        ctx.registrations.retain(|_, r| r.conn_id != conn_id);
        ctx.owned_names.retain(|_, n| n.conn_id != conn_id);
        ctx.connections.remove(&conn_id);
        Ok(())
    }

    pub async fn get_connection(&self, conn_id: HandleId) -> Result<Connection, AgentError> {
        self.ctx
            .read()
            .await
            .connections
            .get(&conn_id)
            .map(|entry| entry.connection.clone())
            .ok_or(AgentError::InvalidHandle)
    }

    pub async fn new_proxy(
        &self,
        conn_id: HandleId,
        _flags: u32,
        name: &str,
        path: &str,
        iface: &str,
    ) -> Result<HandleId, AgentError> {
        let connection = self.get_connection(conn_id).await?;
        let proxy = Proxy::new(&connection, name.to_owned(), path.to_owned(), iface.to_owned())
            .await
            .map_err(AgentError::from)?;

        let proxy_id = self.alloc_handle();
        self.ctx.write().await.proxies.insert(
            proxy_id,
            ProxyEntry {
                proxy,
                conn_id,
                signal_watcher: None,
                props_watcher: None,
            },
        );

        Ok(proxy_id)
    }

    pub async fn close_proxy(&self, proxy_id: HandleId) -> Result<(), AgentError> {
        self.ctx
            .write()
            .await
            .proxies
            .remove(&proxy_id)
            .map(|_| ())
            .ok_or(AgentError::InvalidHandle)
    }

    /// Installs (`enable = true`) or removes (`enable = false`) a forwarder
    /// that turns every signal the proxy's peer emits into an
    /// [`AgentEvent::ProxySignal`].
    pub async fn watch_proxy_signals(&self, proxy_id: HandleId, enable: bool) -> Result<(), AgentError> {
        let mut ctx = self.ctx.write().await;
        let entry = ctx.proxies.get_mut(&proxy_id).ok_or(AgentError::InvalidHandle)?;

        if !enable {
            entry.signal_watcher = None;
            return Ok(());
        }

        let mut stream = entry.proxy.receive_all_signals().await.map_err(AgentError::from)?;
        let events_tx = self.events_tx.clone();

        let watcher = ChildTask::spawn(async move {
            while let Some(signal) = stream.next().await {
                let signal_name = signal
                    .header()
                    .member()
                    .map(|member| member.to_string())
                    .unwrap_or_default();
                let args = serde_json::Value::String(format!("{:?}", signal.body()));
                let _ = events_tx
                    .send(AgentEvent::ProxySignal {
                        proxy_id,
                        signal_name,
                        args,
                    })
                    .await;
            }
        });

        entry.signal_watcher = Some(watcher);
        Ok(())
    }

    /// Installs (`enable = true`) or removes (`enable = false`) a forwarder
    /// for the proxy's `org.freedesktop.DBus.Properties.PropertiesChanged`
    /// signal, scoped to the proxy's own interface.
    pub async fn watch_proxy_property_changes(&self, proxy_id: HandleId, enable: bool) -> Result<(), AgentError> {
        let (connection, destination, path, interface) = {
            let ctx = self.ctx.read().await;
            let entry = ctx.proxies.get(&proxy_id).ok_or(AgentError::InvalidHandle)?;
            (
                entry.proxy.connection().clone(),
                entry.proxy.destination().to_owned(),
                entry.proxy.path().to_owned(),
                entry.proxy.interface().to_owned(),
            )
        };

        let mut ctx = self.ctx.write().await;
        let entry = ctx.proxies.get_mut(&proxy_id).ok_or(AgentError::InvalidHandle)?;

        if !enable {
            entry.props_watcher = None;
            return Ok(());
        }

        let props_proxy = zbus::fdo::PropertiesProxy::builder(&connection)
            .destination(destination)
            .map_err(AgentError::from)?
            .path(path)
            .map_err(AgentError::from)?
            .build()
            .await
            .map_err(AgentError::from)?;

        let mut stream = props_proxy.receive_properties_changed().await.map_err(AgentError::from)?;
        let events_tx = self.events_tx.clone();

        let watcher = ChildTask::spawn(async move {
            while let Some(signal) = stream.next().await {
                let Ok(args) = signal.args() else { continue };
                if args.interface_name().as_str() != interface.as_str() {
                    continue;
                }

                let changed = serde_json::Value::String(format!("{:?}", args.changed_properties()));
                let invalidated = args
                    .invalidated_properties()
                    .iter()
                    .map(|name| name.to_string())
                    .collect();

                let _ = events_tx
                    .send(AgentEvent::PropertiesChanged {
                        proxy_id,
                        changed,
                        invalidated,
                    })
                    .await;
            }
        });

        entry.props_watcher = Some(watcher);
        Ok(())
    }

    /// Registers an object at `path`/`interface` on `conn_id`. Method calls
    /// arriving from the bus are captured off a raw message stream (rather
    /// than zbus's static `#[interface]` machinery, which needs the
    /// interface's shape at compile time) and forwarded as
    /// [`AgentEvent::ObjectMethodCall`]; `description` is carried opaquely
    /// and never interpreted by the agent itself.
    pub async fn register_object(
        &self,
        conn_id: HandleId,
        path: &str,
        interface: &str,
        description: serde_json::Value,
    ) -> Result<HandleId, AgentError> {
        let connection = self.get_connection(conn_id).await?;
        let object_path =
            OwnedObjectPath::try_from(path.to_owned()).map_err(|e| AgentError::BusError(e.to_string()))?;
        let interface_name =
            OwnedInterfaceName::try_from(interface.to_owned()).map_err(|e| AgentError::BusError(e.to_string()))?;

        let reg_id = self.alloc_handle();
        let pending: Arc<RwLock<HashMap<HandleId, Message>>> = Arc::new(RwLock::new(HashMap::new()));

        let watcher = spawn_object_dispatch(
            connection.clone(),
            object_path.clone(),
            interface_name.clone(),
            reg_id,
            Arc::clone(&pending),
            Arc::clone(&self.next_handle),
            self.events_tx.clone(),
        );

        self.ctx.write().await.registrations.insert(
            reg_id,
            RegistrationEntry {
                conn_id,
                path: object_path,
                interface: interface_name,
                _description: description,
                _dispatch_watcher: watcher,
                pending,
            },
        );

        Ok(reg_id)
    }

    pub async fn unregister_object(&self, reg_id: HandleId) -> Result<(), AgentError> {
        self.ctx
            .write()
            .await
            .registrations
            .remove(&reg_id)
            .map(|_| ())
            .ok_or(AgentError::InvalidHandle)
    }

    /// Completes a pending invocation raised by [`AgentEvent::ObjectMethodCall`],
    /// replying to the bus with either `result` or `error`. The wire's
    /// `OBJECT_METHOD_RESPONSE` carries only `invocation_serial`, so this
    /// scans every live registration's pending table rather than requiring
    /// the caller to also track which `reg_id` it belongs to.
    pub async fn respond_object_method(
        &self,
        invocation_serial: HandleId,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), AgentError> {
        let (conn_id, original) = {
            let ctx = self.ctx.read().await;
            let mut found = None;
            for entry in ctx.registrations.values() {
                if let Some(message) = entry.pending.write().await.remove(&invocation_serial) {
                    found = Some((entry.conn_id, message));
                    break;
                }
            }
            found.ok_or(AgentError::InvalidHandle)?
        };

        let connection = self.get_connection(conn_id).await?;

        if let Some(message) = error {
            let error_name = zbus::names::ErrorName::try_from("org.freedesktop.DBus.Error.Failed")
                .map_err(|e| AgentError::BusError(e.to_string()))?;
            connection
                .reply_error(&original, &error_name, &(message,))
                .await
                .map_err(AgentError::from)?;
        } else {
            let body_text = result.unwrap_or(serde_json::Value::Null).to_string();
            connection.reply(&original, &(body_text,)).await.map_err(AgentError::from)?;
        }

        Ok(())
    }

    pub async fn own_name(&self, conn_id: HandleId, name: &str, flags: u32) -> Result<HandleId, AgentError> {
        let connection = self.get_connection(conn_id).await?;
        let request_flags = RequestNameFlags::from_bits_truncate(flags);

        connection
            .request_name_with_flags(name.to_owned(), request_flags)
            .await
            .map_err(AgentError::from)?;

        let name_id = self.alloc_handle();
        let watcher = spawn_name_owner_watcher(connection.clone(), name.to_owned(), name_id, self.events_tx.clone());

        self.ctx.write().await.owned_names.insert(
            name_id,
            OwnedNameEntry {
                conn_id,
                name: name.to_owned(),
                _watcher: watcher,
            },
        );

        Ok(name_id)
    }

    pub async fn unown_name(&self, name_id: HandleId) -> Result<(), AgentError> {
        let entry = self
            .ctx
            .write()
            .await
            .owned_names
            .remove(&name_id)
            .ok_or(AgentError::InvalidHandle)?;

        let connection = self.get_connection(entry.conn_id).await?;
        connection.release_name(entry.name).await.map_err(AgentError::from)?;
        Ok(())
    }

    pub async fn emit_signal(&self, reg_id: HandleId, signal_name: &str, args: serde_json::Value) -> Result<(), AgentError> {
        let (conn_id, path, interface) = {
            let ctx = self.ctx.read().await;
            let entry = ctx.registrations.get(&reg_id).ok_or(AgentError::InvalidHandle)?;
            (entry.conn_id, entry.path.clone(), entry.interface.clone())
        };
        let connection = self.get_connection(conn_id).await?;

        let member = zbus::names::MemberName::try_from(signal_name.to_owned())
            .map_err(|e| AgentError::BusError(e.to_string()))?;
        let body_text = args.to_string();

        connection
            .emit_signal(None::<zbus::names::BusName<'_>>, &path, &interface, member, &(body_text,))
            .await
            .map_err(AgentError::from)?;

        Ok(())
    }

    /// Calls a method generically. Arguments and the return value both
    /// travel as a single JSON-encoded string body — the same opaque-JSON
    /// convention used for `REGISTER_OBJECT`'s interface description, since
    /// a fully general JSON↔D-Bus-signature mapping is outside this agent's
    /// scope (SPEC_FULL.md §9.1).
    pub async fn call_method(
        &self,
        proxy_id: HandleId,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, AgentError> {
        let proxy = {
            let ctx = self.ctx.read().await;
            ctx.proxies.get(&proxy_id).ok_or(AgentError::InvalidHandle)?.proxy.clone()
        };

        let member = zbus::names::MemberName::try_from(method.to_owned())
            .map_err(|e| AgentError::BusError(e.to_string()))?;
        let args_text = args.to_string();

        let reply = proxy
            .call_method(member, &(args_text,))
            .await
            .map_err(AgentError::from)?;

        let result_text: String = reply.body().deserialize().map_err(AgentError::from)?;
        serde_json::from_str(&result_text).map_err(|e| AgentError::BusError(e.to_string()))
    }
}

fn spawn_disconnect_watcher(connection: Connection, conn_id: HandleId, events_tx: mpsc::Sender<AgentEvent>) -> ChildTask<()> {
    ChildTask::spawn(async move {
        let mut stream = MessageStream::from(&connection);
        while stream.next().await.is_some() {}
        debug!(conn_id, "Bus connection stream ended");
        let _ = events_tx.send(AgentEvent::ConnectionLost { conn_id }).await;
    })
}

fn spawn_name_owner_watcher(
    connection: Connection,
    name: String,
    name_id: HandleId,
    events_tx: mpsc::Sender<AgentEvent>,
) -> ChildTask<()> {
    ChildTask::spawn(async move {
        let Ok(dbus_proxy) = zbus::fdo::DBusProxy::new(&connection).await else {
            return;
        };
        let Ok(mut acquired) = dbus_proxy.receive_name_acquired().await else {
            return;
        };
        let Ok(mut lost) = dbus_proxy.receive_name_lost().await else {
            return;
        };

        loop {
            tokio::select! {
                signal = acquired.next() => {
                    let Some(signal) = signal else { break };
                    if matches!(signal.args(), Ok(args) if args.name.as_str() == name) {
                        let _ = events_tx.send(AgentEvent::NameAcquired { name_id }).await;
                    }
                }
                signal = lost.next() => {
                    let Some(signal) = signal else { break };
                    if matches!(signal.args(), Ok(args) if args.name.as_str() == name) {
                        let _ = events_tx.send(AgentEvent::NameLost { name_id }).await;
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_object_dispatch(
    connection: Connection,
    path: OwnedObjectPath,
    interface: OwnedInterfaceName,
    reg_id: HandleId,
    pending: Arc<RwLock<HashMap<HandleId, Message>>>,
    next_handle: Arc<AtomicU64>,
    events_tx: mpsc::Sender<AgentEvent>,
) -> ChildTask<()> {
    ChildTask::spawn(async move {
        let mut stream = MessageStream::from(&connection);

        while let Some(Ok(message)) = stream.next().await {
            let header = message.header();
            if header.message_type() != zbus::message::Type::MethodCall {
                continue;
            }
            if header.path() != Some(path.as_ref()) || header.interface() != Some(interface.as_ref()) {
                continue;
            }

            let method = header.member().map(|member| member.to_string()).unwrap_or_default();
            let args = serde_json::Value::String(format!("{:?}", message.body()));
            // Invocation serials share the owner's handle counter (not a
            // per-registration counter) so that OBJECT_METHOD_RESPONSE,
            // which carries only the serial, unambiguously resolves back to
            // this registration's `pending` table even when a peer has
            // several objects registered at once.
            let invocation_serial = next_handle.fetch_add(1, Ordering::Relaxed);

            pending.write().await.insert(invocation_serial, message.clone());

            let _ = events_tx
                .send(AgentEvent::ObjectMethodCall {
                    reg_id,
                    invocation_serial,
                    method,
                    args,
                })
                .await;
        }

        debug!(reg_id, "Object dispatch watcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> (Arc<BusAgent>, mpsc::Receiver<AgentEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (BusAgent::new(tx), rx)
    }

    #[tokio::test]
    async fn alias_resolves_before_connecting() {
        let (agent, _rx) = agent();
        agent.create_address_alias("work-bus", "unix:abstract=/tmp/work").await;

        assert_eq!(agent.resolve_address("work-bus").await, "unix:abstract=/tmp/work");
        assert_eq!(agent.resolve_address("unix:path=/tmp/other").await, "unix:path=/tmp/other");
    }

    #[tokio::test]
    async fn closing_unknown_connection_is_invalid_handle() {
        let (agent, _rx) = agent();
        let err = agent.close_connection(999).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidHandle));
    }

    #[tokio::test]
    async fn closing_unknown_proxy_is_invalid_handle() {
        let (agent, _rx) = agent();
        assert!(matches!(agent.close_proxy(1).await, Err(AgentError::InvalidHandle)));
    }

    #[tokio::test]
    async fn unregistering_unknown_object_is_invalid_handle() {
        let (agent, _rx) = agent();
        assert!(matches!(agent.unregister_object(1).await, Err(AgentError::InvalidHandle)));
    }

    #[tokio::test]
    async fn unowning_unknown_name_is_invalid_handle() {
        let (agent, _rx) = agent();
        assert!(matches!(agent.unown_name(1).await, Err(AgentError::InvalidHandle)));
    }

    #[tokio::test]
    async fn handle_ids_increase_monotonically_within_an_owner() {
        let (agent, _rx) = agent();
        let first = agent.alloc_handle();
        let second = agent.alloc_handle();
        let third = agent.alloc_handle();
        assert!(first < second);
        assert!(second < third);
    }
}
