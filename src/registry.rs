//! remux/src/registry.rs
//! Name -> factory registries for the pluggable pieces of the pipeline:
//! tunnel dialers/listeners, inbound/outbound proxy plugins, and wrappers.
//! Registering a name twice is a programmer error and panics; looking up a
//! name nobody registered is a normal, reportable error.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use lazy_static::lazy_static;

use crate::bridge::Bridge;
use crate::error::{RemuxError, Result};
use crate::tunnel::{BoxedStream, TcpDialer, TcpListener, TunnelDialer, TunnelListener};
use crate::wrapper::Wrapper;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An inbound plugin accepts a raw connection and speaks whatever protocol
/// its name implies (SOCKS5, HTTP CONNECT, ...) to learn the real
/// destination, then relays bytes between the client and a bridge.
#[async_trait]
pub trait Inbound: Send + Sync {
    async fn relay(&self, client: BoxedStream, bridge: Arc<Bridge>) -> Result<()>;
}

/// An outbound plugin dials the real destination on behalf of a bridge and
/// relays bytes between it and the agent's side of the connection.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn handle(&self, bridge: Arc<Bridge>, destination: &str) -> Result<()>;
}

pub type DialerFactory = Arc<dyn Fn(&HashMap<String, String>) -> Result<Box<dyn TunnelDialer>> + Send + Sync>;
pub type ListenerFactory =
    Arc<dyn for<'a> Fn(&'a HashMap<String, String>) -> BoxFuture<'a, Result<Box<dyn TunnelListener>>> + Send + Sync>;
pub type InboundFactory = Arc<dyn Fn(&HashMap<String, String>) -> Result<Arc<dyn Inbound>> + Send + Sync>;
pub type OutboundFactory = Arc<dyn Fn(&HashMap<String, String>) -> Result<Arc<dyn Outbound>> + Send + Sync>;
pub type WrapperFactory = Arc<dyn Fn(&HashMap<String, String>) -> Result<Box<dyn Wrapper>> + Send + Sync>;

lazy_static! {
    static ref DIALER_REGISTRY: DashMap<String, DialerFactory> = DashMap::new();
    static ref LISTENER_REGISTRY: DashMap<String, ListenerFactory> = DashMap::new();
    static ref INBOUND_REGISTRY: DashMap<String, InboundFactory> = DashMap::new();
    static ref OUTBOUND_REGISTRY: DashMap<String, OutboundFactory> = DashMap::new();
    static ref WRAPPER_REGISTRY: DashMap<String, WrapperFactory> = DashMap::new();
}

macro_rules! registry_pair {
    ($register:ident, $create:ident, $map:ident, $kind:literal, $out:ty) => {
        pub fn $register(name: impl Into<String>, factory: $out) {
            let name = name.into();
            if $map.contains_key(&name) {
                panic!("{} [{}] is already registered", $kind, name);
            }
            $map.insert(name, factory);
        }
    };
}

registry_pair!(register_dialer, create_dialer, DIALER_REGISTRY, "tunnel dialer", DialerFactory);
registry_pair!(register_listener, create_listener, LISTENER_REGISTRY, "tunnel listener", ListenerFactory);
registry_pair!(register_inbound, create_inbound, INBOUND_REGISTRY, "inbound", InboundFactory);
registry_pair!(register_outbound, create_outbound, OUTBOUND_REGISTRY, "outbound", OutboundFactory);
registry_pair!(register_wrapper, create_wrapper, WRAPPER_REGISTRY, "wrapper", WrapperFactory);

pub fn create_dialer(name: &str, opts: &HashMap<String, String>) -> Result<Box<dyn TunnelDialer>> {
    let factory = DIALER_REGISTRY
        .get(name)
        .ok_or_else(|| RemuxError::NotRegistered { kind: "tunnel dialer", name: name.to_string() })?;
    factory(opts)
}

pub async fn create_listener(name: &str, opts: &HashMap<String, String>) -> Result<Box<dyn TunnelListener>> {
    let factory = LISTENER_REGISTRY
        .get(name)
        .ok_or_else(|| RemuxError::NotRegistered { kind: "tunnel listener", name: name.to_string() })?
        .clone();
    factory(opts).await
}

pub fn create_inbound(name: &str, opts: &HashMap<String, String>) -> Result<Arc<dyn Inbound>> {
    let factory = INBOUND_REGISTRY
        .get(name)
        .ok_or_else(|| RemuxError::NotRegistered { kind: "inbound", name: name.to_string() })?;
    factory(opts)
}

pub fn create_outbound(name: &str, opts: &HashMap<String, String>) -> Result<Arc<dyn Outbound>> {
    let factory = OUTBOUND_REGISTRY
        .get(name)
        .ok_or_else(|| RemuxError::NotRegistered { kind: "outbound", name: name.to_string() })?;
    factory(opts)
}

pub fn create_wrapper(name: &str, opts: &HashMap<String, String>) -> Result<Box<dyn Wrapper>> {
    let factory = WRAPPER_REGISTRY
        .get(name)
        .ok_or_else(|| RemuxError::NotRegistered { kind: "wrapper", name: name.to_string() })?;
    factory(opts)
}

/// A raw passthrough inbound/outbound pair: the inbound skips protocol
/// sniffing and relays bytes as-is; the outbound dials the destination
/// verbatim. Registered so the plugin registries are exercisable without any
/// of the concrete application protocols those registries are meant for.
pub struct RawInbound;

#[async_trait]
impl Inbound for RawInbound {
    async fn relay(&self, client: BoxedStream, bridge: Arc<Bridge>) -> Result<()> {
        bridge.pump(client).await
    }
}

pub struct RawOutbound;

#[async_trait]
impl Outbound for RawOutbound {
    async fn handle(&self, bridge: Arc<Bridge>, destination: &str) -> Result<()> {
        let remote = TcpDialer.dial(destination).await?;
        bridge.pump(remote).await
    }
}

/// Registers the built-in TCP transport and raw plugin pair. Call once
/// during startup before any tunnel or agent lookups the name `tcp`/`raw`.
pub fn register_builtins() {
    register_dialer("tcp", Arc::new(|_opts: &HashMap<String, String>| -> Result<Box<dyn TunnelDialer>> {
        Ok(Box::new(TcpDialer))
    }));
    register_listener(
        "tcp",
        Arc::new(|opts: &HashMap<String, String>| -> BoxFuture<'_, Result<Box<dyn TunnelListener>>> {
            let addr = opts.get("addr").cloned().unwrap_or_else(|| "0.0.0.0:0".to_string());
            Box::pin(async move {
                TcpListener::bind(&addr).await.map(|l| Box::new(l) as Box<dyn TunnelListener>)
            })
        }),
    );
    register_inbound("raw", Arc::new(|_opts: &HashMap<String, String>| -> Result<Arc<dyn Inbound>> {
        Ok(Arc::new(RawInbound))
    }));
    register_outbound("raw", Arc::new(|_opts: &HashMap<String, String>| -> Result<Arc<dyn Outbound>> {
        Ok(Arc::new(RawOutbound))
    }));
}

static BUILTINS_ONCE: std::sync::Once = std::sync::Once::new();

/// Calls `register_builtins` exactly once per process, regardless of how
/// many times a Console gets constructed.
pub fn register_builtins_once() {
    BUILTINS_ONCE.call_once(register_builtins);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creating_unregistered_dialer_errors() {
        let err = create_dialer("nonexistent-scheme", &HashMap::new()).unwrap_err();
        assert!(matches!(err, RemuxError::NotRegistered { .. }));
    }

    #[test]
    fn register_builtins_is_idempotent_to_call_once() {
        register_builtins_once();
        register_builtins_once();
        let opts = HashMap::new();
        assert!(create_dialer("tcp", &opts).is_ok());
        assert!(create_inbound("raw", &opts).is_ok());
        assert!(create_outbound("raw", &opts).is_ok());
    }
}
