//! remux/src/tunnel.rs
//! The dialer/listener pipeline a Console builds a transport from.
//! A `TunnelService` wraps one concrete `TunnelDialer`/`TunnelListener` with
//! an ordered chain of hooks — TLS, compression, wrapper ciphers, proxy
//! chaining — applied before and after the raw dial/accept/listen call.
//! Hooks with equal standing run in registration order; the `after` chain is
//! stable-sorted by descending priority so TLS (highest) always wraps
//! everything registered under it.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{RemuxError, Result};
use crate::wrapper::{WrapperChain, WrapperOption, WrapperOptions};

pub const DEFAULT_HOOK_PRIORITY: u32 = 10;
pub const WRAPPER_PRIORITY: u32 = DEFAULT_HOOK_PRIORITY + 10;
pub const TLS_PRIORITY: u32 = u32::MAX - 10;
pub const TLS_IN_TLS_PRIORITY: u32 = TLS_PRIORITY - 100;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncReadWrite for T {}

pub type BoxedStream = Pin<Box<dyn AsyncReadWrite>>;

#[async_trait]
pub trait TunnelDialer: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<BoxedStream>;
}

#[async_trait]
pub trait TunnelListener: Send + Sync {
    async fn accept(&self) -> Result<(BoxedStream, String)>;
    fn local_addr(&self) -> Result<String>;
}

#[async_trait]
pub trait DialHook: Send + Sync {
    async fn on_dial(&self, stream: BoxedStream, addr: &str) -> Result<BoxedStream>;
}

#[async_trait]
pub trait AcceptHook: Send + Sync {
    async fn on_accept(&self, stream: BoxedStream) -> Result<BoxedStream>;
}

struct HookEntry {
    priority: u32,
    dial: Option<Arc<dyn DialHook>>,
    accept: Option<Arc<dyn AcceptHook>>,
}

/// Builds and owns the dialer/listener plus the hook chain applied around
/// every dial/accept; one instance backs one tunnel+scheme URL.
pub struct TunnelService {
    dialer: Option<Box<dyn TunnelDialer>>,
    listener: Option<Box<dyn TunnelListener>>,
    hooks: Vec<HookEntry>,
    pub meta: HashMap<String, String>,
}

impl TunnelService {
    pub fn new(dialer: Option<Box<dyn TunnelDialer>>, listener: Option<Box<dyn TunnelListener>>) -> TunnelService {
        TunnelService { dialer, listener, hooks: Vec::new(), meta: HashMap::new() }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    fn add_hook(&mut self, priority: u32, dial: Option<Arc<dyn DialHook>>, accept: Option<Arc<dyn AcceptHook>>) {
        self.hooks.push(HookEntry { priority, dial, accept });
        // Stable sort descending by priority: highest-priority hooks (TLS)
        // wrap outermost, applied last on dial, first on accept-teardown.
        self.hooks.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn with_tls(mut self, connector: TlsConnector, acceptor: TlsAcceptor, server_name: String) -> Self {
        let dial = Arc::new(TlsDialHook { connector, server_name });
        let accept = Arc::new(TlsAcceptHook { acceptor });
        self.add_hook(TLS_PRIORITY, Some(dial), Some(accept));
        self
    }

    pub fn with_wrapper_hook(mut self, priority_offset: i64, dial: Option<Arc<dyn DialHook>>, accept: Option<Arc<dyn AcceptHook>>) -> Self {
        let priority = (WRAPPER_PRIORITY as i64 + priority_offset).max(0) as u32;
        self.add_hook(priority, dial, accept);
        self
    }

    /// Wraps a TLS session inside an already-wrapped connection (e.g. inside
    /// an outer TLS tunnel), at a priority below the outer `with_tls` layer so
    /// it applies after the outer handshake on dial and before it unwinds on
    /// accept.
    pub fn with_tls_in_tls(mut self, connector: TlsConnector, acceptor: TlsAcceptor, server_name: String) -> Self {
        let dial = Arc::new(TlsDialHook { connector, server_name });
        let accept = Arc::new(TlsAcceptHook { acceptor });
        self.add_hook(TLS_IN_TLS_PRIORITY, Some(dial), Some(accept));
        self
    }

    /// Adds a Snappy-only wrapper hook. Offsets `WRAPPER_PRIORITY` down for a
    /// listener (so compression applies closest to the wire, before any
    /// other wrapper's framing is stripped) and up for a dialer, mirroring
    /// the client/server asymmetry of every other wrapper hook pair.
    pub fn with_compression(mut self) -> Self {
        let offset: i64 = if self.listener.is_some() { -5 } else { 5 };
        let options: WrapperOptions = vec![WrapperOption { name: "snappy".to_string(), options: HashMap::new() }];
        let dial = Arc::new(WrapperDialHook { options: options.clone(), key: Vec::new() });
        let accept = Arc::new(WrapperAcceptHook { options, key: Vec::new() });
        let priority = (WRAPPER_PRIORITY as i64 + offset).max(0) as u32;
        self.add_hook(priority, Some(dial), Some(accept));
        self
    }

    /// Wires a parsed wrapper chain description (cipher/padding/compression,
    /// as produced by `parse_wrapper_options`/`generate_random_wrapper_options`)
    /// into the pipeline at `WRAPPER_PRIORITY`, applied identically on dial
    /// and accept so both peers build the same stack.
    pub fn with_wrappers(mut self, options: WrapperOptions, key: Vec<u8>) -> Self {
        let dial = Arc::new(WrapperDialHook { options: options.clone(), key: key.clone() });
        let accept = Arc::new(WrapperAcceptHook { options, key });
        self.add_hook(WRAPPER_PRIORITY, Some(dial), Some(accept));
        self
    }

    /// Redirects dialing through the first hop of a proxy chain instead of
    /// the original address. Only first-hop TCP redirection is implemented;
    /// negotiating each hop's own proxy protocol is out of scope, matching
    /// this crate's `raw`-only transport support.
    pub fn with_proxy_client(mut self, urls: Vec<String>) -> Self {
        if let Some(first) = urls.first() {
            if let Ok(parsed) = crate::url::TunnelUrl::parse(first) {
                self.dialer = Some(Box::new(ProxyChainDialer { first_hop: parsed.addr() }));
            }
        }
        self
    }

    pub async fn dial(&self, addr: &str) -> Result<BoxedStream> {
        let dialer = self.dialer.as_ref().ok_or(RemuxError::NoDialer)?;
        let mut stream = dialer.dial(addr).await?;
        for hook in &self.hooks {
            if let Some(h) = &hook.dial {
                stream = h.on_dial(stream, addr).await?;
            }
        }
        Ok(stream)
    }

    pub async fn accept(&self) -> Result<(BoxedStream, String)> {
        let listener = self.listener.as_ref().ok_or(RemuxError::NoListener)?;
        let (mut stream, addr) = listener.accept().await?;
        for hook in &self.hooks {
            if let Some(h) = &hook.accept {
                stream = h.on_accept(stream).await?;
            }
        }
        Ok((stream, addr))
    }

    pub fn local_addr(&self) -> Result<String> {
        self.listener.as_ref().ok_or(RemuxError::NoListener)?.local_addr()
    }
}

struct TlsDialHook {
    connector: TlsConnector,
    server_name: String,
}

#[async_trait]
impl DialHook for TlsDialHook {
    async fn on_dial(&self, stream: BoxedStream, _addr: &str) -> Result<BoxedStream> {
        let name = tokio_rustls::rustls::pki_types::ServerName::try_from(self.server_name.clone())
            .map_err(|e| RemuxError::Hook(e.to_string()))?;
        let tls = self
            .connector
            .connect(name, stream)
            .await
            .map_err(|e| RemuxError::Hook(e.to_string()))?;
        Ok(Box::pin(tls))
    }
}

struct TlsAcceptHook {
    acceptor: TlsAcceptor,
}

#[async_trait]
impl AcceptHook for TlsAcceptHook {
    async fn on_accept(&self, stream: BoxedStream) -> Result<BoxedStream> {
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| RemuxError::Hook(e.to_string()))?;
        Ok(Box::pin(tls))
    }
}

struct WrapperDialHook {
    options: WrapperOptions,
    key: Vec<u8>,
}

#[async_trait]
impl DialHook for WrapperDialHook {
    async fn on_dial(&self, stream: BoxedStream, _addr: &str) -> Result<BoxedStream> {
        Ok(WrapperChain::build(stream, &self.options, &self.key)?.into_inner())
    }
}

struct WrapperAcceptHook {
    options: WrapperOptions,
    key: Vec<u8>,
}

#[async_trait]
impl AcceptHook for WrapperAcceptHook {
    async fn on_accept(&self, stream: BoxedStream) -> Result<BoxedStream> {
        Ok(WrapperChain::build(stream, &self.options, &self.key)?.into_inner())
    }
}

/// Dials the first hop of a proxy chain instead of the real destination.
struct ProxyChainDialer {
    first_hop: String,
}

#[async_trait]
impl TunnelDialer for ProxyChainDialer {
    async fn dial(&self, _addr: &str) -> Result<BoxedStream> {
        TcpDialer.dial(&self.first_hop).await
    }
}

/// The one concrete transport shipped in-tree: a plain TCP dialer/listener,
/// sufficient to exercise the pipeline above without pulling in any of the
/// other named-but-out-of-scope transports.
pub struct TcpDialer;

#[async_trait]
impl TunnelDialer for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<BoxedStream> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::pin(stream))
    }
}

pub struct TcpListener {
    inner: TokioTcpListener,
}

impl TcpListener {
    pub async fn bind(addr: &str) -> Result<TcpListener> {
        let inner = TokioTcpListener::bind(addr).await?;
        Ok(TcpListener { inner })
    }
}

#[async_trait]
impl TunnelListener for TcpListener {
    async fn accept(&self) -> Result<(BoxedStream, String)> {
        let (stream, peer) = self.inner.accept().await?;
        Ok((Box::pin(stream), peer.to_string()))
    }

    fn local_addr(&self) -> Result<String> {
        Ok(self.inner.local_addr()?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn tcp_dialer_and_listener_exchange_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let dialer = TcpDialer;
        let mut stream = dialer.dial(&addr).await.unwrap();
        stream.write_all(b"hello").await.unwrap();

        let got = accept_task.await.unwrap();
        assert_eq!(&got, b"hello");
    }

    #[test]
    fn hook_priority_constants_order_tls_above_wrapper() {
        assert!(TLS_PRIORITY > WRAPPER_PRIORITY);
        assert!(WRAPPER_PRIORITY > DEFAULT_HOOK_PRIORITY);
        assert!(TLS_IN_TLS_PRIORITY < TLS_PRIORITY);
    }
}
