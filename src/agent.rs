//! remux/src/agent.rs
//! An Agent owns one multiplexed connection to a peer and everything routed
//! over it. It speaks the login/accept handshake, dispatches
//! `Control` messages to set up routing, and fans `Packet`/`ConnStart`/
//! `ConnEnd` traffic out to the Bridges it owns. Forking shares the parent's
//! outbound channel (and so its underlying connection) while giving the
//! fork its own inbound queue, the same way a redirect hop reuses a
//! transport without reusing its owner's identity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use async_trait::async_trait;
use dashmap::DashMap;
use lazy_static::lazy_static;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, MessageSink};
use crate::chan::{ChanMod, Channel};
use crate::config::{Config, Mod};
use crate::error::{RemuxError, Result};
use crate::message::{self, Ack, Control, ConnEnd, ConnStart, Login, Message, Packet, Pong};
use crate::registry::{self, Inbound, Outbound};
use crate::tunnel::BoxedStream;

pub const DEFAULT_KEY: &str = "remux-preshared-default-key";
const MONITOR_INTERVAL_SECS: u64 = 30;
const HISTORY_CAPACITY: usize = 256;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

lazy_static! {
    static ref AGENTS: DashMap<String, Arc<Agent>> = DashMap::new();
}

pub fn agent_exists(id: &str) -> bool {
    AGENTS.contains_key(id)
}

pub fn agent_get(id: &str) -> Option<Arc<Agent>> {
    AGENTS.get(id).map(|e| e.clone())
}

pub fn agent_remove(id: &str) {
    AGENTS.remove(id);
}

/// Closes and removes every registered agent, used by the FFI `CleanupAgent`
/// entry point to tear a host-embedded process down cleanly.
pub async fn close_all_agents() {
    let agents: Vec<Arc<Agent>> = AGENTS.iter().map(|e| e.value().clone()).collect();
    for agent in agents {
        agent.close(Some("cleanup requested".into())).await;
    }
}

fn derive_key32(key: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, b) in key.iter().cycle().take(32).enumerate() {
        out[i] = *b;
    }
    out
}

fn derive_iv16(key: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    let n = key.len().min(16);
    out[..n].copy_from_slice(&key[..n]);
    out
}

/// Proves knowledge of `auth_key` by AES-256-CBC encrypting `id`, hex-encoded
/// so it travels safely inside a text field.
pub fn compute_token(auth_key: &[u8], id: &str) -> String {
    let key32 = derive_key32(auth_key);
    let iv16 = derive_iv16(auth_key);
    let enc = Aes256CbcEnc::new(&key32.into(), &iv16.into());
    let ciphertext = enc.encrypt_padded_vec_mut::<Pkcs7>(id.as_bytes());
    hex::encode(ciphertext)
}

pub fn verify_token(auth_key: &[u8], id: &str, token: &str) -> bool {
    let Ok(bytes) = hex::decode(token) else { return false };
    let key32 = derive_key32(auth_key);
    let iv16 = derive_iv16(auth_key);
    let dec = Aes256CbcDec::new(&key32.into(), &iv16.into());
    let mut buf = bytes;
    match dec.decrypt_padded_mut::<Pkcs7>(&mut buf) {
        Ok(plain) => plain == id.as_bytes(),
        Err(_) => false,
    }
}

fn random_id() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..8).map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentType {
    Server,
    Client,
    Redirect,
}

pub struct Agent {
    pub id: String,
    pub config: Config,
    pub agent_type: AgentType,
    closed: AtomicBool,
    init: AtomicBool,
    init_notify: tokio::sync::Notify,
    conn_count: AtomicU64,
    conn_index: AtomicU64,
    outbound: Option<Arc<dyn Outbound>>,
    inbound: Option<Arc<dyn Inbound>>,
    pub send_chan: Arc<Channel>,
    wire_chan: Arc<Channel>,
    receive_chan: Arc<Channel>,
    cancel: CancellationToken,
    bridges: DashMap<u64, Arc<Bridge>>,
    history: Mutex<VecDeque<String>>,
}

#[async_trait]
impl MessageSink for Agent {
    async fn send(&self, id: u64, msg: Message) -> Result<()> {
        self.send_chan.send(id, msg).await
    }

    fn pending_count(&self, id: u64) -> i64 {
        self.send_chan.get_pending_count(id)
    }

    fn agent_id(&self) -> &str {
        &self.id
    }
}

impl Agent {
    /// Creates and registers a new Agent. `alias` becomes the agent id if
    /// given; otherwise a random 8-character id is generated. Fails if the id
    /// is already taken.
    pub fn new(config: Config, agent_type: AgentType) -> Result<Arc<Agent>> {
        let id = config.alias.clone().unwrap_or_else(random_id);
        if agent_exists(&id) {
            return Err(RemuxError::AgentExists(id));
        }
        let outbound = registry::create_outbound("raw", &config.params).ok();
        let inbound = registry::create_inbound("raw", &config.params).ok();
        let agent = Arc::new(Agent {
            id: id.clone(),
            config,
            agent_type,
            closed: AtomicBool::new(false),
            init: AtomicBool::new(false),
            init_notify: tokio::sync::Notify::new(),
            conn_count: AtomicU64::new(0),
            conn_index: AtomicU64::new(0),
            outbound,
            inbound,
            send_chan: Arc::new(Channel::new(ChanMod::Sender, "send")),
            wire_chan: Arc::new(Channel::new(ChanMod::Receiver, "wire")),
            receive_chan: Arc::new(Channel::new(ChanMod::Receiver, "receive")),
            cancel: CancellationToken::new(),
            bridges: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        });
        AGENTS.insert(id, agent.clone());
        Ok(agent)
    }

    fn log(&self, line: impl Into<String>) {
        let mut h = self.history.lock().unwrap();
        if h.len() == HISTORY_CAPACITY {
            h.pop_front();
        }
        h.push_back(line.into());
    }

    pub fn history_log(&self) -> Vec<String> {
        self.history.lock().unwrap().iter().cloned().collect()
    }

    /// The side that performs the listening half of a routing pair: always
    /// true for a Server agent, and true for a Client agent when a Control
    /// it is processing did not originate from itself.
    pub fn is_accept(&self, ctrl: &Control) -> bool {
        matches!(self.agent_type, AgentType::Server)
            || (matches!(self.agent_type, AgentType::Client) && self.id != ctrl.source)
    }

    pub fn is_destination(&self, ctrl: &Control) -> bool {
        ctrl.destination == self.id
    }

    pub fn is_init(&self) -> bool {
        self.init.load(Ordering::SeqCst)
    }

    /// Waits until the first Control exchange completes and `init` flips
    /// true. Takes out the `Notified` future before re-checking the flag so
    /// a `notify_waiters` that lands between the check and the await isn't
    /// missed.
    pub async fn wait_init(&self) {
        if self.is_init() {
            return;
        }
        let notified = self.init_notify.notified();
        if self.is_init() {
            return;
        }
        notified.await;
    }

    /// Builds the Login handshake message a Client presents to a Server.
    pub fn build_login(&self) -> Login {
        let console = self.config.console_urls.first();
        Login {
            agent: self.id.clone(),
            console_proto: console.map(|u| u.scheme.clone()).unwrap_or_default(),
            console_ip: console.map(|u| u.host.clone()).unwrap_or_default(),
            console_port: console.map(|u| u.port).unwrap_or(0),
            r#mod: self.config.r#mod.as_str().to_string(),
            token: compute_token(&self.config.auth_key, &self.id),
            interfaces: self.config.interfaces.clone(),
            hostname: self.config.hostname.clone(),
            username: self.config.username.clone(),
        }
    }

    /// Client side of the handshake: sends Login, waits for a successful Ack.
    pub async fn login<S: AsyncRead + AsyncWrite + Unpin>(&self, conn: &mut S) -> Result<Ack> {
        let login = self.build_login();
        message::write_and_assert(conn, &Message::Login(login)).await
    }

    /// Server side of the handshake: reads Login, verifies the token, replies
    /// with Ack, then reads the Control the peer sends right after and Acks
    /// that too, handing both back so the caller can construct the Agent and
    /// dispatch the Control through `handler_control`.
    pub async fn accept<S: AsyncRead + AsyncWrite + Unpin>(
        conn: &mut S,
        auth_key: &[u8],
    ) -> Result<(Login, Control)> {
        let msg = message::read_and_assert(conn, 1).await?;
        let Message::Login(login) = msg else { unreachable!() };
        if !verify_token(auth_key, &login.agent, &login.token) {
            message::write_message(conn, &Message::Ack(Ack::failed("invalid token"))).await?;
            return Err(RemuxError::InvalidToken);
        }
        message::write_message(conn, &Message::Ack(Ack::success())).await?;

        let ctrl_msg = message::read_and_assert(conn, 3).await?;
        let Message::Control(ctrl) = ctrl_msg else { unreachable!() };
        message::write_message(conn, &Message::Ack(Ack::success())).await?;
        Ok((login, ctrl))
    }

    /// Spawns the sender/receiver pumps for this agent's transport, dispatches
    /// `initial_control` (the Control read during the handshake, present on
    /// the accept side only) before flipping `init`, then processes inbound
    /// messages until the connection or agent closes.
    pub async fn handler<S>(self: Arc<Self>, conn: S, initial_control: Option<Control>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(conn);
        let sender = self.clone();
        let sender_task = tokio::spawn(async move { sender.send_chan.sender_loop(write_half).await });

        let internal = self.receive_chan.clone();
        let receiver = self.clone();
        let receiver_task =
            tokio::spawn(async move { receiver.wire_chan.receiver_loop(read_half, &internal).await });

        let mut inbound = self
            .receive_chan
            .take_receiver()
            .ok_or(RemuxError::ChannelClosed)?;

        if let Some(ctrl) = initial_control {
            if let Err(e) = self.handler_control(ctrl).await {
                warn!(agent = %self.id, error = %e, "initial control handling failed");
            }
        }
        self.init.store(true, Ordering::SeqCst);
        self.init_notify.notify_waiters();
        self.monitor();

        let result = self.dispatch_loop(&mut inbound).await;

        sender_task.abort();
        receiver_task.abort();
        result
    }

    async fn dispatch_loop(
        self: &Arc<Self>,
        inbound: &mut tokio::sync::mpsc::Receiver<(u64, Message)>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                item = inbound.recv() => {
                    match item {
                        Some((_, msg)) => self.handle_message(msg).await?,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    pub async fn handle_message(self: &Arc<Self>, msg: Message) -> Result<()> {
        match msg {
            Message::Ping(_) => {
                self.send_chan.send(0, Message::Pong(Pong { pong: "pong".into() })).await?;
            }
            Message::Pong(_) => {
                debug!(agent = %self.id, "pong received");
            }
            Message::ConnStart(cs) => self.handle_conn_start(cs).await?,
            Message::Packet(p) => self.handle_packet(p).await?,
            Message::ConnEnd(ce) => self.handle_conn_end(ce).await,
            Message::Control(ctrl) => self.handler_control(ctrl).await?,
            Message::Redirect(r) => self.handle_redirect(r).await?,
            Message::Login(_) | Message::Ack(_) => {
                warn!(agent = %self.id, "unexpected handshake message after handler start");
            }
        }
        Ok(())
    }

    async fn handle_conn_start(self: &Arc<Self>, cs: ConnStart) -> Result<()> {
        let sink: Arc<dyn MessageSink> = self.clone();
        let bridge = Bridge::new_remote_side(cs.id, sink, cs.destination.clone());
        self.bridges.insert(cs.id, bridge.clone());
        self.conn_count.fetch_add(1, Ordering::Relaxed);
        self.conn_index.fetch_add(1, Ordering::Relaxed);
        if let Some(outbound) = self.outbound.clone() {
            let destination = self
                .config
                .remote_url
                .as_ref()
                .map(|u| u.addr())
                .unwrap_or(cs.source);
            let agent = self.clone();
            tokio::spawn(async move {
                if let Err(e) = outbound.handle(bridge.clone(), &destination).await {
                    warn!(agent = %agent.id, bridge = bridge.id, error = %e, "outbound handler failed");
                }
                let _ = bridge.close().await;
                agent.bridges.remove(&bridge.id);
            });
        }
        Ok(())
    }

    async fn handle_packet(&self, p: Packet) -> Result<()> {
        if let Some(bridge) = self.bridges.get(&p.id) {
            bridge.push_data(&p.data).await?;
        } else {
            warn!(agent = %self.id, bridge = p.id, "packet for unknown bridge dropped");
        }
        Ok(())
    }

    async fn handle_conn_end(&self, ce: ConnEnd) {
        if let Some((_, bridge)) = self.bridges.remove(&ce.id) {
            let _ = bridge.close().await;
        }
    }

    async fn handle_redirect(self: &Arc<Self>, r: crate::message::Redirect) -> Result<()> {
        if r.destination == self.id {
            let inner = message::unwrap(r);
            return Box::pin(self.handle_message(inner)).await;
        }
        match agent_get(&r.destination) {
            Some(target) => {
                let inner = message::unwrap(r);
                Box::pin(target.handle_message(inner)).await
            }
            None => {
                warn!(agent = %self.id, destination = %r.destination, "no local route for redirect, dropping");
                Ok(())
            }
        }
    }

    /// Dispatches a Control message by (mod, fork, is_accept): a forked
    /// control spins up a sibling Agent sharing this one's transport;
    /// otherwise the (mod, is_accept) pair decides which side of the route
    /// actively listens and which reacts to the `ConnStart` the listening
    /// side later sends:
    ///
    /// | mod     | accept | action                          |
    /// |---------|--------|----------------------------------|
    /// | reverse | true   | listen+serve on `ctrl.local`      |
    /// | reverse | false  | reactive: outbound dials on ConnStart |
    /// | proxy   | true   | reactive: outbound dials on ConnStart |
    /// | proxy   | false  | listen+serve on `ctrl.remote`     |
    /// | connect | any    | no-op                             |
    /// | other   | any    | unsupported                       |
    pub async fn handler_control(self: &Arc<Self>, ctrl: Control) -> Result<()> {
        if ctrl.fork {
            let forked = self.fork(ctrl).await?;
            info!(parent = %self.id, forked = %forked.id, "agent forked for control message");
            return Ok(());
        }
        let accept = self.is_accept(&ctrl);
        let r#mod = Mod::parse(&ctrl.r#mod).ok_or_else(|| RemuxError::UnsupportedMod(ctrl.r#mod.clone()))?;
        debug!(agent = %self.id, r#mod = %ctrl.r#mod, accept, "control message processed");
        match (r#mod, accept) {
            (Mod::Reverse, true) => {
                let url = ctrl.local_url()?;
                self.clone().listen_and_serve(url).await?;
            }
            (Mod::Reverse, false) => {
                debug!(agent = %self.id, "reverse/connect side, awaiting ConnStart to dial out");
            }
            (Mod::Proxy, true) => {
                debug!(agent = %self.id, "proxy/accept side, awaiting ConnStart to dial out");
            }
            (Mod::Proxy, false) => {
                let url = ctrl.remote_url()?;
                self.clone().listen_and_serve(url).await?;
            }
            (Mod::Connect, _) => {}
            (Mod::Bind, _) => return Err(RemuxError::UnsupportedMod(ctrl.r#mod.clone())),
        }
        Ok(())
    }

    /// Listens on `url` and, for each accepted connection, opens a local-side
    /// Bridge (announcing it to the peer via `ConnStart`) and drives it
    /// through this agent's inbound plugin.
    pub async fn listen_and_serve(self: Arc<Self>, url: crate::url::TunnelUrl) -> Result<()> {
        let mut opts = url.options();
        opts.insert("addr".to_string(), url.addr());
        let listener = registry::create_listener(&url.tunnel, &opts).await?;
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let agent = self.clone();
                        tokio::spawn(async move {
                            agent.serve_accepted(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!(agent = %self.id, error = %e, "listen_and_serve accept failed, stopping listener");
                        self.close(Some(format!("listener error: {e}"))).await;
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    /// Wraps one accepted connection in a local-side Bridge and relays it
    /// through this agent's inbound plugin (falling back to a raw pump if
    /// none is configured) until the peer closes or the bridge drains.
    async fn serve_accepted(self: Arc<Self>, stream: BoxedStream, peer: String) {
        let id = rand::thread_rng().gen::<u64>();
        let sink: Arc<dyn MessageSink> = self.clone();
        let bridge = match Bridge::new_local_side(id, sink, self.id.clone(), self.id.clone()).await {
            Ok(b) => b,
            Err(e) => {
                warn!(agent = %self.id, peer = %peer, error = %e, "failed to announce local-side bridge");
                return;
            }
        };
        self.bridges.insert(id, bridge.clone());
        self.conn_count.fetch_add(1, Ordering::Relaxed);
        self.conn_index.fetch_add(1, Ordering::Relaxed);
        let result = match self.inbound.clone() {
            Some(inbound) => inbound.relay(stream, bridge.clone()).await,
            None => bridge.pump(stream).await,
        };
        if let Err(e) = result {
            warn!(agent = %self.id, bridge = bridge.id, peer = %peer, error = %e, "inbound relay failed");
        }
        let _ = bridge.close().await;
        self.bridges.remove(&bridge.id);
    }

    /// Creates a sibling Agent sharing this one's outbound channel (and so
    /// its connection), with its own inbound queue and routing config.
    pub async fn fork(self: &Arc<Self>, ctrl: Control) -> Result<Arc<Agent>> {
        let cfg = self.config.clone_for_fork(&ctrl);
        let id = random_id();
        if agent_exists(&id) {
            return Err(RemuxError::AgentExists(id));
        }
        let forked = Arc::new(Agent {
            id: id.clone(),
            config: cfg,
            agent_type: AgentType::Redirect,
            closed: AtomicBool::new(false),
            init: AtomicBool::new(true),
            init_notify: tokio::sync::Notify::new(),
            conn_count: AtomicU64::new(0),
            conn_index: AtomicU64::new(0),
            outbound: self.outbound.clone(),
            inbound: self.inbound.clone(),
            send_chan: self.send_chan.clone(),
            wire_chan: Arc::new(Channel::new(ChanMod::Receiver, format!("wire-{id}"))),
            receive_chan: Arc::new(Channel::new(ChanMod::Receiver, format!("receive-{id}"))),
            cancel: CancellationToken::new(),
            bridges: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        });
        AGENTS.insert(id, forked.clone());
        Ok(forked)
    }

    /// Builds the Control message used to request a new route from a peer.
    pub fn dial_control(&self, remote: &str, local: &str, destination: &str) -> Control {
        Control {
            r#mod: self.config.r#mod.as_str().to_string(),
            remote: remote.to_string(),
            local: local.to_string(),
            source: self.id.clone(),
            destination: destination.to_string(),
            options: Default::default(),
            fork: false,
        }
    }

    /// Periodic tracing of connection and channel throughput.
    fn monitor(self: &Arc<Self>) {
        let agent = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(MONITOR_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = agent.cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        info!(
                            agent = %agent.id,
                            conn_count = agent.conn_count.load(Ordering::Relaxed),
                            conn_index = agent.conn_index.load(Ordering::Relaxed),
                            send_bytes = agent.send_chan.stats.bytes(),
                            recv_bytes = agent.receive_chan.stats.bytes(),
                            "agent monitor tick"
                        );
                    }
                }
            }
        });
    }

    /// Idempotent teardown: cancels the dispatch loop, closes every bridge,
    /// closes both channels, and drops this agent from the registry.
    pub async fn close(&self, reason: Option<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reason) = &reason {
            self.log(format!("closing: {reason}"));
        }
        self.cancel.cancel();
        for entry in self.bridges.iter() {
            let _ = entry.value().close().await;
        }
        self.bridges.clear();
        self.send_chan.close();
        self.receive_chan.close();
        agent_remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_with_matching_key() {
        let key = b"test-key";
        let token = compute_token(key, "agent-42");
        assert!(verify_token(key, "agent-42", &token));
        assert!(!verify_token(key, "agent-43", &token));
    }

    #[test]
    fn token_rejects_wrong_key() {
        let token = compute_token(b"key-a", "agent-1");
        assert!(!verify_token(b"key-b", "agent-1", &token));
    }

    #[tokio::test]
    async fn new_agent_rejects_duplicate_alias() {
        let mut cfg = Config::default();
        cfg.alias = Some(format!("dup-test-{}", random_id()));
        let agent = Agent::new(cfg.clone(), AgentType::Client).unwrap();
        let err = Agent::new(cfg, AgentType::Client).unwrap_err();
        assert!(matches!(err, RemuxError::AgentExists(_)));
        agent.close(None).await;
    }

    #[tokio::test]
    async fn login_then_accept_succeeds_over_duplex_pipe() {
        let mut cfg = Config::default();
        cfg.alias = Some(format!("login-test-{}", random_id()));
        let agent = Agent::new(cfg, AgentType::Client).unwrap();
        let (mut a, mut b) = tokio::io::duplex(4096);
        let auth_key = agent.config.auth_key.clone();
        let agent2 = agent.clone();
        let agent_id = agent.id.clone();
        let client = tokio::spawn(async move {
            agent2.login(&mut a).await?;
            let ctrl = agent2.dial_control("", "", &agent_id);
            message::write_and_assert(&mut a, &Message::Control(ctrl)).await
        });
        let (login, ctrl) = Agent::accept(&mut b, &auth_key).await.unwrap();
        assert_eq!(login.agent, agent.id);
        assert_eq!(ctrl.destination, agent.id);
        let ack = client.await.unwrap().unwrap();
        assert!(ack.is_success());
        agent.close(None).await;
    }

    #[tokio::test]
    async fn handler_flips_init_after_initial_control() {
        let mut cfg = Config::default();
        cfg.alias = Some(format!("init-test-{}", random_id()));
        let agent = Agent::new(cfg, AgentType::Server).unwrap();
        assert!(!agent.is_init());
        let (a, _b) = tokio::io::duplex(4096);
        let ctrl = Control { r#mod: "connect".into(), ..Default::default() };
        let handler_agent = agent.clone();
        tokio::spawn(async move {
            let _ = handler_agent.handler(a, Some(ctrl)).await;
        });
        agent.wait_init().await;
        assert!(agent.is_init());
        agent.close(None).await;
    }
}
