//! remux/src/console.rs
//! The Console is the process entry point: it owns the Config, builds a
//! TunnelService from the console URL, and either listens for Agents to
//! connect (Server) or dials out and retries until one does (Client).
//! A forked subtree's subscription info is assembled here too, as plain
//! data — binding an HTTP listener for it is out of scope, so callers decide
//! how (or whether) to serve `SubscriptionInfo`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::agent::{Agent, AgentType};
use crate::config::Config;
use crate::error::Result;
use crate::message::{self, Message};
use crate::registry;
use crate::tls;
use crate::tunnel::TunnelService;
use crate::url::TunnelUrl;
use crate::wrapper;

/// Rule groups handed to a subscription client, the same three private
/// ranges the original grouped traffic by.
const SUBSCRIPTION_RULE_RANGES: [&str; 3] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub path: String,
    pub rules_yaml: String,
}

pub trait SubscriptionServer: Send + Sync {
    fn info(&self) -> SubscriptionInfo;
}

pub struct Console {
    pub config: Config,
    tunnel: Arc<TunnelService>,
}

impl Console {
    pub async fn new(config: Config) -> Result<Console> {
        registry::register_builtins_once();
        let console_url = config
            .console_urls
            .first()
            .cloned()
            .unwrap_or_else(|| TunnelUrl::parse_console("0.0.0.0:34996").unwrap());
        let tunnel = build_tunnel(&console_url, &config).await?;
        Ok(Console { config, tunnel: Arc::new(tunnel) })
    }

    pub fn is_server(&self) -> bool {
        self.config.is_server()
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        if self.is_server() {
            self.listen().await
        } else {
            self.dial_with_retry().await.map(|_| ())
        }
    }

    /// Server side: accepts connections, performs the handshake, and spawns
    /// one Agent handler task per accepted peer.
    pub async fn listen(self: &Arc<Self>) -> Result<()> {
        info!(addr = %self.tunnel.local_addr().unwrap_or_default(), "console listening");
        loop {
            let (mut stream, peer) = match self.tunnel.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed, continuing");
                    continue;
                }
            };
            let cfg = self.config.clone();
            tokio::spawn(async move {
                let (login, ctrl) = match Agent::accept(&mut stream, &cfg.auth_key).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "handshake failed");
                        return;
                    }
                };
                let mut agent_cfg = cfg.clone();
                agent_cfg.alias = Some(login.agent.clone());
                let agent = match Agent::new(agent_cfg, AgentType::Server) {
                    Ok(agent) => agent,
                    Err(e) => {
                        error!(peer = %peer, error = %e, "failed to register agent");
                        return;
                    }
                };
                info!(peer = %peer, agent = %agent.id, "agent connected");
                if let Err(e) = agent.clone().handler(stream, Some(ctrl)).await {
                    warn!(agent = %agent.id, error = %e, "agent handler exited with error");
                }
                agent.close(Some("connection closed".into())).await;
            });
        }
    }

    /// Client side: dials the console address, retrying up to `retry` times
    /// (0 means forever) with `retry_interval_secs` between attempts, then
    /// runs the handshake and spawns the Agent handler.
    pub async fn dial_with_retry(self: &Arc<Self>) -> Result<Arc<Agent>> {
        let mut attempt: u32 = 0;
        let addr = self.tunnel.local_addr().unwrap_or_default();
        loop {
            attempt += 1;
            match self.dial_once().await {
                Ok(agent) => return Ok(agent),
                Err(e) => {
                    warn!(attempt, addr = %addr, error = %e, "dial failed");
                    if self.config.retry != 0 && attempt >= self.config.retry {
                        return Err(e);
                    }
                    tokio::time::sleep(Duration::from_secs(self.config.retry_interval_secs)).await;
                }
            }
        }
    }

    /// Client dial sequence: dial the transport, run Login, then send the
    /// Control describing the route this agent wants, spawn the handler, and
    /// block until that handler has processed the first Control exchange and
    /// flipped `Agent.init`.
    async fn dial_once(self: &Arc<Self>) -> Result<Arc<Agent>> {
        let console_url = self
            .config
            .console_urls
            .first()
            .ok_or_else(|| crate::error::RemuxError::MissingOption("console_url"))?;
        let mut stream = self.tunnel.dial(&console_url.addr()).await?;
        let agent = Agent::new(self.config.clone(), AgentType::Client)?;
        agent.login(&mut stream).await?;

        let remote = self.config.remote_url.as_ref().map(|u| u.to_string()).unwrap_or_default();
        let local = self.config.local_url.as_ref().map(|u| u.to_string()).unwrap_or_default();
        let destination = self.config.redirect.clone().unwrap_or_else(|| agent.id.clone());
        let ctrl = agent.dial_control(&remote, &local, &destination);
        message::write_and_assert(&mut stream, &Message::Control(ctrl)).await?;

        let handler_agent = agent.clone();
        tokio::spawn(async move {
            if let Err(e) = handler_agent.clone().handler(stream, None).await {
                warn!(agent = %handler_agent.id, error = %e, "agent handler exited with error");
            }
            handler_agent.close(Some("connection closed".into())).await;
        });
        agent.wait_init().await;
        Ok(agent)
    }

    /// Assembles subscription data (rule groups plus a random-looking path)
    /// without binding anything to serve it over HTTP.
    pub fn subscription_info(&self) -> SubscriptionInfo {
        let path = format!("/{}", random_path_segment());
        let rules: Vec<String> = SUBSCRIPTION_RULE_RANGES
            .iter()
            .map(|range| format!("- MATCH,{range},direct"))
            .collect();
        SubscriptionInfo { path, rules_yaml: rules.join("\n") }
    }

    /// Renders the console URL this process can be reached/linked at, wrapper
    /// chain query parameters included.
    pub fn link(&self) -> String {
        self.config
            .console_urls
            .first()
            .map(|u| u.to_string())
            .unwrap_or_default()
    }
}

fn random_path_segment() -> String {
    use rand::Rng;
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..12).map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char).collect()
}

/// Builds the dialer/listener named by `url.tunnel` and layers in whatever
/// `?tls=`/`?wrapper=`/`?compress=` query options the console URL carries, in
/// the same TLS-outermost order `TunnelService::add_hook` already enforces.
/// `?proxy=` chaining comes from `-x`/`--proxy` on the config instead of the
/// URL, since it only ever applies to the dialing (client) side.
async fn build_tunnel(url: &TunnelUrl, cfg: &Config) -> Result<TunnelService> {
    let mut opts = HashMap::new();
    opts.insert("addr".to_string(), url.addr());
    let is_server = cfg.is_server();
    let mut tunnel = if is_server {
        let listener = registry::create_listener(&url.tunnel, &opts).await?;
        TunnelService::new(None, Some(listener))
    } else {
        let dialer = registry::create_dialer(&url.tunnel, &opts)?;
        TunnelService::new(Some(dialer), None)
    };

    if let Some(spec) = url.get_query("wrapper") {
        let options = wrapper::parse_wrapper_options(spec, &cfg.auth_key)?;
        tunnel = tunnel.with_wrappers(options, cfg.auth_key.clone());
    }
    if matches!(url.get_query("compress"), Some("1") | Some("true")) {
        tunnel = tunnel.with_compression();
    }
    if matches!(url.get_query("tls"), Some("1") | Some("true")) {
        let server_name = if url.host == "0.0.0.0" { "localhost".to_string() } else { url.host.clone() };
        let connector = tls::build_connector()?;
        let acceptor = tls::build_acceptor(&server_name)?;
        tunnel = tunnel.with_tls(connector, acceptor, server_name);
    }
    if !is_server && !cfg.proxies.is_empty() {
        tunnel = tunnel.with_proxy_client(cfg.proxies.clone());
    }

    Ok(tunnel)
}

impl Config {
    /// A console URL with an unspecified host (`0.0.0.0`) means this process
    /// listens; anything else means it dials out.
    pub fn is_server(&self) -> bool {
        self.console_urls
            .first()
            .map(|u| u.host == "0.0.0.0")
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_info_lists_expected_rule_ranges() {
        let cfg = Config::default();
        let console = Console { config: cfg, tunnel: Arc::new(TunnelService::new(None, None)) };
        let info = console.subscription_info();
        for range in SUBSCRIPTION_RULE_RANGES {
            assert!(info.rules_yaml.contains(range));
        }
        assert!(info.path.starts_with('/'));
    }

    #[test]
    fn console_url_with_unspecified_host_is_server() {
        let mut cfg = Config::default();
        cfg.console_urls.push(TunnelUrl::parse_console("0.0.0.0:34996").unwrap());
        assert!(cfg.is_server());
    }

    #[test]
    fn console_url_with_concrete_host_is_client() {
        let mut cfg = Config::default();
        cfg.console_urls.push(TunnelUrl::parse_console("10.0.0.5:34996").unwrap());
        assert!(!cfg.is_server());
    }
}
