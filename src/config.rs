//! remux/src/config.rs
//! Parsed configuration shared by a Console and the Agents it creates.
//! One `Config` is built once from CLI/API input and then cloned (with
//! routing fields overwritten) for every forked Agent, mirroring how a
//! redirect hop inherits its parent's identity but serves a different route.

use std::collections::HashMap;

use crate::message::Control;
use crate::url::TunnelUrl;

pub const DEFAULT_RETRY: u32 = 0;
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mod {
    Reverse,
    Proxy,
    Bind,
    Connect,
}

impl Mod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mod::Reverse => "reverse",
            Mod::Proxy => "proxy",
            Mod::Bind => "bind",
            Mod::Connect => "connect",
        }
    }

    pub fn parse(s: &str) -> Option<Mod> {
        match s {
            "reverse" => Some(Mod::Reverse),
            "proxy" => Some(Mod::Proxy),
            "bind" => Some(Mod::Bind),
            "connect" => Some(Mod::Connect),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub console_urls: Vec<TunnelUrl>,
    pub local_url: Option<TunnelUrl>,
    pub remote_url: Option<TunnelUrl>,
    pub external_ip: Option<String>,
    pub alias: Option<String>,
    pub redirect: Option<String>,
    pub auth_key: Vec<u8>,
    pub r#mod: Mod,
    pub proxies: Vec<String>,
    pub params: HashMap<String, String>,
    pub interfaces: Vec<String>,
    pub username: String,
    pub hostname: String,
    pub retry: u32,
    pub retry_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            console_urls: Vec::new(),
            local_url: None,
            remote_url: None,
            external_ip: None,
            alias: None,
            redirect: None,
            auth_key: crate::agent::DEFAULT_KEY.as_bytes().to_vec(),
            r#mod: Mod::Reverse,
            proxies: Vec::new(),
            params: HashMap::new(),
            interfaces: Vec::new(),
            username: crate::url::DEFAULT_USERNAME.to_string(),
            hostname: String::new(),
            retry: DEFAULT_RETRY,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
        }
    }
}

impl Config {
    /// Produces the config a forked Agent runs with: same identity and
    /// transport-level options, routing fields taken from the triggering
    /// `Control` message instead of the original CLI input.
    pub fn clone_for_fork(&self, ctrl: &Control) -> Config {
        let mut cfg = self.clone();
        cfg.redirect = Some(ctrl.destination.clone());
        if let Ok(remote) = ctrl.remote_url() {
            cfg.remote_url = Some(remote);
        }
        if let Ok(local) = ctrl.local_url() {
            cfg.local_url = Some(local);
        }
        if let Some(m) = Mod::parse(&ctrl.r#mod) {
            cfg.r#mod = m;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mod_round_trips_through_string() {
        for m in [Mod::Reverse, Mod::Proxy, Mod::Bind, Mod::Connect] {
            assert_eq!(Mod::parse(m.as_str()), Some(m));
        }
    }

    #[test]
    fn clone_for_fork_overwrites_routing_fields_only() {
        let base = Config { alias: Some("base".into()), ..Config::default() };
        let ctrl = Control {
            r#mod: "proxy".into(),
            destination: "agent-2".into(),
            ..Default::default()
        };
        let forked = base.clone_for_fork(&ctrl);
        assert_eq!(forked.alias.as_deref(), Some("base"));
        assert_eq!(forked.redirect.as_deref(), Some("agent-2"));
        assert_eq!(forked.r#mod, Mod::Proxy);
    }
}
