//! remux/src/cli.rs
//! Command-line surface shared by the `remux` binary and the `RemDial` FFI
//! entry point, so both parse identically.

use clap::Parser;

use crate::config::{Config, Mod};
use crate::error::{RemuxError, Result};
use crate::url::TunnelUrl;

#[derive(Parser, Debug, Clone)]
#[command(name = "remux", version, about = "reverse/forward relay and proxy multiplexer")]
pub struct Cli {
    /// Console URL(s) this process listens on (server) or dials (client).
    #[arg(short = 'c', long = "console", value_name = "URL")]
    pub console: Vec<String>,

    /// Local URL: where traffic destined for this agent should land.
    #[arg(short = 'l', long = "local", value_name = "URL")]
    pub local: Option<String>,

    /// Remote URL: where this agent should ask a peer to route to.
    #[arg(short = 'r', long = "remote", value_name = "URL")]
    pub remote: Option<String>,

    /// Destination agent id to route through.
    #[arg(short = 'd', long = "destination", value_name = "ID")]
    pub destination: Option<String>,

    /// Proxy chain URL(s) to dial through.
    #[arg(short = 'x', long = "proxy", value_name = "URL")]
    pub proxies: Vec<String>,

    /// Forwarded agent URL(s) for fork-based redirects.
    #[arg(short = 'f', long = "forward", value_name = "URL")]
    pub forwards: Vec<String>,

    /// Routing mode.
    #[arg(short = 'm', long = "mod", value_name = "MODE", default_value = "reverse")]
    pub r#mod: String,

    /// Force connect mode: dial out and don't negotiate a route, regardless
    /// of `--mod`. Server/client is always inferred from the console URL's
    /// host, not from this flag.
    #[arg(short = 'n', long = "connect")]
    pub connect_only: bool,

    /// Pre-shared auth key.
    #[arg(short = 'k', long = "key")]
    pub key: Option<String>,

    /// Agent alias/id; random if omitted.
    #[arg(short = 'a', long = "alias")]
    pub alias: Option<String>,

    /// External IP reported in the handshake.
    #[arg(short = 'i', long = "ip")]
    pub external_ip: Option<String>,

    /// Dial retry attempts; 0 means retry forever.
    #[arg(long = "retry", default_value_t = 0)]
    pub retry: u32,

    /// Seconds between dial retries.
    #[arg(long = "retry-interval", default_value_t = 5)]
    pub retry_interval: u64,

    /// Subscription URL to advertise.
    #[arg(long = "sub")]
    pub sub: Option<String>,

    /// Disable subscription assembly.
    #[arg(long = "no-sub")]
    pub no_sub: bool,

    #[arg(long = "debug")]
    pub debug: bool,

    #[arg(long = "detail")]
    pub detail: bool,

    #[arg(long = "quiet")]
    pub quiet: bool,

    #[arg(long = "dump")]
    pub dump: bool,
}

impl Cli {
    pub fn log_directive(&self) -> &'static str {
        if self.dump {
            "trace"
        } else if self.detail {
            "debug"
        } else if self.debug {
            "info"
        } else if self.quiet {
            "error"
        } else {
            "warn"
        }
    }

    pub fn into_config(self) -> Result<Config> {
        let mut cfg = Config::default();
        for url in &self.console {
            cfg.console_urls.push(TunnelUrl::parse_console(url)?);
        }
        if cfg.console_urls.is_empty() {
            return Err(RemuxError::MissingOption("console_url"));
        }
        if let Some(local) = &self.local {
            cfg.local_url = Some(TunnelUrl::parse(local)?);
        }
        if let Some(remote) = &self.remote {
            cfg.remote_url = Some(TunnelUrl::parse(remote)?);
        }
        cfg.redirect = self.destination;
        cfg.proxies = self.proxies;
        cfg.alias = self.alias;
        cfg.external_ip = self.external_ip;
        cfg.retry = self.retry;
        cfg.retry_interval_secs = self.retry_interval;
        if let Some(key) = &self.key {
            cfg.auth_key = key.as_bytes().to_vec();
        }
        cfg.r#mod = Mod::parse(&self.r#mod).ok_or(RemuxError::UnsupportedMod(self.r#mod))?;
        if self.connect_only {
            cfg.r#mod = Mod::Connect;
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_client_invocation() {
        let cli = Cli::try_parse_from(["remux", "-c", "10.0.0.1:34996"]).unwrap();
        let cfg = cli.into_config().unwrap();
        assert_eq!(cfg.console_urls.len(), 1);
        assert!(!cfg.is_server());
    }

    #[test]
    fn connect_flag_overrides_mod_without_touching_console_host() {
        let cli = Cli::try_parse_from(["remux", "-c", "10.0.0.1:34996", "-n"]).unwrap();
        let cfg = cli.into_config().unwrap();
        assert_eq!(cfg.r#mod, crate::config::Mod::Connect);
        assert!(!cfg.is_server());
    }

    #[test]
    fn server_mode_is_inferred_from_console_host_alone() {
        let cli = Cli::try_parse_from(["remux", "-c", "0.0.0.0:34996"]).unwrap();
        let cfg = cli.into_config().unwrap();
        assert!(cfg.is_server());
    }

    #[test]
    fn rejects_unknown_mod() {
        let cli = Cli::try_parse_from(["remux", "-c", "10.0.0.1:34996", "-m", "bogus"]).unwrap();
        assert!(cli.into_config().is_err());
    }
}
