//! remux/src/logging.rs
//! Logging initialization and runtime level updates.

use std::sync::{Mutex, Once};

use lazy_static::lazy_static;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter::EnvFilter, fmt, reload::Layer as ReloadLayer};

type Handle = tracing_subscriber::reload::Handle<EnvFilter, tracing_subscriber::Registry>;

static LOG_INIT: Once = Once::new();

lazy_static! {
    static ref RELOAD_HANDLE: Mutex<Option<Handle>> = Mutex::new(None);
}

pub fn init_logging(default: &str) {
    LOG_INIT.call_once(|| {
        let filter = EnvFilter::new(default);
        let (reload_layer, handle) = ReloadLayer::new(filter);
        let subscriber = tracing_subscriber::registry().with(reload_layer).with(fmt::layer());
        tracing::subscriber::set_global_default(subscriber).unwrap();
        *RELOAD_HANDLE.lock().unwrap() = Some(handle);
    });
}

/// Replaces the active filter directive at runtime, e.g. `-d`/`--detail`/
/// `--quiet` flags flipping verbosity without a restart.
pub fn set_log_level(directive: &str) -> Result<(), String> {
    let guard = RELOAD_HANDLE.lock().unwrap();
    match guard.as_ref() {
        Some(handle) => handle
            .modify(|filter| *filter = EnvFilter::new(directive))
            .map_err(|e| e.to_string()),
        None => Err("logging not initialized".to_string()),
    }
}
