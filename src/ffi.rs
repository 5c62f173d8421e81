//! remux/src/ffi.rs
//! C ABI surface exposed when this crate is built as a shared library: spawn
//! a client agent from a command line (`RemDial`), and a lightweight
//! byte-pipe API (`MemoryDial`/`MemoryRead`/`MemoryWrite`/`MemoryClose`) a
//! host process can drive without opening a real socket of its own.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use lazy_static::lazy_static;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{error, info};

use tokio::net::TcpStream;

use crate::agent::close_all_agents;
use crate::cli::Cli;
use crate::console::Console;
use crate::logging;

pub const ERR_OK: i32 = 0;
pub const ERR_CMD_PARSE: i32 = 1;
pub const ERR_ARGS_PARSE: i32 = 2;
pub const ERR_PREPARE: i32 = 3;
pub const ERR_NO_CONSOLE_URL: i32 = 4;
pub const ERR_CREATE_CONSOLE: i32 = 5;
pub const ERR_DIAL: i32 = 6;

pub const ERR_BAD_PARAM: i32 = -1;
pub const ERR_NOT_FOUND: i32 = -2;
pub const ERR_IO: i32 = -3;
pub const ERR_CLOSED: i32 = -4;

struct MemoryConn {
    read: Mutex<OwnedReadHalf>,
    write: Mutex<OwnedWriteHalf>,
}

lazy_static! {
    static ref FFI_RUNTIME: tokio::runtime::Runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to start ffi runtime");
    static ref MEMORY_CONNS: DashMap<u64, MemoryConn> = DashMap::new();
    static ref NEXT_MEMORY_HANDLE: AtomicU64 = AtomicU64::new(1);
}

/// Splits a shell-like command line into argv tokens. Whitespace-separated
/// only; callers quoting arguments with spaces should use `-k="my key"`-style
/// single tokens instead, since there is no shell to do the quoting for them.
fn split_cmdline(line: &str) -> Option<Vec<String>> {
    let tokens: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens)
    }
}

/// Spawns a Console client from a command line, blocking until the Agent has
/// dialed and completed its handshake. On success, writes the agent id (a
/// NUL-terminated string the caller must release via `RemFreeString`) through
/// `out_agent_id` and returns 0. On failure, returns one of the error codes
/// above and leaves `out_agent_id` untouched.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn RemDial(cmdline: *const c_char, out_agent_id: *mut *mut c_char) -> i32 {
    logging::init_logging("info");
    if cmdline.is_null() {
        return ERR_CMD_PARSE;
    }
    let line = match unsafe { CStr::from_ptr(cmdline) }.to_str() {
        Ok(s) => s,
        Err(_) => return ERR_CMD_PARSE,
    };
    let Some(argv) = split_cmdline(line) else {
        return ERR_CMD_PARSE;
    };

    use clap::Parser;
    let cli = match Cli::try_parse_from(std::iter::once("remux".to_string()).chain(argv)) {
        Ok(cli) => cli,
        Err(e) => {
            error!(error = %e, "RemDial: argument parse failed");
            return ERR_ARGS_PARSE;
        }
    };
    let directive = cli.log_directive();
    let config = match cli.into_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "RemDial: prepare failed");
            return ERR_PREPARE;
        }
    };
    if config.console_urls.is_empty() {
        return ERR_NO_CONSOLE_URL;
    }
    let _ = logging::set_log_level(directive);

    let result = FFI_RUNTIME.block_on(async move {
        let console = match Console::new(config).await {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "RemDial: console creation failed");
                return Err(ERR_CREATE_CONSOLE);
            }
        };
        let console = std::sync::Arc::new(console);
        console.dial_with_retry().await.map_err(|e| {
            error!(error = %e, "RemDial: dial failed");
            ERR_DIAL
        })
    });

    match result {
        Ok(agent) => {
            if !out_agent_id.is_null() {
                if let Ok(cstr) = CString::new(agent.id.clone()) {
                    unsafe { std::ptr::write(out_agent_id, cstr.into_raw()) };
                }
            }
            info!(agent = %agent.id, "RemDial: agent up");
            ERR_OK
        }
        Err(code) => code,
    }
}

/// Releases a string returned by `RemDial`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn RemFreeString(s: *mut c_char) {
    if !s.is_null() {
        unsafe { drop(CString::from_raw(s)) };
    }
}

/// Dials `dst` over a plain TCP connection and hands the caller a byte-pipe
/// handle for it. `mem_handle` names the memory arena the connection is
/// scoped to on the host side; this crate does not need to distinguish
/// arenas since every `MemoryConn` already has its own handle, so the value
/// is accepted but not otherwise interpreted.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn MemoryDial(_mem_handle: u64, dst: *const c_char, out_handle: *mut u64) -> i32 {
    if dst.is_null() || out_handle.is_null() {
        return ERR_BAD_PARAM;
    }
    let Ok(dst) = (unsafe { CStr::from_ptr(dst) }.to_str()) else {
        return ERR_BAD_PARAM;
    };
    let dst = dst.to_string();

    let stream = FFI_RUNTIME.block_on(async move { TcpStream::connect(&dst).await });
    let tcp = match stream {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "MemoryDial: dial failed");
            return ERR_IO;
        }
    };
    let (read, write) = tcp.into_split();
    let handle = NEXT_MEMORY_HANDLE.fetch_add(1, Ordering::Relaxed);
    MEMORY_CONNS.insert(handle, MemoryConn { read: Mutex::new(read), write: Mutex::new(write) });
    unsafe { std::ptr::write(out_handle, handle) };
    ERR_OK
}

/// Reads up to `len` bytes into `buf`, returning the number of bytes read
/// (0 on clean EOF) or a negative error code.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn MemoryRead(handle: u64, buf: *mut u8, len: i32) -> i32 {
    if buf.is_null() || len < 0 {
        return ERR_BAD_PARAM;
    }
    let Some(conn) = MEMORY_CONNS.get(&handle) else {
        return ERR_NOT_FOUND;
    };
    let slice = unsafe { std::slice::from_raw_parts_mut(buf, len as usize) };
    let n = FFI_RUNTIME.block_on(async {
        let mut read = conn.read.lock().unwrap_or_else(|p| p.into_inner());
        read.read(slice).await
    });
    match n {
        Ok(n) => n as i32,
        Err(e) => {
            error!(handle, error = %e, "MemoryRead failed");
            ERR_IO
        }
    }
}

/// Writes `len` bytes from `buf`, returning the number of bytes written or a
/// negative error code.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn MemoryWrite(handle: u64, buf: *const u8, len: i32) -> i32 {
    if buf.is_null() || len < 0 {
        return ERR_BAD_PARAM;
    }
    let Some(conn) = MEMORY_CONNS.get(&handle) else {
        return ERR_NOT_FOUND;
    };
    let slice = unsafe { std::slice::from_raw_parts(buf, len as usize) };
    let n = FFI_RUNTIME.block_on(async {
        let mut write = conn.write.lock().unwrap_or_else(|p| p.into_inner());
        write.write(slice).await
    });
    match n {
        Ok(n) => n as i32,
        Err(e) => {
            error!(handle, error = %e, "MemoryWrite failed");
            ERR_IO
        }
    }
}

/// Closes and forgets a `MemoryDial` handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn MemoryClose(handle: u64) -> i32 {
    match MEMORY_CONNS.remove(&handle) {
        Some((_, conn)) => {
            FFI_RUNTIME.block_on(async move {
                let mut write = conn.write.lock().unwrap_or_else(|p| p.into_inner());
                let _ = write.shutdown().await;
            });
            ERR_OK
        }
        None => ERR_CLOSED,
    }
}

/// Closes every agent this process has created, as a clean-shutdown hook for
/// a host embedding this crate as a library.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn CleanupAgent() -> i32 {
    FFI_RUNTIME.block_on(close_all_agents());
    ERR_OK
}
