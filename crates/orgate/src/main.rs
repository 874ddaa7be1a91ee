//! A control-plane gatekeeper between a privacy browser and the local
//! anonymity services.
//!
//! Orgate sits between a Tor-Browser-style client and a system Tor
//! daemon (and, optionally, an I2P router), and presents the two ports
//! the browser expects:
//!
//! * A **filtered control port**: a stripped-down rendition of the Tor
//!   control protocol that answers a tiny whitelist of commands —
//!   truthfully or by forwarding to the real control socket — and
//!   refuses everything else.  Its PROTOCOLINFO deliberately lies
//!   about the available authentication methods so the browser picks
//!   NULL instead of demanding a cookie it could never read.
//! * A **multiplexing SOCKS5 port**: terminates SOCKS5, looks at the
//!   target and the per-connection isolation credentials, and hands
//!   the stream to exactly one of: the Tor SOCKS port, the I2P HTTP
//!   proxy, the I2P HTTPS CONNECT proxy, a direct connection, or a
//!   direct DNS lookup.
//!
//! The design goal is default-deny: a browser that tries anything
//! outside the expected repertoire gets a conforming error reply, not
//! a pass-through to the real daemon.
//!
//! # Command-line arguments
//!
//! `--config <path>` names the TOML configuration file.  Its contents
//! are merged over the embedded defaults
//! ([`orgate_defaults.toml`](./orgate_defaults.toml)).

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![deny(clippy::await_holding_lock)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::option_option)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]

mod backend;
mod config;
mod control;
mod exit;
mod rewrite;
mod socks;
mod torctl;
mod upstream;

use std::sync::Arc;

use anyhow::Result;
use argh::FromArgs;
use tracing::level_filters::LevelFilter;
use tracing::info;

use crate::config::Config;

/// Filter a Tor control port and multiplex browser SOCKS traffic
/// between anonymity networks.
#[derive(FromArgs, Debug, Clone)]
struct Args {
    /// path to the configuration file
    #[argh(option)]
    config: String,
}

/// Run both listeners until one fails or we are told to exit.
async fn run(cfg: Arc<Config>) -> Result<()> {
    tokio::select! {
        r = exit::wait_for_ctrl_c() => r,
        r = control::run_control_listener(Arc::clone(&cfg)) => r,
        r = socks::run_socks_listener(Arc::clone(&cfg)) => r,
    }
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();
    let cfg = config::load(&args.config)?;

    let filt = if !cfg.logging.enable {
        LevelFilter::OFF
    } else if cfg.logging.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt().with_max_level(filt).init();
    info!("orgate starting up");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(Arc::new(cfg)))
}
