// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Boilerplate shared by the example servers: argument/usage handling and
//! the configure-then-serve startup sequence.

use anyhow::{Context, Result};

use russ_ipc::server::ignore_sigpipe;
use russ_ipc::{Conf, Server, SvcNode};

/// Load configuration from the command line, print usage on `-h`, build
/// the dispatch tree, apply the settings the binary mandates, and run the
/// server loop. Only returns on failure or listener shutdown.
///
/// `tune` runs after the server is configured from the conf file; services
/// that always require a setting (privilege switching, peer matching)
/// force it there.
pub fn serve_main(
    usage: &str,
    help: &str,
    build: impl FnOnce(&Conf) -> Result<SvcNode>,
    tune: impl FnOnce(&mut Server),
) -> Result<()> {
    ignore_sigpipe();
    let level = if russ_ipc::env::debug().any() {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{usage}");
        std::process::exit(0);
    }
    let conf = Conf::load_args(&mut args).map_err(|e| anyhow::anyhow!("cannot configure: {e}"))?;

    let root = build(&conf)?;
    let (mut svr, lis) = Server::init_from_conf(&conf, root)
        .map_err(|e| anyhow::anyhow!("cannot set up server: {e}"))?;
    if svr.help().is_none() {
        svr.set_help(Some(help.to_string()));
    }
    tune(&mut svr);
    svr.serve(lis).context("server loop failed")
}
