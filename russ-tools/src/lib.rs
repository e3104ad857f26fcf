// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared plumbing for the command-line front-ends.

pub mod dial;
pub mod spawn;

/// Diagnostics go to stderr so service output on stdout stays clean. The
/// level comes from `--debug` or any `RUSS_DEBUG_*` flag.
pub fn init_logging(debug: bool) {
    let level = if debug || russ_ipc::env::debug().any() {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}
