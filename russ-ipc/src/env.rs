// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Debug-flag block: each `RUSS_DEBUG_*` variable is on if set (values are
//! ignored), loaded once at first use and read-only thereafter.

use std::sync::LazyLock;

#[derive(Debug, Default)]
pub struct DebugFlags {
    pub dialv: bool,
    pub connect_deadline: bool,
    pub accept: bool,
    pub server_loop: bool,
}

impl DebugFlags {
    /// True when any flag is set; binaries raise their log level on it.
    pub fn any(&self) -> bool {
        self.dialv || self.connect_deadline || self.accept || self.server_loop
    }
}

fn flag(name: &str) -> bool {
    std::env::var_os(name).is_some()
}

static FLAGS: LazyLock<DebugFlags> = LazyLock::new(|| DebugFlags {
    dialv: flag("RUSS_DEBUG_DIALV"),
    connect_deadline: flag("RUSS_DEBUG_CONNECT_DEADLINE"),
    accept: flag("RUSS_DEBUG_ACCEPT"),
    server_loop: flag("RUSS_DEBUG_SVR_LOOP"),
});

pub fn debug() -> &'static DebugFlags {
    &FLAGS
}
