// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::LazyLock;
use std::time::{Duration, Instant};

static CLOCK_START: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Milliseconds on the process-local monotonic clock.
pub fn now_ms() -> u64 {
    CLOCK_START.elapsed().as_millis() as u64
}

/// Absolute monotonic-millisecond bound on a blocking operation. `Never`
/// disables timing, `Now` forces an immediate return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deadline {
    Never,
    Now,
    At(u64),
}

impl Deadline {
    /// Deadline a timeout from now.
    pub fn after_ms(timeout_ms: u64) -> Deadline {
        Deadline::At(now_ms().saturating_add(timeout_ms))
    }

    pub fn after(timeout: Duration) -> Deadline {
        Deadline::after_ms(timeout.as_millis() as u64)
    }

    pub fn expired(&self) -> bool {
        match self {
            Deadline::Never => false,
            Deadline::Now => true,
            Deadline::At(t) => now_ms() >= *t,
        }
    }

    /// Remaining time in milliseconds; `None` means unbounded. A deadline
    /// in the past yields zero.
    pub fn timeout_ms(&self) -> Option<u64> {
        match self {
            Deadline::Never => None,
            Deadline::Now => Some(0),
            Deadline::At(t) => Some(t.saturating_sub(now_ms())),
        }
    }
}
