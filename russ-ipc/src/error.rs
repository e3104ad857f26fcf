// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;

use crate::codes;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds of the bus. Argument and resolution failures are rejected
/// before any I/O and surface as call-failure exits; transport, deadline and
/// protocol failures surface as sys-failure. Application failures are not
/// errors: they are exit statuses returned by `wait`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad arguments: {0}")]
    BadArgs(String),

    #[error("cannot resolve service address: {0}")]
    Resolution(String),

    #[error(transparent)]
    Transport(#[from] io::Error),

    #[error("deadline expired")]
    DeadlineExpired,

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub(crate) fn bad_args(msg: impl Into<String>) -> Self {
        Error::BadArgs(msg.into())
    }

    /// The exit code a front-end reports for this failure.
    pub fn exit_status(&self) -> i32 {
        match self {
            Error::BadArgs(_) | Error::Resolution(_) => codes::EXIT_CALL_FAILURE,
            Error::Transport(_) | Error::DeadlineExpired | Error::Protocol(_) => {
                codes::EXIT_SYS_FAILURE
            }
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Transport(io::Error::from(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_mapping() {
        assert_eq!(Error::bad_args("x").exit_status(), codes::EXIT_CALL_FAILURE);
        assert_eq!(
            Error::Resolution("x".into()).exit_status(),
            codes::EXIT_CALL_FAILURE
        );
        assert_eq!(Error::DeadlineExpired.exit_status(), codes::EXIT_SYS_FAILURE);
        assert_eq!(Error::protocol("x").exit_status(), codes::EXIT_SYS_FAILURE);
    }
}
