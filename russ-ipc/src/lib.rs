// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UNIX-domain RPC substrate: named services reachable through filesystem
//! paths, dialed with an operation verb, exchanging data over a small fixed
//! set of descriptors whose lifetime is tied to the call.

#![cfg(unix)]

pub mod addr;
pub mod buf;
pub mod cconn;
pub mod codec;
pub mod conf;
pub mod env;
pub mod error;
pub mod fds;
pub mod forwarder;
pub mod helpers;
pub mod io;
pub mod listener;
pub mod relay;
pub mod request;
pub mod sconn;
pub mod server;
pub mod svcnode;
pub mod time;

pub use buf::Buf;
pub use cconn::ClientConn;
pub use conf::Conf;
pub use error::{Error, Result};
pub use fds::Credentials;
pub use forwarder::{ClosePolicy, FwdMode, FwdReason, Forwarder};
pub use listener::Listener;
pub use relay::Relay;
pub use request::{Op, Request};
pub use sconn::ServerConn;
pub use server::{Server, ServerKind, Session};
pub use svcnode::SvcNode;
pub use time::Deadline;

/// Protocol identification tag, the wire-compatibility identifier. Changes
/// only with major compatibility breaks.
pub const PROTOCOL_STRING: &[u8; 4] = b"0010";

/// Largest request frame accepted on the wire, size prefix excluded.
pub const MAX_REQUEST_BUF_SIZE: usize = 262144;

pub const REQ_ATTRS_MAX: usize = 1024;
pub const REQ_ARGS_MAX: usize = 1024;
pub const REQ_SPATH_MAX: usize = 4096;

/// Data descriptors per connection (in, out, err). A fourth system
/// descriptor carries the exit status.
pub const CONN_STD_NFDS: usize = 3;

pub const FORWARD_BLOCK_SIZE: usize = 1 << 16;
pub const RELAY_BUF_SIZE: usize = 1 << 16;

/// Service root used when `RUSS_SERVICES_DIR` is not set.
pub const SERVICES_DIR: &str = "/run/russ/services";

/// Reserved exit sentinels; clients surface these unmodified.
pub mod codes {
    pub const EXIT_SUCCESS: i32 = 0;
    pub const EXIT_FAILURE: i32 = 1;
    pub const EXIT_CALL_FAILURE: i32 = -1;
    pub const EXIT_SYS_FAILURE: i32 = -127;
}

/// Fixed user-visible phrases written to the error descriptor before the
/// exit code is sent.
pub mod msgs {
    pub const MSG_BAD_ARGS: &str = "+ bad arguments";
    pub const MSG_BAD_OP: &str = "+ unknown operation";
    pub const MSG_NO_EXIT: &str = "+ no exit status";
    pub const MSG_NO_HELP: &str = "+ no help available";
    pub const MSG_NO_LIST: &str = "+ no list available";
    pub const MSG_NO_SERVICE: &str = "+ no service available";
    pub const MSG_NO_EXEC: &str = "+ could not execute program";
    pub const MSG_NO_SWITCH_USER: &str = "+ could not switch user";
    pub const MSG_BAD_USER: &str = "+ user not allowed";
}
