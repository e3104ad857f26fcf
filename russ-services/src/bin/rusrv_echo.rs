// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Echo server: copies input back to the caller.

use std::os::fd::AsFd;
use std::sync::Arc;

use anyhow::Result;

use russ_ipc::codes::EXIT_SUCCESS;
use russ_ipc::io::{fd_read, fd_write_all};
use russ_ipc::{Op, Session, SvcNode};

const HELP: &str = "Echoes lines of input back.\n";

const USAGE: &str = "usage: rusrv_echo [<conf options>]

Russ-based echo server.";

fn svc_root_handler(sess: &mut Session) -> russ_ipc::Result<()> {
    if sess.req.op != Op::Execute {
        return Ok(());
    }
    let mut buf = [0u8; 1024];
    loop {
        let Some(in_fd) = sess.sconn.fds[0].as_ref() else {
            break;
        };
        let n = fd_read(in_fd.as_fd(), &mut buf).unwrap_or(0);
        if n == 0 {
            break;
        }
        if let Some(out_fd) = sess.sconn.fds[1].as_ref() {
            fd_write_all(out_fd.as_fd(), &buf[..n])?;
        }
    }
    sess.sconn.exit(EXIT_SUCCESS)
}

fn main() -> Result<()> {
    russ_services::serve_main(
        USAGE,
        HELP,
        |_conf| {
            let mut root = SvcNode::new("", None);
            root.set_handler(Some(Arc::new(svc_root_handler)));
            Ok(root)
        },
        |_svr| {},
    )
}
