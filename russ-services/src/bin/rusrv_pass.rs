// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pass-through server: dial a service and hand the dialed descriptor set
//! back to the original client, then get out of the way.

use std::sync::Arc;

use anyhow::Result;

use russ_ipc::codes::EXIT_SUCCESS;
use russ_ipc::{Deadline, Op, Session, SvcNode};

const HELP: &str = "Pass request to another service with splicing of fds.\n\
\n\
/<spath> <args>\n\
    Dial service at <spath>.\n";

const USAGE: &str = "usage: rusrv_pass [<conf options>]

Dial a service and pass the dialed descriptors back to the original
client. Useful for services that do something and then step out of the
data path (scheduler, redirector, rewriter).";

/// Answer and service the request only when it is for `/`; otherwise pass
/// it on with redial and splice.
fn svc_root_handler(sess: &mut Session) -> russ_ipc::Result<()> {
    if sess.req.spath == "/" {
        sess.sconn.standard_answer()?;
        if sess.req.op == Op::Help {
            if let Some(help) = sess.svr.help() {
                sess.sconn.dprint(1, help)?;
            }
            sess.sconn.exit(EXIT_SUCCESS)?;
        }
        return Ok(());
    }
    let req = sess.req.clone();
    sess.sconn.redial_and_splice(Deadline::Never, &req)
}

fn main() -> Result<()> {
    russ_services::serve_main(
        USAGE,
        HELP,
        |_conf| {
            let mut root = SvcNode::new("", None);
            root.set_handler(Some(Arc::new(svc_root_handler)));
            root.set_virtual(true);
            root.set_autoanswer(false);
            Ok(root)
        },
        |_svr| {},
    )
}
