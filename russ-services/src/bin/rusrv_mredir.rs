// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Multi-redirect server: map the first spath component through the
//! `[spaths]` configuration section and pass the call on.

use std::sync::Arc;

use anyhow::Result;

use russ_ipc::codes::{EXIT_FAILURE, EXIT_SUCCESS};
use russ_ipc::msgs::MSG_NO_SERVICE;
use russ_ipc::{Conf, Deadline, Op, Request, Server, Session, SvcNode, REQ_SPATH_MAX};

const HELP: &str = "Redirects connection requests.\n\
\n\
/... <args>\n\
    Dial service at ... .\n";

const USAGE: &str = "usage: rusrv_mredir [<conf options>]

Redirect connection by mapping the leading spath component through the
[spaths] configuration section.";

/// `list` on the root reports the configured sub-service names, sorted.
fn svc_root_handler(sess: &mut Session, conf: &Conf) -> russ_ipc::Result<()> {
    if sess.req.op == Op::List {
        sess.sconn.standard_answer()?;
        let listing: String = conf.options("spaths").iter().map(|o| format!("{o}\n")).collect();
        sess.sconn.dprint(1, &listing)?;
        sess.sconn.exit(EXIT_SUCCESS)?;
    }
    Ok(())
}

/// Redial and splice for requests to `/<name>/...`.
fn svc_next_handler(sess: &mut Session, conf: &Conf) -> russ_ipc::Result<()> {
    let spath = sess.req.spath.clone();
    let trimmed = spath.trim_start_matches('/');
    let (comp, rest) = match trimmed.split_once('/') {
        Some((comp, rest)) => (comp, format!("/{rest}")),
        None => (trimmed, String::new()),
    };
    let Some(next) = conf.get("spaths", comp) else {
        return sess.sconn.fatal(MSG_NO_SERVICE, EXIT_FAILURE);
    };
    let next_spath = format!("{next}{rest}");
    if next_spath.len() > REQ_SPATH_MAX {
        return sess.sconn.fatal("error: spath too big", EXIT_FAILURE);
    }
    let req = Request {
        op: sess.req.op.clone(),
        spath: next_spath,
        attrv: sess.req.attrv.clone(),
        argv: sess.req.argv.clone(),
    };
    sess.sconn.redial_and_splice(Deadline::Never, &req)
}

fn main() -> Result<()> {
    russ_services::serve_main(
        USAGE,
        HELP,
        |conf| {
            let mut root = SvcNode::new("", None);
            let root_conf = conf.clone();
            root.set_handler(Some(Arc::new(move |sess: &mut Session| {
                svc_root_handler(sess, &root_conf)
            })));

            let next_conf = conf.clone();
            let node = root
                .add("*", None)
                .map_err(|e| anyhow::anyhow!("cannot set up server: {e}"))?;
            node.set_handler(Some(Arc::new(move |sess: &mut Session| {
                svc_next_handler(sess, &next_conf)
            })));
            node.set_wildcard(true);
            node.set_virtual(true);
            node.set_autoanswer(false);
            Ok(root)
        },
        // redials run as the caller, and only for the caller's own calls
        |svr: &mut Server| {
            svr.set_auto_switch_user(true);
            svr.set_match_client_user(true);
        },
    )
}
