// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Redirect server: prefix the requested spath and pass the call on. The
//! prefix is selected by username, groupname, or default sections of the
//! configuration.

use std::sync::Arc;

use anyhow::Result;
use nix::unistd::{Gid, Group, Uid, User};

use russ_ipc::codes::EXIT_FAILURE;
use russ_ipc::{Conf, Deadline, Request, Server, Session, SvcNode, REQ_SPATH_MAX};

const HELP: &str = "Pass request to another service with splicing of fds.\n\
\n\
/<spath> <args>\n\
    Dial service at <spath>.\n";

const USAGE: &str = "usage: rusrv_redir [<conf options>]

Redirect connection by prefixing an spath. The prefix is selected by
username, groupname, or default as specified in the sections of the
configuration file.";

/// Prefix lookup order: `[user.<name>]`, `[group.<name>]`, `[user]`,
/// `[next]`, each with option `spath`.
fn next_prefix(conf: &Conf, uid: u32, gid: u32) -> Option<String> {
    let username = User::from_uid(Uid::from_raw(uid)).ok().flatten().map(|u| u.name);
    let groupname = Group::from_gid(Gid::from_raw(gid)).ok().flatten().map(|g| g.name);

    if let Some(name) = username {
        if let Some(prefix) = conf.get(&format!("user.{name}"), "spath") {
            return Some(prefix.to_string());
        }
    }
    if let Some(name) = groupname {
        if let Some(prefix) = conf.get(&format!("group.{name}"), "spath") {
            return Some(prefix.to_string());
        }
    }
    conf.get("user", "spath")
        .or_else(|| conf.get("next", "spath"))
        .map(str::to_string)
}

fn svc_root_handler(sess: &mut Session, conf: &Conf) -> russ_ipc::Result<()> {
    let creds = sess.sconn.creds();
    let Some(prefix) = next_prefix(conf, creds.uid, creds.gid) else {
        return sess.sconn.fatal("error: cannot find next spath", EXIT_FAILURE);
    };
    let spath = format!("{prefix}{}", sess.req.spath);
    if spath.len() > REQ_SPATH_MAX {
        return sess.sconn.fatal("error: spath too big", EXIT_FAILURE);
    }
    let req = Request {
        op: sess.req.op.clone(),
        spath,
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
            let conf = conf.clone();
            let mut root = SvcNode::new("", None);
            root.set_handler(Some(Arc::new(move |sess: &mut Session| {
                svc_root_handler(sess, &conf)
            })));
            root.set_virtual(true);
            root.set_autoanswer(false);
            Ok(root)
        },
        // the redirect always runs as the caller
        |svr: &mut Server| {
            svr.set_auto_switch_user(true);
        },
    )
}
