// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Intermediate service that sets or modifies attributes and positional
//! arguments in a dial request before forwarding it.

use std::sync::Arc;

use anyhow::Result;

use russ_ipc::codes::{EXIT_FAILURE, EXIT_SUCCESS};
use russ_ipc::msgs::MSG_NO_LIST;
use russ_ipc::{Deadline, Op, Request, Server, Session, SvcNode};

const HELP: &str = "Intermediate service to set/modify attributes and positional\n\
arguments in the dial request. Multiple settings are separated by the\n\
spath separator (/); a period (.) marks the end of the settings.\n\
\n\
/index=value/..././...\n\
    Set positional argument 'index' to 'value'. An index of -1 appends\n\
    the value to the argument list.\n\
\n\
/name=value/..././...\n\
    Set attribute 'name' to 'value', overwriting an existing assignment.\n";

const USAGE: &str = "usage: rusrv_set [<conf options>]

Set/modify attributes and positional arguments.";

/// Apply one `index=value` or `name=value` setting to the request.
fn update_attrv_argv(req: &mut Request, setting: &str) -> std::result::Result<(), ()> {
    let (name, value) = setting.split_once('=').ok_or(())?;
    if let Ok(index) = name.parse::<i64>() {
        if index == -1 || index as usize == req.argv.len() {
            req.argv.push(value.to_string());
        } else if index >= 0 && (index as usize) < req.argv.len() {
            req.argv[index as usize] = value.to_string();
        } else {
            return Err(());
        }
    } else {
        let slot = req.attrv.iter_mut().find(|a| {
            a.split_once('=').map(|(n, _)| n == name).unwrap_or(false)
        });
        match slot {
            Some(slot) => *slot = setting.to_string(),
            None => req.attrv.push(setting.to_string()),
        }
    }
    Ok(())
}

/// Extract settings from the spath up to the `.` end marker and forward
/// the rewritten request.
fn svc_value_handler(sess: &mut Session) -> russ_ipc::Result<()> {
    let mut req = sess.req.clone();
    let components: Vec<&str> = sess.req.spath.trim_start_matches('/').split('/').collect();

    let Some(marker) = components.iter().position(|c| *c == ".") else {
        // no end marker: answer and let the built-in answers take over
        sess.sconn.standard_answer()?;
        return Ok(());
    };

    for setting in &components[..marker] {
        if sess.req.op != Op::Execute {
            continue;
        }
        if update_attrv_argv(&mut req, setting).is_err() {
            sess.sconn.standard_answer()?;
            return sess
                .sconn
                .fatal("error: could not set attribute/argument", EXIT_FAILURE);
        }
    }

    let rest = components[marker + 1..].join("/");
    req.spath = format!("/{rest}");
    sess.sconn.redial_and_splice(Deadline::after_ms(30000), &req)
}

fn svc_root_handler(sess: &mut Session) -> russ_ipc::Result<()> {
    if sess.req.op == Op::List {
        return sess.sconn.fatal(MSG_NO_LIST, EXIT_SUCCESS);
    }
    Ok(())
}

fn main() -> Result<()> {
    russ_services::serve_main(
        USAGE,
        HELP,
        |_conf| {
            let mut root = SvcNode::new("", None);
            root.set_handler(Some(Arc::new(svc_root_handler)));

            let node = root
                .add("*", None)
                .map_err(|e| anyhow::anyhow!("cannot set up server: {e}"))?;
            node.set_handler(Some(Arc::new(svc_value_handler)));
            node.set_wildcard(true);
            node.set_virtual(true);
            node.set_autoanswer(false);
            Ok(root)
        },
        // rewritten requests go out as the caller, for the caller only
        |svr: &mut Server| {
            svr.set_auto_switch_user(true);
            svr.set_match_client_user(true);
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use russ_ipc::Op;

    fn req() -> Request {
        Request {
            op: Op::Execute,
            spath: String::new(),
            attrv: vec!["LANG=C".to_string()],
            argv: vec![],
        }
    }

    #[test]
    fn test_argv_index_set_and_append() {
        let mut r = req();
        update_attrv_argv(&mut r, "0=cat").unwrap();
        assert_eq!(r.argv, vec!["cat"]);
        update_attrv_argv(&mut r, "-1=-n").unwrap();
        assert_eq!(r.argv, vec!["cat", "-n"]);
        update_attrv_argv(&mut r, "0=tac").unwrap();
        assert_eq!(r.argv, vec!["tac", "-n"]);
    }

    #[test]
    fn test_argv_index_out_of_range() {
        let mut r = req();
        update_attrv_argv(&mut r, "5=x").unwrap_err();
    }

    #[test]
    fn test_attr_overwrite_and_add() {
        let mut r = req();
        update_attrv_argv(&mut r, "LANG=en_US").unwrap();
        assert_eq!(r.attrv, vec!["LANG=en_US"]);
        update_attrv_argv(&mut r, "TERM=dumb").unwrap();
        assert_eq!(r.attrv, vec!["LANG=en_US", "TERM=dumb"]);
    }
}
