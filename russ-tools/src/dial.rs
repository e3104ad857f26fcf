// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The rudial driver: dial a service, wire the connection's descriptors to
//! the process std streams through forwarders, and exit with the service's
//! status. The alias binaries fix the operation verb.

use std::os::fd::AsFd;

use clap::{Arg, ArgAction, Command};

use russ_ipc::codes::{EXIT_CALL_FAILURE, EXIT_SYS_FAILURE};
use russ_ipc::forwarder::{ClosePolicy, Forwarder};
use russ_ipc::helpers;
use russ_ipc::msgs::MSG_BAD_ARGS;
use russ_ipc::server::ignore_sigpipe;
use russ_ipc::{ClientConn, Deadline, REQ_ATTRS_MAX};

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum DialMode {
    /// `rudial <op> <addr> [arg...]`
    Dial,
    /// `ruexec <addr> [arg...]`
    Exec,
    /// `ruhelp <addr>`
    Help,
    /// `ruinfo <addr>`
    Info,
    /// `ruls <addr>`
    List,
}

impl DialMode {
    fn prog(&self) -> &'static str {
        match self {
            DialMode::Dial => "rudial",
            DialMode::Exec => "ruexec",
            DialMode::Help => "ruhelp",
            DialMode::Info => "ruinfo",
            DialMode::List => "ruls",
        }
    }

    fn about(&self) -> &'static str {
        match self {
            DialMode::Dial => {
                "Dial service at <addr> to perform <op>, connecting its stdin, \
                 stdout and stderr to the caller's"
            }
            DialMode::Exec => "Execute service at <addr>",
            DialMode::Help => "Get help for service at <addr>",
            DialMode::Info => "Get information about service at <addr>",
            DialMode::List => "List services under <addr>",
        }
    }

    fn takes_args(&self) -> bool {
        matches!(self, DialMode::Dial | DialMode::Exec)
    }
}

fn cli(mode: DialMode) -> Command {
    let mut cmd = Command::new(mode.prog())
        .about(mode.about())
        .arg(
            Arg::new("attr")
                .short('a')
                .long("attr")
                .value_name("name=value")
                .action(ArgAction::Append)
                .help("pass a 'name=value' string to the service (repeatable)"),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .value_name("seconds")
                .help("allow a given amount of time to connect"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("keep stderr forwarding after exit and emit diagnostics"),
        );
    if mode == DialMode::Dial {
        cmd = cmd.arg(Arg::new("op").required(true).value_name("op"));
    }
    cmd = cmd.arg(Arg::new("addr").required(true).value_name("addr"));
    if mode.takes_args() {
        cmd = cmd.arg(
            Arg::new("arg")
                .value_name("arg")
                .num_args(0..)
                .allow_hyphen_values(true)
                .trailing_var_arg(true),
        );
    }
    cmd
}

/// Run one front-end; returns the process exit code.
pub fn dial_main(mode: DialMode) -> i32 {
    ignore_sigpipe();
    let matches = cli(mode).get_matches();
    let debug = matches.get_flag("debug");
    crate::init_logging(debug);

    let mut attrv: Vec<String> = Vec::new();
    if let Some(attrs) = matches.get_many::<String>("attr") {
        for attr in attrs {
            if !attr.contains('=') {
                eprintln!("{MSG_BAD_ARGS}");
                return EXIT_CALL_FAILURE;
            }
            attrv.push(attr.clone());
        }
        if attrv.len() > REQ_ATTRS_MAX {
            eprintln!("{MSG_BAD_ARGS}");
            return EXIT_CALL_FAILURE;
        }
    }

    let deadline = match matches.get_one::<String>("timeout") {
        None => Deadline::Never,
        Some(secs) => match secs.parse::<u64>() {
            Ok(secs) => Deadline::after_ms(secs * 1000),
            Err(_) => {
                eprintln!("{MSG_BAD_ARGS}");
                return EXIT_CALL_FAILURE;
            }
        },
    };

    let addr = match matches.get_one::<String>("addr") {
        Some(addr) => addr.clone(),
        None => {
            eprintln!("{MSG_BAD_ARGS}");
            return EXIT_CALL_FAILURE;
        }
    };
    let argv: Vec<String> = if mode.takes_args() {
        matches
            .get_many::<String>("arg")
            .map(|v| v.cloned().collect())
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    let dialed = match mode {
        DialMode::Dial => {
            let op = matches
                .get_one::<String>("op")
                .map(String::as_str)
                .unwrap_or("execute");
            ClientConn::dialv(deadline, op, &addr, &attrv, &argv)
        }
        DialMode::Exec => helpers::execv(deadline, &addr, &attrv, &argv),
        DialMode::Help => helpers::help(deadline, &addr),
        DialMode::Info => helpers::info(deadline, &addr),
        DialMode::List => helpers::list(deadline, &addr),
    };
    let mut conn = match dialed {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("error: cannot dial service: {e}");
            return EXIT_CALL_FAILURE;
        }
    };

    // hand the connection descriptors to forwarders; the std streams are
    // duplicated so a finishing forwarder never closes the real ones
    let wired = wire_forwarders(&mut conn, debug);
    let (fwd_out, fwd_err) = match wired {
        Ok(handles) => handles,
        Err(e) => {
            eprintln!("error: could not forward bytes: {e}");
            return EXIT_SYS_FAILURE;
        }
    };

    let status = match conn.wait(deadline) {
        Ok(status) => status,
        Err(e) => {
            eprintln!("error: unexpected connection event: {e}");
            EXIT_SYS_FAILURE
        }
    };
    tracing::debug!(status, "service exited");

    // drain the output paths; the stdin forwarder may stay blocked on the
    // terminal and is left to die with the process
    fwd_out.join();
    fwd_err.join();
    status
}

type OutErrHandles = (russ_ipc::forwarder::FwdHandle, russ_ipc::forwarder::FwdHandle);

fn wire_forwarders(conn: &mut ClientConn, debug: bool) -> std::io::Result<OutErrHandles> {
    let stdin = std::io::stdin().as_fd().try_clone_to_owned()?;
    let stdout = std::io::stdout().as_fd().try_clone_to_owned()?;
    let stderr = std::io::stderr().as_fd().try_clone_to_owned()?;

    if let Some(svc_in) = conn.take_fd(0) {
        Forwarder::new(stdin, svc_in).start();
    }
    let fwd_out = conn
        .take_fd(1)
        .map(|svc_out| Forwarder::new(svc_out, stdout).start());
    let fwd_err = conn.take_fd(2).map(|svc_err| {
        Forwarder::new(svc_err, stderr)
            .close_policy(if debug { ClosePolicy::In } else { ClosePolicy::Both })
            .start()
    });
    match (fwd_out, fwd_err) {
        (Some(fwd_out), Some(fwd_err)) => Ok((fwd_out, fwd_err)),
        _ => Err(std::io::Error::other("connection descriptors missing")),
    }
}
