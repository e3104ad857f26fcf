// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tunnel endpoint: receives a dial request over stdin, dials the target
//! service locally, and relays bytes between its own std streams and the
//! dialed connection. Used where descriptors cannot be passed directly
//! (e.g. across a remote transport).

use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;

use russ_ipc::codes::{EXIT_CALL_FAILURE, EXIT_SYS_FAILURE};
use russ_ipc::server::ignore_sigpipe;
use russ_ipc::{Credentials, Deadline, Relay, ServerConn};

const USAGE: &str = "usage: rutuns [<option>]

Dial tunnel server. Receives the dial request over stdin to establish a
connection, then relays stdin, stdout and stderr to the dialed service.";

const DIAL_TIMEOUT_MS: u64 = 30000;

fn main() {
    ignore_sigpipe();
    russ_tools::init_logging(false);
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{USAGE}");
        return;
    }
    std::process::exit(run());
}

fn run() -> i32 {
    // stdin carries the framed request; the peer's identity is our own
    let stream = match std::io::stdin().as_fd().try_clone_to_owned() {
        Ok(fd) => UnixStream::from(fd),
        Err(e) => {
            eprintln!("error: cannot adopt stdin: {e}");
            return EXIT_SYS_FAILURE;
        }
    };
    let creds = Credentials {
        pid: -1,
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
    };
    let mut sconn = ServerConn::from_stream(stream, creds);
    let req = match sconn.await_request(Deadline::after_ms(DIAL_TIMEOUT_MS)) {
        Ok(req) => req,
        Err(e) => {
            eprintln!("error: cannot read request: {e}");
            return EXIT_SYS_FAILURE;
        }
    };
    drop(sconn);

    let mut cconn = match russ_ipc::ClientConn::dialv(
        Deadline::after_ms(DIAL_TIMEOUT_MS),
        req.op.as_str(),
        &req.spath,
        &req.attrv,
        &req.argv,
    ) {
        Ok(cconn) => cconn,
        Err(e) => {
            eprintln!("error: cannot dial service: {e}");
            return EXIT_CALL_FAILURE;
        }
    };

    let bridged = bridge(&mut cconn);
    match bridged {
        Ok(status) => status,
        Err(e) => {
            eprintln!("error: relay failed: {e}");
            EXIT_SYS_FAILURE
        }
    }
}

fn bridge(cconn: &mut russ_ipc::ClientConn) -> Result<i32, Box<dyn std::error::Error>> {
    let stdin = std::io::stdin().as_fd().try_clone_to_owned()?;
    let stdout = std::io::stdout().as_fd().try_clone_to_owned()?;
    let stderr = std::io::stderr().as_fd().try_clone_to_owned()?;

    let mut relay = Relay::new(3);
    let (svc_in, svc_out, svc_err, exit_fd) = match (
        cconn.take_fd(0),
        cconn.take_fd(1),
        cconn.take_fd(2),
        cconn.take_exit_fd(),
    ) {
        (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
        _ => return Err("connection descriptors missing".into()),
    };
    relay.add(stdin, svc_in, true)?;
    relay.add(svc_out, stdout, true)?;
    relay.add(svc_err, stderr, true)?;
    Ok(relay.serve(Deadline::Never, exit_fd)?)
}
