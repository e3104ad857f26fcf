// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Like ruspawn, but the server replaces the current process and runs in
//! the foreground. The socket path is printed before the exec.

use std::io::Write;
use std::os::unix::process::CommandExt;

use anyhow::Result;

use russ_ipc::server::ignore_sigpipe;
use russ_tools::spawn;

const USAGE: &str = "usage: rustart (-f <path>|-c <sect:opt>=<value>) [...] [-- ...]

Start a russ server in the foreground using the configuration, printing
the socket path first. The listener socket is passed on descriptor 3.";

fn main() {
    ignore_sigpipe();
    russ_tools::init_logging(false);
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{USAGE}");
        return;
    }
    if let Err(e) = run(args) {
        eprintln!("error: cannot start server: {e:#}");
        std::process::exit(1);
    }
}

fn run(args: Vec<String>) -> Result<()> {
    let plan = spawn::plan(args)?;
    let lis = spawn::announce(&plan)?;

    println!("{}", plan.sock_path.display());
    let _ = std::io::stdout().flush();

    let err = spawn::server_command(&plan, spawn::listener_fd(lis)).exec();
    let _ = std::fs::remove_file(&plan.sock_path);
    Err(err.into())
}
