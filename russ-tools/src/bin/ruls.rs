// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use russ_tools::dial::{dial_main, DialMode};

fn main() {
    std::process::exit(dial_main(DialMode::List));
}
