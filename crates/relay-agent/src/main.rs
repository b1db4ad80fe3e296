// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;

use relay_agent::config::Config;

#[tokio::main]
async fn main() {
    let config = Config::parse();
    relay_agent::init_tracing(&config);
    let code = relay_agent::run(config).await;
    std::process::exit(code);
}
