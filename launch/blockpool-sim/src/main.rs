// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use blockpool_sim::{Args, run};
use clap::Parser;

fn main() -> anyhow::Result<()> {
    blockpool_runtime::logging::init();
    let args = Args::parse();
    let report = run(&args)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if args.metrics {
        eprint!("{}", report.metrics_text);
    }
    Ok(())
}
