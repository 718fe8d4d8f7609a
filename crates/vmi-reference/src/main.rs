// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use vmi_core::runner::{run, RunnerSpec};

use vmi_reference::{
    categorical_task_builder, counter_task_builder, gauge_task_builder, ReferenceConfig,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const GIT_INFO: &str = match option_env!("VMI_GIT_INFO") {
    Some(git_info) => git_info,
    None => "unknown",
};

#[tokio::main]
async fn main() {
    let exit_code = run(RunnerSpec::<ReferenceConfig> {
        instance_default: "refvmi",
        version: VERSION,
        git_info: GIT_INFO,
        task_builders: vec![
            gauge_task_builder,
            counter_task_builder,
            categorical_task_builder,
        ],
    })
    .await;
    std::process::exit(exit_code);
}
