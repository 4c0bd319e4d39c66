#![allow(async_fn_in_trait)]

mod args;
mod cmd;

use std::process::ExitCode;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    cmd::run().await
}
