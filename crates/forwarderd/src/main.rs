//! Process entry point for the forwarder.
//!
//! Errors are reported through the structured health reporter before
//! `run_forwarder` returns, so only the exit status remains to be set here.

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match forwarderd::run_forwarder().await {
        Ok(code) => code,
        Err(_) => ExitCode::FAILURE,
    }
}
