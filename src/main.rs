use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    eventdesk::cli::run().await
}
