use clap::ArgMatches;

use dbx::cmd::{build_app, run};

#[tokio::main]
async fn main() {
    let matches: ArgMatches = build_app().get_matches();
    if let Err(e) = run(&matches).await {
        tracing::error!(target: "dbx::error", "{:#}", e);
        eprintln!("错误: {:#}", e);
        std::process::exit(1);
    }
}
