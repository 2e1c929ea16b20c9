#[tokio::main]
async fn main() {
    if let Err(message) = trellis_cli::run_from_env().await {
        eprintln!("{message}");
        std::process::exit(1);
    }
}
