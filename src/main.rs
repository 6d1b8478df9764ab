use mindforge::core::terminal;

#[tokio::main]
async fn main() {
    if let Err(e) = mindforge::cli::run_main().await {
        terminal::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
