#[tokio::main]
async fn main() {
    let code = autohost_server::run_with_config().await;
    std::process::exit(code);
}
