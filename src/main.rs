#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = linguacheck::run().await {
        eprintln!("linguacheck fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
