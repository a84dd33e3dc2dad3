use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    ledger_link_probe::run().await?;
    Ok(())
}
