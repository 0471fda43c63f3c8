#[tokio::main]
async fn main() -> anyhow::Result<()> {
    localchat::run().await
}
