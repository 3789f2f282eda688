#[tokio::main]
async fn main() -> anyhow::Result<()> {
    codepad::run().await
}
