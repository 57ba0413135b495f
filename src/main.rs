#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sandbox_exec::engine::run().await
}
