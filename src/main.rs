#[tokio::main]
async fn main() -> eyre::Result<()> {
    courier::run().start().await
}
