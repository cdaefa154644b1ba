#[tokio::main]
async fn main() -> anyhow::Result<()> {
    weekly_archive_api::run().await
}
