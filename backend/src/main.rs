#[tokio::main]
async fn main() -> anyhow::Result<()> {
    smpl_server::start_server().await
}
