use events_cache::test::sim_app::SimApp;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    SimApp::run().await
}
