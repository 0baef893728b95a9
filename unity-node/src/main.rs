use std::path::PathBuf;

use unity_node::run_node;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let path = std::env::var("UNITY_CONFIG").unwrap_or_else(|_| "config/unity.toml".to_string());
    if let Err(e) = run_node(PathBuf::from(path)).await {
        eprintln!("node failed: {e:?}");
    }
}
