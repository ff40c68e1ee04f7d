use feature_client::{plugins::LoggingPlugin, ClientConfig, FeatureOptions};

#[tokio::main]
pub async fn main() -> feature_client::Result<()> {
    env_logger::init();

    let api_key = std::env::var("FEATURES_API_KEY").unwrap();
    let mut config = ClientConfig::new(api_key, "development");
    if let Ok(base_url) = std::env::var("FEATURES_BASE_URL") {
        config.base_url(base_url);
    }
    config
        .context([("user_id".to_owned(), "test-subject".into())].into())
        .plugin(LoggingPlugin::new());

    let client = config.to_client()?;
    client.initialize().await?;

    // Resolves to `false` if the service cannot be reached.
    let dark_mode = client
        .get_feature("dark-mode", FeatureOptions::new().with_fallback(false))
        .await?
        .as_boolean()
        .unwrap_or(false);

    println!("dark-mode: {:?}", dark_mode);

    client.cleanup().await
}
