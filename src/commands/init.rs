use crate::commands::Out;
use crate::{Config, Result};
use anyhow::Context;
use std::path::Path;

/// Creates the data directory with an initial `config.json` pointing at `api_url`, the secrets
/// directory and an empty database.
///
/// # Errors
/// - Returns an error if the directory already holds a config file, if `api_url` is not a URL or
///   if any file operation fails.
pub async fn init(fintrack_home: &Path, api_url: &str) -> Result<Out<()>> {
    let config = Config::create(fintrack_home, api_url)
        .await
        .context("Unable to create the data directory and configs")?;
    Ok(format!(
        "Created the fintrack directory at '{}'. Put an API token in '{}' if the server needs one",
        config.root().display(),
        config.token_path().display()
    )
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_twice_fails() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("fintrack");
        let out = init(&home, "https://fintrack.example.com/api/").await.unwrap();
        assert!(out.message().contains("Created"));
        assert!(home.join("config.json").is_file());
        assert!(init(&home, "https://fintrack.example.com/api/").await.is_err());
    }
}
