use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Directory the upload endpoint writes spreadsheets into.
    pub upload_dir: String,
    /// Public base URL under which uploaded files are reachable.
    pub public_base_url: String,
    /// Shared secret for the storage-finalize webhook (optional).
    pub webhook_secret: Option<String>,
    /// Account ids allowed to perform admin loan actions.
    pub admin_account_ids: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            upload_dir: std::env::var("UPLOAD_DIR")
                .unwrap_or_else(|_| "uploads".to_string())
                .trim_end_matches('/')
                .to_string(),
            public_base_url: std::env::var("PUBLIC_BASE_URL")
                .map_err(|_| anyhow::anyhow!("PUBLIC_BASE_URL environment variable required"))
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("PUBLIC_BASE_URL cannot be empty");
                    }
                    let parsed = url::Url::parse(&url)
                        .map_err(|e| anyhow::anyhow!("PUBLIC_BASE_URL is not a valid URL: {e}"))?;
                    if parsed.scheme() != "http" && parsed.scheme() != "https" {
                        anyhow::bail!("PUBLIC_BASE_URL must start with http:// or https://");
                    }
                    Ok(url.trim_end_matches('/').to_string())
                })?,
            webhook_secret: std::env::var("WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            admin_account_ids: std::env::var("ADMIN_ACCOUNT_IDS")
                .map_err(|_| {
                    anyhow::anyhow!("ADMIN_ACCOUNT_IDS environment variable required")
                })
                .and_then(|ids| {
                    let parsed: Vec<String> = ids
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                    if parsed.is_empty() {
                        anyhow::bail!("ADMIN_ACCOUNT_IDS must list at least one account id");
                    }
                    Ok(parsed)
                })?,
        };

        if config.webhook_secret.is_none() {
            tracing::warn!("WEBHOOK_SECRET not set; storage webhook will accept unsigned events");
        }

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        tracing::debug!("Upload dir: {}", config.upload_dir);
        tracing::debug!("Public base URL: {}", config.public_base_url);
        tracing::debug!("Admin accounts configured: {}", config.admin_account_ids.len());
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }
}
