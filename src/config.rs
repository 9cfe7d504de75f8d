use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub shipping_cost: i64,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(3000);
        let shipping_cost = env::var("SHIPPING_COST")
            .ok()
            .and_then(|c| c.parse::<i64>().ok())
            .unwrap_or(50);
        Ok(Self {
            port,
            database_url,
            host,
            shipping_cost,
        })
    }
}
