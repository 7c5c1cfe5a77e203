use std::env;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres
    pub database_host: String,
    pub database_port: u16,
    pub database_user: String,
    pub database_password: String,
    pub database_name: String,

    // Job queue
    pub kafka_brokers: String,
    pub kafka_topic: String,
    pub kafka_group_id: String,

    // Web servers
    pub web_port: u16,
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        let queue_host = required_env("QUEUE_HOST");
        let queue_port = env::var("QUEUE_PORT").unwrap_or_else(|_| "9092".to_string());

        Self {
            database_host: required_env("DATABASE_HOST"),
            database_port: env::var("DATABASE_PORT")
                .unwrap_or_else(|_| "5432".to_string())
                .parse()
                .expect("DATABASE_PORT must be a number"),
            database_user: required_env("DATABASE_USER"),
            database_password: required_env("DATABASE_PASSWORD"),
            database_name: required_env("DATABASE_NAME"),
            kafka_brokers: format!("{queue_host}:{queue_port}"),
            kafka_topic: env::var("KAFKA_TOPIC")
                .unwrap_or_else(|_| "platform.catalog.persister".to_string()),
            kafka_group_id: env::var("KAFKA_GROUP_ID")
                .unwrap_or_else(|_| "tower_persister".to_string()),
            web_port: env::var("WEB_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .expect("WEB_PORT must be a number"),
            metrics_port: env::var("METRICS_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .expect("METRICS_PORT must be a number"),
        }
    }

    /// Connection string for the catalog database.
    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.database_user,
            self.database_password,
            self.database_host,
            self.database_port,
            self.database_name
        )
    }

    /// Log the presence and size of each sensitive value, never its contents.
    pub fn log_redacted(&self) {
        let vars = [
            ("DATABASE_HOST", &self.database_host),
            ("DATABASE_USER", &self.database_user),
            ("DATABASE_PASSWORD", &self.database_password),
            ("DATABASE_NAME", &self.database_name),
        ];
        for (name, value) in vars {
            if value.is_empty() {
                tracing::info!("{name} = (empty)");
            } else {
                tracing::info!("{name} = ({} chars)", value.len());
            }
        }
        tracing::info!(
            brokers = %self.kafka_brokers,
            topic = %self.kafka_topic,
            group = %self.kafka_group_id,
            "Queue configuration"
        );
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}
