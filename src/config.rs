use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::telemetry::LogFormat;

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    #[serde(default = "default_bind_ip")]
    pub server_bind_ip: String,
    #[serde(default = "default_port")]
    pub server_port: u16,
    #[serde(default = "default_concurrency")]
    pub server_concurrency: usize,
    #[serde(default = "default_body_limit")]
    pub server_body_limit: usize,

    #[serde(default)]
    pub redis_cluster: bool,
    #[serde(default)]
    pub redis_failover: bool,
    #[serde(default = "default_connection")]
    pub redis_connection: String,
    #[serde(default)]
    pub redis_connections: Vec<String>,
    #[serde(default)]
    pub redis_master_name: String,
    #[serde(default)]
    pub redis_username: String,
    #[serde(default)]
    pub redis_password: String,
    #[serde(default)]
    pub redis_db: i64,

    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Set by the serverless platform; its presence switches the serve mode.
    pub aws_lambda_function_name: Option<String>,
    pub aws_lambda_runtime_api: Option<String>,
    pub aws_lambda_function_memory_size: Option<String>,
    pub aws_lambda_function_version: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server_bind_ip, self.server_port)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            concurrency: self.server_concurrency,
            body_limit: self.server_body_limit,
        }
    }
}

/// Limits applied to the HTTP front end regardless of serve mode.
#[derive(Clone, Copy, Debug)]
pub struct ServerConfig {
    pub concurrency: usize,
    pub body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            body_limit: default_body_limit(),
        }
    }
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_concurrency() -> usize {
    256 * 1024
}

fn default_body_limit() -> usize {
    1024 * 1024
}

fn default_connection() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_queue_name() -> String {
    "default".to_string()
}
