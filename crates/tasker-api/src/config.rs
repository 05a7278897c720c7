//! API server configuration.

use serde::Deserialize;

/// API server configuration loaded from environment variables.
///
/// Environment variables are prefixed with `TASKER_API_`:
/// - `TASKER_API_HOST`: Server bind address (default: "0.0.0.0")
/// - `TASKER_API_PORT`: Server port (default: 8090)
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

impl ApiConfig {
    /// Load configuration from `TASKER_API_`-prefixed environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("TASKER_API_").from_env::<ApiConfig>()
    }

    /// Address suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ApiConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8090");
    }

    #[test]
    fn test_prefixed_vars() {
        let vars = vec![("TASKER_API_PORT".to_string(), "9000".to_string())];
        let config: ApiConfig = envy::prefixed("TASKER_API_").from_iter(vars).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
    }
}
