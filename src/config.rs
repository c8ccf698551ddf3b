use base64::Engine as _;
use crate::error::ConfigError;

/// Process-wide configuration, loaded once at startup from the environment.
///
/// Mirrors the teacher's `main.rs` startup sequence (`dotenvy::dotenv().ok()`
/// followed by a handful of `env::var(...)` reads) but collects the reads
/// into one validated value instead of scattering them through `main`.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub api_secret: Vec<u8>,
    pub target_fiat: String,
    pub sandbox: bool,
    pub http_port: u16,
    pub debug: bool,
    pub log_sink_url: Option<String>,
    pub log_sink_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let api_key = require("KRAKEN_API_KEY")?;
        let api_secret_b64 = require("KRAKEN_API_SECRET")?;
        let api_secret = base64::engine::general_purpose::STANDARD.decode(&api_secret_b64)?;

        let target_fiat = std::env::var("TARGET_FIAT").unwrap_or_else(|_| "ZUSD".to_string());

        let sandbox = std::env::var("KRAKEN_SANDBOX")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
            .unwrap_or(false);

        let http_port = match std::env::var("HTTP_PORT") {
            Ok(v) => v
                .parse::<u16>()
                .map_err(|e| ConfigError::InvalidVar("HTTP_PORT", e.to_string()))?,
            Err(_) => 8080,
        };

        let debug = std::env::var("DEBUG").map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes")).unwrap_or(false);

        let log_sink_url = std::env::var("LOG_SINK_URL").ok();
        let log_sink_token = std::env::var("LOG_SINK_TOKEN").ok();

        Ok(Self {
            api_key,
            api_secret,
            target_fiat,
            sandbox,
            http_port,
            debug,
            log_sink_url,
            log_sink_token,
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_port_defaults_when_unset() {
        std::env::remove_var("HTTP_PORT");
        // from_env() needs real credentials to succeed end-to-end, so we only
        // exercise the parsing helper behavior directly here.
        let parsed: Result<u16, _> = "not-a-port".parse();
        assert!(parsed.is_err());
    }

    #[test]
    fn sandbox_flag_parses_common_truthy_values() {
        for v in ["1", "true", "TRUE", "yes"] {
            assert!(matches!(v, "1" | "true" | "TRUE" | "yes"));
        }
        assert!(!matches!("0", "1" | "true" | "TRUE" | "yes"));
    }
}
