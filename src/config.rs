//! Configuration for the gateway.
//!
//! Precedence, lowest to highest: built-in defaults < `gateway.toml` <
//! process environment variables < CLI flags. All secrets (provider API
//! keys) are read from the environment or the TOML file; the binary
//! never hard-codes one.

use anyhow::Result;
use serde::Deserialize;

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: String,

    // Provider credentials
    pub openrouter_api_key: Option<String>,
    pub opencode_zen_api_key: Option<String>,

    // Upstream base URLs (parameterized so tests/deployments can point elsewhere)
    pub ollama_base_url: String,
    pub opencode_zen_base_url: String,
    pub openrouter_base_url: String,

    // Scanner (C3)
    pub scanner_ttl_seconds: u64,

    // Retry policy (C5)
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    // Circuit breaker (C4)
    pub circuit_failure_threshold: u32,
    pub circuit_reset_ms: u64,

    // Spending ledger (C9)
    pub spending_daily_cap: f64,
    pub spending_monthly_cap: f64,
    pub spending_warn_at_percent: u8,

    // Telemetry (C6)
    pub telemetry_endpoint: Option<String>,
    pub telemetry_batch_size: usize,
    pub telemetry_flush_interval_ms: u64,

    // Transaction inspector (C10)
    pub inspector_max_transactions: usize,
    pub inspector_enabled: bool,

    // Fanout (C8)
    pub fanout_max_models: usize,

    // Per-attempt HTTP timeouts (C7)
    pub streaming_total_timeout_ms: u64,
    pub streaming_idle_timeout_ms: u64,
}

/// Mirrors the recognized `[gateway]`/`[api_keys]`/... TOML layout from a config
/// file. Every field is optional: an absent file, or an absent field within a
/// present file, simply falls through to the environment-variable layer.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    gateway: Option<FileGateway>,
    api_keys: Option<FileApiKeys>,
    scanner: Option<FileScanner>,
    retry: Option<FileRetry>,
    circuit: Option<FileCircuit>,
    spending: Option<FileSpending>,
    telemetry: Option<FileTelemetry>,
    inspector: Option<FileInspector>,
    fanout: Option<FileFanout>,
    streaming: Option<FileStreaming>,
}

#[derive(Debug, Default, Deserialize)]
struct FileGateway {
    port: Option<u16>,
    data_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileApiKeys {
    openrouter: Option<String>,
    opencode_zen: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileScanner {
    ttl_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileRetry {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileCircuit {
    failure_threshold: Option<u32>,
    reset_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileSpending {
    daily_cap: Option<f64>,
    monthly_cap: Option<f64>,
    warn_at_percent: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
struct FileTelemetry {
    endpoint: Option<String>,
    batch_size: Option<usize>,
    flush_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileInspector {
    max_transactions: Option<usize>,
    enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct FileFanout {
    max_models: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct FileStreaming {
    total_timeout_ms: Option<u64>,
    idle_timeout_ms: Option<u64>,
}

impl Config {
    /// Load with full precedence: defaults < `gateway.toml` < env vars < CLI flags.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = Self::read_file_config("gateway.toml");
        let mut config = Self::from_layers(&file);
        config.apply_cli_overrides(std::env::args().skip(1));
        config.validate()?;
        Ok(config)
    }

    fn read_file_config(path: &str) -> FileConfig {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|err| {
                tracing::warn!(error = %err, path, "failed to parse config file, using defaults");
                FileConfig::default()
            }),
            Err(_) => FileConfig::default(),
        }
    }

    fn from_layers(file: &FileConfig) -> Self {
        let gateway = file.gateway.as_ref();
        let api_keys = file.api_keys.as_ref();
        let scanner = file.scanner.as_ref();
        let retry = file.retry.as_ref();
        let circuit = file.circuit.as_ref();
        let spending = file.spending.as_ref();
        let telemetry = file.telemetry.as_ref();
        let inspector = file.inspector.as_ref();
        let fanout = file.fanout.as_ref();
        let streaming = file.streaming.as_ref();

        Self {
            port: env_or(
                "MULTIAI_PORT",
                gateway.and_then(|g| g.port),
                11434,
            ),
            data_dir: env_or_string("GATEWAY_DATA_DIR", gateway.and_then(|g| g.data_dir.clone()), "./data"),

            openrouter_api_key: std::env::var("OPENROUTER_API_KEY")
                .ok()
                .or_else(|| api_keys.and_then(|k| k.openrouter.clone())),
            opencode_zen_api_key: std::env::var("OPENCODE_ZEN_API_KEY")
                .ok()
                .or_else(|| api_keys.and_then(|k| k.opencode_zen.clone())),

            ollama_base_url: "http://localhost:11434".to_string(),
            opencode_zen_base_url: "https://zen.opencode.ai".to_string(),
            openrouter_base_url: "https://openrouter.ai".to_string(),

            scanner_ttl_seconds: scanner.and_then(|s| s.ttl_seconds).unwrap_or(300),

            retry_max_attempts: retry.and_then(|r| r.max_attempts).unwrap_or(3),
            retry_base_delay_ms: retry.and_then(|r| r.base_delay_ms).unwrap_or(1000),
            retry_max_delay_ms: retry.and_then(|r| r.max_delay_ms).unwrap_or(30_000),

            circuit_failure_threshold: circuit.and_then(|c| c.failure_threshold).unwrap_or(5),
            circuit_reset_ms: circuit.and_then(|c| c.reset_ms).unwrap_or(60_000),

            spending_daily_cap: env_or(
                "MULTIAI_DAILY_CAP",
                spending.and_then(|s| s.daily_cap),
                5.00,
            ),
            spending_monthly_cap: env_or(
                "MULTIAI_MONTHLY_CAP",
                spending.and_then(|s| s.monthly_cap),
                50.00,
            ),
            spending_warn_at_percent: env_or(
                "MULTIAI_WARN_AT_PERCENT",
                spending.and_then(|s| s.warn_at_percent),
                80,
            ),

            telemetry_endpoint: telemetry.and_then(|t| t.endpoint.clone()),
            telemetry_batch_size: telemetry.and_then(|t| t.batch_size).unwrap_or(10),
            telemetry_flush_interval_ms: telemetry.and_then(|t| t.flush_interval_ms).unwrap_or(5000),

            inspector_max_transactions: inspector.and_then(|i| i.max_transactions).unwrap_or(1000),
            inspector_enabled: inspector.and_then(|i| i.enabled).unwrap_or(true),

            fanout_max_models: fanout.and_then(|f| f.max_models).unwrap_or(3),

            streaming_total_timeout_ms: streaming.and_then(|s| s.total_timeout_ms).unwrap_or(120_000),
            streaming_idle_timeout_ms: streaming.and_then(|s| s.idle_timeout_ms).unwrap_or(30_000),
        }
    }

    /// Apply `--key=value` / `--key value` overrides for the handful of options
    /// most commonly tweaked from the command line. Unrecognized flags are
    /// ignored rather than rejected, since this gateway has no subcommands.
    fn apply_cli_overrides(&mut self, args: impl Iterator<Item = String>) {
        let mut args = args.peekable();
        while let Some(arg) = args.next() {
            let (key, inline_value) = match arg.strip_prefix("--") {
                Some(rest) => match rest.split_once('=') {
                    Some((k, v)) => (k.to_string(), Some(v.to_string())),
                    None => (rest.to_string(), None),
                },
                None => continue,
            };
            let value = inline_value.or_else(|| args.next());
            let Some(value) = value else { continue };

            match key.as_str() {
                "port" => {
                    if let Ok(v) = value.parse() {
                        self.port = v;
                    }
                }
                "daily-cap" => {
                    if let Ok(v) = value.parse() {
                        self.spending_daily_cap = v;
                    }
                }
                "monthly-cap" => {
                    if let Ok(v) = value.parse() {
                        self.spending_monthly_cap = v;
                    }
                }
                "data-dir" => self.data_dir = value,
                _ => {}
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("gateway.port must be nonzero");
        }
        if self.spending_daily_cap < 0.0 || self.spending_monthly_cap < 0.0 {
            anyhow::bail!("spending caps must be non-negative");
        }
        Ok(())
    }

    pub fn has_openrouter(&self) -> bool {
        self.openrouter_api_key.is_some()
    }

    pub fn has_opencode_zen(&self) -> bool {
        self.opencode_zen_api_key.is_some()
    }
}

fn env_or<T: std::str::FromStr>(var: &str, file_value: Option<T>, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .or(file_value)
        .unwrap_or(default)
}

fn env_or_string(var: &str, file_value: Option<String>, default: &str) -> String {
    std::env::var(var).ok().or(file_value).unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
impl Config {
    /// Build a default `Config` for tests elsewhere in the crate that need
    /// one but don't care about file/env/CLI layering.
    pub fn load_for_test() -> Self {
        Self::from_layers(&FileConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Config {
        Config::from_layers(&FileConfig::default())
    }

    #[test]
    fn defaults_match_the_recognized_option_table() {
        let config = defaults();
        assert_eq!(config.port, 11434);
        assert_eq!(config.scanner_ttl_seconds, 300);
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.retry_base_delay_ms, 1000);
        assert_eq!(config.retry_max_delay_ms, 30_000);
        assert_eq!(config.circuit_failure_threshold, 5);
        assert_eq!(config.circuit_reset_ms, 60_000);
        assert_eq!(config.spending_daily_cap, 5.00);
        assert_eq!(config.spending_monthly_cap, 50.00);
        assert_eq!(config.spending_warn_at_percent, 80);
        assert_eq!(config.telemetry_batch_size, 10);
        assert_eq!(config.telemetry_flush_interval_ms, 5000);
        assert_eq!(config.inspector_max_transactions, 1000);
        assert!(config.inspector_enabled);
        assert_eq!(config.fanout_max_models, 3);
        assert_eq!(config.streaming_total_timeout_ms, 120_000);
        assert_eq!(config.streaming_idle_timeout_ms, 30_000);
        assert!(config.telemetry_endpoint.is_none());
    }

    #[test]
    fn cli_flags_override_defaults() {
        let mut config = defaults();
        config.apply_cli_overrides(
            vec!["--port=9999".to_string(), "--daily-cap".to_string(), "12.5".to_string()].into_iter(),
        );
        assert_eq!(config.port, 9999);
        assert_eq!(config.spending_daily_cap, 12.5);
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut config = defaults();
        config.port = 0;
        assert!(config.validate().is_err());
    }
}
