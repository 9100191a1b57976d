use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub temp_dir: String,
    /// Largest accepted upload body in bytes; `None` is unlimited.
    pub max_upload_bytes: Option<u64>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Ephemeral file-sharing store")]
pub struct Args {
    /// Host to bind to (overrides TRANSFER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TRANSFER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides TRANSFER_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Directory large uploads are spilled into (overrides TRANSFER_TEMP_DIR)
    #[arg(long)]
    pub temp_dir: Option<String>,

    /// Upload size cap in bytes (overrides TRANSFER_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<u64>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::merge(Args::parse())
    }

    /// CLI values win, then environment variables, then defaults.
    pub fn merge(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("TRANSFER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_env::<u16>("TRANSFER_PORT")?.unwrap_or(3000);
        let env_storage =
            env::var("TRANSFER_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_temp = env::var("TRANSFER_TEMP_DIR")
            .unwrap_or_else(|_| env::temp_dir().to_string_lossy().into_owned());
        let env_max_upload = parse_env::<u64>("TRANSFER_MAX_UPLOAD_BYTES")?;

        // --- Merge ---
        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            temp_dir: args.temp_dir.unwrap_or(env_temp),
            max_upload_bytes: args.max_upload_bytes.or(env_max_upload),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_win() {
        let cfg = AppConfig::merge(Args {
            host: Some("127.0.0.1".into()),
            port: Some(8080),
            storage_dir: Some("/srv/objects".into()),
            temp_dir: Some("/srv/tmp".into()),
            max_upload_bytes: Some(1024),
        })
        .unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:8080");
        assert_eq!(cfg.storage_dir, "/srv/objects");
        assert_eq!(cfg.temp_dir, "/srv/tmp");
        assert_eq!(cfg.max_upload_bytes, Some(1024));
    }

    #[test]
    fn args_parse_from_command_line() {
        let args = Args::parse_from(["transfer-store", "--port", "9000", "--max-upload-bytes", "10"]);
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.max_upload_bytes, Some(10));
        assert_eq!(args.host, None);
    }
}
