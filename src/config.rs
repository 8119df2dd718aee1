use std::fs::{self, File};
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

use crate::auth::Credentials;
use crate::model::{Calendar, MINUTE_MS};

/// Server settings, read once from `VIVAT_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub users_file: Option<PathBuf>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub utc_offset_minutes: i64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let utc_offset_minutes = parse_or(&lookup, "VIVAT_UTC_OFFSET_MINUTES", 0i64)?;
        if utc_offset_minutes.abs() > 14 * 60 {
            return Err(ConfigError::Invalid {
                var: "VIVAT_UTC_OFFSET_MINUTES",
                value: utc_offset_minutes.to_string(),
            });
        }
        let max_connections = parse_or(&lookup, "VIVAT_MAX_CONNECTIONS", 256usize)?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "VIVAT_MAX_CONNECTIONS",
                value: "0".into(),
            });
        }

        Ok(Self {
            port: parse_or(&lookup, "VIVAT_PORT", 5433)?,
            bind: lookup("VIVAT_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(lookup("VIVAT_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("VIVAT_PASSWORD").unwrap_or_else(|| "vivat".into()),
            users_file: lookup("VIVAT_USERS_FILE").map(PathBuf::from),
            max_connections,
            compact_threshold: parse_or(&lookup, "VIVAT_COMPACT_THRESHOLD", 1000)?,
            utc_offset_minutes,
            tls_cert: lookup("VIVAT_TLS_CERT"),
            tls_key: lookup("VIVAT_TLS_KEY"),
            metrics_port: lookup("VIVAT_METRICS_PORT")
                .map(|v| parse_value("VIVAT_METRICS_PORT", &v))
                .transpose()?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn calendar(&self) -> Calendar {
        Calendar::new(self.utc_offset_minutes * MINUTE_MS)
    }

    /// Per-user passwords from the users file when configured. The shared
    /// password covers everyone else only when no users file is given.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let Some(path) = &self.users_file else {
            return Ok(Credentials::shared(self.password.clone()));
        };
        let json = fs::read_to_string(path)?;
        let users = Credentials::parse_users(&json)
            .map_err(|e| ConfigError::Users(format!("{}: {e}", path.display())))?;
        if users.is_empty() {
            return Err(ConfigError::Users(format!("{}: no users defined", path.display())));
        }
        Ok(Credentials::new(users, None))
    }

    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ConfigError> {
        load_tls_acceptor(self.tls_cert.as_deref(), self.tls_key.as_deref())
    }
}

fn parse_value<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        Some(value) => parse_value(var, &value),
        None => Ok(default),
    }
}

pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> Result<Option<TlsAcceptor>, ConfigError> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(ConfigError::Tls(
                "both VIVAT_TLS_CERT and VIVAT_TLS_KEY must be set, or neither".into(),
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| ConfigError::Tls("no private key found in key file".into()))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::Tls(e.to_string()))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    Users(String),
    Tls(String),
    Io(io::Error),
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid {var}: {value:?}"),
            ConfigError::Users(msg) => write!(f, "users file: {msg}"),
            ConfigError::Tls(msg) => write!(f, "tls: {msg}"),
            ConfigError::Io(e) if e.kind() == ErrorKind::NotFound => write!(f, "file not found: {e}"),
            ConfigError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
