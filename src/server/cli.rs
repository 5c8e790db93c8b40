//! Command-line interface and layered configuration for `janusd`.
//!
//! Configuration resolves in the usual order: built-in defaults, then a
//! `janusd.toml` next to the working directory, then `JANUS_`-prefixed
//! environment variables, then explicit command-line flags. Flags only
//! override what the operator actually passed.

use std::path::PathBuf;

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// Resolved runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// TCP bind address.
    pub bind: String,
    /// Serve a single session over stdin/stdout instead of listening.
    pub stdio: bool,
    /// Minimum worker count offered at handshake.
    pub workers: u32,
    /// Allow-list file: one fully-qualified class name per line.
    pub allow_list: Option<PathBuf>,
    /// TLS private-key path, handed to the transport integration point.
    pub tls_key: Option<PathBuf>,
    /// TLS certificate path, handed to the transport integration point.
    pub tls_cert: Option<PathBuf>,
    /// Hold the process-wide lock across every request execution.
    pub global_lock: bool,
    /// Offer the shared-memory fast path to co-located clients.
    pub shm: bool,
    /// Identity announced in HELLO_ACK.
    pub identity: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9700".to_owned(),
            stdio: false,
            workers: 4,
            allow_list: None,
            tls_key: None,
            tls_cert: None,
            global_lock: false,
            shm: true,
            identity: "janusd".to_owned(),
        }
    }
}

/// Command-line flags; unset flags defer to the file and environment
/// layers.
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(name = "janusd", about = "Object-bridge daemon")]
pub struct Cli {
    /// TCP bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Serve one session over stdin/stdout.
    #[arg(long)]
    pub stdio: bool,
    /// Minimum worker count.
    #[arg(long)]
    pub workers: Option<u32>,
    /// Allow-list file path.
    #[arg(long)]
    pub allow_list: Option<PathBuf>,
    /// TLS private-key path.
    #[arg(long)]
    pub tls_key: Option<PathBuf>,
    /// TLS certificate path.
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,
    /// Hold the process-wide lock across every request.
    #[arg(long)]
    pub global_lock: bool,
    /// Disable the shared-memory fast path.
    #[arg(long)]
    pub no_shm: bool,
    /// Identity announced to clients.
    #[arg(long)]
    pub identity: Option<String>,
}

impl AppConfig {
    fn apply_cli(mut self, cli: &Cli) -> Self {
        if let Some(bind) = &cli.bind {
            self.bind.clone_from(bind);
        }
        if cli.stdio {
            self.stdio = true;
        }
        if let Some(workers) = cli.workers {
            self.workers = workers;
        }
        if let Some(path) = &cli.allow_list {
            self.allow_list = Some(path.clone());
        }
        if let Some(path) = &cli.tls_key {
            self.tls_key = Some(path.clone());
        }
        if let Some(path) = &cli.tls_cert {
            self.tls_cert = Some(path.clone());
        }
        if cli.global_lock {
            self.global_lock = true;
        }
        if cli.no_shm {
            self.shm = false;
        }
        if let Some(identity) = &cli.identity {
            self.identity.clone_from(identity);
        }
        self
    }

    /// Resolve configuration from every layer, with `args` as the
    /// command line.
    ///
    /// # Errors
    /// Returns a [`figment::Error`] for malformed files or environment
    /// values.
    pub fn load_from_iter<I, T>(args: I) -> Result<Self, figment::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::parse_from(args);
        let base: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("janusd.toml"))
            .merge(Env::prefixed("JANUS_"))
            .extract()?;
        Ok(base.apply_cli(&cli))
    }
}

#[cfg(test)]
mod tests {
    use figment::Jail;
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn env_config_loading() {
        Jail::expect_with(|j| {
            j.set_env("JANUS_BIND", "0.0.0.0:9999");
            j.set_env("JANUS_WORKERS", "8");
            let cfg = AppConfig::load_from_iter(["janusd"]).expect("load");
            assert_eq!(cfg.bind, "0.0.0.0:9999");
            assert_eq!(cfg.workers, 8);
            Ok(())
        });
    }

    #[rstest]
    fn cli_overrides_env() {
        Jail::expect_with(|j| {
            j.set_env("JANUS_BIND", "0.0.0.0:9999");
            let cfg = AppConfig::load_from_iter(["janusd", "--bind", "127.0.0.1:1234"])
                .expect("load");
            assert_eq!(cfg.bind, "127.0.0.1:1234");
            Ok(())
        });
    }

    #[rstest]
    fn loads_from_toml_file() {
        Jail::expect_with(|j| {
            j.create_file("janusd.toml", "workers = 2\nglobal_lock = true\n")?;
            let cfg = AppConfig::load_from_iter(["janusd"]).expect("load");
            assert_eq!(cfg.workers, 2);
            assert!(cfg.global_lock);
            Ok(())
        });
    }

    #[rstest]
    fn shm_flag_disables() {
        Jail::expect_with(|_j| {
            let cfg = AppConfig::load_from_iter(["janusd", "--no-shm"]).expect("load");
            assert!(!cfg.shm);
            Ok(())
        });
    }
}
