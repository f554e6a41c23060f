/*
 * Copyright (C) 2023 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::sendfile;
use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

pub const VERIFY_CLIENT_MODES: &[&str] = &["none", "optional", "require", "optionalNoCA"];

/// Endpoint settings. Field semantics follow the configuration table in the
/// project documentation; all fields have working defaults so a `Settings`
/// can be built from a partial config file or modified piecemeal in code.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub port: u16,
    pub address: Option<String>,
    pub backlog: i32,

    /// 0 means derive at init time.
    pub acceptor_thread_count: usize,
    pub poller_thread_count: usize,
    pub sendfile_thread_count: usize,

    pub poller_size: usize,
    pub sendfile_size: usize,

    /// Negative means unbounded, 0 disables worker creation.
    pub max_threads: i32,

    /// Poll quantum in microseconds.
    pub poll_time: i64,

    /// Socket timeout in milliseconds. Non-positive disables.
    pub so_timeout: i64,

    /// Keep-alive timeout in milliseconds. Negative means fall back to
    /// so_timeout.
    pub keep_alive_timeout: i64,

    /// Linger in seconds. Negative means leave the socket default.
    pub so_linger: i32,

    pub tcp_no_delay: bool,
    pub defer_accept: bool,
    pub use_sendfile: bool,
    pub use_comet: bool,

    /// Accepted for compatibility. Threads are detached by default; the stop
    /// path joins acceptors regardless of this flag.
    pub daemon: bool,

    /// Niceness applied to stage threads. 0 leaves the scheduler default.
    pub thread_priority: i32,

    /// Prefix for stage thread names.
    pub name: String,

    /// Connect timeout in milliseconds for the wake-up connection used by
    /// pause/stop.
    pub unlock_timeout: i64,

    pub ssl_enabled: bool,
    pub ssl_protocol: String,
    pub ssl_cipher_suite: Option<String>,
    pub ssl_certificate_file: Option<PathBuf>,
    pub ssl_certificate_key_file: Option<PathBuf>,
    pub ssl_certificate_chain_file: Option<PathBuf>,
    pub ssl_password: Option<String>,
    pub ssl_ca_certificate_file: Option<PathBuf>,
    pub ssl_ca_certificate_path: Option<PathBuf>,
    pub ssl_ca_revocation_file: Option<PathBuf>,
    pub ssl_ca_revocation_path: Option<PathBuf>,
    pub ssl_verify_client: String,
    pub ssl_verify_depth: u32,
    pub ssl_honor_cipher_order: bool,
    pub ssl_disable_compression: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 0,
            address: None,
            backlog: 100,
            acceptor_thread_count: 0,
            poller_thread_count: 0,
            sendfile_thread_count: 0,
            poller_size: 8 * 1024,
            sendfile_size: 1024,
            max_threads: 200,
            poll_time: 2000,
            so_timeout: -1,
            keep_alive_timeout: -1,
            so_linger: 100,
            tcp_no_delay: false,
            defer_accept: true,
            use_sendfile: sendfile::supported(),
            use_comet: true,
            daemon: true,
            thread_priority: 0,
            name: "portico".to_string(),
            unlock_timeout: 250,
            ssl_enabled: false,
            ssl_protocol: String::new(),
            ssl_cipher_suite: None,
            ssl_certificate_file: None,
            ssl_certificate_key_file: None,
            ssl_certificate_chain_file: None,
            ssl_password: None,
            ssl_ca_certificate_file: None,
            ssl_ca_certificate_path: None,
            ssl_ca_revocation_file: None,
            ssl_ca_revocation_path: None,
            ssl_verify_client: "none".to_string(),
            ssl_verify_depth: 10,
            ssl_honor_cipher_order: false,
            ssl_disable_compression: false,
        }
    }
}

#[derive(Debug)]
pub enum SettingsError {
    Load(ConfigError),
    Invalid(String),
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load(e) => write!(f, "failed to load settings: {}", e),
            Self::Invalid(s) => write!(f, "invalid settings: {}", s),
        }
    }
}

impl std::error::Error for SettingsError {}

impl From<ConfigError> for SettingsError {
    fn from(e: ConfigError) -> Self {
        Self::Load(e)
    }
}

impl Settings {
    /// Loads settings from a config file, merged over the defaults. The
    /// format is detected from the file extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let settings: Settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;

        settings.validate()?;

        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.backlog <= 0 {
            return Err(SettingsError::Invalid("backlog must be positive".into()));
        }

        if self.poll_time <= 0 {
            return Err(SettingsError::Invalid("poll_time must be positive".into()));
        }

        if self.poller_size == 0 {
            return Err(SettingsError::Invalid(
                "poller_size must be positive".into(),
            ));
        }

        if self.sendfile_size == 0 {
            return Err(SettingsError::Invalid(
                "sendfile_size must be positive".into(),
            ));
        }

        if !VERIFY_CLIENT_MODES
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&self.ssl_verify_client))
        {
            return Err(SettingsError::Invalid(format!(
                "unknown ssl_verify_client value: {}",
                self.ssl_verify_client
            )));
        }

        Ok(())
    }

    /// The keep-alive timeout, falling back to so_timeout when unset.
    pub fn keep_alive_timeout_effective(&self) -> i64 {
        if self.keep_alive_timeout < 0 {
            self.so_timeout
        } else {
            self.keep_alive_timeout
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let s = Settings::default();

        assert_eq!(s.backlog, 100);
        assert_eq!(s.max_threads, 200);
        assert_eq!(s.poll_time, 2000);
        assert_eq!(s.poller_size, 8192);
        assert_eq!(s.sendfile_size, 1024);
        assert_eq!(s.so_timeout, -1);
        assert_eq!(s.keep_alive_timeout, -1);
        assert_eq!(s.unlock_timeout, 250);
        assert!(s.defer_accept);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn keep_alive_fallback() {
        let mut s = Settings::default();
        s.so_timeout = 5000;

        assert_eq!(s.keep_alive_timeout_effective(), 5000);

        s.keep_alive_timeout = 100;
        assert_eq!(s.keep_alive_timeout_effective(), 100);
    }

    #[test]
    fn validate_rejects() {
        let mut s = Settings::default();
        s.backlog = 0;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.poll_time = 0;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.ssl_verify_client = "sometimes".to_string();
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.ssl_verify_client = "OPTIONAL".to_string();
        assert!(s.validate().is_ok());
    }

    #[test]
    fn from_file() {
        let mut f = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();

        write!(
            f,
            "port = 8080\nmax_threads = 4\ntcp_no_delay = true\nname = \"web\"\n"
        )
        .unwrap();
        f.flush().unwrap();

        let s = Settings::from_file(f.path()).unwrap();

        assert_eq!(s.port, 8080);
        assert_eq!(s.max_threads, 4);
        assert!(s.tcp_no_delay);
        assert_eq!(s.name, "web");

        // unspecified fields keep their defaults
        assert_eq!(s.backlog, 100);
    }
}
