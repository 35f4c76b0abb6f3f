//! Configuration getter.
//!
//! The daemon consumes configuration as a precomputed key/value map — the
//! on-disk format and its parser live outside this crate. Typed accessors
//! fall back to the documented defaults and log rather than fail on
//! unparseable values, so a bad override never takes the daemon down.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

const DEFAULT_REPLY_TIMEOUT_SECS: u64 = 120;
const DEFAULT_ACK_TIMEOUT_SECS: u64 = 10;
const DEFAULT_REQ_TRIES: u32 = 3;
const DEFAULT_LIBEXEC_DIR: &str = "/usr/libexec/ark";

/// Key/value configuration with typed accessors.
#[derive(Clone, Debug, Default)]
pub struct Config {
    values: BTreeMap<String, String>,
}

impl Config {
    /// Creates an empty configuration; every accessor returns its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a configuration from `key=value` override pairs.
    pub fn from_overrides<I, K, V>(overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut config = Self::new();
        for (key, value) in overrides {
            config.set(key, value);
        }
        config
    }

    /// Sets one key, replacing any previous value.
    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.values.insert(key.into(), value.into());
    }

    /// Raw lookup; `None` when the key is absent.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn seconds(&self, key: &str, default: u64) -> Duration {
        Duration::from_secs(self.parsed(key, default))
    }

    fn parsed<T: std::str::FromStr + Copy>(&self, key: &str, default: T) -> T {
        match self.lookup(key) {
            None => default,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(key, value = raw, "ignoring unparseable configuration value");
                default
            }),
        }
    }

    /// How long to wait for the subprocess to finish writing its reply.
    #[must_use]
    pub fn reply_timeout(&self) -> Duration {
        self.seconds("reply-timeout", DEFAULT_REPLY_TIMEOUT_SECS)
    }

    /// How long to wait for the peer to acknowledge a reply before
    /// retransmitting.
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        self.seconds("ack-timeout", DEFAULT_ACK_TIMEOUT_SECS)
    }

    /// Number of reply retransmissions before the transaction fails.
    #[must_use]
    pub fn req_tries(&self) -> u32 {
        self.parsed("req-tries", DEFAULT_REQ_TRIES)
    }

    /// Directory holding the service executables.
    #[must_use]
    pub fn libexec_dir(&self) -> PathBuf {
        PathBuf::from(
            self.lookup("libexec-dir")
                .unwrap_or(DEFAULT_LIBEXEC_DIR),
        )
    }

    /// Users allowed to issue requests, from the comma-separated
    /// `auth-users` key.
    #[must_use]
    pub fn auth_users(&self) -> Vec<String> {
        self.lookup("auth-users")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|user| !user.is_empty())
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remote-shell command for the tunnel backend.
    #[must_use]
    pub fn shell_command(&self) -> String {
        self.lookup("shell-command").unwrap_or("ssh").to_owned()
    }

    /// Remote account expected on the tunnel backend.
    #[must_use]
    pub fn shell_remote_user(&self) -> Option<String> {
        self.lookup("shell-remote-user").map(ToOwned::to_owned)
    }
}
