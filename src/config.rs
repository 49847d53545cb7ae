//! Connection settings for a batch.
//!
//! Everything here is supplied per invocation. [`Defaults`] gathers the
//! environment-provided fallbacks once, at the edge of the program, so the
//! sending code never reads process state on its own.

use std::{env, fmt, time::Duration};

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Host used when neither a flag nor `SMTP_HOST` names one.
pub const DEFAULT_HOST: &str = "smtp.gmail.com";

/// Implicit TLS submission port.
pub const DEFAULT_PORT: u16 = 465;

/// Applies to connecting and to every exchange with the server.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How the connection is secured before credentials are sent.
///
/// Both modes end with a TLS session verified against the platform roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Security {
    /// TLS is negotiated as soon as the TCP connection is up (SMTPS).
    #[default]
    Implicit,

    /// Plain TCP upgraded with the `STARTTLS` command before `AUTH`.
    StartTls,
}

/// The mail submission endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub security: Security,
}

impl Endpoint {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, security: Security) -> Self {
        Self {
            host: host.into(),
            port,
            security,
        }
    }

    /// `host:port`, as handed to the socket layer.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT, Security::Implicit)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({:?})", self.host, self.port, self.security)
    }
}

/// Login for the submission server.
///
/// The secret is wiped from memory on drop and never shows up in `Debug`
/// output.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    secret: Zeroizing<String>,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Zeroizing::new(secret.into()),
        }
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn secret(&self) -> &str {
        self.secret.as_str()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Fallback values for the caller, read from the environment.
///
/// | Variable          | Field      |
/// |-------------------|------------|
/// | `SMTP_HOST`       | `host`     |
/// | `SMTP_PORT`       | `port`     |
/// | `SENDER_EMAIL`    | `sender`   |
/// | `SENDER_PASSWORD` | `password` |
#[derive(Clone, Default)]
pub struct Defaults {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub sender: Option<String>,
    pub password: Option<Zeroizing<String>>,
}

impl Defaults {
    /// Reads the defaults from the process environment.
    ///
    /// Unset, empty, or unparsable variables are treated as absent.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the defaults from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let port = get("SMTP_PORT").and_then(|port| match port.trim().parse() {
            Ok(port) => Some(port),
            Err(e) => {
                tracing::warn!("Ignoring SMTP_PORT={port}: {e}");
                None
            }
        });

        Self {
            host: get("SMTP_HOST"),
            port,
            sender: get("SENDER_EMAIL"),
            password: get("SENDER_PASSWORD").map(Zeroizing::new),
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

impl fmt::Debug for Defaults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Defaults")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("sender", &self.sender)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
