use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use clap::Parser;

pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "appdock";
pub const DEFAULT_JWT_SECRET: &str = "appdock-secret-key-change-in-production";
pub const TOKEN_ISSUER: &str = "appdock";
pub const TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Parser)]
#[command(
    name = "appdock-bridge",
    author,
    version,
    about = "Streams container logs and interactive shells over WebSocket"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "APPDOCK_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Login name accepted by the token endpoint.
    #[arg(long, env = "APPDOCK_USERNAME", default_value = DEFAULT_USERNAME)]
    pub username: String,

    /// Password accepted by the token endpoint.
    #[arg(long, env = "APPDOCK_PASSWORD", default_value = DEFAULT_PASSWORD, hide_default_value = true)]
    pub password: String,

    /// HMAC secret used to sign access tokens.
    #[arg(long, env = "APPDOCK_JWT_SECRET", default_value = DEFAULT_JWT_SECRET, hide_default_value = true)]
    pub jwt_secret: String,

    /// Treat every request as authenticated (development mode only).
    #[arg(long, env = "APPDOCK_AUTH_DISABLED", default_value_t = false)]
    pub auth_disabled: bool,

    /// Historical log lines sent before following.
    #[arg(long, env = "APPDOCK_LOG_TAIL", default_value = "100")]
    pub log_tail: String,

    /// Prefix streamed log lines with Docker timestamps.
    #[arg(long, env = "APPDOCK_LOG_TIMESTAMPS", default_value_t = true, action = clap::ArgAction::Set)]
    pub log_timestamps: bool,

    /// Command started for interactive exec sessions.
    #[arg(long, env = "APPDOCK_EXEC_SHELL", default_value = "/bin/sh")]
    pub exec_shell: String,

    /// Grace period applied during shutdown.
    #[arg(long, env = "APPDOCK_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

/// Credentials and signing material, fixed for the lifetime of the process.
#[derive(Clone)]
pub struct AuthSettings {
    pub username: String,
    pub password: String,
    pub jwt_secret: Vec<u8>,
    pub issuer: String,
    pub token_ttl: Duration,
    pub enabled: bool,
}

impl AuthSettings {
    pub fn new(username: impl Into<String>, password: impl Into<String>, secret: &[u8]) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            jwt_secret: secret.to_vec(),
            issuer: TOKEN_ISSUER.to_string(),
            token_ttl: TOKEN_TTL,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn uses_default_password(&self) -> bool {
        self.password == DEFAULT_PASSWORD
    }

    pub fn uses_default_secret(&self) -> bool {
        self.jwt_secret == DEFAULT_JWT_SECRET.as_bytes()
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self::new(
            DEFAULT_USERNAME,
            DEFAULT_PASSWORD,
            DEFAULT_JWT_SECRET.as_bytes(),
        )
    }
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("username", &self.username)
            .field("token_ttl", &self.token_ttl)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct DockerSettings {
    pub log_tail: String,
    pub log_timestamps: bool,
    pub exec_shell: String,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            log_tail: "100".to_string(),
            log_timestamps: true,
            exec_shell: "/bin/sh".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub auth: AuthSettings,
    pub docker: DockerSettings,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let username = non_empty_or(cli.username, DEFAULT_USERNAME);
        // Passwords and secrets are taken byte-for-byte; only an empty value falls back.
        let password = or_default(cli.password, DEFAULT_PASSWORD);
        let secret = or_default(cli.jwt_secret, DEFAULT_JWT_SECRET);

        let mut auth = AuthSettings::new(username, password, secret.as_bytes());
        if cli.auth_disabled {
            auth = auth.disabled();
        }

        Ok(ServerConfig {
            listen_addr,
            auth,
            docker: DockerSettings {
                log_tail: non_empty_or(cli.log_tail, "100"),
                log_timestamps: cli.log_timestamps,
                exec_shell: non_empty_or(cli.exec_shell, "/bin/sh"),
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

fn or_default(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServerConfig {
        let mut argv = vec!["appdock-bridge"];
        argv.extend_from_slice(args);
        ServerConfig::try_from(Cli::parse_from(argv)).expect("config")
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--listen-addr",
            "127.0.0.1:9000",
            "--username",
            "ops",
            "--auth-disabled",
            "--log-timestamps",
            "false",
        ]);
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.auth.username, "ops");
        assert!(!config.auth.enabled);
        assert!(!config.docker.log_timestamps);
    }

    #[test]
    fn blank_credentials_fall_back_to_defaults() {
        let config = parse(&["--username", " ", "--jwt-secret", ""]);
        assert_eq!(config.auth.username, DEFAULT_USERNAME);
        assert!(config.auth.uses_default_secret());
    }

    #[test]
    fn invalid_listen_addr_is_rejected() {
        let cli = Cli::parse_from(["appdock-bridge", "--listen-addr", "not-an-addr"]);
        assert!(ServerConfig::try_from(cli).is_err());
    }

    #[test]
    fn debug_output_hides_secrets() {
        let rendered = format!("{:?}", AuthSettings::default());
        assert!(!rendered.contains(DEFAULT_PASSWORD));
        assert!(!rendered.contains(DEFAULT_JWT_SECRET));
    }
}
