//! Simple-protocol driver built from structured options

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use url::Url;

use crate::config::duration_ms;
use crate::db::connection::{apply_client_options, ClientOption, ClientSettings, Database};
use crate::db::driver::Driver;
use crate::error::{Error, Result};

/// Transport used to reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    /// `addr` names the directory holding the server socket.
    Unix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    Allow,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl From<SslMode> for PgSslMode {
    fn from(mode: SslMode) -> Self {
        match mode {
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Allow => PgSslMode::Allow,
            SslMode::Prefer => PgSslMode::Prefer,
            SslMode::Require => PgSslMode::Require,
            SslMode::VerifyCa => PgSslMode::VerifyCa,
            SslMode::VerifyFull => PgSslMode::VerifyFull,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub mode: SslMode,
    pub root_cert: Option<PathBuf>,
}

/// Raw adjustment of the connect options, applied after everything else.
#[derive(Clone)]
pub struct ConnectHook(Arc<dyn Fn(PgConnectOptions) -> PgConnectOptions + Send + Sync>);

impl ConnectHook {
    pub fn new<F>(hook: F) -> Self
    where
        F: Fn(PgConnectOptions) -> PgConnectOptions + Send + Sync + 'static,
    {
        Self(Arc::new(hook))
    }

    fn apply(&self, options: PgConnectOptions) -> PgConnectOptions {
        (self.0)(options)
    }
}

impl fmt::Debug for ConnectHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectHook")
    }
}

/// One facet of the connection, in the order [`SimpleDriver::connection_options`]
/// emits them.
#[derive(Debug, Clone)]
pub enum ConnOption {
    Dsn(String),
    Addr(String),
    ApplicationName(String),
    ConnParams(IndexMap<String, String>),
    Database(String),
    DialTimeout(Duration),
    Insecure(bool),
    Network(Network),
    Password(String),
    StatementTimeout(Duration),
    LockTimeout(Duration),
    User(String),
    Tls(TlsSettings),
    Custom(ConnectHook),
}

/// Connect options ready for the pool.
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    pub connect: PgConnectOptions,
    pub dial_timeout: Option<Duration>,
}

/// Driver speaking the simple query protocol. Statements are sent unprepared,
/// which keeps it usable behind transaction-pooling proxies.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimpleDriver {
    /// Full connection URL. Facets it sets take precedence over the fields below.
    pub dsn: Option<String>,
    pub network: Option<Network>,
    /// `host:port` for TCP, socket directory for Unix.
    pub addr: Option<String>,
    /// Extra server parameters, sent as `-c key=value`.
    pub conn_params: IndexMap<String, String>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub tls: Option<TlsSettings>,
    #[serde(deserialize_with = "duration_ms::deserialize")]
    pub dial_timeout: Option<Duration>,
    #[serde(deserialize_with = "duration_ms::deserialize")]
    pub statement_timeout: Option<Duration>,
    #[serde(deserialize_with = "duration_ms::deserialize")]
    pub lock_timeout: Option<Duration>,
    pub app_name: Option<String>,
    pub insecure: Option<bool>,
    #[serde(skip)]
    pub options: Vec<ConnOption>,
}

fn non_empty(value: &Option<String>) -> Option<&String> {
    value.as_ref().filter(|value| !value.is_empty())
}

fn non_zero(value: Option<Duration>) -> Option<Duration> {
    value.filter(|value| !value.is_zero())
}

impl SimpleDriver {
    pub fn from_dsn(dsn: impl Into<String>) -> Self {
        Self {
            dsn: Some(dsn.into()),
            ..Self::default()
        }
    }

    /// Append a raw connect-options hook.
    pub fn with_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(PgConnectOptions) -> PgConnectOptions + Send + Sync + 'static,
    {
        self.options.push(ConnOption::Custom(ConnectHook::new(hook)));
        self
    }

    /// The configured facets in emission order. Unset, empty and zero values
    /// are skipped.
    pub fn connection_options(&self) -> Vec<ConnOption> {
        let mut options = Vec::new();

        if let Some(dsn) = non_empty(&self.dsn) {
            options.push(ConnOption::Dsn(dsn.clone()));
        }
        if let Some(addr) = non_empty(&self.addr) {
            options.push(ConnOption::Addr(addr.clone()));
        }
        if let Some(app_name) = non_empty(&self.app_name) {
            options.push(ConnOption::ApplicationName(app_name.clone()));
        }
        if !self.conn_params.is_empty() {
            options.push(ConnOption::ConnParams(self.conn_params.clone()));
        }
        if let Some(database) = non_empty(&self.database) {
            options.push(ConnOption::Database(database.clone()));
        }
        if let Some(timeout) = non_zero(self.dial_timeout) {
            options.push(ConnOption::DialTimeout(timeout));
        }
        if let Some(insecure) = self.insecure {
            options.push(ConnOption::Insecure(insecure));
        }
        if let Some(network) = self.network {
            options.push(ConnOption::Network(network));
        }
        if let Some(password) = non_empty(&self.password) {
            options.push(ConnOption::Password(password.clone()));
        }
        if let Some(timeout) = non_zero(self.statement_timeout) {
            options.push(ConnOption::StatementTimeout(timeout));
        }
        if let Some(timeout) = non_zero(self.lock_timeout) {
            options.push(ConnOption::LockTimeout(timeout));
        }
        if let Some(user) = non_empty(&self.user) {
            options.push(ConnOption::User(user.clone()));
        }
        if let Some(tls) = &self.tls {
            options.push(ConnOption::Tls(tls.clone()));
        }

        options.extend(self.options.iter().cloned());
        options
    }
}

/// Facets a DSN sets explicitly. Anything recorded here wins over structured
/// options.
#[derive(Debug, Default)]
struct DsnFacets {
    host: bool,
    user: bool,
    password: bool,
    database: bool,
    /// Query keys, folded onto one spelling per alias group.
    params: HashSet<String>,
    /// Server parameters set through `options` or `options[key]`.
    server_options: HashSet<String>,
    connect_timeout: Option<Duration>,
}

/// The key sqlx treats `key` as. sqlx accepts several spellings for the TLS
/// settings.
fn canonical_param(key: &str) -> &str {
    match key {
        "ssl-mode" => "sslmode",
        "ssl-root-cert" | "ssl-ca" => "sslrootcert",
        "ssl-cert" => "sslcert",
        "ssl-key" => "sslkey",
        other => other,
    }
}

/// Server parameter names in a libpq `options` string: `-c name=value`,
/// `-cname=value` or `--name=value`. Dashes in names count as underscores.
fn server_option_names(options: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut tokens = options.split_whitespace();

    while let Some(token) = tokens.next() {
        let setting = if token == "-c" {
            tokens.next()
        } else if let Some(setting) = token.strip_prefix("--") {
            Some(setting)
        } else {
            token.strip_prefix("-c")
        };

        if let Some((name, _)) = setting.and_then(|setting| setting.split_once('=')) {
            names.push(name.replace('-', "_").to_lowercase());
        }
    }

    names
}

impl DsnFacets {
    fn parse(dsn: &str) -> Result<Self> {
        let url = Url::parse(dsn).map_err(|e| Error::Config(format!("invalid DSN: {}", e)))?;
        let mut facets = DsnFacets {
            host: url.host_str().map_or(false, |host| !host.is_empty()) || url.port().is_some(),
            user: !url.username().is_empty(),
            password: url.password().map_or(false, |password| !password.is_empty()),
            database: !url.path().trim_start_matches('/').is_empty(),
            ..DsnFacets::default()
        };

        for (key, value) in url.query_pairs() {
            let key = canonical_param(&key).to_string();
            match key.as_str() {
                "host" | "hostaddr" | "port" => facets.host = true,
                "user" => facets.user = true,
                "password" => facets.password = true,
                "dbname" => facets.database = true,
                "options" => facets.server_options.extend(server_option_names(&value)),
                "connect_timeout" => {
                    facets.connect_timeout = value.parse::<u64>().ok().map(Duration::from_secs)
                }
                _ => {
                    if let Some(name) = key.strip_prefix("options[").and_then(|k| k.strip_suffix(']')) {
                        facets.server_options.insert(name.replace('-', "_").to_lowercase());
                    }
                }
            }
            facets.params.insert(key);
        }

        Ok(facets)
    }

    fn sets(&self, param: &str) -> bool {
        self.params.contains(param)
    }

    fn sets_server_option(&self, key: &str) -> bool {
        self.server_options.contains(&key.replace('-', "_").to_lowercase())
    }
}

/// Fold connection options into sqlx connect options.
///
/// Options are applied in order. A DSN parses into the base options and every
/// facet it sets is kept; later structured options only fill the rest. Hooks
/// run last.
pub fn resolve(options: &[ConnOption]) -> Result<ResolvedOptions> {
    let mut connect = PgConnectOptions::new();
    let mut facets = DsnFacets::default();
    let mut dial_timeout = None;
    let mut addr = None;
    let mut network = Network::Tcp;
    let mut hooks = Vec::new();

    for option in options {
        match option {
            ConnOption::Dsn(dsn) => {
                connect = PgConnectOptions::from_str(dsn)?;
                facets = DsnFacets::parse(dsn)?;
                dial_timeout = facets.connect_timeout;
            }
            ConnOption::Addr(value) => addr = Some(value.clone()),
            ConnOption::ApplicationName(name) => {
                if !facets.sets("application_name") {
                    connect = connect.application_name(name);
                }
            }
            ConnOption::ConnParams(params) => {
                for (key, value) in params {
                    if !facets.sets_server_option(key) {
                        connect = connect.options([(key.as_str(), value.as_str())]);
                    }
                }
            }
            ConnOption::Database(database) => {
                if !facets.database {
                    connect = connect.database(database);
                }
            }
            ConnOption::DialTimeout(timeout) => {
                if facets.connect_timeout.is_none() {
                    dial_timeout = Some(*timeout);
                }
            }
            ConnOption::Insecure(insecure) => {
                if *insecure && !facets.sets("sslmode") {
                    connect = connect.ssl_mode(PgSslMode::Disable);
                }
            }
            ConnOption::Network(value) => network = *value,
            ConnOption::Password(password) => {
                if !facets.password {
                    connect = connect.password(password);
                }
            }
            ConnOption::StatementTimeout(timeout) => {
                if !facets.sets_server_option("statement_timeout") {
                    connect = connect.options([("statement_timeout", timeout.as_millis())]);
                }
            }
            ConnOption::LockTimeout(timeout) => {
                if !facets.sets_server_option("lock_timeout") {
                    connect = connect.options([("lock_timeout", timeout.as_millis())]);
                }
            }
            ConnOption::User(user) => {
                if !facets.user {
                    connect = connect.username(user);
                }
            }
            ConnOption::Tls(tls) => {
                if !facets.sets("sslmode") {
                    connect = connect.ssl_mode(tls.mode.into());
                }
                if let Some(root_cert) = &tls.root_cert {
                    if !facets.sets("sslrootcert") {
                        connect = connect.ssl_root_cert(root_cert);
                    }
                }
            }
            ConnOption::Custom(hook) => hooks.push(hook),
        }
    }

    if let Some(addr) = addr.filter(|_| !facets.host) {
        connect = match network {
            Network::Unix => connect.socket(addr),
            Network::Tcp => match addr.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port
                        .parse::<u16>()
                        .map_err(|_| Error::Config(format!("invalid port in address {:?}", addr)))?;
                    connect.host(host).port(port)
                }
                None => connect.host(&addr),
            },
        };
    }

    for hook in hooks {
        connect = hook.apply(connect);
    }

    Ok(ResolvedOptions {
        connect,
        dial_timeout,
    })
}

impl Driver for SimpleDriver {
    type Store = Database;
    type Raw = PgPool;

    fn connect(&self, options: &[ClientOption]) -> Result<(Database, PgPool)> {
        let resolved = resolve(&self.connection_options())?;

        let mut pool_options = PgPoolOptions::new();
        if let Some(timeout) = resolved.dial_timeout {
            pool_options = pool_options.acquire_timeout(timeout);
        }

        let settings = ClientSettings {
            prefer_simple_protocol: true,
            ..ClientSettings::default()
        };
        let (pool_options, settings) = apply_client_options(pool_options, settings, options);
        let pool = pool_options.connect_lazy_with(resolved.connect);

        tracing::debug!(driver = "simple", "Opened lazy connection pool");
        Ok((Database::new(pool.clone(), settings), pool))
    }
}
