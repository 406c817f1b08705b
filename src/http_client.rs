use std::time::Duration;

use reqwest::tls::Version;
use reqwest::Identity;
use reqwest_middleware::ClientWithMiddleware;
use url::Url;

use crate::error::Result;
use crate::proxy;

/// Default user agent.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Hard ceiling on a single upstream exchange.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);

/// Builds the per-pushkin HTTP clients.
///
/// Every pushkin gets its own client so connection pools, client identities
/// and proxies never bleed between apps. The factory only carries the global
/// proxy fallback.
#[derive(Debug, Clone, Default)]
pub struct ClientFactory {
    global_proxy: Option<String>,
}

/// Per-client knobs the pushkin configuration controls.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// App-level proxy override.
    pub proxy: Option<String>,

    /// Upstream connection-pool cap.
    pub max_connections: usize,

    /// TLS client identity for certificate-authenticated upstreams.
    pub identity: Option<Identity>,
}

impl ClientFactory {
    pub fn new(global_proxy: Option<String>) -> Self {
        Self { global_proxy }
    }

    /// Resolves the proxy this client would use; exposed for logging.
    pub fn resolve_proxy(&self, options: &ClientOptions) -> Result<Option<Url>> {
        proxy::select_proxy(options.proxy.as_deref(), self.global_proxy.as_deref())
    }

    pub fn build(&self, options: ClientOptions) -> Result<ClientWithMiddleware> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .use_rustls_tls()
            .pool_idle_timeout(None)
            .pool_max_idle_per_host(options.max_connections.max(1))
            .http2_keep_alive_interval(Some(Duration::from_secs(60 * 60)))
            .http2_keep_alive_timeout(Duration::from_secs(60))
            .http2_keep_alive_while_idle(true)
            .min_tls_version(Version::TLS_1_2)
            .timeout(UPSTREAM_TIMEOUT);

        if let Some(url) = self.resolve_proxy(&options)? {
            builder = builder.proxy(proxy::build_proxy(&url)?);
        }

        if let Some(identity) = options.identity {
            builder = builder.identity(identity);
        }

        let client = builder.build()?;
        Ok(reqwest_middleware::ClientBuilder::new(client).build())
    }
}
