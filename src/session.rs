//! Authenticated session cache
//!
//! Sessions are keyed by endpoint, user name, and a digest of the password so
//! that rotated credentials produce a fresh login. Every key owns a slot guarded
//! by its own async mutex: the liveness check, the logout of a stale session,
//! and the re-login all happen under that lock, so concurrent reconciles for
//! machines on the same endpoint never log in twice.

use std::fmt;
use std::net::Ipv6Addr;
use std::sync::Arc;

use dashmap::DashMap;
use reqwest::Url;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::vsphere::{VsphereConnector, VsphereSession};
use crate::{Error, Result};

/// Path of the vSphere API when the configured endpoint has none
pub const DEFAULT_SDK_PATH: &str = "/sdk";

/// User name and password for a vCenter login
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name
    pub username: String,
    password: String,
}

impl Credentials {
    /// Create credentials
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The password
    pub fn password(&self) -> &str {
        &self.password
    }

    fn password_digest(&self) -> String {
        use aws_lc_rs::digest;
        let hash = digest::digest(&digest::SHA256, self.password.as_bytes());
        hash.as_ref()
            .iter()
            .fold(String::with_capacity(64), |mut s, b| {
                use std::fmt::Write;
                let _ = write!(s, "{:02x}", b);
                s
            })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A parsed vCenter endpoint and its TLS settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// The endpoint as configured
    pub server: String,
    /// Normalized API URL
    pub url: Url,
    /// Skip certificate verification
    pub insecure: bool,
    /// CA bundle to trust
    pub ca_cert_pem: Option<String>,
}

impl Endpoint {
    /// Parse a hostname, IP address, or URL
    ///
    /// Bare IPv6 addresses are bracketed, the scheme defaults to `https`, and
    /// an empty path becomes `/sdk`.
    pub fn parse(server: &str, insecure: bool, ca_cert_pem: Option<String>) -> Result<Self> {
        let trimmed = server.trim();
        if trimmed.is_empty() {
            return Err(Error::invalid_endpoint(server, "no server configured"));
        }

        let mut raw = if trimmed.parse::<Ipv6Addr>().is_ok() {
            format!("[{trimmed}]")
        } else {
            trimmed.to_string()
        };
        if !raw.contains("://") {
            raw = format!("https://{raw}");
        }

        let mut url = Url::parse(&raw).map_err(|e| Error::invalid_endpoint(server, e.to_string()))?;
        if !matches!(url.scheme(), "https" | "http") {
            return Err(Error::invalid_endpoint(
                server,
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(Error::invalid_endpoint(server, "missing host"));
        }
        if url.path().is_empty() || url.path() == "/" {
            url.set_path(DEFAULT_SDK_PATH);
        }

        Ok(Self {
            server: server.to_string(),
            url,
            insecure,
            ca_cert_pem,
        })
    }

    /// Host part of the URL, for logging
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Key prefix shared by every password of one user on this endpoint
    fn identity_prefix(&self, credentials: &Credentials) -> String {
        format!("{}#{}#", self.url, credentials.username)
    }

    fn cache_key(&self, credentials: &Credentials) -> String {
        format!(
            "{}{}",
            self.identity_prefix(credentials),
            credentials.password_digest()
        )
    }
}

type SessionSlot = Arc<Mutex<Option<Arc<dyn VsphereSession>>>>;

/// Process-wide cache of live vCenter sessions
pub struct SessionManager {
    connector: Arc<dyn VsphereConnector>,
    sessions: DashMap<String, SessionSlot>,
}

impl SessionManager {
    /// Create an empty cache that logs in through `connector`
    pub fn new(connector: Arc<dyn VsphereConnector>) -> Self {
        Self {
            connector,
            sessions: DashMap::new(),
        }
    }

    /// Return a live session for `endpoint` and `credentials`, logging in if needed
    #[instrument(skip(self, endpoint, credentials), fields(server = %endpoint.host(), user = %credentials.username))]
    pub async fn get_session(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Arc<dyn VsphereSession>> {
        let key = endpoint.cache_key(credentials);
        // Clone the slot out so no map shard lock is held across an await.
        let slot = self.sessions.entry(key.clone()).or_default().clone();
        let mut cached = slot.lock().await;

        if let Some(session) = cached.take() {
            match session.is_active().await {
                Ok(true) => {
                    *cached = Some(session.clone());
                    return Ok(session);
                }
                Ok(false) => debug!("cached session is no longer active"),
                Err(e) => warn!(error = %e, "session liveness check failed"),
            }
            if let Err(e) = session.logout().await {
                debug!(error = %e, "logout of stale session failed");
            }
        }

        let session = self.connector.login(endpoint, credentials).await?;
        info!("logged in to vCenter");
        *cached = Some(session.clone());
        drop(cached);

        self.evict_rotated(&key, &endpoint.identity_prefix(credentials))
            .await;
        Ok(session)
    }

    /// Drop the slots of earlier passwords for the identity that just logged in
    ///
    /// A slot another pass is still holding is removed without a logout.
    async fn evict_rotated(&self, key: &str, prefix: &str) {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.key() != key)
            .filter(|e| {
                e.key()
                    .strip_prefix(prefix)
                    .is_some_and(|digest| !digest.contains('#'))
            })
            .map(|e| e.key().clone())
            .collect();
        for stale_key in stale {
            let Some((_, slot)) = self.sessions.remove(&stale_key) else {
                continue;
            };
            let old = match slot.try_lock() {
                Ok(mut guard) => guard.take(),
                Err(_) => None,
            };
            debug!("dropping session of rotated credentials");
            if let Some(old) = old {
                if let Err(e) = old.logout().await {
                    debug!(error = %e, "logout of rotated session failed");
                }
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.sessions.len()
    }
}
