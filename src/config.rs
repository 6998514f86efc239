use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Where and as whom to connect.
///
/// Loadable from a JSON file; every field is optional there and can be
/// overridden from the command line.
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Server input (`tls://host:port`, `host:port`, ...). Defaults to SRV lookup on `domain`.
    pub server: Option<String>,
    pub domain: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub resource: Option<String>,
    pub dangerous_insecure_tls: bool,
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("server", &self.server)
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("resource", &self.resource)
            .field("dangerous_insecure_tls", &self.dangerous_insecure_tls)
            .finish()
    }
}

impl ConnectionInfo {
    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Default::default()
        }
    }

    /// Fill username, domain and resource from `user@domain/resource`.
    pub fn set_jid(&mut self, jid: &str) -> Result<()> {
        let (bare, resource) = match jid.split_once('/') {
            Some((bare, resource)) => (bare, Some(resource)),
            None => (jid, None),
        };
        let (username, domain) = match bare.split_once('@') {
            Some((user, domain)) => (Some(user), domain),
            None => (None, bare),
        };
        if domain.is_empty() || username == Some("") || resource == Some("") {
            return Err(Error::Config(format!("invalid JID '{}'", jid)));
        }

        self.domain = domain.to_string();
        self.username = username.map(str::to_string);
        if let Some(resource) = resource {
            self.resource = Some(resource.to_string());
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&data).map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.domain.is_empty() {
            return Err(Error::Config("no XMPP domain configured".to_string()));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(Error::Config("a password was given without a username".to_string()));
        }
        Ok(())
    }

    pub fn server_input(&self) -> &str {
        self.server.as_deref().unwrap_or(&self.domain)
    }
}
