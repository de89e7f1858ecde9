//! Routing of resource names to authority workers.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::client::authority::{Authority, AuthorityContext, AuthorityHandle};
use crate::client::config::{AuthorityConfig, ServerConfig};
use crate::codec::XdsCodec;
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::transport::TransportBuilder;

const XDSTP_SCHEME: &str = "xdstp://";

/// Name used in logs and errors for the authority serving non-`xdstp` names.
pub(crate) const DEFAULT_AUTHORITY: &str = "default";

/// Type-erased view of a [`WatchManager`], so the client handle does not
/// carry the transport, codec and runtime type parameters.
pub(crate) trait WatchRouter: Send + Sync + fmt::Debug {
    /// Resolve the authority serving `name`, starting its worker if needed.
    fn route(&self, type_url: &str, name: &str) -> Result<AuthorityHandle>;

    /// Resolve the authority serving `name` without starting anything.
    fn lookup(&self, name: &str) -> Option<AuthorityHandle>;

    /// Stop routing. Later calls to [`route`](Self::route) fail with
    /// [`Error::ClientClosed`].
    fn close(&self);
}

/// Returns the authority part of an `xdstp://<authority>/<rest>` name.
pub(crate) fn authority_of(name: &str) -> Option<&str> {
    let rest = name.strip_prefix(XDSTP_SCHEME)?;
    Some(rest.split_once('/').map_or(rest, |(authority, _)| authority))
}

#[derive(Debug, Default)]
struct ManagerState {
    closed: bool,
    // Authorities with identical server chains share one worker.
    workers: HashMap<Vec<ServerConfig>, AuthorityHandle>,
}

pub(crate) struct WatchManager<TB, C, R> {
    ctx: AuthorityContext<TB, C, R>,
    default_servers: Vec<ServerConfig>,
    authorities: HashMap<String, Vec<ServerConfig>>,
    // Every authority served by a chain, comma-joined, used to name its worker.
    worker_names: HashMap<Vec<ServerConfig>, String>,
    state: Mutex<ManagerState>,
}

impl<TB, C, R> WatchManager<TB, C, R>
where
    TB: TransportBuilder,
    C: XdsCodec,
    R: Runtime,
{
    pub(crate) fn new(
        ctx: AuthorityContext<TB, C, R>,
        default_servers: Vec<ServerConfig>,
        authorities: HashMap<String, AuthorityConfig>,
    ) -> Self {
        let authorities: HashMap<String, Vec<ServerConfig>> = authorities
            .into_iter()
            .map(|(name, config)| {
                // An authority without servers of its own uses the top-level ones.
                let servers = if config.xds_servers.is_empty() {
                    default_servers.clone()
                } else {
                    config.xds_servers
                };
                (name, servers)
            })
            .collect();

        let mut sharing: HashMap<Vec<ServerConfig>, Vec<&str>> = HashMap::new();
        if !default_servers.is_empty() {
            sharing
                .entry(default_servers.clone())
                .or_default()
                .push(DEFAULT_AUTHORITY);
        }
        let mut named: Vec<(&String, &Vec<ServerConfig>)> = authorities.iter().collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        for (name, servers) in named {
            if !servers.is_empty() {
                sharing.entry(servers.clone()).or_default().push(name);
            }
        }
        let worker_names = sharing
            .into_iter()
            .map(|(servers, names)| (servers, names.join(",")))
            .collect();

        Self {
            ctx,
            default_servers,
            authorities,
            worker_names,
            state: Mutex::new(ManagerState::default()),
        }
    }

    fn chain_for<'a>(&'a self, name: &'a str) -> Result<&'a [ServerConfig]> {
        let (label, servers) = match authority_of(name) {
            Some(authority) => match self.authorities.get(authority) {
                Some(servers) => (authority, servers.as_slice()),
                None => return Err(Error::UnknownAuthority(authority.to_string())),
            },
            None => (DEFAULT_AUTHORITY, self.default_servers.as_slice()),
        };
        if servers.is_empty() {
            return Err(Error::AuthorityUnavailable(label.to_string()));
        }
        Ok(servers)
    }
}

impl<TB, C, R> WatchRouter for WatchManager<TB, C, R>
where
    TB: TransportBuilder,
    C: XdsCodec,
    R: Runtime,
{
    fn route(&self, type_url: &str, name: &str) -> Result<AuthorityHandle> {
        if self.ctx.registry.get(type_url).is_none() {
            return Err(Error::UnknownResourceType(type_url.to_string()));
        }
        let servers = self.chain_for(name)?;

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(Error::ClientClosed);
        }
        let handle = state
            .workers
            .entry(servers.to_vec())
            .or_insert_with(|| {
                let worker = self
                    .worker_names
                    .get(servers)
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_AUTHORITY.to_string());
                debug!(authority = %worker, servers = servers.len(), "starting authority worker");
                Authority::spawn(worker, servers.to_vec(), self.ctx.clone())
            });
        Ok(handle.clone())
    }

    fn lookup(&self, name: &str) -> Option<AuthorityHandle> {
        let servers = self.chain_for(name).ok()?;
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.workers.get(servers).cloned()
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return;
        }
        state.closed = true;
        state.workers.clear();
        self.ctx.shutdown.cancel();
    }
}

impl<TB, C, R> fmt::Debug for WatchManager<TB, C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchManager")
            .field("default_servers", &self.default_servers)
            .field("authorities", &self.authorities)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_of_parses_xdstp_names() {
        assert_eq!(
            authority_of("xdstp://auth.example.com/envoy.config.listener.v3.Listener/l1"),
            Some("auth.example.com")
        );
        assert_eq!(authority_of("xdstp://bare"), Some("bare"));
        assert_eq!(authority_of("xdstp:///no-authority"), Some(""));
        assert_eq!(authority_of("listener-1"), None);
        assert_eq!(authority_of("https://auth/x"), None);
    }
}
