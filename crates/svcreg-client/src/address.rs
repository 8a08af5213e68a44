//! Registry address rotation.
//!
//! Picks which registry endpoint the transport should call next. The
//! candidate list is the statically configured addresses followed by the
//! addresses the registry publishes for itself (when auto-discovery is
//! on). A single atomic index walks that combined list; invalidating the
//! current address advances it, and it wraps to 0 past the end.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::{info, warn};

use svcreg_core::{CoreError, CoreResult, RegistryConfig};

/// A host/port pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IpPort {
    pub host: String,
    pub port: u16,
}

impl IpPort {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    /// Parse `scheme://host:port[?query]` or `host:port`.
    pub fn parse(address: &str) -> CoreResult<Self> {
        let invalid = || CoreError::InvalidAddress(address.to_string());

        let rest = match address.split_once("://") {
            Some((_, rest)) => rest,
            None => address,
        };
        let authority = rest
            .split(['?', '/'])
            .next()
            .filter(|a| !a.is_empty())
            .ok_or_else(invalid)?;
        let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for IpPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Supplies addresses discovered at runtime.
pub trait AddressSource: Send + Sync {
    /// Current endpoint URIs, in a stable order.
    fn addresses(&self) -> Vec<String>;
}

impl<T: AddressSource + ?Sized> AddressSource for Arc<T> {
    fn addresses(&self) -> Vec<String> {
        (**self).addresses()
    }
}

pub struct IpPortManager {
    defaults: Vec<IpPort>,
    discovered: ArcSwapOption<Box<dyn AddressSource>>,
    auto_discovery: bool,
    index: AtomicUsize,
}

impl IpPortManager {
    /// Build from config. Unparseable static addresses are skipped with a warning.
    pub fn new(config: &RegistryConfig) -> Self {
        let defaults = config
            .addresses
            .iter()
            .filter_map(|a| match IpPort::parse(a) {
                Ok(ip) => Some(ip),
                Err(e) => {
                    warn!(address = %a, error = %e, "ignoring invalid registry address");
                    None
                }
            })
            .collect();
        Self::with_defaults(defaults, config.registry_auto_discovery)
    }

    pub fn with_defaults(defaults: Vec<IpPort>, auto_discovery: bool) -> Self {
        Self {
            defaults,
            discovered: ArcSwapOption::empty(),
            auto_discovery,
            index: AtomicUsize::new(0),
        }
    }

    /// Attach the source of discovered addresses. Ignored unless
    /// auto-discovery is enabled.
    pub fn set_address_source(&self, source: Box<dyn AddressSource>) {
        if !self.auto_discovery {
            return;
        }
        self.discovered.store(Some(Arc::new(source)));
        info!("registry address auto-discovery attached");
    }

    pub fn is_auto_discovery(&self) -> bool {
        self.auto_discovery
    }

    /// Address to use next. `invalidate` moves past the current one
    /// (after a connection failure); otherwise the current one is re-read.
    ///
    /// Returns `None` only when no address is known at all.
    pub fn get_available_address(&self, invalidate: bool) -> Option<IpPort> {
        let candidates = self.candidates();
        if candidates.is_empty() {
            warn!("no registry address configured or discovered");
            return None;
        }

        let len = candidates.len();
        let step = |i: usize| {
            let next = if invalidate { i + 1 } else { i };
            if next >= len { 0 } else { next }
        };
        // Rotate and wrap in one step so concurrent invalidations each
        // move exactly one address.
        let previous = self
            .index
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| Some(step(i)))
            .unwrap_or_else(|i| i);
        let index = step(previous);

        let chosen = candidates[index].clone();
        if invalidate {
            let from = candidates
                .get(previous)
                .map(ToString::to_string)
                .unwrap_or_default();
            info!(%from, to = %chosen, "switching registry address");
        }
        Some(chosen)
    }

    /// Current rotation index (for diagnostics).
    pub fn current_index(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }

    fn candidates(&self) -> Vec<IpPort> {
        let mut all = self.defaults.clone();
        if self.auto_discovery {
            if let Some(source) = self.discovered.load_full() {
                all.extend(
                    source
                        .addresses()
                        .iter()
                        .filter_map(|a| IpPort::parse(a).ok()),
                );
            }
        }
        all
    }
}
