// ABOUTME: Runtime topology detection and endpoint addressing policy
// ABOUTME: Decides between direct host networking and the published rotating-port workaround

use crate::endpoint::{DirectServerFactory, PublishedPortServerFactory, ServerFactory};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Synthetic DNS entry that resolves to the host from inside the sandbox
/// runtime when host networking is unavailable. Has historically changed
/// between runtime releases, so only the current name is supported.
pub const WORKER_HOST_ALIAS: &str = "host.docker.internal";

/// Published port range used when the sandbox runtime has no host networking.
/// The range must be published when the sandbox container is brought up.
pub const PUBLISHED_PORT_START: u16 = 8100;
pub const PUBLISHED_PORT_END: u16 = 8200;

/// Override flag: treat this host as the no-host-networking case regardless
/// of the detected OS. Needed when running inside a nested virtualization
/// layer that is indistinguishable from the native case by OS name alone.
pub const NO_HOST_NETWORK_ENV: &str = "SLUICE_NO_HOST_NETWORK";

/// How sandbox-facing endpoints are addressed on this host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Addressing {
    /// Sandboxes reach endpoint ports directly; bind loopback ephemeral ports.
    Direct,
    /// No host networking: publish a fixed rotating port range `[start, end)`
    /// under a synthetic host alias.
    PublishedPorts {
        alias: String,
        start: u16,
        end: u16,
    },
}

/// Detected (or injected) runtime topology for the current host.
#[derive(Clone, Debug)]
pub struct RuntimeTopology {
    addressing: Addressing,
}

impl RuntimeTopology {
    /// Detect the topology from host OS metadata and the override flag.
    pub fn detect() -> Self {
        let forced = std::env::var(NO_HOST_NETWORK_ENV).as_deref() == Ok("1");
        Self::from_parts(std::env::consts::OS, forced)
    }

    /// Build a topology from explicit parts; used by tests and deployments
    /// that already know their networking situation.
    pub fn from_parts(os: &str, no_host_network: bool) -> Self {
        let addressing = if no_host_network || os.starts_with("mac") {
            Addressing::PublishedPorts {
                alias: WORKER_HOST_ALIAS.to_string(),
                start: PUBLISHED_PORT_START,
                end: PUBLISHED_PORT_END,
            }
        } else if os == "linux" {
            Addressing::Direct
        } else {
            warn!(os, "unknown sandbox runtime platform, falling back to direct addressing");
            Addressing::Direct
        };

        Self { addressing }
    }

    pub fn addressing(&self) -> &Addressing {
        &self.addressing
    }

    /// Server factory implementing this topology's addressing policy.
    pub fn server_factory(&self) -> Arc<dyn ServerFactory> {
        match &self.addressing {
            Addressing::Direct => Arc::new(DirectServerFactory::new()),
            Addressing::PublishedPorts { alias, start, end } => Arc::new(
                PublishedPortServerFactory::new(alias.clone(), PortRotation::new(*start, *end)),
            ),
        }
    }
}

/// Rotating allocator over a fixed published port range `[start, end)`.
///
/// Hands out the next port on every request and wraps back to `start` after
/// `end - 1`. Availability is deliberately ignored: the range is externally
/// published and free to reuse this way.
#[derive(Debug)]
pub struct PortRotation {
    start: u16,
    end: u16,
    next: AtomicU16,
}

impl PortRotation {
    pub fn new(start: u16, end: u16) -> Self {
        assert!(start < end, "empty published port range");
        Self {
            start,
            end,
            next: AtomicU16::new(start),
        }
    }

    pub fn next_port(&self) -> u16 {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |port| {
                Some(if port + 1 == self.end { self.start } else { port + 1 })
            })
            .unwrap_or(self.start)
    }
}
