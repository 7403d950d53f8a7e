// ABOUTME: Endpoint addresses, bound service endpoints, and the server factory policy
// ABOUTME: Direct factory reserves loopback ephemeral ports; published factory synthesizes alias:port pairs

use crate::topology::PortRotation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("failed to bind endpoint for {service} service: {source}")]
    Bind {
        service: String,
        #[source]
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, EndpointError>;

/// Published address of one RPC endpoint as the sandbox will see it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub host: String,
    pub port: u16,
}

impl EndpointAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One started endpoint server for a named RPC service.
///
/// Carries the address published to sandboxes and, in direct addressing mode,
/// the listener reserving that port. The wire protocol served on it belongs
/// to external collaborators; this core only manages the lifetime.
pub struct ServiceEndpoint {
    service: String,
    address: EndpointAddress,
    listener: Mutex<Option<TcpListener>>,
    closed: AtomicBool,
}

impl ServiceEndpoint {
    fn new(service: String, address: EndpointAddress, listener: Option<TcpListener>) -> Self {
        Self {
            service,
            address,
            listener: Mutex::new(listener),
            closed: AtomicBool::new(false),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Hand the bound listener to whoever serves the endpoint. Returns `None`
    /// in published-port mode or once the listener has been taken.
    pub(crate) fn take_listener(&self) -> Option<TcpListener> {
        self.listener.lock().ok().and_then(|mut guard| guard.take())
    }

    /// Release the endpoint. Idempotent: closing twice is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut guard) = self.listener.lock() {
            guard.take();
        }
        debug!(service = %self.service, address = %self.address, "endpoint closed");
    }
}

impl fmt::Debug for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEndpoint")
            .field("service", &self.service)
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Starts endpoint servers under one addressing policy.
pub trait ServerFactory: Send + Sync {
    fn bind(&self, service: &str) -> Result<ServiceEndpoint>;
}

/// Direct host networking: bind a loopback ephemeral port per endpoint and
/// publish the bound address as-is.
pub struct DirectServerFactory;

impl DirectServerFactory {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DirectServerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerFactory for DirectServerFactory {
    fn bind(&self, service: &str) -> Result<ServiceEndpoint> {
        let listener = TcpListener::bind("127.0.0.1:0").map_err(|source| EndpointError::Bind {
            service: service.to_string(),
            source,
        })?;
        let port = listener
            .local_addr()
            .map_err(|source| EndpointError::Bind {
                service: service.to_string(),
                source,
            })?
            .port();

        let address = EndpointAddress::new("127.0.0.1", port);
        debug!(service, %address, "bound endpoint");
        Ok(ServiceEndpoint::new(
            service.to_string(),
            address,
            Some(listener),
        ))
    }
}

/// No host networking: publish `alias:port` with ports taken from a fixed
/// rotating range. Nothing is bound locally; the range is assumed externally
/// published and free to reuse.
pub struct PublishedPortServerFactory {
    alias: String,
    rotation: PortRotation,
}

impl PublishedPortServerFactory {
    pub fn new(alias: String, rotation: PortRotation) -> Self {
        Self { alias, rotation }
    }
}

impl ServerFactory for PublishedPortServerFactory {
    fn bind(&self, service: &str) -> Result<ServiceEndpoint> {
        let address = EndpointAddress::new(self.alias.clone(), self.rotation.next_port());
        debug!(service, %address, "published endpoint");
        Ok(ServiceEndpoint::new(service.to_string(), address, None))
    }
}
