//! Session assembly: one endpoint per connection.

use std::sync::Arc;
use std::time::Duration;

use crate::handler::NoopHandler;
use crate::interceptor::NoopInterceptor;
use crate::lease::{RequesterLeaseTracker, ResponderLeaseTracker};
use crate::multiplexer::InputMultiplexer;
use crate::requester::Requester;
use crate::session::SessionCore;
use crate::{
    DuplexConnection, EngineConfig, ErrorSink, Frame, RequestHandler, RequestInterceptor,
    StreamIdAllocator, StreamRegistry, WeftError,
};

/// Which side of the connection this endpoint is; decides stream id parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Allocates odd stream ids.
    Client,
    /// Allocates even stream ids.
    Server,
}

/// One protocol session over one connection.
///
/// Built with [`Endpoint::builder`]. The [`Requester`] starts outbound
/// interactions; the [`InputMultiplexer`] is handed to the transport's
/// read loop.
pub struct Endpoint {
    core: Arc<SessionCore>,
    requester: Requester,
    multiplexer: InputMultiplexer,
}

impl Endpoint {
    pub fn builder(role: Role, connection: Arc<dyn DuplexConnection>) -> EndpointBuilder {
        EndpointBuilder {
            role,
            connection,
            config: EngineConfig::default(),
            handler: None,
            interceptor: None,
            error_sink: ErrorSink::disabled(),
            leasing: false,
            runtime: None,
        }
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    pub fn multiplexer(&self) -> &InputMultiplexer {
        &self.multiplexer
    }

    /// Combined transport and lease availability.
    pub fn availability(&self) -> f64 {
        self.core.availability()
    }

    /// Grant the peer `permits` new requests for `ttl`. Replaces any
    /// previous grant. Fails when leasing is disabled.
    pub fn grant_lease(&self, permits: u32, ttl: Duration) -> Result<(), WeftError> {
        let Some(lease) = &self.core.responder_lease else {
            return Err(WeftError::InvalidConfig(
                "leasing is not enabled on this endpoint".into(),
            ));
        };
        let grant = lease.issue(permits, ttl);
        self.core.send_frame(Frame::lease(grant.permits, grant.ttl));
        tracing::debug!(permits, ttl_ms = ttl.as_millis() as u64, "lease granted");
        Ok(())
    }

    /// Number of live streams, both locally and remotely initiated.
    pub fn live_streams(&self) -> usize {
        self.core.registry.len()
    }

    /// Tear the session down, faulting every live stream.
    pub fn close(&self) {
        self.multiplexer.connection_closed();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("live_streams", &self.live_streams())
            .finish()
    }
}

pub struct EndpointBuilder {
    role: Role,
    connection: Arc<dyn DuplexConnection>,
    config: EngineConfig,
    handler: Option<Arc<dyn RequestHandler>>,
    interceptor: Option<Arc<dyn RequestInterceptor>>,
    error_sink: ErrorSink,
    leasing: bool,
    runtime: Option<tokio::runtime::Handle>,
}

impl EndpointBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn error_sink(mut self, sink: ErrorSink) -> Self {
        self.error_sink = sink;
        self
    }

    /// Gate outbound requests on peer leases and enforce our own grants.
    pub fn enable_leasing(mut self) -> Self {
        self.leasing = true;
        self
    }

    /// Runtime used to spawn responder and channel driver tasks. Defaults
    /// to the current runtime at build time.
    pub fn runtime(mut self, handle: tokio::runtime::Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Validate the configuration and assemble the endpoint.
    pub fn build(self) -> Result<Endpoint, WeftError> {
        self.config.validate()?;
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => tokio::runtime::Handle::try_current().map_err(|_| {
                WeftError::InvalidConfig("no tokio runtime available for driver tasks".into())
            })?,
        };
        let allocator = match self.role {
            Role::Client => StreamIdAllocator::client(),
            Role::Server => StreamIdAllocator::server(),
        };
        let core = Arc::new(SessionCore {
            connection: self.connection,
            registry: StreamRegistry::new(),
            allocator,
            config: self.config,
            interceptor: self
                .interceptor
                .unwrap_or_else(|| Arc::new(NoopInterceptor)),
            error_sink: self.error_sink,
            requester_lease: self.leasing.then(RequesterLeaseTracker::new),
            responder_lease: self.leasing.then(ResponderLeaseTracker::new),
            runtime,
        });
        let handler = self.handler.unwrap_or_else(|| Arc::new(NoopHandler));
        Ok(Endpoint {
            requester: Requester::new(core.clone()),
            multiplexer: InputMultiplexer::new(core.clone(), handler),
            core,
        })
    }
}
