//! Association acceptor module
//!
//! The module provides a server which listens to incoming association requests,
//! negotiates them against the local configuration
//! and serves each established association in its own thread.
//! See [`AssociationServer`] for details and examples.
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use snafu::ResultExt;
use tracing::{debug, info, warn};

use crate::acse::{
    self, AcceptAny, AcceptCalledAeTitle, AcceptCallingAeTitles, AcceptorParameters, AccessControl,
    NegotiatedAssociation,
};
use crate::association::config::UpperLayerConfig;
use crate::association::handler::{HandlerRegistry, ServiceHandler};
use crate::association::{Association, AssociationOutcome};
use crate::dul::{AbortReason, DulServiceProvider};
use crate::error::{ConfigSnafu, Error, Result, TransportSnafu};
use crate::pdu::{
    AssociationRJ, AssociationRJResult, AssociationRJServiceProviderPresentationReason,
    AssociationRJSource,
};

/// How long to wait for the peer to close the connection
/// after its association request was rejected.
const REJECT_CLOSE_WAIT: Duration = Duration::from_secs(2);

/// A shared counter of the associations being served.
#[derive(Debug, Clone, Default)]
pub struct ActiveAssociations(Arc<AtomicUsize>);

impl ActiveAssociations {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of slots currently held.
    pub fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Take one slot, unless `max` are already held.
    ///
    /// The slot is given back when the returned guard is dropped.
    pub fn try_acquire(&self, max: usize) -> Option<AssociationSlot> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < max).then_some(count + 1)
            })
            .ok()
            .map(|_| AssociationSlot(Arc::clone(&self.0)))
    }
}

/// A held slot of [`ActiveAssociations`].
#[derive(Debug)]
pub struct AssociationSlot(Arc<AtomicUsize>);

impl Drop for AssociationSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Observer of the life cycle of the associations of a server.
///
/// All methods do nothing by default.
pub trait AssociationListener: Send + Sync {
    fn on_established(&self, _association: &NegotiatedAssociation) {}

    fn on_rejected(&self, _association_rj: &AssociationRJ) {}

    fn on_released(&self, _association: &NegotiatedAssociation) {}

    /// Called when an association is aborted,
    /// or when the connection is lost before it is established.
    fn on_aborted(&self, _association: Option<&NegotiatedAssociation>, _reason: &AbortReason) {}
}

#[derive(Debug)]
struct Silent;

impl AssociationListener for Silent {}

/// A DICOM association acceptor,
/// usually taking the role of a service class provider (SCP).
///
/// Incoming requests are negotiated against the presentation contexts
/// of the [configuration](UpperLayerConfig),
/// and requests received on an established association are dispatched
/// to the [handler](ServiceHandler) registered for their abstract syntax.
/// Requests for an abstract syntax without a handler
/// are answered with the status _SOP class not supported_.
///
/// No more than `max_associations` associations are served at once.
/// Connections beyond that are rejected
/// with the reason _local limit exceeded_.
///
/// A value of this type can be cloned cheaply
/// and used for any number of connections.
///
/// # Example
///
/// ```no_run
/// # use std::net::TcpListener;
/// # use dicom_upper_layer::association::{AssociationServer, UpperLayerConfig, VerificationService};
/// # use dicom_upper_layer::association::config::VERIFICATION_SOP_CLASS;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let server = AssociationServer::new(UpperLayerConfig::default())?
///     .with_handler(VERIFICATION_SOP_CLASS, VerificationService)
///     .accept_called_ae_title();
///
/// let listener = TcpListener::bind("0.0.0.0:104")?;
/// server.serve(&listener)?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AssociationServer {
    config: Arc<UpperLayerConfig>,
    handlers: HandlerRegistry,
    access_control: Arc<dyn AccessControl + Send + Sync>,
    listener: Arc<dyn AssociationListener>,
    active: ActiveAssociations,
}

impl std::fmt::Debug for AssociationServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssociationServer")
            .field("config", &self.config)
            .field("handlers", &self.handlers)
            .field("active", &self.active.count())
            .finish()
    }
}

impl AssociationServer {
    /// Create a server with the given configuration,
    /// accepting any AE title and with no handlers.
    pub fn new(config: UpperLayerConfig) -> Result<Self> {
        config.validate().context(ConfigSnafu)?;
        Ok(AssociationServer {
            config: Arc::new(config),
            handlers: HandlerRegistry::new(),
            access_control: Arc::new(AcceptAny),
            listener: Arc::new(Silent),
            active: ActiveAssociations::new(),
        })
    }

    /// Register the handler for an abstract syntax.
    pub fn with_handler<H>(mut self, abstract_syntax: impl Into<String>, handler: H) -> Self
    where
        H: ServiceHandler + 'static,
    {
        self.handlers.register(abstract_syntax, handler);
        self
    }

    /// Replace the whole handler registry.
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Change the access control policy.
    pub fn with_access_control<A>(mut self, access_control: A) -> Self
    where
        A: AccessControl + Send + Sync + 'static,
    {
        self.access_control = Arc::new(access_control);
        self
    }

    /// Only accept requests addressed to this node's AE title.
    pub fn accept_called_ae_title(self) -> Self {
        self.with_access_control(AcceptCalledAeTitle)
    }

    /// Only accept requests from the given calling AE titles.
    pub fn accept_calling_ae_titles<I, S>(self, ae_titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.with_access_control(AcceptCallingAeTitles::new(ae_titles))
    }

    pub fn with_listener<L>(mut self, listener: L) -> Self
    where
        L: AssociationListener + 'static,
    {
        self.listener = Arc::new(listener);
        self
    }

    pub fn config(&self) -> &UpperLayerConfig {
        &self.config
    }

    /// The counter of associations currently being served.
    pub fn active_associations(&self) -> &ActiveAssociations {
        &self.active
    }

    /// Accept connections from the listener until it fails,
    /// serving each one in its own thread.
    pub fn serve(&self, listener: &TcpListener) -> Result<()> {
        if let Ok(address) = listener.local_addr() {
            info!("{} listening on {}", self.config.ae_title, address);
        }
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    if let Err(e) = self.handle_connection(stream) {
                        warn!("Could not serve connection: {}", e);
                    }
                }
                Err(e) => warn!("Could not accept connection: {}", e),
            }
        }
        Ok(())
    }

    /// Serve a freshly accepted connection in a new thread.
    ///
    /// The association slot is taken before the thread starts,
    /// so that the capacity check is exact even under a burst of connections.
    pub fn handle_connection(&self, stream: TcpStream) -> Result<JoinHandle<()>> {
        let peer = stream.peer_addr().ok();
        let slot = self.active.try_acquire(self.config.max_associations);
        if slot.is_none() {
            warn!(
                "Too many associations ({}), rejecting {:?}",
                self.config.max_associations, peer
            );
        }
        let dul = DulServiceProvider::new_acceptor(stream, self.config.dul_options())?;
        let server = self.clone();
        std::thread::Builder::new()
            .name(thread_name(peer))
            .spawn(move || server.serve_association(dul, slot))
            .context(TransportSnafu)
    }

    fn serve_association(&self, mut dul: DulServiceProvider, slot: Option<AssociationSlot>) {
        let preset_rejection = slot.is_none().then(|| AssociationRJ {
            result: AssociationRJResult::Transient,
            source: AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            ),
        });
        let parameters = AcceptorParameters {
            ae_title: &self.config.ae_title,
            max_pdu_length: self.config.max_pdu_length,
            presentation_contexts: &self.config.presentation_contexts,
            access_control: &*self.access_control,
        };

        match acse::accept(
            &mut dul,
            &parameters,
            preset_rejection,
            self.config.acse_timeout(),
        ) {
            Ok(negotiated) => {
                self.listener.on_established(&negotiated);
                let association = Association::new(
                    dul,
                    negotiated.clone(),
                    &self.handlers,
                    self.config.idle_timeout(),
                    self.config.poll_interval(),
                );
                match association.run() {
                    AssociationOutcome::Released => self.listener.on_released(&negotiated),
                    AssociationOutcome::Aborted(reason) => {
                        self.listener.on_aborted(Some(&negotiated), &reason)
                    }
                }
            }
            Err(Error::NegotiationRejected { association_rj, .. }) => {
                self.listener.on_rejected(&association_rj);
                if !dul.join(REJECT_CLOSE_WAIT) {
                    dul.kill();
                }
            }
            Err(Error::Closed { reason, .. }) => {
                debug!("Connection closed before association: {}", reason);
                self.listener.on_aborted(None, &reason);
            }
            Err(Error::TimeoutExpired { .. }) => {
                self.listener.on_aborted(None, &AbortReason::Timeout);
            }
            Err(e) => {
                warn!("Could not establish association: {}", e);
                dul.stop();
            }
        }
        drop(slot);
    }
}

fn thread_name(peer: Option<SocketAddr>) -> String {
    match peer {
        Some(peer) => format!("association-{}", peer),
        None => "association".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_bounded_and_released() {
        let active = ActiveAssociations::new();
        let first = active.try_acquire(2);
        let second = active.try_acquire(2);
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(active.try_acquire(2).is_none());
        assert_eq!(active.count(), 2);

        drop(first);
        assert_eq!(active.count(), 1);
        assert!(active.try_acquire(2).is_some());
        // the guard of the last acquisition was dropped right away
        assert_eq!(active.count(), 1);
    }

    #[test]
    fn invalid_configuration_is_refused() {
        let config = UpperLayerConfig {
            max_associations: 0,
            ..Default::default()
        };
        assert!(matches!(
            AssociationServer::new(config),
            Err(Error::Config { .. })
        ));
    }
}
