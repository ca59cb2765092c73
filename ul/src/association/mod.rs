//! DICOM association module
//!
//! This module contains utilities for establishing associations
//! between DICOM nodes via TCP/IP,
//! and for serving DIMSE requests over them.
//!
//! As an association requester, often as a service class user (SCU),
//! a new association can be started
//! via the [`ClientAssociationOptions`][1] type.
//!
//! As an association acceptor,
//! usually taking the role of a service class provider (SCP),
//! an [`AssociationServer`][2] takes incoming TCP connections,
//! negotiates them and dispatches each request
//! to the [`ServiceHandler`][3] registered for its abstract syntax.
//!
//! [1]: crate::association::client::ClientAssociationOptions
//! [2]: crate::association::server::AssociationServer
//! [3]: crate::association::handler::ServiceHandler
pub mod client;
pub mod config;
pub mod handler;
pub mod server;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use snafu::ResultExt;
use tracing::{debug, info, warn};

use crate::acse::{self, NegotiatedAssociation};
use crate::dimse::commands::{self, status};
use crate::dimse::{DimseMessage, DimseProvider};
use crate::dul::{AbortReason, DulServiceProvider, Indication};
use crate::error::{CommandSnafu, Result};
use crate::pdu::AbortRQSource;
use crate::timer::Timer;

pub use client::{ClientAssociation, ClientAssociationOptions};
pub use config::{PresentationContextConfig, RemoteNode, UpperLayerConfig};
pub use handler::{HandlerRegistry, ServiceContext, ServiceHandler, ServiceResponse, VerificationService};
pub use server::{ActiveAssociations, AssociationListener, AssociationServer, AssociationSlot};

/// How an association came to an end.
#[derive(Debug, Clone, PartialEq)]
pub enum AssociationOutcome {
    Released,
    Aborted(AbortReason),
}

/// An established association on the accepting side,
/// serving requests until it is released or aborted.
pub struct Association {
    dul: DulServiceProvider,
    dimse: DimseProvider,
    negotiated: NegotiatedAssociation,
    /// handlers by presentation context ID
    handlers: HashMap<u8, Arc<dyn ServiceHandler>>,
    /// requests which arrived while a response stream was being sent
    deferred: VecDeque<(DimseMessage, u8)>,
    idle_timer: Timer,
    poll_interval: Duration,
}

impl std::fmt::Debug for Association {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Association")
            .field("negotiated", &self.negotiated)
            .field("state", &self.dul.state())
            .finish()
    }
}

impl Association {
    /// Wrap a freshly negotiated association,
    /// resolving the handler of each accepted presentation context.
    pub fn new(
        dul: DulServiceProvider,
        negotiated: NegotiatedAssociation,
        registry: &HandlerRegistry,
        idle_timeout: Option<Duration>,
        poll_interval: Duration,
    ) -> Self {
        let handlers = negotiated
            .accepted_contexts()
            .filter_map(|pc| registry.get(&pc.abstract_syntax).map(|h| (pc.id, h)))
            .collect();
        Association {
            dul,
            dimse: DimseProvider::new(),
            negotiated,
            handlers,
            deferred: VecDeque::new(),
            idle_timer: Timer::new(idle_timeout),
            poll_interval,
        }
    }

    pub fn negotiated(&self) -> &NegotiatedAssociation {
        &self.negotiated
    }

    /// Serve the association until it ends.
    pub fn run(mut self) -> AssociationOutcome {
        self.idle_timer.start();
        loop {
            let wait = match self.idle_timer.remaining() {
                Some(remaining) => remaining.min(self.poll_interval),
                None => self.poll_interval,
            };
            self.dul.wait_indication(Some(wait));

            loop {
                match self.next_message() {
                    Ok(Some((message, id))) => {
                        self.idle_timer.restart();
                        if let Err(e) = self.dispatch(message, id) {
                            warn!("Could not receive DIMSE message: {}", e);
                            acse::abort(&mut self.dul, AbortRQSource::ServiceUser);
                            return AssociationOutcome::Aborted(AbortReason::MalformedPdu);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Could not receive DIMSE message: {}", e);
                        acse::abort(&mut self.dul, AbortRQSource::ServiceUser);
                        return AssociationOutcome::Aborted(AbortReason::MalformedPdu);
                    }
                }
            }

            match acse::check_release(&mut self.dul) {
                Ok(true) => {
                    self.dul.stop();
                    info!("Association with {} released", self.negotiated.calling_ae_title);
                    return AssociationOutcome::Released;
                }
                Ok(false) => {}
                Err(e) => debug!("Could not answer release request: {}", e),
            }

            if let Some(reason) = acse::check_abort(&mut self.dul) {
                warn!(
                    "Association with {} aborted: {}",
                    self.negotiated.calling_ae_title, reason
                );
                self.dul.stop();
                return AssociationOutcome::Aborted(reason);
            }

            // nothing else is expected once established
            while let Some(other) = self.dul.take_indication(|i| {
                !matches!(
                    i,
                    Indication::Data(_) | Indication::ReleaseRequested | Indication::Aborted(_)
                )
            }) {
                debug!("Ignoring indication {:?}", other);
            }

            if !self.dul.is_alive() && self.dul.peek_indication().is_none() {
                warn!("Association with {} lost", self.negotiated.calling_ae_title);
                return AssociationOutcome::Aborted(AbortReason::TransportClosed);
            }

            if self.idle_timer.is_expired() {
                warn!(
                    "Association with {} idle for too long, aborting",
                    self.negotiated.calling_ae_title
                );
                acse::abort(&mut self.dul, AbortRQSource::ServiceUser);
                return AssociationOutcome::Aborted(AbortReason::Timeout);
            }
        }
    }

    fn next_message(&mut self) -> Result<Option<(DimseMessage, u8)>> {
        match self.deferred.pop_front() {
            Some(message) => Ok(Some(message)),
            None => self.dimse.receive(&mut self.dul, false, None),
        }
    }

    /// Hand a request over to its handler and send back the responses.
    ///
    /// Failing to answer is contained to the request,
    /// while an error is only returned when receiving fails
    /// in the middle of a response stream.
    fn dispatch(&mut self, message: DimseMessage, presentation_context_id: u8) -> Result<()> {
        let Some(pc) = self.negotiated.context(presentation_context_id) else {
            warn!(
                "Message on presentation context {} which was not accepted",
                presentation_context_id
            );
            return Ok(());
        };
        match message.command_field() {
            Ok(field) if commands::is_response(field) => {
                debug!("Ignoring unsolicited response {:#06x}", field);
                return Ok(());
            }
            Ok(commands::C_CANCEL_RQ) => {
                debug!("Ignoring C-CANCEL for a request no longer in progress");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Invalid command set: {}", e);
                return Ok(());
            }
        }

        let context = ServiceContext {
            presentation_context_id,
            abstract_syntax: &pc.abstract_syntax,
            transfer_syntax: &pc.transfer_syntax,
            calling_ae_title: &self.negotiated.calling_ae_title,
            called_ae_title: &self.negotiated.called_ae_title,
        };
        let response = match self.handlers.get(&presentation_context_id) {
            Some(handler) => handler.handle(&message, &context),
            None => {
                warn!("No handler for abstract syntax {}", pc.abstract_syntax);
                ServiceResponse::Status(status::SOP_CLASS_NOT_SUPPORTED)
            }
        };

        let result = match response {
            ServiceResponse::Status(status) => commands::response_to(&message, status)
                .context(CommandSnafu)
                .and_then(|rsp| self.send(&rsp, presentation_context_id)),
            ServiceResponse::Stream(responses) => {
                let mut sent = Ok(());
                for rsp in responses {
                    if self.cancel_requested(&message, presentation_context_id)? {
                        info!("Request cancelled by {}", self.negotiated.calling_ae_title);
                        sent = commands::response_to(&message, status::CANCEL)
                            .context(CommandSnafu)
                            .and_then(|rsp| self.send(&rsp, presentation_context_id));
                        break;
                    }
                    sent = self.send(&rsp, presentation_context_id);
                    if sent.is_err() {
                        break;
                    }
                }
                sent
            }
        };
        if let Err(e) = result {
            warn!("Could not send response: {}", e);
        }
        Ok(())
    }

    /// Look at the messages received so far for a C-CANCEL of the request.
    ///
    /// Other messages are kept for dispatching later.
    fn cancel_requested(&mut self, request: &DimseMessage, presentation_context_id: u8) -> Result<bool> {
        let Ok(message_id) = request.message_id() else {
            return Ok(false);
        };
        let mut cancelled = false;
        while let Some((message, id)) = self.dimse.receive(&mut self.dul, false, None)? {
            let is_cancel = id == presentation_context_id
                && matches!(message.command_field(), Ok(commands::C_CANCEL_RQ))
                && matches!(message.message_id_being_responded_to(), Ok(m) if m == message_id);
            if is_cancel {
                cancelled = true;
            } else {
                self.deferred.push_back((message, id));
            }
        }
        Ok(cancelled)
    }

    fn send(&self, message: &DimseMessage, presentation_context_id: u8) -> Result<()> {
        self.dimse.send(
            &self.dul,
            message,
            presentation_context_id,
            self.negotiated.peer_max_pdu_length,
        )
    }
}
