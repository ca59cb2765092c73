//! Association requester module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity is the one requesting the association.
//! See [`ClientAssociationOptions`](self::ClientAssociationOptions)
//! for details and examples on how to create an association.
use std::borrow::Cow;
use std::io::ErrorKind;
use std::net::ToSocketAddrs;
use std::time::Duration;

use snafu::{OptionExt, ResultExt};
use tracing::{debug, warn};

use crate::acse::{self, NegotiatedAssociation, RequestOutcome, RequestParameters};
use crate::association::config::{
    self, PresentationContextConfig, RemoteNode, UpperLayerConfig, EXPLICIT_VR_LE,
    IMPLICIT_VR_LE, MAX_PRESENTATION_CONTEXTS, VERIFICATION_SOP_CLASS,
};
use crate::dimse::commands::{self, echo_request};
use crate::dimse::{DimseMessage, DimseProvider};
use crate::dul::{AbortReason, DulOptions, DulServiceProvider};
use crate::error::{
    ClosedSnafu, CommandSnafu, ConfigSnafu, NegotiationRejectedSnafu, Result,
    TimeoutExpiredSnafu, TransportSnafu, UnsupportedAbstractSyntaxSnafu,
};
use crate::pdu::{
    AbortRQSource, PresentationContextNegotiated, PresentationContextProposed, RoleSelection,
    UserVariableItem, DEFAULT_MAX_PDU,
};

/// A DICOM association builder for a client node.
/// The final outcome is a [`ClientAssociation`].
///
/// This is the standard way of requesting and establishing
/// an association with another DICOM node,
/// that one usually taking the role of a service class provider (SCP).
///
/// # Example
///
/// ```no_run
/// # use dicom_upper_layer::association::client::ClientAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = ClientAssociationOptions::new()
///    .with_presentation_context("1.2.840.10008.1.1", vec!["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"])
///    .establish("129.168.0.5:104")?;
/// # Ok(())
/// # }
/// ```
///
/// At least one presentation context must be specified,
/// using the method [`with_presentation_context`](Self::with_presentation_context)
/// and supplying both an abstract syntax and list of transfer syntaxes.
///
/// A helper method [`with_abstract_syntax`](Self::with_abstract_syntax) will
/// include by default the transfer syntaxes
/// _Implicit VR Little Endian_ and _Explicit VR Little Endian_
/// in the resulting presentation context.
///
/// Each presentation context is proposed with an SCP/SCU role selection item
/// for its abstract syntax.
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions<'a> {
    /// the calling AE title
    calling_ae_title: Cow<'a, str>,
    /// the called AE title
    called_ae_title: Cow<'a, str>,
    /// the list of requested presentation contexts
    presentation_contexts: Vec<PresentationContextConfig>,
    /// the maximum PDU length requested for receiving PDUs
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    acse_timeout: Option<Duration>,
    dimse_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    /// additional user information items
    extended_negotiation: Vec<UserVariableItem>,
}

impl<'a> Default for ClientAssociationOptions<'a> {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            presentation_contexts: Vec::new(),
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            acse_timeout: Some(Duration::from_secs(30)),
            dimse_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Some(Duration::from_millis(5_000)),
            extended_negotiation: Vec::new(),
        }
    }
}

impl<'a> ClientAssociationOptions<'a> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create options from an Upper Layer configuration.
    ///
    /// The local AE title becomes the calling AE title,
    /// and the configured remote node, if any, the called one.
    pub fn from_config(config: &UpperLayerConfig) -> Self {
        let mut options = ClientAssociationOptions {
            calling_ae_title: Cow::Owned(config.ae_title.clone()),
            presentation_contexts: config.presentation_contexts.clone(),
            max_pdu_length: config.max_pdu_length,
            strict: config.strict,
            acse_timeout: config.acse_timeout(),
            dimse_timeout: config.dimse_timeout(),
            connect_timeout: config.connect_timeout(),
            ..Default::default()
        };
        if let Some(remote) = &config.remote {
            options.called_ae_title = Cow::Owned(remote.ae_title.clone());
        }
        options
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// Include this presentation context
    /// in the list of proposed presentation contexts.
    pub fn with_presentation_context<T>(
        self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let transfer_syntaxes: Vec<String> = transfer_syntax_uids
            .into_iter()
            .map(|t| trim_uid(t.into()))
            .collect();
        self.with_context(PresentationContextConfig::new(
            trim_uid(abstract_syntax_uid.into()),
            transfer_syntaxes,
        ))
    }

    /// Include this presentation context, with its role selection,
    /// in the list of proposed presentation contexts.
    pub fn with_context(mut self, context: PresentationContextConfig) -> Self {
        self.presentation_contexts.push(context);
        self
    }

    /// Helper to add this abstract syntax
    /// with the default transfer syntaxes
    /// to the list of proposed presentation contexts.
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let default_transfer_syntaxes: Vec<Cow<'a, str>> =
            vec![EXPLICIT_VR_LE.into(), IMPLICIT_VR_LE.into()];
        self.with_presentation_context(abstract_syntax_uid.into(), default_transfer_syntaxes)
    }

    /// Override the maximum PDU length
    /// that this application entity will admit.
    ///
    /// 0 means no limit.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether receiving PDUs must not
    /// surpass the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Time to wait for association and release responses.
    pub fn acse_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acse_timeout = timeout;
        self
    }

    /// Time to wait for DIMSE responses.
    pub fn dimse_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dimse_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Send an additional user information item in the request,
    /// such as SOP class extended negotiation or user identity.
    pub fn with_extended_negotiation(mut self, item: UserVariableItem) -> Self {
        self.extended_negotiation.push(item);
        self
    }

    /// Initiate the TCP connection to the given address
    /// and request a new DICOM association,
    /// negotiating the presentation contexts in the process.
    ///
    /// A rejection by the peer is returned as
    /// [`Error::NegotiationRejected`](crate::error::Error::NegotiationRejected).
    pub fn establish<A: ToSocketAddrs>(self, address: A) -> Result<ClientAssociation> {
        let ClientAssociationOptions {
            calling_ae_title,
            called_ae_title,
            presentation_contexts,
            max_pdu_length,
            strict,
            acse_timeout,
            dimse_timeout,
            connect_timeout,
            extended_negotiation,
        } = self;

        // fail if no presentation contexts were provided: they represent intent,
        // should not be omitted by the user
        if presentation_contexts.is_empty() {
            return config::NoPresentationContextsSnafu.fail().context(ConfigSnafu);
        }
        if presentation_contexts.len() > MAX_PRESENTATION_CONTEXTS {
            return config::TooManyPresentationContextsSnafu {
                count: presentation_contexts.len(),
            }
            .fail()
            .context(ConfigSnafu);
        }

        let address = address
            .to_socket_addrs()
            .context(TransportSnafu)?
            .next()
            .ok_or_else(|| std::io::Error::from(ErrorKind::AddrNotAvailable))
            .context(TransportSnafu)?;

        let mut user_variables = Vec::new();
        for pc in &presentation_contexts {
            let already = user_variables.iter().any(|item| {
                matches!(item, UserVariableItem::RoleSelection(role) if role.sop_class_uid == pc.abstract_syntax)
            });
            if !already {
                user_variables.push(UserVariableItem::RoleSelection(RoleSelection {
                    sop_class_uid: pc.abstract_syntax.clone(),
                    scu_role: pc.scu_role,
                    scp_role: pc.scp_role,
                }));
            }
        }
        user_variables.extend(extended_negotiation);

        let parameters = RequestParameters {
            calling_ae_title: calling_ae_title.into_owned(),
            called_ae_title: called_ae_title.into_owned(),
            max_pdu_length,
            presentation_contexts: presentation_contexts
                .into_iter()
                .zip((1..=255).step_by(2))
                .map(|(pc, id)| PresentationContextProposed {
                    id,
                    abstract_syntax: pc.abstract_syntax,
                    transfer_syntaxes: pc.transfer_syntaxes,
                })
                .collect(),
            extended_negotiation: user_variables,
        };

        let options = DulOptions {
            max_pdu_length,
            strict,
            artim_timeout: acse_timeout,
            connect_timeout,
        };
        let mut dul = DulServiceProvider::new_requestor(address, options)?;
        match acse::request(&mut dul, &parameters, acse_timeout)? {
            RequestOutcome::Accepted(negotiated) => {
                if negotiated.accepted_contexts().next().is_none() {
                    warn!("No presentation context was accepted by {}", address);
                }
                Ok(ClientAssociation {
                    dul,
                    dimse: DimseProvider::new(),
                    negotiated,
                    acse_timeout,
                    dimse_timeout,
                    message_id: 0,
                })
            }
            RequestOutcome::Rejected(association_rj) => {
                dul.stop();
                NegotiationRejectedSnafu { association_rj }.fail()
            }
        }
    }

    /// Request an association with a remote node from the configuration.
    pub fn establish_remote(self, remote: &RemoteNode) -> Result<ClientAssociation> {
        let address = remote.socket_addr().context(ConfigSnafu)?;
        self.called_ae_title(remote.ae_title.clone())
            .establish(address)
    }
}

/// A DICOM upper level association from the perspective
/// of a requesting application entity.
///
/// The most common operations of an established association are
/// [`send_message`](Self::send_message)
/// and [`receive_message`](Self::receive_message).
///
/// When the value falls out of scope,
/// the association is aborted unless it was released.
#[derive(Debug)]
pub struct ClientAssociation {
    dul: DulServiceProvider,
    dimse: DimseProvider,
    negotiated: NegotiatedAssociation,
    acse_timeout: Option<Duration>,
    dimse_timeout: Option<Duration>,
    /// the last message ID used
    message_id: u16,
}

impl ClientAssociation {
    /// What was agreed on with the acceptor.
    pub fn negotiated(&self) -> &NegotiatedAssociation {
        &self.negotiated
    }

    /// Retrieve the list of negotiated presentation contexts.
    pub fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.negotiated.presentation_contexts
    }

    /// Retrieve the maximum PDU length
    /// admitted by the association acceptor,
    /// 0 if unlimited.
    pub fn acceptor_max_pdu_length(&self) -> u32 {
        self.negotiated.peer_max_pdu_length
    }

    /// Retrieve the maximum PDU length
    /// that this application entity is expecting to receive.
    pub fn requestor_max_pdu_length(&self) -> u32 {
        self.negotiated.local_max_pdu_length
    }

    /// The accepted presentation context for the abstract syntax.
    pub fn context_for(&self, abstract_syntax: &str) -> Result<&PresentationContextNegotiated> {
        self.negotiated
            .context_for(abstract_syntax)
            .context(UnsupportedAbstractSyntaxSnafu { abstract_syntax })
    }

    /// Obtain a fresh message ID for a request.
    pub fn next_message_id(&mut self) -> u16 {
        self.message_id = self.message_id.wrapping_add(1).max(1);
        self.message_id
    }

    /// Whether the association is still up.
    pub fn is_alive(&self) -> bool {
        self.dul.is_alive()
    }

    /// Send a DIMSE message on the given presentation context.
    pub fn send_message(&mut self, message: &DimseMessage, presentation_context_id: u8) -> Result<()> {
        self.dimse.send(
            &self.dul,
            message,
            presentation_context_id,
            self.negotiated.peer_max_pdu_length,
        )
    }

    /// Wait for the next DIMSE message and its presentation context ID,
    /// up to the DIMSE timeout.
    pub fn receive_message(&mut self) -> Result<(DimseMessage, u8)> {
        match self.dimse.receive(&mut self.dul, true, self.dimse_timeout)? {
            Some(message) => Ok(message),
            None if !self.dul.is_alive() => ClosedSnafu {
                reason: AbortReason::TransportClosed,
            }
            .fail(),
            None => TimeoutExpiredSnafu {
                operation: "a DIMSE message",
            }
            .fail(),
        }
    }

    /// Send a C-ECHO request and wait for its response.
    ///
    /// Returns the status of the response.
    pub fn echo(&mut self) -> Result<u16> {
        let presentation_context_id = self.context_for(VERIFICATION_SOP_CLASS)?.id;
        let message_id = self.next_message_id();
        self.send_message(
            &echo_request(VERIFICATION_SOP_CLASS, message_id),
            presentation_context_id,
        )?;
        let response = self.await_final(message_id, commands::C_ECHO_RSP, |_| {}, None)?;
        response.status().context(CommandSnafu)
    }

    /// Send a data set to the acceptor with a C-STORE request
    /// and wait for its response.
    ///
    /// The data set must already be encoded
    /// in the transfer syntax negotiated for the SOP class.
    /// Returns the status of the response.
    pub fn store(&mut self, sop_class_uid: &str, sop_instance_uid: &str, data: Vec<u8>) -> Result<u16> {
        let presentation_context_id = self.context_for(sop_class_uid)?.id;
        let message_id = self.next_message_id();
        self.send_message(
            &commands::store_request(
                sop_class_uid,
                sop_instance_uid,
                message_id,
                commands::priority::MEDIUM,
                data,
            ),
            presentation_context_id,
        )?;
        let response = self.await_final(message_id, commands::C_STORE_RSP, |_| {}, None)?;
        response.status().context(CommandSnafu)
    }

    /// Query the acceptor with a C-FIND request.
    ///
    /// `on_match` is called with each pending response,
    /// which holds a matching identifier in its data set.
    /// Returns the final response.
    pub fn find<F>(&mut self, sop_class_uid: &str, identifier: Vec<u8>, on_match: F) -> Result<DimseMessage>
    where
        F: FnMut(&DimseMessage),
    {
        let presentation_context_id = self.context_for(sop_class_uid)?.id;
        let message_id = self.next_message_id();
        self.send_message(
            &commands::find_request(
                sop_class_uid,
                message_id,
                commands::priority::MEDIUM,
                identifier,
            ),
            presentation_context_id,
        )?;
        self.await_final(message_id, commands::C_FIND_RSP, on_match, None)
    }

    /// Ask the acceptor to send the matching instances
    /// to another application entity with a C-MOVE request.
    ///
    /// `on_progress` is called with each pending response,
    /// see [`DimseMessage::sub_operations`].
    /// Returns the final response.
    pub fn move_to<F>(
        &mut self,
        sop_class_uid: &str,
        move_destination: &str,
        identifier: Vec<u8>,
        on_progress: F,
    ) -> Result<DimseMessage>
    where
        F: FnMut(&DimseMessage),
    {
        let presentation_context_id = self.context_for(sop_class_uid)?.id;
        let message_id = self.next_message_id();
        self.send_message(
            &commands::move_request(
                sop_class_uid,
                message_id,
                commands::priority::MEDIUM,
                move_destination,
                identifier,
            ),
            presentation_context_id,
        )?;
        self.await_final(message_id, commands::C_MOVE_RSP, on_progress, None)
    }

    /// Retrieve the matching instances over this association
    /// with a C-GET request.
    ///
    /// The acceptor sends each instance in a C-STORE request
    /// on the presentation context of its SOP class,
    /// which must have been negotiated with the SCP role for this node.
    /// `on_store` receives each of them and returns the status to answer with.
    /// Returns the final C-GET response.
    pub fn get<F>(&mut self, sop_class_uid: &str, identifier: Vec<u8>, mut on_store: F) -> Result<DimseMessage>
    where
        F: FnMut(&DimseMessage) -> u16,
    {
        let presentation_context_id = self.context_for(sop_class_uid)?.id;
        let message_id = self.next_message_id();
        self.send_message(
            &commands::get_request(
                sop_class_uid,
                message_id,
                commands::priority::MEDIUM,
                identifier,
            ),
            presentation_context_id,
        )?;
        self.await_final(
            message_id,
            commands::C_GET_RSP,
            |_| {},
            Some(&mut on_store as &mut dyn FnMut(&DimseMessage) -> u16),
        )
    }

    /// Ask the acceptor to stop a C-FIND, C-GET or C-MOVE in progress.
    ///
    /// The acceptor answers the cancelled request
    /// with a final response of status _Cancel_.
    pub fn cancel(&mut self, presentation_context_id: u8, message_id: u16) -> Result<()> {
        debug!("Cancelling request {}", message_id);
        self.send_message(&commands::cancel_request(message_id), presentation_context_id)
    }

    /// Wait for the responses to the request with the given ID
    /// until one with a final status arrives, and return it.
    ///
    /// Pending responses go to `on_pending`.
    /// Incoming C-STORE requests are answered through `on_store`,
    /// or refused when there is none.
    fn await_final<F>(
        &mut self,
        message_id: u16,
        response_field: u16,
        mut on_pending: F,
        mut on_store: Option<&mut dyn FnMut(&DimseMessage) -> u16>,
    ) -> Result<DimseMessage>
    where
        F: FnMut(&DimseMessage),
    {
        loop {
            let (message, presentation_context_id) = self.receive_message()?;
            let field = message.command_field().context(CommandSnafu)?;
            if field == commands::C_STORE_RQ {
                let status = match on_store.as_deref_mut() {
                    Some(on_store) => on_store(&message),
                    None => {
                        warn!("Refusing unexpected C-STORE request");
                        commands::status::SOP_CLASS_NOT_SUPPORTED
                    }
                };
                let response = commands::response_to(&message, status).context(CommandSnafu)?;
                self.send_message(&response, presentation_context_id)?;
                continue;
            }

            let responded_to = message.message_id_being_responded_to().context(CommandSnafu)?;
            if field != response_field || responded_to != message_id {
                warn!(
                    "Ignoring message {:#06x} responding to {}",
                    field, responded_to
                );
                continue;
            }
            let status = message.status().context(CommandSnafu)?;
            if commands::is_final_status(status) {
                debug!("Final status {:#06x} for request {}", status, message_id);
                return Ok(message);
            }
            on_pending(&message);
        }
    }

    /// Gracefully terminate the association by exchanging release messages
    /// and then shutting down the TCP connection.
    pub fn release(mut self) -> Result<()> {
        acse::release(&mut self.dul, self.acse_timeout)
    }

    /// Send an abort message and shut down the TCP connection,
    /// terminating the association.
    pub fn abort(mut self) {
        acse::abort(&mut self.dul, AbortRQSource::ServiceUser);
    }
}

/// Automatically release the association and shut down the connection.
impl Drop for ClientAssociation {
    fn drop(&mut self) {
        if self.dul.is_alive() {
            acse::abort(&mut self.dul, AbortRQSource::ServiceUser);
        }
    }
}

/// Remove trailing whitespace and null characters from a UID.
fn trim_uid(uid: Cow<'_, str>) -> String {
    uid.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string()
}
