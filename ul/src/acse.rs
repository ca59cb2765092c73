//! Association Control Service Element.
//!
//! These functions negotiate, release and abort associations
//! on top of a [`DulServiceProvider`],
//! waiting on its indication queue with bounded timeouts.
use std::time::{Duration, Instant};

use snafu::ensure;
use tracing::{debug, info, warn};

use crate::association::config::PresentationContextConfig;
use crate::dul::{AbortReason, DulServiceProvider, Event, Indication};
use crate::error::{
    ClosedSnafu, Error, NegotiationRejectedSnafu, Result, TimeoutExpiredSnafu,
    UnexpectedEventSnafu,
};
use crate::pdu::{
    AbortRQSource, AssociationAC, AssociationRJ, AssociationRJResult, AssociationRJSource,
    AssociationRJServiceUserReason, AssociationRQ, PresentationContextNegotiated,
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
    RoleSelection, UserIdentity, UserVariableItem, APPLICATION_CONTEXT_NAME,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// How long to wait for the transport to close
/// after the release is confirmed.
const RELEASE_CLOSE_WAIT: Duration = Duration::from_secs(2);

/// Common interface for application entity access control policies.
///
/// Existing implementations include [`AcceptAny`], [`AcceptCalledAeTitle`]
/// and [`AcceptCallingAeTitles`],
/// but users are free to implement their own.
pub trait AccessControl {
    /// Decide whether an association request may proceed,
    /// based on the application entity titles and the user identity.
    ///
    /// On refusal, the service user reason given
    /// is sent back in the A-ASSOCIATE-RJ.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// An access control rule that accepts any incoming association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that only accepts requests
/// addressed to this node's AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title.trim() == called_ae_title.trim() {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// An access control rule that only accepts requests
/// from the listed calling AE titles.
///
/// Titles are compared without their padding.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct AcceptCallingAeTitles {
    ae_titles: Vec<String>,
}

impl AcceptCallingAeTitles {
    pub fn new<I, S>(ae_titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        AcceptCallingAeTitles {
            ae_titles: ae_titles
                .into_iter()
                .map(|t| t.as_ref().trim().to_string())
                .collect(),
        }
    }
}

impl AccessControl for AcceptCallingAeTitles {
    fn check_access(
        &self,
        _this_ae_title: &str,
        calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        let calling_ae_title = calling_ae_title.trim();
        if self.ae_titles.iter().any(|t| t == calling_ae_title) {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CallingAETitleNotRecognized)
        }
    }
}

/// What was agreed on when an association was established.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedAssociation {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    /// all proposed presentation contexts with their outcome
    pub presentation_contexts: Vec<PresentationContextNegotiated>,
    /// maximum PDU length the peer accepts, 0 if unlimited
    pub peer_max_pdu_length: u32,
    /// maximum PDU length this node accepts, 0 if unlimited
    pub local_max_pdu_length: u32,
    /// user information items sent by the peer
    pub peer_user_variables: Vec<UserVariableItem>,
}

impl NegotiatedAssociation {
    /// The accepted presentation contexts.
    pub fn accepted_contexts(&self) -> impl Iterator<Item = &PresentationContextNegotiated> {
        self.presentation_contexts.iter().filter(|pc| pc.is_accepted())
    }

    /// Look up an accepted presentation context by ID.
    pub fn context(&self, id: u8) -> Option<&PresentationContextNegotiated> {
        self.accepted_contexts().find(|pc| pc.id == id)
    }

    /// The first accepted presentation context for the abstract syntax.
    pub fn context_for(&self, abstract_syntax: &str) -> Option<&PresentationContextNegotiated> {
        self.accepted_contexts()
            .find(|pc| pc.abstract_syntax == abstract_syntax)
    }

    /// The user identity sent by the requestor, if any.
    pub fn user_identity(&self) -> Option<&UserIdentity> {
        self.peer_user_variables.iter().find_map(|item| match item {
            UserVariableItem::UserIdentityItem(identity) => Some(identity),
            _ => None,
        })
    }
}

/// Parameters of an association request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestParameters {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    /// maximum PDU length this node accepts, 0 if unlimited
    pub max_pdu_length: u32,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    /// extended negotiation items,
    /// sent after the implementation items
    pub extended_negotiation: Vec<UserVariableItem>,
}

/// The answer of the peer to an association request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Accepted(NegotiatedAssociation),
    Rejected(AssociationRJ),
}

/// Build the A-ASSOCIATE-RQ for the given parameters.
pub fn build_request(parameters: &RequestParameters) -> AssociationRQ {
    let mut user_variables = vec![
        UserVariableItem::MaxLength(parameters.max_pdu_length),
        UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
        UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
    ];
    user_variables.extend(parameters.extended_negotiation.iter().cloned());

    AssociationRQ {
        protocol_version: 1,
        calling_ae_title: parameters.calling_ae_title.clone(),
        called_ae_title: parameters.called_ae_title.clone(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: parameters.presentation_contexts.clone(),
        user_variables,
    }
}

/// Request an association and wait for the answer of the peer.
///
/// The DUL service provider must be a requestor
/// which has not been used yet.
pub fn request(
    dul: &mut DulServiceProvider,
    parameters: &RequestParameters,
    timeout: Option<Duration>,
) -> Result<RequestOutcome> {
    let rq = build_request(parameters);
    dul.send(Event::AssociateRequest(rq))?;

    let indication = dul.wait_for(
        |i| {
            matches!(
                i,
                Indication::AssociateAccepted(_)
                    | Indication::AssociateRejected(_)
                    | Indication::Aborted(_)
            )
        },
        timeout,
    );
    match indication {
        Some(Indication::AssociateAccepted(ac)) => {
            let negotiated = negotiated_from_accept(parameters, ac);
            info!(
                "Association with {} established, {} of {} presentation contexts accepted",
                negotiated.called_ae_title,
                negotiated.accepted_contexts().count(),
                negotiated.presentation_contexts.len()
            );
            Ok(RequestOutcome::Accepted(negotiated))
        }
        Some(Indication::AssociateRejected(rj)) => {
            info!("Association rejected: {}", rj);
            Ok(RequestOutcome::Rejected(rj))
        }
        Some(Indication::Aborted(reason)) => {
            warn!("Association request failed: {}", reason);
            Err(Error::from_abort(reason, "the association response"))
        }
        Some(other) => UnexpectedEventSnafu {
            description: format!("{:?} while awaiting the association response", other),
        }
        .fail(),
        None if !dul.is_alive() => ClosedSnafu {
            reason: AbortReason::TransportClosed,
        }
        .fail(),
        None => {
            warn!("No association response in time");
            abort(dul, AbortRQSource::ServiceUser);
            TimeoutExpiredSnafu {
                operation: "the association response",
            }
            .fail()
        }
    }
}

fn negotiated_from_accept(
    parameters: &RequestParameters,
    ac: AssociationAC,
) -> NegotiatedAssociation {
    let presentation_contexts = ac
        .presentation_contexts
        .iter()
        .filter_map(|result| {
            let proposed = parameters
                .presentation_contexts
                .iter()
                .find(|pc| pc.id == result.id);
            if proposed.is_none() {
                warn!(
                    "Peer answered presentation context {} which was never proposed",
                    result.id
                );
            }
            proposed.map(|pc| PresentationContextNegotiated {
                id: result.id,
                reason: result.reason.clone(),
                abstract_syntax: pc.abstract_syntax.clone(),
                transfer_syntax: result.transfer_syntax.clone(),
            })
        })
        .collect();

    NegotiatedAssociation {
        calling_ae_title: parameters.calling_ae_title.clone(),
        called_ae_title: parameters.called_ae_title.clone(),
        presentation_contexts,
        peer_max_pdu_length: ac.max_pdu_length().unwrap_or(0),
        local_max_pdu_length: parameters.max_pdu_length,
        peer_user_variables: ac.user_variables,
    }
}

/// Settings of the accepting side of an association.
pub struct AcceptorParameters<'a> {
    /// this node's AE title
    pub ae_title: &'a str,
    /// maximum PDU length this node accepts, 0 if unlimited
    pub max_pdu_length: u32,
    /// the abstract syntaxes and transfer syntaxes supported
    pub presentation_contexts: &'a [PresentationContextConfig],
    pub access_control: &'a dyn AccessControl,
}

/// Negotiate the proposed presentation contexts
/// against the acceptable ones.
///
/// A context is accepted with the first proposed transfer syntax
/// which is also acceptable for its abstract syntax.
/// A context with an unknown abstract syntax,
/// or without any acceptable transfer syntax,
/// is rejected as "abstract syntax not supported".
pub fn negotiate_presentation_contexts(
    proposed: &[PresentationContextProposed],
    acceptable: &[PresentationContextConfig],
) -> Vec<PresentationContextNegotiated> {
    proposed
        .iter()
        .map(|pc| {
            let transfer_syntax = acceptable
                .iter()
                .filter(|a| a.abstract_syntax == pc.abstract_syntax)
                .find_map(|a| {
                    pc.transfer_syntaxes
                        .iter()
                        .find(|ts| a.transfer_syntaxes.contains(ts))
                });
            match transfer_syntax {
                Some(ts) => PresentationContextNegotiated {
                    id: pc.id,
                    reason: PresentationContextResultReason::Acceptance,
                    abstract_syntax: pc.abstract_syntax.clone(),
                    transfer_syntax: ts.clone(),
                },
                None => PresentationContextNegotiated {
                    id: pc.id,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    abstract_syntax: pc.abstract_syntax.clone(),
                    transfer_syntax: pc.transfer_syntaxes.first().cloned().unwrap_or_default(),
                },
            }
        })
        .collect()
}

/// Answer the SCP/SCU role selection items of a request,
/// granting only the roles allowed for each SOP class.
fn answer_role_selections(
    requested: &[UserVariableItem],
    acceptable: &[PresentationContextConfig],
) -> Vec<UserVariableItem> {
    requested
        .iter()
        .filter_map(|item| match item {
            UserVariableItem::RoleSelection(role) => acceptable
                .iter()
                .find(|a| a.abstract_syntax == role.sop_class_uid)
                .map(|a| {
                    UserVariableItem::RoleSelection(RoleSelection {
                        sop_class_uid: role.sop_class_uid.clone(),
                        scu_role: role.scu_role && a.scu_role,
                        scp_role: role.scp_role && a.scp_role,
                    })
                }),
            _ => None,
        })
        .collect()
}

/// Wait for an association request and answer it.
///
/// If `preset_rejection` is given, the request is rejected with it
/// no matter what was asked.
/// Otherwise the request goes through access control
/// and presentation context negotiation.
///
/// On rejection, the A-ASSOCIATE-RJ sent is returned
/// as [`Error::NegotiationRejected`].
pub fn accept(
    dul: &mut DulServiceProvider,
    acceptor: &AcceptorParameters<'_>,
    preset_rejection: Option<AssociationRJ>,
    timeout: Option<Duration>,
) -> Result<NegotiatedAssociation> {
    let indication = dul.wait_for(
        |i| matches!(i, Indication::AssociateRequest(_) | Indication::Aborted(_)),
        timeout,
    );
    let rq = match indication {
        Some(Indication::AssociateRequest(rq)) => rq,
        Some(Indication::Aborted(reason)) => {
            return Err(Error::from_abort(reason, "the association request"))
        }
        Some(other) => {
            return UnexpectedEventSnafu {
                description: format!("{:?} while awaiting the association request", other),
            }
            .fail()
        }
        None if !dul.is_alive() => {
            return ClosedSnafu {
                reason: AbortReason::TransportClosed,
            }
            .fail()
        }
        None => {
            warn!("No association request in time");
            dul.kill();
            return TimeoutExpiredSnafu {
                operation: "the association request",
            }
            .fail();
        }
    };
    debug!(
        "Association request from {} to {}",
        rq.calling_ae_title, rq.called_ae_title
    );

    let rejection = preset_rejection.or_else(|| check_request(acceptor, &rq).err());
    if let Some(rj) = rejection {
        info!("Rejecting association from {}: {}", rq.calling_ae_title, rj);
        dul.send(Event::AssociateReject(rj.clone()))?;
        return NegotiationRejectedSnafu { association_rj: rj }.fail();
    }

    let presentation_contexts =
        negotiate_presentation_contexts(&rq.presentation_contexts, acceptor.presentation_contexts);

    let mut user_variables = vec![
        UserVariableItem::MaxLength(acceptor.max_pdu_length),
        UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
        UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
    ];
    if rq
        .user_variables
        .iter()
        .any(|item| matches!(item, UserVariableItem::AsyncOperationsWindow(..)))
    {
        // asynchronous operations are not supported
        user_variables.push(UserVariableItem::AsyncOperationsWindow(1, 1));
    }
    user_variables.extend(answer_role_selections(
        &rq.user_variables,
        acceptor.presentation_contexts,
    ));

    let ac = AssociationAC {
        protocol_version: 1,
        calling_ae_title: rq.calling_ae_title.clone(),
        called_ae_title: rq.called_ae_title.clone(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: presentation_contexts
            .iter()
            .map(PresentationContextResult::from)
            .collect(),
        user_variables,
    };
    dul.send(Event::AssociateAccept(ac))?;

    let negotiated = NegotiatedAssociation {
        peer_max_pdu_length: rq.max_pdu_length().unwrap_or(0),
        calling_ae_title: rq.calling_ae_title,
        called_ae_title: rq.called_ae_title,
        presentation_contexts,
        local_max_pdu_length: acceptor.max_pdu_length,
        peer_user_variables: rq.user_variables,
    };
    info!(
        "Association with {} established, {} of {} presentation contexts accepted",
        negotiated.calling_ae_title,
        negotiated.accepted_contexts().count(),
        negotiated.presentation_contexts.len()
    );
    Ok(negotiated)
}

/// Decide whether the request can be accepted at all.
fn check_request(acceptor: &AcceptorParameters<'_>, rq: &AssociationRQ) -> Result<(), AssociationRJ> {
    if rq.application_context_name != APPLICATION_CONTEXT_NAME {
        return Err(AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            ),
        });
    }
    let user_identity = rq.user_variables.iter().find_map(|item| match item {
        UserVariableItem::UserIdentityItem(identity) => Some(identity),
        _ => None,
    });
    acceptor
        .access_control
        .check_access(
            acceptor.ae_title,
            &rq.calling_ae_title,
            &rq.called_ae_title,
            user_identity,
        )
        .map_err(|reason| AssociationRJ {
            result: AssociationRJResult::Permanent,
            source: AssociationRJSource::ServiceUser(reason),
        })
}

/// Release the association and wait for the confirmation.
///
/// On a release collision, the requestor of the association answers
/// the peer's release request right away,
/// while the acceptor answers once its own request is confirmed.
pub fn release(dul: &mut DulServiceProvider, timeout: Option<Duration>) -> Result<()> {
    dul.send(Event::ReleaseRequest)?;
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut answer_after_confirmation = false;

    loop {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let indication = dul.wait_for(
            |i| {
                matches!(
                    i,
                    Indication::ReleaseConfirmed
                        | Indication::ReleaseRequested
                        | Indication::Aborted(_)
                )
            },
            remaining,
        );
        match indication {
            Some(Indication::ReleaseRequested) => {
                debug!("Release collision");
                if dul.is_requestor() {
                    dul.send(Event::ReleaseResponse)?;
                } else {
                    answer_after_confirmation = true;
                }
            }
            Some(Indication::ReleaseConfirmed) => {
                if answer_after_confirmation {
                    dul.send(Event::ReleaseResponse)?;
                }
                if !dul.join(RELEASE_CLOSE_WAIT) {
                    dul.kill();
                }
                info!("Association released");
                return Ok(());
            }
            Some(Indication::Aborted(reason)) => {
                warn!("Association aborted during release: {}", reason);
                return Err(Error::from_abort(reason, "the release response"));
            }
            Some(_) => {}
            None => {
                ensure!(
                    dul.is_alive(),
                    ClosedSnafu {
                        reason: AbortReason::TransportClosed
                    }
                );
                warn!("No release response in time");
                abort(dul, AbortRQSource::ServiceUser);
                return TimeoutExpiredSnafu {
                    operation: "the release response",
                }
                .fail();
            }
        }
    }
}

/// Abort the association.
///
/// When this returns, the transport connection is closed.
pub fn abort(dul: &mut DulServiceProvider, source: AbortRQSource) {
    if dul.is_alive() {
        debug!("Aborting association ({})", source);
        let _ = dul.send(Event::AbortRequest(source));
    }
    dul.stop();
}

/// Answer a pending release request, if any.
///
/// Returns whether the association is being released.
pub fn check_release(dul: &mut DulServiceProvider) -> Result<bool> {
    match dul.take_indication(|i| matches!(i, Indication::ReleaseRequested)) {
        Some(_) => {
            debug!("Release requested by peer");
            dul.send(Event::ReleaseResponse)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Take a pending abort indication, if any.
pub fn check_abort(dul: &mut DulServiceProvider) -> Option<AbortReason> {
    match dul.take_indication(|i| matches!(i, Indication::Aborted(_))) {
        Some(Indication::Aborted(reason)) => Some(reason),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::config::{EXPLICIT_VR_LE, IMPLICIT_VR_LE, VERIFICATION_SOP_CLASS};
    use crate::dul::{DulOptions, State};
    use crate::pdu::{read_pdu_from_buffer, write_pdu, Pdu};
    use bytes::BytesMut;
    use matches::matches;
    use rstest::rstest;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
    const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";

    fn proposed(id: u8, abstract_syntax: &str, transfer_syntaxes: &[&str]) -> PresentationContextProposed {
        PresentationContextProposed {
            id,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: transfer_syntaxes.iter().map(|ts| ts.to_string()).collect(),
        }
    }

    fn acceptable() -> Vec<PresentationContextConfig> {
        vec![
            PresentationContextConfig::new(VERIFICATION_SOP_CLASS, [IMPLICIT_VR_LE]),
            PresentationContextConfig::new(CT_IMAGE_STORAGE, [EXPLICIT_VR_LE, IMPLICIT_VR_LE]),
        ]
    }

    #[test]
    fn verification_is_accepted() {
        let result = negotiate_presentation_contexts(
            &[proposed(1, VERIFICATION_SOP_CLASS, &[IMPLICIT_VR_LE])],
            &acceptable(),
        );
        assert_eq!(
            result,
            vec![PresentationContextNegotiated {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                abstract_syntax: VERIFICATION_SOP_CLASS.to_string(),
                transfer_syntax: IMPLICIT_VR_LE.to_string(),
            }]
        );
    }

    #[test]
    fn unknown_abstract_syntax_rejects_only_that_context() {
        let result = negotiate_presentation_contexts(
            &[
                proposed(1, VERIFICATION_SOP_CLASS, &[IMPLICIT_VR_LE]),
                proposed(3, "1.2.3.4", &[IMPLICIT_VR_LE]),
            ],
            &acceptable(),
        );
        assert!(result[0].is_accepted());
        assert_eq!(result[1].id, 3);
        assert_eq!(
            result[1].reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported
        );
    }

    #[rstest]
    #[case(&[IMPLICIT_VR_LE, EXPLICIT_VR_LE], Some(IMPLICIT_VR_LE))]
    #[case(&[EXPLICIT_VR_LE, IMPLICIT_VR_LE], Some(EXPLICIT_VR_LE))]
    #[case(&[JPEG_BASELINE, IMPLICIT_VR_LE], Some(IMPLICIT_VR_LE))]
    #[case(&[JPEG_BASELINE], None)]
    fn first_proposed_acceptable_transfer_syntax_wins(
        #[case] transfer_syntaxes: &[&str],
        #[case] expected: Option<&str>,
    ) {
        let result = negotiate_presentation_contexts(
            &[proposed(5, CT_IMAGE_STORAGE, transfer_syntaxes)],
            &acceptable(),
        );
        match expected {
            Some(ts) => {
                assert!(result[0].is_accepted());
                assert_eq!(result[0].transfer_syntax, ts);
            }
            None => assert_eq!(
                result[0].reason,
                PresentationContextResultReason::AbstractSyntaxNotSupported
            ),
        }
    }

    #[test]
    fn role_selection_is_limited_to_allowed_roles() {
        let acceptable = vec![
            PresentationContextConfig::new(VERIFICATION_SOP_CLASS, [IMPLICIT_VR_LE]),
            PresentationContextConfig::new(CT_IMAGE_STORAGE, [IMPLICIT_VR_LE]).with_roles(true, true),
        ];
        let requested = vec![
            UserVariableItem::MaxLength(16384),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: VERIFICATION_SOP_CLASS.to_string(),
                scu_role: true,
                scp_role: true,
            }),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: CT_IMAGE_STORAGE.to_string(),
                scu_role: false,
                scp_role: true,
            }),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2.3.4".to_string(),
                scu_role: true,
                scp_role: false,
            }),
        ];
        let answer = answer_role_selections(&requested, &acceptable);
        assert_eq!(
            answer,
            vec![
                UserVariableItem::RoleSelection(RoleSelection {
                    sop_class_uid: VERIFICATION_SOP_CLASS.to_string(),
                    scu_role: true,
                    scp_role: false,
                }),
                UserVariableItem::RoleSelection(RoleSelection {
                    sop_class_uid: CT_IMAGE_STORAGE.to_string(),
                    scu_role: false,
                    scp_role: true,
                }),
            ]
        );
    }

    #[test]
    fn request_carries_implementation_items_first() {
        let rq = build_request(&RequestParameters {
            calling_ae_title: "SCU".to_string(),
            called_ae_title: "SCP".to_string(),
            max_pdu_length: 16384,
            presentation_contexts: vec![proposed(1, VERIFICATION_SOP_CLASS, &[IMPLICIT_VR_LE])],
            extended_negotiation: vec![UserVariableItem::AsyncOperationsWindow(1, 1)],
        });
        assert_eq!(rq.protocol_version, 1);
        assert_eq!(rq.application_context_name, APPLICATION_CONTEXT_NAME);
        assert_eq!(rq.max_pdu_length(), Some(16384));
        assert_eq!(
            rq.user_variables[1],
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string())
        );
        assert_eq!(
            rq.user_variables.last(),
            Some(&UserVariableItem::AsyncOperationsWindow(1, 1))
        );
    }

    /// Read one whole PDU off a raw connection.
    fn read_from(stream: &mut TcpStream, buffer: &mut BytesMut) -> Pdu {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(pdu) = read_pdu_from_buffer(buffer, 0, false).unwrap() {
                return pdu;
            }
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed before a full PDU");
            buffer.extend_from_slice(&chunk[..n]);
        }
    }

    fn write_to(stream: &mut TcpStream, pdu: &Pdu) {
        let mut bytes = Vec::new();
        write_pdu(&mut bytes, pdu).unwrap();
        stream.write_all(&bytes).unwrap();
    }

    fn parameters() -> RequestParameters {
        RequestParameters {
            calling_ae_title: "SCU".to_string(),
            called_ae_title: "SCP".to_string(),
            max_pdu_length: 16384,
            presentation_contexts: vec![proposed(1, VERIFICATION_SOP_CLASS, &[IMPLICIT_VR_LE])],
            extended_negotiation: vec![],
        }
    }

    /// Wait for the peer to close its end.
    fn assert_closed(stream: &mut TcpStream) {
        stream.set_read_timeout(Some(WAIT)).unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest);
        assert!(rest.is_empty());
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn release_collision_on_acceptor_answers_after_confirmation() {
        let listener = TcpListener::bind("localhost:0").unwrap();
        let mut peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let mut dul = DulServiceProvider::new_acceptor(stream, DulOptions::default()).unwrap();
        let mut buffer = BytesMut::new();

        write_to(&mut peer, &Pdu::AssociationRQ(build_request(&parameters())));
        let contexts = acceptable();
        let acceptor = AcceptorParameters {
            ae_title: "SCP",
            max_pdu_length: 16384,
            presentation_contexts: &contexts,
            access_control: &AcceptAny,
        };
        let negotiated = accept(&mut dul, &acceptor, None, Some(WAIT)).unwrap();
        assert_eq!(negotiated.accepted_contexts().count(), 1);
        assert!(matches!(read_from(&mut peer, &mut buffer), Pdu::AssociationAC(_)));

        let releasing = std::thread::spawn(move || {
            let result = release(&mut dul, Some(WAIT));
            (result, dul)
        });

        // both release requests cross on the wire
        assert_eq!(read_from(&mut peer, &mut buffer), Pdu::ReleaseRQ);
        write_to(&mut peer, &Pdu::ReleaseRQ);
        // the acceptor holds its answer until its own request is confirmed
        peer.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut byte = [0u8; 1];
        assert!(peer.read(&mut byte).is_err());
        peer.set_read_timeout(None).unwrap();

        write_to(&mut peer, &Pdu::ReleaseRP);
        assert_eq!(read_from(&mut peer, &mut buffer), Pdu::ReleaseRP);
        drop(peer);

        let (result, mut dul) = releasing.join().unwrap();
        assert!(result.is_ok(), "{:?}", result);
        assert!(dul.join(WAIT));
        assert_eq!(dul.state(), State::Sta1);
    }

    #[test]
    fn release_collision_on_requestor_answers_right_away() {
        let listener = TcpListener::bind("localhost:0").unwrap();
        let address = listener.local_addr().unwrap();
        let mut dul = DulServiceProvider::new_requestor(address, DulOptions::default()).unwrap();

        let requesting = std::thread::spawn(move || {
            let outcome = request(&mut dul, &parameters(), Some(WAIT));
            (outcome, dul)
        });
        let (mut peer, _) = listener.accept().unwrap();
        let mut buffer = BytesMut::new();
        let rq = match read_from(&mut peer, &mut buffer) {
            Pdu::AssociationRQ(rq) => rq,
            other => panic!("unexpected {:?}", other),
        };
        write_to(
            &mut peer,
            &Pdu::AssociationAC(AssociationAC {
                protocol_version: 1,
                calling_ae_title: rq.calling_ae_title,
                called_ae_title: rq.called_ae_title,
                application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
                presentation_contexts: vec![PresentationContextResult {
                    id: 1,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: IMPLICIT_VR_LE.to_string(),
                }],
                user_variables: vec![UserVariableItem::MaxLength(16384)],
            }),
        );
        let (outcome, mut dul) = requesting.join().unwrap();
        assert!(matches!(outcome, Ok(RequestOutcome::Accepted(_))));

        let releasing = std::thread::spawn(move || {
            let result = release(&mut dul, Some(WAIT));
            (result, dul)
        });

        assert_eq!(read_from(&mut peer, &mut buffer), Pdu::ReleaseRQ);
        write_to(&mut peer, &Pdu::ReleaseRQ);
        // the requestor answers the crossing request first
        assert_eq!(read_from(&mut peer, &mut buffer), Pdu::ReleaseRP);
        write_to(&mut peer, &Pdu::ReleaseRP);
        assert_closed(&mut peer);

        let (result, mut dul) = releasing.join().unwrap();
        assert!(result.is_ok(), "{:?}", result);
        assert!(dul.join(WAIT));
        assert_eq!(dul.state(), State::Sta1);
    }

    #[test]
    fn calling_ae_title_policy() {
        let policy = AcceptCallingAeTitles::new(["STORE-SCU ", "FIND-SCU"]);
        assert!(policy.check_access("SCP", "STORE-SCU", "SCP", None).is_ok());
        assert!(policy.check_access("SCP", "FIND-SCU  ", "SCP", None).is_ok());
        assert_eq!(
            policy.check_access("SCP", "INTRUDER", "SCP", None),
            Err(AssociationRJServiceUserReason::CallingAETitleNotRecognized)
        );
    }

    #[test]
    fn called_ae_title_policy() {
        assert!(AcceptCalledAeTitle
            .check_access("STORE-SCP", "ANY", "STORE-SCP", None)
            .is_ok());
        assert_eq!(
            AcceptCalledAeTitle.check_access("STORE-SCP", "ANY", "OTHER", None),
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        );
    }
}
