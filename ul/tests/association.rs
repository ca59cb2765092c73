use dicom_upper_layer::acse::NegotiatedAssociation;
use dicom_upper_layer::association::config::{
    PresentationContextConfig, EXPLICIT_VR_LE, IMPLICIT_VR_LE, VERIFICATION_SOP_CLASS,
};
use dicom_upper_layer::association::{
    AssociationListener, AssociationServer, ClientAssociationOptions, ServiceContext,
    ServiceHandler, ServiceResponse, UpperLayerConfig, VerificationService,
};
use dicom_upper_layer::dimse::commands::{self, echo_request, status};
use dicom_upper_layer::dimse::DimseMessage;
use dicom_upper_layer::dul::AbortReason;
use dicom_upper_layer::pdu::{
    AbortRQSource, AssociationRJResult, AssociationRJServiceProviderPresentationReason,
    AssociationRJServiceUserReason, AssociationRJSource, PresentationContextNegotiated,
    PresentationContextResultReason,
};
use dicom_upper_layer::Error;
use matches::matches;
use std::net::{SocketAddr, TcpListener};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::time::{Duration, Instant};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "ECHO-SCU";
static SCP_AE_TITLE: &str = "ECHO-SCP";

static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
static DIGITAL_MG_STORAGE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.1.2";

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
enum Lifecycle {
    Established(String),
    Rejected(AssociationRJSource),
    Released(String),
    Aborted(Option<String>, AbortReason),
}

/// Forwards the life cycle of associations to the test.
struct Recorder(Mutex<Sender<Lifecycle>>);

impl Recorder {
    fn new() -> (Self, Receiver<Lifecycle>) {
        let (tx, rx) = mpsc::channel();
        (Recorder(Mutex::new(tx)), rx)
    }

    fn record(&self, event: Lifecycle) {
        if let Ok(tx) = self.0.lock() {
            let _ = tx.send(event);
        }
    }
}

impl AssociationListener for Recorder {
    fn on_established(&self, association: &NegotiatedAssociation) {
        self.record(Lifecycle::Established(association.calling_ae_title.clone()));
    }

    fn on_rejected(&self, association_rj: &dicom_upper_layer::pdu::AssociationRJ) {
        self.record(Lifecycle::Rejected(association_rj.source.clone()));
    }

    fn on_released(&self, association: &NegotiatedAssociation) {
        self.record(Lifecycle::Released(association.calling_ae_title.clone()));
    }

    fn on_aborted(&self, association: Option<&NegotiatedAssociation>, reason: &AbortReason) {
        self.record(Lifecycle::Aborted(
            association.map(|a| a.calling_ae_title.clone()),
            reason.clone(),
        ));
    }
}

/// Answers every request with two pending responses and a final success.
struct PendingTwice;

impl ServiceHandler for PendingTwice {
    fn handle(&self, request: &DimseMessage, _context: &ServiceContext<'_>) -> ServiceResponse {
        let responses: Vec<DimseMessage> = [status::PENDING, status::PENDING, status::SUCCESS]
            .into_iter()
            .filter_map(|s| commands::response_to(request, s).ok())
            .collect();
        ServiceResponse::Stream(Box::new(responses.into_iter()))
    }
}

fn scp_config() -> UpperLayerConfig {
    UpperLayerConfig {
        ae_title: SCP_AE_TITLE.to_string(),
        poll_interval_ms: 20,
        presentation_contexts: vec![
            PresentationContextConfig::new(VERIFICATION_SOP_CLASS, [IMPLICIT_VR_LE]),
            PresentationContextConfig::new(CT_IMAGE_STORAGE, [EXPLICIT_VR_LE, IMPLICIT_VR_LE]),
        ],
        ..Default::default()
    }
}

fn spawn_scp(server: AssociationServer) -> Result<SocketAddr> {
    let listener = TcpListener::bind("localhost:0")?;
    let addr = listener.local_addr()?;
    std::thread::spawn(move || server.serve(&listener));
    Ok(addr)
}

fn scu() -> ClientAssociationOptions<'static> {
    ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
}

#[test]
fn verification_is_negotiated_and_echoed() -> Result<()> {
    let (recorder, events) = Recorder::new();
    let server = AssociationServer::new(scp_config())?
        .with_handler(VERIFICATION_SOP_CLASS, VerificationService)
        .accept_called_ae_title()
        .with_listener(recorder);
    let addr = spawn_scp(server)?;

    let mut association = scu()
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .establish(addr)?;

    assert_eq!(
        association.presentation_contexts(),
        &[PresentationContextNegotiated {
            id: 1,
            reason: PresentationContextResultReason::Acceptance,
            abstract_syntax: VERIFICATION_SOP_CLASS.to_string(),
            transfer_syntax: IMPLICIT_VR_LE.to_string(),
        }]
    );
    assert_eq!(association.acceptor_max_pdu_length(), 16384);
    assert_eq!(
        events.recv_timeout(WAIT)?,
        Lifecycle::Established(SCU_AE_TITLE.to_string())
    );

    assert_eq!(association.echo()?, status::SUCCESS);
    assert_eq!(association.echo()?, status::SUCCESS);
    association.release()?;

    assert_eq!(
        events.recv_timeout(WAIT)?,
        Lifecycle::Released(SCU_AE_TITLE.to_string())
    );
    Ok(())
}

#[test]
fn unknown_abstract_syntax_is_rejected_alone() -> Result<()> {
    let server = AssociationServer::new(scp_config())?
        .with_handler(VERIFICATION_SOP_CLASS, VerificationService);
    let addr = spawn_scp(server)?;

    let mut association = scu()
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .with_presentation_context(DIGITAL_MG_STORAGE_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .with_presentation_context(CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE, EXPLICIT_VR_LE])
        .establish(addr)?;

    let contexts = association.presentation_contexts();
    assert_eq!(contexts.len(), 3);
    assert_eq!(contexts[0].reason, PresentationContextResultReason::Acceptance);
    assert_eq!(
        contexts[1],
        PresentationContextNegotiated {
            id: 3,
            reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
            abstract_syntax: DIGITAL_MG_STORAGE_SOP_CLASS.to_string(),
            transfer_syntax: IMPLICIT_VR_LE.to_string(),
        }
    );
    // the first transfer syntax of the proposal wins
    assert_eq!(contexts[2].id, 5);
    assert_eq!(contexts[2].reason, PresentationContextResultReason::Acceptance);
    assert_eq!(contexts[2].transfer_syntax, IMPLICIT_VR_LE);

    assert!(matches!(
        association.context_for(DIGITAL_MG_STORAGE_SOP_CLASS),
        Err(Error::UnsupportedAbstractSyntax { .. })
    ));
    assert_eq!(association.echo()?, status::SUCCESS);
    association.release()?;
    Ok(())
}

#[test]
fn wrong_called_ae_title_is_rejected() -> Result<()> {
    let (recorder, events) = Recorder::new();
    let server = AssociationServer::new(scp_config())?
        .accept_called_ae_title()
        .with_listener(recorder);
    let addr = spawn_scp(server)?;

    let result = scu()
        .called_ae_title("SOMEONE-ELSE")
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr);

    match result {
        Err(Error::NegotiationRejected { association_rj, .. }) => {
            assert_eq!(association_rj.result, AssociationRJResult::Permanent);
            assert_eq!(
                association_rj.source,
                AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized
                )
            );
        }
        other => panic!("expected a rejection, got {:?}", other.map(|_| ())),
    }
    assert!(matches!(
        events.recv_timeout(WAIT)?,
        Lifecycle::Rejected(AssociationRJSource::ServiceUser(_))
    ));
    Ok(())
}

#[test]
fn missing_handler_answers_sop_class_not_supported() -> Result<()> {
    // CT image storage is negotiable, but nothing handles it
    let server = AssociationServer::new(scp_config())?
        .with_handler(VERIFICATION_SOP_CLASS, VerificationService);
    let addr = spawn_scp(server)?;

    let mut association = scu()
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .with_presentation_context(CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])
        .establish(addr)?;

    let ct_context = association.context_for(CT_IMAGE_STORAGE)?.id;
    let message_id = association.next_message_id();
    association.send_message(&echo_request(CT_IMAGE_STORAGE, message_id), ct_context)?;
    let (response, pc_id) = association.receive_message()?;
    assert_eq!(pc_id, ct_context);
    assert_eq!(response.message_id_being_responded_to()?, message_id);
    assert_eq!(response.status()?, status::SOP_CLASS_NOT_SUPPORTED);

    // the association carries on
    assert!(association.is_alive());
    assert_eq!(association.echo()?, status::SUCCESS);
    association.release()?;
    Ok(())
}

#[test]
fn streamed_responses_arrive_in_order() -> Result<()> {
    let server = AssociationServer::new(scp_config())?.with_handler(CT_IMAGE_STORAGE, PendingTwice);
    let addr = spawn_scp(server)?;

    let mut association = scu()
        .with_presentation_context(CT_IMAGE_STORAGE, vec![EXPLICIT_VR_LE])
        .establish(addr)?;
    let pc_id = association.context_for(CT_IMAGE_STORAGE)?.id;
    let message_id = association.next_message_id();
    association.send_message(&echo_request(CT_IMAGE_STORAGE, message_id), pc_id)?;

    let mut statuses = Vec::new();
    loop {
        let (response, _) = association.receive_message()?;
        let status = response.status()?;
        statuses.push(status);
        if commands::is_final_status(status) {
            break;
        }
    }
    assert_eq!(statuses, vec![status::PENDING, status::PENDING, status::SUCCESS]);
    association.release()?;
    Ok(())
}

#[test]
fn associations_beyond_capacity_are_rejected() -> Result<()> {
    let (recorder, events) = Recorder::new();
    let config = UpperLayerConfig {
        max_associations: 1,
        ..scp_config()
    };
    let server = AssociationServer::new(config)?
        .with_handler(VERIFICATION_SOP_CLASS, VerificationService)
        .with_listener(recorder);
    let active = server.active_associations().clone();
    let addr = spawn_scp(server)?;

    let mut first = scu()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)?;
    assert!(matches!(events.recv_timeout(WAIT)?, Lifecycle::Established(_)));
    assert_eq!(active.count(), 1);

    let second = scu()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr);
    match second {
        Err(Error::NegotiationRejected { association_rj, .. }) => {
            assert_eq!(association_rj.result, AssociationRJResult::Transient);
            assert_eq!(
                association_rj.source,
                AssociationRJSource::ServiceProviderPresentation(
                    AssociationRJServiceProviderPresentationReason::LocalLimitExceeded
                )
            );
        }
        other => panic!("expected a rejection, got {:?}", other.map(|_| ())),
    }
    assert!(matches!(events.recv_timeout(WAIT)?, Lifecycle::Rejected(_)));
    // the rejected request never took a slot
    assert_eq!(active.count(), 1);

    assert_eq!(first.echo()?, status::SUCCESS);
    first.release()?;
    assert!(matches!(events.recv_timeout(WAIT)?, Lifecycle::Released(_)));

    let deadline = Instant::now() + WAIT;
    while active.count() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(active.count(), 0);

    // room for one more
    let third = scu()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)?;
    third.release()?;
    Ok(())
}

#[test]
fn idle_association_is_aborted() -> Result<()> {
    let (recorder, events) = Recorder::new();
    let config = UpperLayerConfig {
        idle_timeout_secs: 1,
        ..scp_config()
    };
    let server = AssociationServer::new(config)?
        .with_handler(VERIFICATION_SOP_CLASS, VerificationService)
        .with_listener(recorder);
    let addr = spawn_scp(server)?;

    let mut association = scu()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .dimse_timeout(Some(WAIT))
        .establish(addr)?;
    assert!(matches!(events.recv_timeout(WAIT)?, Lifecycle::Established(_)));
    let established = Instant::now();

    // no traffic: the acceptor gives up on its own
    let result = association.receive_message();
    let elapsed = established.elapsed();
    assert!(
        matches!(
            result,
            Err(Error::Closed {
                reason: AbortReason::Peer(AbortRQSource::ServiceUser),
                ..
            })
        ),
        "unexpected outcome {:?}",
        result.map(|_| ())
    );
    assert!(elapsed >= Duration::from_millis(900), "aborted too soon: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "aborted too late: {:?}", elapsed);

    assert_eq!(
        events.recv_timeout(WAIT)?,
        Lifecycle::Aborted(Some(SCU_AE_TITLE.to_string()), AbortReason::Timeout)
    );
    Ok(())
}

#[test]
fn peer_abort_is_reported() -> Result<()> {
    let (recorder, events) = Recorder::new();
    let server = AssociationServer::new(scp_config())?
        .with_handler(VERIFICATION_SOP_CLASS, VerificationService)
        .with_listener(recorder);
    let addr = spawn_scp(server)?;

    let association = scu()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)?;
    assert!(matches!(events.recv_timeout(WAIT)?, Lifecycle::Established(_)));
    association.abort();

    assert_eq!(
        events.recv_timeout(WAIT)?,
        Lifecycle::Aborted(
            Some(SCU_AE_TITLE.to_string()),
            AbortReason::Peer(AbortRQSource::ServiceUser)
        )
    );
    Ok(())
}
