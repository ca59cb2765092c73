use dicom_upper_layer::association::config::{
    PresentationContextConfig, EXPLICIT_VR_LE, IMPLICIT_VR_LE, VERIFICATION_SOP_CLASS,
};
use dicom_upper_layer::association::{
    AssociationServer, ClientAssociationOptions, ServiceContext, ServiceHandler, ServiceResponse,
    UpperLayerConfig, VerificationService,
};
use dicom_upper_layer::dimse::commands::{self, priority, status, SubOperations};
use dicom_upper_layer::dimse::DimseMessage;
use dicom_upper_layer::pdu::{AssociationRJServiceUserReason, AssociationRJSource, DEFAULT_MAX_PDU};
use dicom_upper_layer::Error;
use matches::matches;
use rstest::rstest;
use std::net::{SocketAddr, TcpListener};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::time::Duration;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "QUERY-SCU";
static SCP_AE_TITLE: &str = "ARCHIVE-SCP";

static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
static STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
static STUDY_ROOT_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";
static STUDY_ROOT_GET: &str = "1.2.840.10008.5.1.4.1.2.2.3";

fn scp_config() -> UpperLayerConfig {
    UpperLayerConfig {
        ae_title: SCP_AE_TITLE.to_string(),
        poll_interval_ms: 20,
        presentation_contexts: vec![
            PresentationContextConfig::new(VERIFICATION_SOP_CLASS, [IMPLICIT_VR_LE]),
            PresentationContextConfig::new(CT_IMAGE_STORAGE, [EXPLICIT_VR_LE, IMPLICIT_VR_LE]),
            PresentationContextConfig::new(STUDY_ROOT_FIND, [IMPLICIT_VR_LE]),
            PresentationContextConfig::new(STUDY_ROOT_MOVE, [IMPLICIT_VR_LE]),
            PresentationContextConfig::new(STUDY_ROOT_GET, [IMPLICIT_VR_LE]).with_roles(true, true),
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

fn stream(responses: Vec<DimseMessage>) -> ServiceResponse {
    ServiceResponse::Stream(Box::new(responses.into_iter()))
}

/// Sends back the data set it receives.
struct Mirror;

impl ServiceHandler for Mirror {
    fn handle(&self, request: &DimseMessage, _context: &ServiceContext<'_>) -> ServiceResponse {
        match commands::response_to(request, status::SUCCESS) {
            Ok(response) => stream(vec![response.with_data(request.data.clone().unwrap_or_default())]),
            Err(_) => ServiceResponse::Status(status::PROCESSING_FAILURE),
        }
    }
}

/// Keeps the instances it is given.
struct Storage(Mutex<Sender<(String, Vec<u8>)>>);

impl Storage {
    fn new() -> (Self, Receiver<(String, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel();
        (Storage(Mutex::new(tx)), rx)
    }
}

impl ServiceHandler for Storage {
    fn handle(&self, request: &DimseMessage, _context: &ServiceContext<'_>) -> ServiceResponse {
        match (request.affected_sop_instance_uid(), &request.data) {
            (Ok(uid), Some(data)) => {
                if let Ok(tx) = self.0.lock() {
                    let _ = tx.send((uid, data.clone()));
                }
                ServiceResponse::Status(status::SUCCESS)
            }
            _ => ServiceResponse::Status(status::PROCESSING_FAILURE),
        }
    }
}

/// Answers every query with the given number of matches,
/// producing each one after a pause.
struct Matches {
    count: u8,
    pause: Duration,
}

impl ServiceHandler for Matches {
    fn handle(&self, request: &DimseMessage, _context: &ServiceContext<'_>) -> ServiceResponse {
        let request = request.clone();
        let pause = self.pause;
        let pending_request = request.clone();
        let pending = (0..self.count).filter_map(move |i| {
            std::thread::sleep(pause);
            commands::response_to(&pending_request, status::PENDING)
                .ok()
                .map(|rsp| rsp.with_data(vec![i]))
        });
        let last = commands::response_to(&request, status::SUCCESS).ok();
        ServiceResponse::Stream(Box::new(pending.chain(last)))
    }
}

/// Sends one instance back over the association for every C-GET.
struct Retrieve;

impl ServiceHandler for Retrieve {
    fn handle(&self, request: &DimseMessage, _context: &ServiceContext<'_>) -> ServiceResponse {
        let store = commands::store_request(CT_IMAGE_STORAGE, "1.2.3.4.5.6", 100, priority::MEDIUM, vec![7; 64]);
        let pending = SubOperations {
            remaining: 1,
            ..Default::default()
        };
        let done = SubOperations {
            completed: 1,
            ..Default::default()
        };
        let responses = [
            commands::response_to(request, status::PENDING).map(|r| r.with_sub_operations(pending)),
            commands::response_to(request, done.final_status()).map(|r| r.with_sub_operations(done)),
        ];
        match responses {
            [Ok(pending), Ok(last)] => stream(vec![store, pending, last]),
            _ => ServiceResponse::Status(status::PROCESSING_FAILURE),
        }
    }
}

/// Moves two instances to the "ARCHIVE" node only.
struct Move;

impl ServiceHandler for Move {
    fn handle(&self, request: &DimseMessage, _context: &ServiceContext<'_>) -> ServiceResponse {
        if request.move_destination().ok().as_deref() != Some("ARCHIVE") {
            return ServiceResponse::Status(status::MOVE_DESTINATION_UNKNOWN);
        }
        let progress = [(1, 1), (0, 2)];
        let responses: Vec<DimseMessage> = progress
            .iter()
            .filter_map(|&(remaining, completed)| {
                let counts = SubOperations {
                    remaining,
                    completed,
                    ..Default::default()
                };
                let status = if remaining > 0 {
                    status::PENDING
                } else {
                    counts.final_status()
                };
                commands::response_to(request, status)
                    .ok()
                    .map(|r| r.with_sub_operations(counts))
            })
            .collect();
        stream(responses)
    }
}

#[rstest]
#[case(DEFAULT_MAX_PDU, 100_000)]
#[case(0, 200_000)]
fn large_data_sets_are_fragmented_both_ways(
    #[case] max_pdu_length: u32,
    #[case] size: usize,
) -> Result<()> {
    let server = AssociationServer::new(scp_config())?.with_handler(CT_IMAGE_STORAGE, Mirror);
    let addr = spawn_scp(server)?;

    let mut association = scu()
        .with_presentation_context(CT_IMAGE_STORAGE, vec![EXPLICIT_VR_LE])
        .max_pdu_length(max_pdu_length)
        .establish(addr)?;
    assert_eq!(association.requestor_max_pdu_length(), max_pdu_length);
    assert_eq!(association.acceptor_max_pdu_length(), DEFAULT_MAX_PDU);

    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let pc_id = association.context_for(CT_IMAGE_STORAGE)?.id;
    let message_id = association.next_message_id();
    association.send_message(
        &commands::store_request(CT_IMAGE_STORAGE, "1.2.3.4", message_id, priority::MEDIUM, data.clone()),
        pc_id,
    )?;

    let (response, response_pc_id) = association.receive_message()?;
    assert_eq!(response_pc_id, pc_id);
    assert_eq!(response.command_field()?, commands::C_STORE_RSP);
    assert_eq!(response.message_id_being_responded_to()?, message_id);
    let echoed = response.data.unwrap_or_default();
    assert_eq!(echoed.len(), size);
    assert!(echoed == data, "data set changed on the way");
    association.release()?;
    Ok(())
}

#[test]
fn storage_service_receives_instances() -> Result<()> {
    let (storage, stored) = Storage::new();
    let server = AssociationServer::new(scp_config())?.with_handler(CT_IMAGE_STORAGE, storage);
    let addr = spawn_scp(server)?;

    let mut association = scu()
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .establish(addr)?;
    assert_eq!(association.store(CT_IMAGE_STORAGE, "1.2.3.4.5", vec![1; 300])?, status::SUCCESS);
    assert_eq!(association.store(CT_IMAGE_STORAGE, "1.2.3.4.6", vec![2; 30_000])?, status::SUCCESS);

    assert_eq!(stored.recv_timeout(Duration::from_secs(5))?, ("1.2.3.4.5".to_string(), vec![1; 300]));
    let (uid, data) = stored.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(uid, "1.2.3.4.6");
    assert_eq!(data.len(), 30_000);

    // no context was negotiated for this one
    assert!(matches!(
        association.store(STUDY_ROOT_FIND, "1.2.3", vec![]),
        Err(Error::UnsupportedAbstractSyntax { .. })
    ));
    association.release()?;
    Ok(())
}

#[test]
fn find_reports_each_match_then_completes() -> Result<()> {
    let server = AssociationServer::new(scp_config())?.with_handler(
        STUDY_ROOT_FIND,
        Matches {
            count: 3,
            pause: Duration::ZERO,
        },
    );
    let addr = spawn_scp(server)?;

    let mut association = scu()
        .with_presentation_context(STUDY_ROOT_FIND, vec![IMPLICIT_VR_LE])
        .establish(addr)?;
    let mut matches_found = Vec::new();
    let last = association.find(STUDY_ROOT_FIND, vec![0; 8], |m| {
        matches_found.push(m.data.clone().unwrap_or_default())
    })?;
    assert_eq!(last.status()?, status::SUCCESS);
    assert_eq!(matches_found, vec![vec![0], vec![1], vec![2]]);
    association.release()?;
    Ok(())
}

#[test]
fn find_in_progress_can_be_cancelled() -> Result<()> {
    let server = AssociationServer::new(scp_config())?
        .with_handler(VERIFICATION_SOP_CLASS, VerificationService)
        .with_handler(
            STUDY_ROOT_FIND,
            Matches {
                count: 250,
                pause: Duration::from_millis(20),
            },
        );
    let addr = spawn_scp(server)?;

    let mut association = scu()
        .with_presentation_context(STUDY_ROOT_FIND, vec![IMPLICIT_VR_LE])
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .establish(addr)?;
    let pc_id = association.context_for(STUDY_ROOT_FIND)?.id;
    let message_id = association.next_message_id();
    association.send_message(
        &commands::find_request(STUDY_ROOT_FIND, message_id, priority::MEDIUM, vec![0; 8]),
        pc_id,
    )?;

    let (first, _) = association.receive_message()?;
    assert_eq!(first.status()?, status::PENDING);
    association.cancel(pc_id, message_id)?;

    let mut pending = 1;
    let last = loop {
        let (response, _) = association.receive_message()?;
        assert_eq!(response.message_id_being_responded_to()?, message_id);
        if commands::is_final_status(response.status()?) {
            break response;
        }
        pending += 1;
    };
    assert_eq!(last.status()?, status::CANCEL);
    assert!(pending < 250, "all {} matches were sent", pending);

    // the association is still usable
    assert_eq!(association.echo()?, status::SUCCESS);
    association.release()?;
    Ok(())
}

#[test]
fn get_answers_incoming_stores() -> Result<()> {
    let server = AssociationServer::new(scp_config())?.with_handler(STUDY_ROOT_GET, Retrieve);
    let addr = spawn_scp(server)?;

    let mut association = scu()
        .with_context(
            PresentationContextConfig::new(STUDY_ROOT_GET, [IMPLICIT_VR_LE]).with_roles(true, true),
        )
        .establish(addr)?;

    let mut received = Vec::new();
    let last = association.get(STUDY_ROOT_GET, vec![0; 8], |store| {
        received.push(store.affected_sop_instance_uid().unwrap_or_default());
        status::SUCCESS
    })?;
    assert_eq!(received, vec!["1.2.3.4.5.6".to_string()]);
    assert_eq!(last.status()?, status::SUCCESS);
    assert_eq!(
        last.sub_operations(),
        SubOperations {
            completed: 1,
            ..Default::default()
        }
    );
    association.release()?;
    Ok(())
}

#[test]
fn move_reports_progress_and_unknown_destinations() -> Result<()> {
    let server = AssociationServer::new(scp_config())?.with_handler(STUDY_ROOT_MOVE, Move);
    let addr = spawn_scp(server)?;

    let mut association = scu()
        .with_presentation_context(STUDY_ROOT_MOVE, vec![IMPLICIT_VR_LE])
        .establish(addr)?;

    let mut progress = Vec::new();
    let last = association.move_to(STUDY_ROOT_MOVE, "ARCHIVE", vec![0; 8], |rsp| {
        progress.push(rsp.sub_operations().remaining)
    })?;
    assert_eq!(progress, vec![1]);
    assert_eq!(last.status()?, status::SUCCESS);
    assert_eq!(last.sub_operations().completed, 2);

    let last = association.move_to(STUDY_ROOT_MOVE, "NOWHERE", vec![0; 8], |_| {})?;
    assert_eq!(last.status()?, status::MOVE_DESTINATION_UNKNOWN);
    association.release()?;
    Ok(())
}

#[test]
fn only_listed_calling_ae_titles_are_accepted() -> Result<()> {
    let server = AssociationServer::new(scp_config())?
        .with_handler(CT_IMAGE_STORAGE, Mirror)
        .accept_calling_ae_titles([SCU_AE_TITLE]);
    let addr = spawn_scp(server)?;

    let refused = scu()
        .calling_ae_title("STRANGER")
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .establish(addr);
    match refused {
        Err(Error::NegotiationRejected { association_rj, .. }) => assert_eq!(
            association_rj.source,
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized
            )
        ),
        other => panic!("expected a rejection, got {:?}", other.map(|_| ())),
    }

    let association = scu()
        .with_abstract_syntax(CT_IMAGE_STORAGE)
        .establish(addr)?;
    association.release()?;
    Ok(())
}
