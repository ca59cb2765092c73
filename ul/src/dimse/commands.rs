//! DIMSE command field values, status codes
//! and builders for common command sets.
use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

use super::{DimseMessage, Result};

/// C-STORE-RQ
pub const C_STORE_RQ: u16 = 0x0001;
/// C-GET-RQ
pub const C_GET_RQ: u16 = 0x0010;
/// C-FIND-RQ
pub const C_FIND_RQ: u16 = 0x0020;
/// C-MOVE-RQ
pub const C_MOVE_RQ: u16 = 0x0021;
/// C-ECHO-RQ
pub const C_ECHO_RQ: u16 = 0x0030;
/// N-EVENT-REPORT-RQ
pub const N_EVENT_REPORT_RQ: u16 = 0x0100;
/// N-GET-RQ
pub const N_GET_RQ: u16 = 0x0110;
/// N-SET-RQ
pub const N_SET_RQ: u16 = 0x0120;
/// N-ACTION-RQ
pub const N_ACTION_RQ: u16 = 0x0130;
/// N-CREATE-RQ
pub const N_CREATE_RQ: u16 = 0x0140;
/// N-DELETE-RQ
pub const N_DELETE_RQ: u16 = 0x0150;
/// C-CANCEL-RQ
pub const C_CANCEL_RQ: u16 = 0x0FFF;

/// The bit distinguishing a response from its request.
pub const RESPONSE_BIT: u16 = 0x8000;

/// C-STORE-RSP
pub const C_STORE_RSP: u16 = C_STORE_RQ | RESPONSE_BIT;
/// C-GET-RSP
pub const C_GET_RSP: u16 = C_GET_RQ | RESPONSE_BIT;
/// C-FIND-RSP
pub const C_FIND_RSP: u16 = C_FIND_RQ | RESPONSE_BIT;
/// C-MOVE-RSP
pub const C_MOVE_RSP: u16 = C_MOVE_RQ | RESPONSE_BIT;
/// C-ECHO-RSP
pub const C_ECHO_RSP: u16 = C_ECHO_RQ | RESPONSE_BIT;

/// Command Data Set Type value meaning that no data set follows.
pub const DATA_SET_ABSENT: u16 = 0x0101;
/// Command Data Set Type value used when a data set follows.
pub const DATA_SET_PRESENT: u16 = 0x0001;

/// Priority values of C-STORE, C-FIND, C-GET and C-MOVE requests.
pub mod priority {
    pub const MEDIUM: u16 = 0x0000;
    pub const HIGH: u16 = 0x0001;
    pub const LOW: u16 = 0x0002;
}

/// DIMSE status codes.
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const CANCEL: u16 = 0xFE00;
    pub const PENDING: u16 = 0xFF00;
    pub const PENDING_WITH_WARNINGS: u16 = 0xFF01;
    /// Refused: SOP class not supported
    pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;
    /// Error: processing failure
    pub const PROCESSING_FAILURE: u16 = 0x0110;
    /// Error: unrecognized operation
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;
    /// Failure: no such SOP class
    pub const NO_SUCH_SOP_CLASS: u16 = 0x0118;
    /// Refused: out of resources
    pub const OUT_OF_RESOURCES: u16 = 0xA700;
    /// Refused: move destination unknown
    pub const MOVE_DESTINATION_UNKNOWN: u16 = 0xA801;
    /// Error: identifier does not match SOP class
    pub const IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS: u16 = 0xA900;
    /// Warning: sub-operations complete, one or more failures
    pub const SUB_OPERATIONS_WITH_FAILURES: u16 = 0xB000;
}

/// Whether the command field value denotes a response.
pub fn is_response(command_field: u16) -> bool {
    command_field & RESPONSE_BIT != 0
}

/// The command field of the response to the given request.
pub fn response_field(request_field: u16) -> u16 {
    request_field | RESPONSE_BIT
}

/// Whether the status code ends a response sequence.
pub fn is_final_status(status: u16) -> bool {
    !matches!(status, status::PENDING | status::PENDING_WITH_WARNINGS)
}

/// Pad a UID to an even length as required in command sets.
pub(crate) fn even_uid(uid: &str) -> String {
    let mut uid = uid.to_string();
    if uid.len() % 2 == 1 {
        uid.push('\0');
    }
    uid
}

/// Build a C-ECHO-RQ message.
pub fn echo_request(sop_class_uid: &str, message_id: u16) -> DimseMessage {
    DimseMessage::new(
        InMemDicomObject::command_from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                PrimitiveValue::from(even_uid(sop_class_uid)),
            ),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_ECHO_RQ])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_ABSENT]),
            ),
        ]),
        None,
    )
}

/// Build a C-STORE-RQ message carrying the given data set.
pub fn store_request(
    sop_class_uid: &str,
    sop_instance_uid: &str,
    message_id: u16,
    priority: u16,
    data: Vec<u8>,
) -> DimseMessage {
    DimseMessage::new(
        InMemDicomObject::command_from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                PrimitiveValue::from(even_uid(sop_class_uid)),
            ),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_STORE_RQ])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
            DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority])),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_PRESENT]),
            ),
            DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(even_uid(sop_instance_uid)),
            ),
        ]),
        Some(data),
    )
}

/// Build a C-FIND-RQ message with the given query identifier.
pub fn find_request(
    sop_class_uid: &str,
    message_id: u16,
    priority: u16,
    identifier: Vec<u8>,
) -> DimseMessage {
    query_request(C_FIND_RQ, sop_class_uid, message_id, priority, None, identifier)
}

/// Build a C-GET-RQ message with the given query identifier.
pub fn get_request(
    sop_class_uid: &str,
    message_id: u16,
    priority: u16,
    identifier: Vec<u8>,
) -> DimseMessage {
    query_request(C_GET_RQ, sop_class_uid, message_id, priority, None, identifier)
}

/// Build a C-MOVE-RQ message,
/// asking for the matching instances to be sent to `move_destination`.
pub fn move_request(
    sop_class_uid: &str,
    message_id: u16,
    priority: u16,
    move_destination: &str,
    identifier: Vec<u8>,
) -> DimseMessage {
    query_request(
        C_MOVE_RQ,
        sop_class_uid,
        message_id,
        priority,
        Some(move_destination),
        identifier,
    )
}

fn query_request(
    command_field: u16,
    sop_class_uid: &str,
    message_id: u16,
    priority: u16,
    move_destination: Option<&str>,
    identifier: Vec<u8>,
) -> DimseMessage {
    let mut elements = vec![
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(even_uid(sop_class_uid)),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [command_field])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
    ];
    if let Some(destination) = move_destination {
        elements.push(DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            PrimitiveValue::from(padded_ae_title(destination)),
        ));
    }
    DimseMessage::new(
        InMemDicomObject::command_from_element_iter(elements),
        Some(identifier),
    )
}

/// Build a C-CANCEL-RQ message
/// for the C-FIND, C-GET or C-MOVE request with the given ID.
pub fn cancel_request(message_id_being_responded_to: u16) -> DimseMessage {
    DimseMessage::new(
        InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_CANCEL_RQ])),
            DataElement::new(
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                dicom_value!(U16, [message_id_being_responded_to]),
            ),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [DATA_SET_ABSENT]),
            ),
        ]),
        None,
    )
}

/// AE titles in command sets are padded with spaces to an even length.
fn padded_ae_title(ae_title: &str) -> String {
    let mut ae_title = ae_title.trim().to_string();
    if ae_title.len() % 2 == 1 {
        ae_title.push(' ');
    }
    ae_title
}

/// Progress of the sub-operations of a C-GET or C-MOVE,
/// as reported in its responses.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct SubOperations {
    pub remaining: u16,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

impl SubOperations {
    /// The final status of a retrieval with these counts:
    /// success when all completed without failures or warnings.
    pub fn final_status(&self) -> u16 {
        if self.failed == 0 && self.warning == 0 {
            status::SUCCESS
        } else {
            status::SUB_OPERATIONS_WITH_FAILURES
        }
    }
}

/// Build a C-ECHO-RSP message.
pub fn echo_response(sop_class_uid: &str, message_id: u16, status: u16) -> DimseMessage {
    response(C_ECHO_RSP, Some(sop_class_uid), None, message_id, status)
}

/// Build the response to a request with the given status,
/// and no data set.
///
/// The affected SOP class and instance are copied over
/// from the request when present.
pub fn response_to(request: &DimseMessage, status: u16) -> Result<DimseMessage> {
    let field = response_field(request.command_field()?);
    let message_id = request.message_id()?;
    let sop_class_uid = request.affected_sop_class_uid().ok();
    let sop_instance_uid = request.affected_sop_instance_uid().ok();
    Ok(response(
        field,
        sop_class_uid.as_deref(),
        sop_instance_uid.as_deref(),
        message_id,
        status,
    ))
}

fn response(
    command_field: u16,
    sop_class_uid: Option<&str>,
    sop_instance_uid: Option<&str>,
    message_id: u16,
    status: u16,
) -> DimseMessage {
    let mut elements = Vec::with_capacity(6);
    if let Some(uid) = sop_class_uid {
        elements.push(DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(even_uid(uid)),
        ));
    }
    elements.push(DataElement::new(
        tags::COMMAND_FIELD,
        VR::US,
        dicom_value!(U16, [command_field]),
    ));
    elements.push(DataElement::new(
        tags::MESSAGE_ID_BEING_RESPONDED_TO,
        VR::US,
        dicom_value!(U16, [message_id]),
    ));
    elements.push(DataElement::new(
        tags::COMMAND_DATA_SET_TYPE,
        VR::US,
        dicom_value!(U16, [DATA_SET_ABSENT]),
    ));
    elements.push(DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])));
    if let Some(uid) = sop_instance_uid {
        elements.push(DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(even_uid(uid)),
        ));
    }
    DimseMessage::new(InMemDicomObject::command_from_element_iter(elements), None)
}
