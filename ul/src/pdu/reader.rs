//! PDU reader module
//!
//! PDUs are decoded incrementally from a byte buffer
//! filled by the transport:
//! [`read_pdu_from_buffer`] yields `Ok(None)`
//! for as long as the buffer does not yet hold a full PDU,
//! so that the caller can keep receiving.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BytesMut};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom};
use tracing::warn;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size,
/// as specified by the standard
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid max PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("Unknown PDU type {:#04x}", pdu_type))]
    UnknownPduType { pdu_type: u8, backtrace: Backtrace },

    #[snafu(display("Could not read PDU item"))]
    ReadPduItem {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid item length {} (must be >=2)", length))]
    InvalidItemLength { length: u32, backtrace: Backtrace },

    #[snafu(display("Could not read {} reserved bytes", bytes))]
    ReadReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Incoming pdu was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },
    #[snafu(display("PDU contained an invalid value {:?}", var_item))]
    InvalidPduVariable {
        var_item: PduVariableItem,
        backtrace: Backtrace,
    },
    #[snafu(display("Multiple transfer syntaxes were accepted"))]
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },
    #[snafu(display("Invalid reject source or reason"))]
    InvalidRejectSourceOrReason { backtrace: Backtrace },
    #[snafu(display("Invalid abort service provider"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },
    #[snafu(display("Invalid presentation context result reason"))]
    InvalidPresentationContextResultReason { backtrace: Backtrace },
    #[snafu(display("invalid transfer syntax sub-item"))]
    InvalidTransferSyntaxSubItem { backtrace: Backtrace },
    #[snafu(display("unknown presentation context sub-item"))]
    UnknownPresentationContextSubItem { backtrace: Backtrace },
    #[snafu(display("Could not decode text field `{}`", field))]
    DecodeText {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::DecodeTextError,
    },
    #[snafu(display("Missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },
    #[snafu(display("Missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },
    #[snafu(display("Missing transfer syntax"))]
    MissingTransferSyntax { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Try to decode one PDU from the front of the given buffer.
///
/// Returns `Ok(None)` if the buffer does not contain a full PDU yet,
/// in which case the buffer is left untouched.
/// On success, the bytes of the PDU are removed from the buffer.
///
/// With `strict` set, PDUs longer than `max_pdu_length` are refused.
/// Otherwise they are tolerated up to [`MAXIMUM_PDU_SIZE`].
/// A `max_pdu_length` of 0 stands for the "no limit" advertised
/// in the maximum length sub-item, and lets PDUs of any length through.
pub fn read_pdu_from_buffer(
    buffer: &mut BytesMut,
    max_pdu_length: u32,
    strict: bool,
) -> Result<Option<Pdu>> {
    ensure!(
        max_pdu_length == 0 || (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    if buffer.len() < PDU_HEADER_SIZE as usize {
        return Ok(None);
    }

    let pdu_type = buffer[0];
    ensure!(
        (0x01..=0x07).contains(&pdu_type),
        UnknownPduTypeSnafu { pdu_type }
    );
    let pdu_length = u32::from_be_bytes([buffer[2], buffer[3], buffer[4], buffer[5]]);

    let bounded = max_pdu_length != 0;
    if bounded && strict {
        ensure!(
            pdu_length <= max_pdu_length,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
    } else if bounded && pdu_length > max_pdu_length {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        warn!(
            "Incoming pdu was too large: length {}, maximum is {}",
            pdu_length, max_pdu_length
        );
    }

    let total = PDU_HEADER_SIZE as usize + pdu_length as usize;
    if buffer.len() < total {
        return Ok(None);
    }

    let mut frame = buffer.split_to(total);
    frame.advance(PDU_HEADER_SIZE as usize);
    read_pdu_body(pdu_type, &frame).map(Some)
}

fn read_pdu_body(pdu_type: u8, body: &[u8]) -> Result<Pdu> {
    let mut cursor = Cursor::new(body);
    let codec = DefaultCharacterSetCodec;

    match pdu_type {
        0x01 => {
            // A-ASSOCIATE-RQ PDU Structure

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];

            // 7-8 - Protocol-version - This two byte field shall use one bit to identify each
            // version of the DICOM UL protocol supported by the calling end-system.
            let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Protocol-version",
            })?;

            // 9-10 - Reserved - This reserved field shall be sent with a value 0000H but not
            // tested to this value when received.
            cursor
                .read_u16::<BigEndian>()
                .context(ReadReservedSnafu { bytes: 2_u32 })?;

            // 11-26 - Called-AE-title
            // 27-42 - Calling-AE-title
            let called_ae_title = read_ae_title(&mut cursor, &codec, "Called-AE-title")?;
            let calling_ae_title = read_ae_title(&mut cursor, &codec, "Calling-AE-title")?;

            // 43-74 - Reserved
            skip_reserved(&mut cursor, 32)?;

            // 75-xxx - Variable items - This variable field shall contain the following items:
            // one Application Context Item, one or more Presentation Context Items and one User
            // Information Item.
            while cursor.position() < cursor.get_ref().len() as u64 {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextProposed(val) => {
                        presentation_contexts.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            Ok(Pdu::AssociationRQ(AssociationRQ {
                protocol_version,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                called_ae_title,
                calling_ae_title,
                presentation_contexts,
                user_variables,
            }))
        }
        0x02 => {
            // A-ASSOCIATE-AC PDU Structure

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];

            let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Protocol-version",
            })?;

            cursor
                .read_u16::<BigEndian>()
                .context(ReadReservedSnafu { bytes: 2_u32 })?;

            // 11-26 and 27-42 - Reserved - These reserved fields shall be sent with a value
            // identical to the value received in the same field of the A-ASSOCIATE-RQ PDU
            let called_ae_title = read_ae_title(&mut cursor, &codec, "Called-AE-title")?;
            let calling_ae_title = read_ae_title(&mut cursor, &codec, "Calling-AE-title")?;

            skip_reserved(&mut cursor, 32)?;

            while cursor.position() < cursor.get_ref().len() as u64 {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextResult(val) => {
                        presentation_contexts.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            Ok(Pdu::AssociationAC(AssociationAC {
                protocol_version,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                called_ae_title,
                calling_ae_title,
                presentation_contexts,
                user_variables,
            }))
        }
        0x03 => {
            // A-ASSOCIATE-RJ PDU Structure

            // 7 - Reserved
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // 8 - Result
            let result = AssociationRJResult::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Result" })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            // 9 - Source
            // 10 - Reason/Diag.
            let source = AssociationRJSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag.",
                })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            Ok(Pdu::AssociationRJ(AssociationRJ { result, source }))
        }
        0x04 => {
            // P-DATA-TF PDU Structure

            // 7-xxx - Presentation-data-value Item(s)
            let mut values = vec![];
            while cursor.position() < cursor.get_ref().len() as u64 {
                // 1-4 - Item-length
                let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-Length",
                })?;

                ensure!(
                    item_length >= 2,
                    InvalidItemLengthSnafu {
                        length: item_length
                    }
                );

                // 5 - Presentation-context-ID
                let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;

                // 6 - Message Control Header
                let header = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Message Control Header",
                })?;

                let value_type = if header & 0x01 > 0 {
                    PDataValueType::Command
                } else {
                    PDataValueType::Data
                };
                let is_last = (header & 0x02) > 0;

                let data =
                    read_n(&mut cursor, (item_length - 2) as usize).context(ReadPduFieldSnafu {
                        field: "Presentation-data-value",
                    })?;

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last,
                    data,
                })
            }

            Ok(Pdu::PData { data: values })
        }
        0x05 => {
            // A-RELEASE-RQ PDU Structure

            // 7-10 - Reserved
            skip_reserved(&mut cursor, 4)?;

            Ok(Pdu::ReleaseRQ)
        }
        0x06 => {
            // A-RELEASE-RP PDU Structure

            // 7-10 - Reserved
            skip_reserved(&mut cursor, 4)?;

            Ok(Pdu::ReleaseRP)
        }
        0x07 => {
            // A-ABORT PDU Structure

            // 7-8 - Reserved
            skip_reserved(&mut cursor, 2)?;

            // 9 - Source
            // 10 - Reason/Diag
            let source = AbortRQSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag",
                })?,
            )
            .context(InvalidAbortSourceOrReasonSnafu)?;

            Ok(Pdu::AbortRQ { source })
        }
        _ => UnknownPduTypeSnafu { pdu_type }.fail(),
    }
}

/// Read exactly `bytes_to_read` bytes,
/// failing with `UnexpectedEof` if fewer are available.
fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut result = Vec::new();
    reader.take(bytes_to_read as u64).read_to_end(&mut result)?;
    if result.len() < bytes_to_read {
        return Err(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            "declared length exceeds available bytes",
        ));
    }
    Ok(result)
}

fn skip_reserved(cursor: &mut Cursor<&[u8]>, bytes: u32) -> Result<()> {
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if remaining < u64::from(bytes) {
        return Err(std::io::Error::from(ErrorKind::UnexpectedEof))
            .context(ReadReservedSnafu { bytes });
    }
    cursor
        .seek(SeekFrom::Current(i64::from(bytes)))
        .context(ReadReservedSnafu { bytes })?;
    Ok(())
}

fn read_ae_title(
    cursor: &mut Cursor<&[u8]>,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<String> {
    // It shall be encoded as 16 characters as defined by the ISO 646:1990-Basic G0 Set with
    // leading and trailing spaces (20H) being non-significant.
    let mut ae_bytes = [0; 16];
    cursor
        .read_exact(&mut ae_bytes)
        .context(ReadPduFieldSnafu { field })?;
    Ok(codec
        .decode(&ae_bytes)
        .context(DecodeTextSnafu { field })?
        .trim()
        .to_string())
}

/// Decode a UID field,
/// discarding trailing null padding and surrounding whitespace.
fn read_uid<R>(
    reader: &mut R,
    length: usize,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<String>
where
    R: Read,
{
    let bytes = read_n(reader, length).context(ReadPduFieldSnafu { field })?;
    let text = codec.decode(&bytes).context(DecodeTextSnafu { field })?;
    Ok(text.trim_end_matches('\0').trim().to_string())
}

/// Read a sub-item header (type, reserved, u16 length)
/// followed by the sub-item's bytes.
fn read_sub_item<R>(reader: &mut R) -> Result<(u8, Vec<u8>)>
where
    R: Read,
{
    let item_type = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;

    reader
        .read_u8()
        .context(ReadReservedSnafu { bytes: 1_u32 })?;

    let item_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;

    let bytes = read_n(reader, item_length as usize).context(ReadPduItemSnafu)?;
    Ok((item_type, bytes))
}

fn read_pdu_variable<R>(reader: &mut R, codec: &dyn TextCodec) -> Result<PduVariableItem>
where
    R: Read,
{
    let (item_type, bytes) = read_sub_item(reader)?;
    let item_length = bytes.len();
    let mut cursor = Cursor::new(bytes.as_slice());

    match item_type {
        0x10 => {
            // Application Context Item Structure
            let val = read_uid(
                &mut cursor,
                item_length,
                codec,
                "Application-context-name",
            )?;
            Ok(PduVariableItem::ApplicationContext(val))
        }
        0x20 => {
            // Presentation Context Item Structure (proposed)

            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];

            // 5 - Presentation-context-ID - Presentation-context-ID values shall be odd integers
            // between 1 and 255, encoded as an unsigned binary number.
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            // 6-8 - Reserved
            skip_reserved(&mut cursor, 3)?;

            // 9-xxx - Abstract/Transfer Syntax Sub-Items - This variable field shall contain the
            // following sub-items: one Abstract Syntax and one or more Transfer Syntax(es).
            while cursor.position() < cursor.get_ref().len() as u64 {
                let (sub_item_type, sub_item) = read_sub_item(&mut cursor)?;

                match sub_item_type {
                    0x30 => {
                        abstract_syntax = Some(read_uid(
                            &mut sub_item.as_slice(),
                            sub_item.len(),
                            codec,
                            "Abstract-syntax-name",
                        )?);
                    }
                    0x40 => {
                        transfer_syntaxes.push(read_uid(
                            &mut sub_item.as_slice(),
                            sub_item.len(),
                            codec,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return UnknownPresentationContextSubItemSnafu.fail();
                    }
                }
            }

            ensure!(!transfer_syntaxes.is_empty(), MissingTransferSyntaxSnafu);

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context Item Structure (result)

            let mut transfer_syntax: Option<String> = None;

            // 5 - Presentation-context-ID
            let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            // 6 - Reserved
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // 7 - Result/Reason
            let reason = PresentationContextResultReason::from(cursor.read_u8().context(
                ReadPduFieldSnafu {
                    field: "Result/Reason",
                },
            )?)
            .context(InvalidPresentationContextResultReasonSnafu)?;

            // 8 - Reserved
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // 9-xxx - Transfer syntax sub-item - This variable field shall contain one Transfer
            // Syntax Sub-Item. When the Result/Reason field has a value other than acceptance
            // (0), this field shall not be significant and its value shall not be tested when
            // received.
            while cursor.position() < cursor.get_ref().len() as u64 {
                let (sub_item_type, sub_item) = read_sub_item(&mut cursor)?;

                match sub_item_type {
                    0x40 => {
                        ensure!(
                            transfer_syntax.is_none(),
                            MultipleTransferSyntaxesAcceptedSnafu
                        );
                        transfer_syntax = Some(read_uid(
                            &mut sub_item.as_slice(),
                            sub_item.len(),
                            codec,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return InvalidTransferSyntaxSubItemSnafu.fail();
                    }
                }
            }

            let transfer_syntax = match transfer_syntax {
                Some(ts) => ts,
                None if reason != PresentationContextResultReason::Acceptance => String::new(),
                None => return MissingTransferSyntaxSnafu.fail(),
            };

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax,
                },
            ))
        }
        0x50 => {
            // User Information Item Structure

            let mut user_variables = vec![];

            while cursor.position() < cursor.get_ref().len() as u64 {
                let (sub_item_type, sub_item) = read_sub_item(&mut cursor)?;
                user_variables.push(read_user_variable(sub_item_type, sub_item, codec)?);
            }

            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}

fn read_user_variable(
    item_type: u8,
    bytes: Vec<u8>,
    codec: &dyn TextCodec,
) -> Result<UserVariableItem> {
    let mut cursor = Cursor::new(bytes.as_slice());
    let item = match item_type {
        0x51 => {
            // 5-8 - Maximum-length-received
            UserVariableItem::MaxLength(cursor.read_u32::<BigEndian>().context(
                ReadPduFieldSnafu {
                    field: "Maximum-length-received",
                },
            )?)
        }
        0x52 => UserVariableItem::ImplementationClassUID(read_uid(
            &mut cursor,
            bytes.len(),
            codec,
            "Implementation-class-uid",
        )?),
        0x53 => {
            // 5-6 - Maximum-number-operations-invoked
            // 7-8 - Maximum-number-operations-performed
            let invoked = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Maximum-number-operations-invoked",
            })?;
            let performed = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Maximum-number-operations-performed",
            })?;
            UserVariableItem::AsyncOperationsWindow(invoked, performed)
        }
        0x54 => {
            // 5-6 - UID-length
            let uid_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "UID-length",
            })?;
            // 7-xxx - SOP-class-uid
            let sop_class_uid =
                read_uid(&mut cursor, uid_length as usize, codec, "SOP-class-uid")?;
            // xxx - SCU-role
            let scu_role = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "SCU-role" })?;
            // xxx - SCP-role
            let scp_role = cursor
                .read_u8()
                .context(ReadPduFieldSnafu { field: "SCP-role" })?;
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid,
                scu_role: scu_role == 1,
                scp_role: scp_role == 1,
            })
        }
        0x55 => UserVariableItem::ImplementationVersionName(read_uid(
            &mut cursor,
            bytes.len(),
            codec,
            "Implementation-version-name",
        )?),
        0x56 => {
            // 5-6 - SOP-class-uid-length
            let sop_class_uid_length =
                cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "SOP-class-uid-length",
                })?;

            // 7-xxx - SOP-class-uid
            let sop_class_uid = read_uid(
                &mut cursor,
                sop_class_uid_length as usize,
                codec,
                "SOP-class-uid",
            )?;

            // xxx-xxx - Service-class-application-information,
            // spanning the rest of the item
            let mut data = Vec::new();
            cursor
                .read_to_end(&mut data)
                .context(ReadPduFieldSnafu {
                    field: "Service-class-application-information",
                })?;

            UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data)
        }
        0x58 => {
            // 5 - User-Identity-Type
            let user_identity_type = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "User-Identity-type",
            })?;

            // 6 - Positive-response-requested
            let positive_response_requested = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "User-Identity-positive-response-requested",
            })?;

            // 7-8 - Primary-field-length
            let primary_field_length =
                cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "User-Identity-primary-field-length",
                })?;

            // 9-n - Primary-field
            let primary_field = read_n(&mut cursor, primary_field_length as usize).context(
                ReadPduFieldSnafu {
                    field: "User-Identity-primary-field",
                },
            )?;

            // n+1-n+2 - Secondary-field-length
            let secondary_field_length =
                cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "User-Identity-secondary-field-length",
                })?;

            // n+3-m - Secondary-field
            let secondary_field = read_n(&mut cursor, secondary_field_length as usize).context(
                ReadPduFieldSnafu {
                    field: "User-Identity-secondary-field",
                },
            )?;

            match UserIdentityType::from(user_identity_type) {
                Some(user_identity_type) => UserVariableItem::UserIdentityItem(UserIdentity::new(
                    positive_response_requested == 1,
                    user_identity_type,
                    primary_field,
                    secondary_field,
                )),
                None => {
                    warn!("Unknown User Identity Type code {}", user_identity_type);
                    UserVariableItem::Unknown(item_type, bytes.clone())
                }
            }
        }
        _ => UserVariableItem::Unknown(item_type, bytes.clone()),
    };
    Ok(item)
}
