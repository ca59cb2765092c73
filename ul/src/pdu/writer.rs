use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not write chunk of {} PDU structure", name))]
    WriteChunk {
        /// the name of the PDU structure
        name: &'static str,
        source: WriteChunkError,
    },

    #[snafu(display("Could not write field `{}`", field))]
    WriteField {
        field: &'static str,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not write {} reserved bytes", bytes))]
    WriteReserved {
        bytes: u32,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not encode field `{}`", field))]
    EncodeField {
        field: &'static str,
        source: dicom_encoding::text::EncodeTextError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
pub enum WriteChunkError {
    #[snafu(display("Failed to build chunk"))]
    BuildChunk {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
    #[snafu(display("Chunk of {} bytes does not fit its length field", length))]
    ChunkTooLarge { length: usize, backtrace: Backtrace },
    #[snafu(display("Failed to write chunk length"))]
    WriteLength {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    #[snafu(display("Failed to write chunk data"))]
    WriteData {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

/// Write a chunk of data built by `func`,
/// preceded by its length as a big endian 32-bit integer.
fn write_chunk_u32<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).context(BuildChunkSnafu)?;

    let length = u32::try_from(data.len())
        .map_err(|_| ChunkTooLargeSnafu { length: data.len() }.build())?;
    writer
        .write_u32::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

/// Write a chunk of data built by `func`,
/// preceded by its length as a big endian 16-bit integer.
fn write_chunk_u16<F>(writer: &mut dyn Write, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).context(BuildChunkSnafu)?;

    let length = u16::try_from(data.len())
        .map_err(|_| ChunkTooLargeSnafu { length: data.len() }.build())?;
    writer
        .write_u16::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

/// Write the item type and reserved byte of a variable item,
/// followed by its contents with a 16-bit length.
fn write_item<F>(writer: &mut dyn Write, item_type: u8, name: &'static str, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    writer
        .write_u8(item_type)
        .context(WriteFieldSnafu { field: "Item-type" })?;

    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u16(writer, func).context(WriteChunkSnafu { name })
}

/// Write the PDU type and reserved byte of a PDU,
/// followed by its contents with a 32-bit length.
fn write_pdu_frame<F>(writer: &mut dyn Write, pdu_type: u8, name: &'static str, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    writer
        .write_u8(pdu_type)
        .context(WriteFieldSnafu { field: "PDU-type" })?;

    // 2 - Reserved - This reserved field shall be sent with a value 00H but not tested to this
    // value when received.
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    write_chunk_u32(writer, func).context(WriteChunkSnafu { name })
}

fn write_text(
    writer: &mut dyn Write,
    text: &str,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<()> {
    let bytes = codec.encode(text).context(EncodeFieldSnafu { field })?;
    writer.write_all(&bytes).context(WriteFieldSnafu { field })
}

fn write_ae_title(
    writer: &mut dyn Write,
    ae_title: &str,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<()> {
    // It shall be encoded as 16 characters as defined by the ISO 646:1990-Basic G0 Set with
    // leading and trailing spaces (20H) being non-significant.
    let mut ae_title_bytes = codec.encode(ae_title).context(EncodeFieldSnafu { field })?;
    ae_title_bytes.resize(16, b' ');
    writer
        .write_all(&ae_title_bytes)
        .context(WriteFieldSnafu { field })
}

/// Encode the given PDU into the writer.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let codec = DefaultCharacterSetCodec;
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // A-ASSOCIATE-RQ PDU Structure
            write_pdu_frame(writer, 0x01, "A-ASSOCIATE-RQ", |writer| {
                // 7-8  Protocol-version
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;

                // 9-10 - Reserved
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                // 11-26 - Called-AE-title
                write_ae_title(writer, called_ae_title, &codec, "Called-AE-title")?;

                // 27-42 - Calling-AE-title
                write_ae_title(writer, calling_ae_title, &codec, "Calling-AE-title")?;

                // 43-74 - Reserved
                writer
                    .write_all(&[0; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                write_pdu_variable_application_context_name(
                    writer,
                    application_context_name,
                    &codec,
                )?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_proposed(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }

                write_pdu_variable_user_variables(writer, user_variables, &codec)
            })
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            // A-ASSOCIATE-AC PDU Structure
            write_pdu_frame(writer, 0x02, "A-ASSOCIATE-AC", |writer| {
                // 7-8 - Protocol-version
                writer
                    .write_u16::<BigEndian>(*protocol_version)
                    .context(WriteFieldSnafu {
                        field: "Protocol-version",
                    })?;

                // 9-10 - Reserved
                writer
                    .write_u16::<BigEndian>(0x00)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                // 11-26 - Reserved - This reserved field shall be sent with a value identical to
                // the value received in the same field of the A-ASSOCIATE-RQ PDU, but its value
                // shall not be tested when received.
                write_ae_title(writer, called_ae_title, &codec, "Called-AE-title")?;

                // 27-42 - Reserved - same as above, for the calling AE title
                write_ae_title(writer, calling_ae_title, &codec, "Calling-AE-title")?;

                // 43-74 - Reserved
                writer
                    .write_all(&[0; 32])
                    .context(WriteReservedSnafu { bytes: 32_u32 })?;

                // 75-xxx - Variable items - This variable field shall contain the following items:
                // one Application Context Item, one or more Presentation Context Item(s) and one
                // User Information Item.
                write_pdu_variable_application_context_name(
                    writer,
                    application_context_name,
                    &codec,
                )?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_result(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }

                write_pdu_variable_user_variables(writer, user_variables, &codec)
            })
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            // A-ASSOCIATE-RJ PDU Structure
            write_pdu_frame(writer, 0x03, "A-ASSOCIATE-RJ", |writer| {
                // 7 - Reserved
                writer
                    .write_u8(0x00)
                    .context(WriteReservedSnafu { bytes: 1_u32 })?;

                // 8 - Result
                // - 1 - rejected-permanent
                // - 2 - rejected-transient
                writer
                    .write_u8(match result {
                        AssociationRJResult::Permanent => 0x01,
                        AssociationRJResult::Transient => 0x02,
                    })
                    .context(WriteFieldSnafu { field: "Result" })?;

                // 9 - Source
                // 10 - Reason/Diag.
                writer
                    .write_all(&source.to_bytes())
                    .context(WriteFieldSnafu {
                        field: "Source and Reason/Diag.",
                    })
            })
        }
        Pdu::PData { data } => {
            // P-DATA-TF PDU Structure
            write_pdu_frame(writer, 0x04, "P-DATA-TF", |writer| {
                // 7-xxx - Presentation-data-value Item(s)
                for presentation_data_value in data {
                    write_chunk_u32(writer, |writer| {
                        // 5 - Presentation-context-ID
                        writer
                            .write_u8(presentation_data_value.presentation_context_id)
                            .context(WriteFieldSnafu {
                                field: "Presentation-context-ID",
                            })?;

                        // 6-xxx - Presentation-data-value, starting with the message control
                        // header
                        writer
                            .write_u8(presentation_data_value.control_header())
                            .context(WriteFieldSnafu {
                                field: "Presentation-data-value control header",
                            })?;

                        writer
                            .write_all(&presentation_data_value.data)
                            .context(WriteFieldSnafu {
                                field: "Presentation-data-value",
                            })
                    })
                    .context(WriteChunkSnafu {
                        name: "Presentation-data-value item",
                    })?;
                }

                Ok(())
            })
        }
        Pdu::ReleaseRQ => write_pdu_frame(writer, 0x05, "A-RELEASE-RQ", |writer| {
            // 7-10 - Reserved
            writer
                .write_all(&[0u8; 4])
                .context(WriteReservedSnafu { bytes: 4_u32 })
        }),
        Pdu::ReleaseRP => write_pdu_frame(writer, 0x06, "A-RELEASE-RP", |writer| {
            // 7-10 - Reserved
            writer
                .write_all(&[0u8; 4])
                .context(WriteReservedSnafu { bytes: 4_u32 })
        }),
        Pdu::AbortRQ { source } => write_pdu_frame(writer, 0x07, "A-ABORT", |writer| {
            // 7-8 - Reserved
            writer
                .write_all(&[0u8; 2])
                .context(WriteReservedSnafu { bytes: 2_u32 })?;

            // 9 - Source
            // 10 - Reason/Diag
            writer.write_all(&source.to_bytes()).context(WriteFieldSnafu {
                field: "Source and Reason/Diag",
            })
        }),
    }
}

fn write_pdu_variable_application_context_name(
    writer: &mut dyn Write,
    application_context_name: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    write_item(writer, 0x10, "Application Context Item", |writer| {
        write_text(
            writer,
            application_context_name,
            codec,
            "Application-context-name",
        )
    })
}

fn write_pdu_variable_presentation_context_proposed(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextProposed,
    codec: &dyn TextCodec,
) -> Result<()> {
    write_item(writer, 0x20, "Presentation Context Item", |writer| {
        // 5 - Presentation-context-ID
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;

        // 6-8 - Reserved
        writer
            .write_all(&[0u8; 3])
            .context(WriteReservedSnafu { bytes: 3_u32 })?;

        // 9-xxx - Abstract/Transfer Syntax Sub-Items
        write_item(writer, 0x30, "Abstract Syntax Sub-Item", |writer| {
            write_text(
                writer,
                &presentation_context.abstract_syntax,
                codec,
                "Abstract-syntax-name",
            )
        })?;

        for transfer_syntax in &presentation_context.transfer_syntaxes {
            write_item(writer, 0x40, "Transfer Syntax Sub-Item", |writer| {
                write_text(writer, transfer_syntax, codec, "Transfer-syntax-name")
            })?;
        }

        Ok(())
    })
}

fn write_pdu_variable_presentation_context_result(
    writer: &mut dyn Write,
    presentation_context: &PresentationContextResult,
    codec: &dyn TextCodec,
) -> Result<()> {
    write_item(writer, 0x21, "Presentation Context Item", |writer| {
        // 5 - Presentation-context-ID
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;

        // 6 - Reserved
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        // 7 - Result/Reason
        writer
            .write_u8(presentation_context.reason.to_u8())
            .context(WriteFieldSnafu {
                field: "Presentation Context Result/Reason",
            })?;

        // 8 - Reserved
        writer
            .write_u8(0x00)
            .context(WriteReservedSnafu { bytes: 1_u32 })?;

        // 9-xxx - Transfer syntax sub-item
        write_item(writer, 0x40, "Transfer Syntax Sub-Item", |writer| {
            write_text(
                writer,
                &presentation_context.transfer_syntax,
                codec,
                "Transfer-syntax-name",
            )
        })
    })
}

fn write_pdu_variable_user_variables(
    writer: &mut dyn Write,
    user_variables: &[UserVariableItem],
    codec: &dyn TextCodec,
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    write_item(writer, 0x50, "User Information Item", |writer| {
        for user_variable in user_variables {
            match user_variable {
                UserVariableItem::MaxLength(max_length) => {
                    write_item(writer, 0x51, "Maximum Length Sub-Item", |writer| {
                        writer
                            .write_u32::<BigEndian>(*max_length)
                            .context(WriteFieldSnafu {
                                field: "Maximum-length-received",
                            })
                    })?;
                }
                UserVariableItem::ImplementationClassUID(implementation_class_uid) => {
                    write_item(writer, 0x52, "Implementation Class UID Sub-Item", |writer| {
                        write_text(
                            writer,
                            implementation_class_uid,
                            codec,
                            "Implementation-class-uid",
                        )
                    })?;
                }
                UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
                    write_item(writer, 0x53, "Asynchronous Operations Window Sub-Item", |writer| {
                        writer
                            .write_u16::<BigEndian>(*invoked)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-invoked",
                            })?;
                        writer
                            .write_u16::<BigEndian>(*performed)
                            .context(WriteFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            })
                    })?;
                }
                UserVariableItem::RoleSelection(role) => {
                    write_item(writer, 0x54, "SCP/SCU Role Selection Sub-Item", |writer| {
                        let uid = codec
                            .encode(&role.sop_class_uid)
                            .context(EncodeFieldSnafu {
                                field: "SOP-class-uid",
                            })?;
                        writer
                            .write_u16::<BigEndian>(uid.len() as u16)
                            .context(WriteFieldSnafu { field: "UID-length" })?;
                        writer
                            .write_all(&uid)
                            .context(WriteFieldSnafu {
                                field: "SOP-class-uid",
                            })?;
                        writer
                            .write_u8(role.scu_role as u8)
                            .context(WriteFieldSnafu { field: "SCU-role" })?;
                        writer
                            .write_u8(role.scp_role as u8)
                            .context(WriteFieldSnafu { field: "SCP-role" })
                    })?;
                }
                UserVariableItem::ImplementationVersionName(implementation_version_name) => {
                    write_item(writer, 0x55, "Implementation Version Name Sub-Item", |writer| {
                        write_text(
                            writer,
                            implementation_version_name,
                            codec,
                            "Implementation-version-name",
                        )
                    })?;
                }
                UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data) => {
                    write_item(writer, 0x56, "SOP Class Extended Negotiation Sub-Item", |writer| {
                        let uid = codec.encode(sop_class_uid).context(EncodeFieldSnafu {
                            field: "SOP-class-uid",
                        })?;
                        writer
                            .write_u16::<BigEndian>(uid.len() as u16)
                            .context(WriteFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;
                        writer.write_all(&uid).context(WriteFieldSnafu {
                            field: "SOP-class-uid",
                        })?;
                        writer.write_all(data).context(WriteFieldSnafu {
                            field: "Service-class-application-information",
                        })
                    })?;
                }
                UserVariableItem::UserIdentityItem(user_identity) => {
                    write_item(writer, 0x58, "User Identity Sub-Item", |writer| {
                        writer
                            .write_u8(user_identity.identity_type().to_u8())
                            .context(WriteFieldSnafu {
                                field: "User-Identity-type",
                            })?;
                        writer
                            .write_u8(user_identity.positive_response_requested() as u8)
                            .context(WriteFieldSnafu {
                                field: "User-Identity-positive-response-requested",
                            })?;
                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(user_identity.primary_field())
                                .context(WriteFieldSnafu {
                                    field: "User-Identity-primary-field",
                                })
                        })
                        .context(WriteChunkSnafu {
                            name: "User-Identity-primary-field",
                        })?;
                        write_chunk_u16(writer, |writer| {
                            writer
                                .write_all(user_identity.secondary_field())
                                .context(WriteFieldSnafu {
                                    field: "User-Identity-secondary-field",
                                })
                        })
                        .context(WriteChunkSnafu {
                            name: "User-Identity-secondary-field",
                        })
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    write_item(writer, *item_type, "Unknown Sub-Item", |writer| {
                        writer.write_all(data).context(WriteFieldSnafu {
                            field: "Unknown Data",
                        })
                    })?;
                }
            }
        }

        Ok(())
    })
}
