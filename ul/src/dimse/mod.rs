//! DICOM Message Service Element.
//!
//! Messages are made of a command set,
//! always encoded in Implicit VR Little Endian,
//! optionally followed by a data set
//! which is carried here as opaque bytes.
//! On the way out, both are split into presentation data value fragments
//! packed into P-DATA-TF PDUs ([`fragment`]).
//! On the way in, [`DimseProvider`] reassembles them
//! per presentation context.
pub mod commands;

pub use self::commands::SubOperations;

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use dicom_core::value::ConvertValueError;
use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use tracing::{debug, trace};

use crate::dul::{DulServiceProvider, Event, Indication};
use crate::error::{CommandSnafu, Error as UlError};
use crate::pdu::{PDataValue, PDataValueType, Pdu, PDV_ITEM_OVERHEAD};

#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display(
        "Invalid maximum PDU length {} (must be 0 or larger than {})",
        max_pdu_length,
        PDV_ITEM_OVERHEAD
    ))]
    InvalidMaxPduLength {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    /// could not decode command set
    ReadCommand {
        #[snafu(backtrace)]
        source: dicom_object::ReadError,
    },

    /// could not encode command set
    WriteCommand {
        #[snafu(backtrace)]
        source: dicom_object::WriteError,
    },

    #[snafu(display("Missing command element {}", tag))]
    MissingCommandElement { tag: Tag, backtrace: Backtrace },

    #[snafu(display("Invalid value in command element {}", tag))]
    InvalidCommandElement {
        tag: Tag,
        source: ConvertValueError,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Data set fragment received before the command set on presentation context {}",
        presentation_context_id
    ))]
    DataBeforeCommand {
        presentation_context_id: u8,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A DIMSE message: a command set with an optional data set.
#[derive(Debug, Clone)]
pub struct DimseMessage {
    pub command: InMemDicomObject,
    /// the encoded data set, in the presentation context's transfer syntax
    pub data: Option<Vec<u8>>,
}

impl DimseMessage {
    pub fn new(command: InMemDicomObject, data: Option<Vec<u8>>) -> Self {
        DimseMessage { command, data }
    }

    /// Decode a message from its encoded command set.
    pub fn from_command_bytes(command: &[u8], data: Option<Vec<u8>>) -> Result<Self> {
        let command = InMemDicomObject::read_dataset_with_ts(
            command,
            &IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .context(ReadCommandSnafu)?;
        Ok(DimseMessage { command, data })
    }

    /// Encode the command set in Implicit VR Little Endian.
    pub fn encode_command(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(128);
        self.command
            .write_dataset_with_ts(&mut out, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .context(WriteCommandSnafu)?;
        Ok(out)
    }

    fn uint16(&self, tag: Tag) -> Result<u16> {
        self.command
            .get(tag)
            .context(MissingCommandElementSnafu { tag })?
            .to_int::<u16>()
            .context(InvalidCommandElementSnafu { tag })
    }

    fn uid(&self, tag: Tag) -> Result<String> {
        let value: Cow<str> = self
            .command
            .get(tag)
            .context(MissingCommandElementSnafu { tag })?
            .to_str()
            .context(InvalidCommandElementSnafu { tag })?;
        Ok(value
            .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
            .to_string())
    }

    pub fn command_field(&self) -> Result<u16> {
        self.uint16(tags::COMMAND_FIELD)
    }

    pub fn message_id(&self) -> Result<u16> {
        self.uint16(tags::MESSAGE_ID)
    }

    pub fn message_id_being_responded_to(&self) -> Result<u16> {
        self.uint16(tags::MESSAGE_ID_BEING_RESPONDED_TO)
    }

    pub fn affected_sop_class_uid(&self) -> Result<String> {
        self.uid(tags::AFFECTED_SOP_CLASS_UID)
    }

    pub fn affected_sop_instance_uid(&self) -> Result<String> {
        self.uid(tags::AFFECTED_SOP_INSTANCE_UID)
    }

    pub fn status(&self) -> Result<u16> {
        self.uint16(tags::STATUS)
    }

    pub fn priority(&self) -> Result<u16> {
        self.uint16(tags::PRIORITY)
    }

    /// The AE title a C-MOVE asks the instances to be sent to.
    pub fn move_destination(&self) -> Result<String> {
        let value: Cow<str> = self
            .command
            .get(tags::MOVE_DESTINATION)
            .context(MissingCommandElementSnafu {
                tag: tags::MOVE_DESTINATION,
            })?
            .to_str()
            .context(InvalidCommandElementSnafu {
                tag: tags::MOVE_DESTINATION,
            })?;
        Ok(value.trim().to_string())
    }

    /// The sub-operation counts of a C-GET or C-MOVE response.
    /// Counts absent from the command set are taken as 0.
    pub fn sub_operations(&self) -> SubOperations {
        let count = |tag| self.uint16(tag).unwrap_or(0);
        SubOperations {
            remaining: count(tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
            completed: count(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
            failed: count(tags::NUMBER_OF_FAILED_SUBOPERATIONS),
            warning: count(tags::NUMBER_OF_WARNING_SUBOPERATIONS),
        }
    }

    /// Attach a data set, updating _Command Data Set Type_ to match.
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.command.put(DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [commands::DATA_SET_PRESENT]),
        ));
        self.data = Some(data);
        self
    }

    /// Record the sub-operation counts in a C-GET or C-MOVE response.
    pub fn with_sub_operations(mut self, counts: SubOperations) -> Self {
        for (tag, count) in [
            (tags::NUMBER_OF_REMAINING_SUBOPERATIONS, counts.remaining),
            (tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, counts.completed),
            (tags::NUMBER_OF_FAILED_SUBOPERATIONS, counts.failed),
            (tags::NUMBER_OF_WARNING_SUBOPERATIONS, counts.warning),
        ] {
            self.command
                .put(DataElement::new(tag, VR::US, dicom_value!(U16, [count])));
        }
        self
    }

    /// Whether the command set announces a data set.
    ///
    /// A command set without _Command Data Set Type_
    /// is taken as announcing none.
    pub fn has_data_set(&self) -> bool {
        has_data_set(&self.command)
    }
}

fn has_data_set(command: &InMemDicomObject) -> bool {
    command
        .get(tags::COMMAND_DATA_SET_TYPE)
        .and_then(|e| e.to_int::<u16>().ok())
        .map(|value| value != commands::DATA_SET_ABSENT)
        .unwrap_or(false)
}

/// Split an encoded message into P-DATA-TF PDUs.
///
/// The command set comes first, then the data set if there is one.
/// Each fragment holds at most `max_pdu_length - 6` bytes,
/// and each PDU holds as many whole fragments as fit in
/// `max_pdu_length` bytes, counting 6 bytes of overhead per fragment.
/// A `max_pdu_length` of 0 means there is no limit.
pub fn fragment(
    command: &[u8],
    data: Option<&[u8]>,
    presentation_context_id: u8,
    max_pdu_length: u32,
) -> Result<Vec<Pdu>> {
    ensure!(
        max_pdu_length == 0 || max_pdu_length > PDV_ITEM_OVERHEAD,
        InvalidMaxPduLengthSnafu { max_pdu_length }
    );
    let max_fragment = if max_pdu_length == 0 {
        usize::MAX
    } else {
        (max_pdu_length - PDV_ITEM_OVERHEAD) as usize
    };

    let mut values = Vec::new();
    push_fragments(
        &mut values,
        command,
        PDataValueType::Command,
        presentation_context_id,
        max_fragment,
    );
    if let Some(data) = data {
        push_fragments(
            &mut values,
            data,
            PDataValueType::Data,
            presentation_context_id,
            max_fragment,
        );
    }

    let mut pdus = Vec::new();
    let mut current: Vec<PDataValue> = Vec::new();
    let mut current_len = 0usize;
    for value in values {
        let len = value.data.len() + PDV_ITEM_OVERHEAD as usize;
        if max_pdu_length != 0
            && !current.is_empty()
            && current_len + len > max_pdu_length as usize
        {
            pdus.push(Pdu::PData {
                data: std::mem::take(&mut current),
            });
            current_len = 0;
        }
        current_len += len;
        current.push(value);
    }
    if !current.is_empty() {
        pdus.push(Pdu::PData { data: current });
    }
    Ok(pdus)
}

fn push_fragments(
    values: &mut Vec<PDataValue>,
    bytes: &[u8],
    value_type: PDataValueType,
    presentation_context_id: u8,
    max_fragment: usize,
) {
    if bytes.is_empty() {
        values.push(PDataValue {
            presentation_context_id,
            value_type,
            is_last: true,
            data: Vec::new(),
        });
        return;
    }
    let mut chunks = bytes.chunks(max_fragment).peekable();
    while let Some(chunk) = chunks.next() {
        values.push(PDataValue {
            presentation_context_id,
            value_type,
            is_last: chunks.peek().is_none(),
            data: chunk.to_vec(),
        });
    }
}

/// Partial message of one presentation context.
#[derive(Debug, Default)]
struct Reassembly {
    command: Vec<u8>,
    /// the decoded command set, once complete, if a data set follows
    command_set: Option<InMemDicomObject>,
    data: Vec<u8>,
}

/// Sends and receives DIMSE messages over a DUL service provider.
#[derive(Debug, Default)]
pub struct DimseProvider {
    buckets: HashMap<u8, Reassembly>,
    ready: VecDeque<(DimseMessage, u8)>,
}

impl DimseProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a message on the given presentation context,
    /// splitting it according to the peer's maximum PDU length.
    pub fn send(
        &self,
        dul: &DulServiceProvider,
        message: &DimseMessage,
        presentation_context_id: u8,
        max_pdu_length: u32,
    ) -> crate::error::Result<()> {
        let command = message.encode_command().context(CommandSnafu)?;
        let pdus = fragment(
            &command,
            message.data.as_deref(),
            presentation_context_id,
            max_pdu_length,
        )
        .context(CommandSnafu)?;
        debug!(
            "Sending DIMSE message on context {} in {} PDUs",
            presentation_context_id,
            pdus.len()
        );
        for pdu in pdus {
            if let Pdu::PData { data } = pdu {
                dul.send(Event::PDataRequest(data))?;
            }
        }
        Ok(())
    }

    /// Obtain the next complete message and its presentation context ID.
    ///
    /// Without `wait`, this only looks at what has already arrived.
    /// With `wait`, it blocks up to `timeout` (or indefinitely if `None`)
    /// and returns `None` once the time is up.
    /// An abort indication met while waiting is returned as an error.
    pub fn receive(
        &mut self,
        dul: &mut DulServiceProvider,
        wait: bool,
        timeout: Option<Duration>,
    ) -> crate::error::Result<Option<(DimseMessage, u8)>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            while let Some(Indication::Data(values)) =
                dul.take_indication(|i| matches!(i, Indication::Data(_)))
            {
                self.absorb(values).context(CommandSnafu)?;
            }
            if let Some(message) = self.ready.pop_front() {
                return Ok(Some(message));
            }
            if !wait {
                return Ok(None);
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            match dul.wait_for(
                |i| matches!(i, Indication::Data(_) | Indication::Aborted(_)),
                remaining,
            ) {
                Some(Indication::Data(values)) => {
                    self.absorb(values).context(CommandSnafu)?;
                }
                Some(Indication::Aborted(reason)) => {
                    return Err(UlError::from_abort(reason, "a DIMSE message"));
                }
                Some(_) | None => return Ok(None),
            }
        }
    }

    /// Feed received fragments into their buckets.
    fn absorb(&mut self, values: Vec<PDataValue>) -> Result<()> {
        for value in values {
            let id = value.presentation_context_id;
            trace!(
                "{:?} fragment of {} bytes on context {}",
                value.value_type,
                value.data.len(),
                id
            );
            let bucket = self.buckets.entry(id).or_default();
            let complete = match value.value_type {
                PDataValueType::Command => {
                    bucket.command.extend_from_slice(&value.data);
                    if value.is_last {
                        let bytes = std::mem::take(&mut bucket.command);
                        let message = match DimseMessage::from_command_bytes(&bytes, None) {
                            Ok(message) => message,
                            Err(e) => {
                                self.buckets.remove(&id);
                                return Err(e);
                            }
                        };
                        if message.has_data_set() {
                            bucket.command_set = Some(message.command);
                            None
                        } else {
                            Some(message)
                        }
                    } else {
                        None
                    }
                }
                PDataValueType::Data => {
                    if bucket.command_set.is_none() {
                        self.buckets.remove(&id);
                        return DataBeforeCommandSnafu {
                            presentation_context_id: id,
                        }
                        .fail();
                    }
                    bucket.data.extend_from_slice(&value.data);
                    if value.is_last {
                        let data = std::mem::take(&mut bucket.data);
                        bucket
                            .command_set
                            .take()
                            .map(|command| DimseMessage::new(command, Some(data)))
                    } else {
                        None
                    }
                }
            };
            if let Some(message) = complete {
                self.buckets.remove(&id);
                self.ready.push_back((message, id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::commands::{echo_request, DATA_SET_PRESENT};
    use super::*;
    use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
    use matches::matches;
    use rstest::rstest;

    fn pdata_values(pdus: Vec<Pdu>) -> Vec<PDataValue> {
        pdus.into_iter()
            .flat_map(|pdu| match pdu {
                Pdu::PData { data } => data,
                _ => panic!("not a P-DATA PDU"),
            })
            .collect()
    }

    fn store_like_command() -> DimseMessage {
        DimseMessage::new(
            InMemDicomObject::command_from_element_iter([
                DataElement::new(
                    tags::AFFECTED_SOP_CLASS_UID,
                    VR::UI,
                    PrimitiveValue::from("1.2.840.10008.5.1.4.1.1.7\0"),
                ),
                DataElement::new(
                    tags::COMMAND_FIELD,
                    VR::US,
                    dicom_value!(U16, [commands::C_STORE_RQ]),
                ),
                DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [1])),
                DataElement::new(
                    tags::COMMAND_DATA_SET_TYPE,
                    VR::US,
                    dicom_value!(U16, [DATA_SET_PRESENT]),
                ),
            ]),
            None,
        )
    }

    #[rstest]
    #[case(0)]
    #[case(7)]
    #[case(16)]
    #[case(100)]
    #[case(4096)]
    fn fragments_fit_and_reassemble(#[case] max_pdu_length: u32) {
        let command: Vec<u8> = (0..90u8).collect();
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let pdus = fragment(&command, Some(&data), 3, max_pdu_length).unwrap();

        if max_pdu_length != 0 {
            for pdu in &pdus {
                let Pdu::PData { data: values } = pdu else {
                    panic!("not a P-DATA PDU");
                };
                let pdu_len: usize = values.iter().map(|v| v.data.len() + 6).sum();
                assert!(pdu_len <= max_pdu_length as usize);
                for value in values {
                    assert!(value.data.len() <= max_pdu_length as usize - 6);
                }
            }
        }

        let values = pdata_values(pdus);
        let mut command_out = Vec::new();
        let mut data_out = Vec::new();
        let mut seen_data = false;
        for value in &values {
            assert_eq!(value.presentation_context_id, 3);
            match value.value_type {
                PDataValueType::Command => {
                    assert!(!seen_data, "command fragment after data");
                    command_out.extend_from_slice(&value.data);
                }
                PDataValueType::Data => {
                    seen_data = true;
                    data_out.extend_from_slice(&value.data);
                }
            }
        }
        assert_eq!(command_out, command);
        assert_eq!(data_out, data);

        // exactly one last fragment per component
        let last_commands = values
            .iter()
            .filter(|v| v.value_type == PDataValueType::Command && v.is_last)
            .count();
        let last_data = values
            .iter()
            .filter(|v| v.value_type == PDataValueType::Data && v.is_last)
            .count();
        assert_eq!((last_commands, last_data), (1, 1));
    }

    #[rstest]
    #[case(1)]
    #[case(6)]
    fn tiny_max_pdu_length_is_refused(#[case] max_pdu_length: u32) {
        assert!(matches!(
            fragment(&[1, 2, 3], None, 1, max_pdu_length),
            Err(Error::InvalidMaxPduLength { .. })
        ));
    }

    #[test]
    fn whole_fragments_are_packed_together() {
        // 10 + 6 and 4 + 6 fit within 26 bytes
        let pdus = fragment(&[0; 10], Some(&[0; 4]), 1, 26).unwrap();
        assert_eq!(pdus.len(), 1);
        // but not within 25
        let pdus = fragment(&[0; 10], Some(&[0; 4]), 1, 25).unwrap();
        assert_eq!(pdus.len(), 2);
    }

    #[test]
    fn reassembles_command_only_message() -> Result<(), Box<dyn std::error::Error>> {
        let request = echo_request("1.2.840.10008.1.1", 5);
        let bytes = request.encode_command()?;
        let pdus = fragment(&bytes, None, 1, 20)?;
        assert!(pdus.len() > 1);

        let mut provider = DimseProvider::new();
        let mut values = pdata_values(pdus);
        let last = values.split_off(values.len() - 1);
        provider.absorb(values)?;
        // nothing complete until the last fragment arrives
        assert!(provider.ready.is_empty());
        provider.absorb(last)?;

        let (message, id) = provider.ready.pop_front().expect("message should be complete");
        assert_eq!(id, 1);
        assert_eq!(message.command_field()?, commands::C_ECHO_RQ);
        assert_eq!(message.message_id()?, 5);
        assert!(message.data.is_none());
        Ok(())
    }

    #[test]
    fn reassembles_interleaved_contexts() -> Result<(), Box<dyn std::error::Error>> {
        let store = store_like_command();
        let store_bytes = store.encode_command()?;
        let echo_bytes = echo_request("1.2.840.10008.1.1", 9).encode_command()?;

        let store_values = pdata_values(fragment(&store_bytes, Some(&[1, 2, 3, 4]), 3, 0)?);
        let echo_values = pdata_values(fragment(&echo_bytes, None, 1, 0)?);

        let mut provider = DimseProvider::new();
        // store command, then the echo, then the store data set
        provider.absorb(vec![store_values[0].clone()])?;
        provider.absorb(echo_values)?;
        provider.absorb(vec![store_values[1].clone()])?;

        let (first, first_id) = provider.ready.pop_front().expect("echo should be ready");
        assert_eq!(first_id, 1);
        assert_eq!(first.command_field()?, commands::C_ECHO_RQ);

        let (second, second_id) = provider.ready.pop_front().expect("store should be ready");
        assert_eq!(second_id, 3);
        assert_eq!(second.command_field()?, commands::C_STORE_RQ);
        assert_eq!(second.data.as_deref(), Some(&[1, 2, 3, 4][..]));
        Ok(())
    }

    #[test]
    fn data_before_command_is_an_error() {
        let mut provider = DimseProvider::new();
        let result = provider.absorb(vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; 4],
        }]);
        assert!(matches!(
            result,
            Err(Error::DataBeforeCommand {
                presentation_context_id: 1,
                ..
            })
        ));
    }
}
