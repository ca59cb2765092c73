#![no_main]
use std::error::Error;

use bytes::BytesMut;
use dicom_upper_layer::pdu::{read_pdu_from_buffer, write_pdu, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u32, bool, &[u8])| {
    let (maxlen, strict, data) = data;
    let _ = fuzz(maxlen, strict, data);
});

fn fuzz(maxlen: u32, strict: bool, data: &[u8]) -> Result<(), Box<dyn Error>> {
    let maxlen = maxlen.clamp(MINIMUM_PDU_SIZE, MAXIMUM_PDU_SIZE);

    // deserialize random bytes
    let mut buffer = BytesMut::from(data);
    let Some(pdu) = read_pdu_from_buffer(&mut buffer, maxlen, strict)? else {
        return Ok(());
    };

    // serialize pdu back to bytes
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu)?;

    // deserialize back to pdu, in two halves
    let half = bytes.len() / 2;
    let mut buffer = BytesMut::from(&bytes[..half]);
    assert!(read_pdu_from_buffer(&mut buffer, MAXIMUM_PDU_SIZE, false)?.is_none());
    buffer.extend_from_slice(&bytes[half..]);
    let pdu2 = read_pdu_from_buffer(&mut buffer, MAXIMUM_PDU_SIZE, false)
        .expect("serialized pdu should always deserialize")
        .expect("serialized pdu should be complete");

    // assert equivalence
    assert_eq!(
        pdu, pdu2,
        "pdu should be equal after serializing to/from bytes"
    );

    Ok(())
}
