use bytes::BytesMut;
use dicom_upper_layer::pdu::{
    read_pdu_from_buffer, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationAC,
    AssociationRJ, AssociationRJResult, AssociationRJServiceProviderPresentationReason,
    AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ, PDataValue,
    PDataValueType, Pdu, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, RoleSelection, UserIdentity, UserIdentityType,
    UserVariableItem, APPLICATION_CONTEXT_NAME, DEFAULT_MAX_PDU,
};
use matches::matches;
use rstest::rstest;

fn association_rq() -> Pdu {
    Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "STORE-SCP".to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2.1".to_string(),
                    "1.2.840.10008.1.2".to_string(),
                ],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16384),
            UserVariableItem::ImplementationClassUID("1.2.3.4".to_string()),
            UserVariableItem::ImplementationVersionName("TEST 1.0".to_string()),
            UserVariableItem::AsyncOperationsWindow(1, 1),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                scu_role: true,
                scp_role: false,
            }),
            UserVariableItem::SopClassExtendedNegotiationSubItem(
                "1.2.840.10008.5.1.4.1.1.2".to_string(),
                vec![1, 0, 1],
            ),
            UserVariableItem::UserIdentityItem(UserIdentity::new(
                true,
                UserIdentityType::UsernamePassword,
                b"MyUsername".to_vec(),
                b"MyPassword".to_vec(),
            )),
        ],
    })
}

fn association_ac() -> Pdu {
    Pdu::AssociationAC(AssociationAC {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "STORE-SCP".to_string(),
        application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2.1".to_string(),
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(0),
            UserVariableItem::ImplementationClassUID("1.2.3.4".to_string()),
        ],
    })
}

fn p_data() -> Pdu {
    Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0x08, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00],
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0x55; 100],
            },
        ],
    }
}

fn round_trip(pdu: &Pdu) -> Result<Pdu, Box<dyn std::error::Error>> {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, pdu)?;
    let mut buffer = BytesMut::from(&bytes[..]);
    let decoded = read_pdu_from_buffer(&mut buffer, DEFAULT_MAX_PDU, true)?;
    assert!(buffer.is_empty(), "{} bytes left over", buffer.len());
    decoded.ok_or_else(|| "PDU should be complete".into())
}

#[rstest]
#[case(association_rq())]
#[case(association_ac())]
#[case(Pdu::AssociationRJ(AssociationRJ {
    result: AssociationRJResult::Permanent,
    source: AssociationRJSource::ServiceUser(
        AssociationRJServiceUserReason::CalledAETitleNotRecognized,
    ),
}))]
#[case(Pdu::AssociationRJ(AssociationRJ {
    result: AssociationRJResult::Transient,
    source: AssociationRJSource::ServiceProviderPresentation(
        AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
    ),
}))]
#[case(p_data())]
#[case(Pdu::ReleaseRQ)]
#[case(Pdu::ReleaseRP)]
#[case(Pdu::AbortRQ { source: AbortRQSource::ServiceUser })]
#[case(Pdu::AbortRQ {
    source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
})]
fn pdus_survive_encoding(#[case] pdu: Pdu) -> Result<(), Box<dyn std::error::Error>> {
    assert_eq!(round_trip(&pdu)?, pdu);
    Ok(())
}

#[rstest]
#[case(association_rq())]
#[case(p_data())]
#[case(Pdu::ReleaseRQ)]
fn every_proper_prefix_needs_more_data(#[case] pdu: Pdu) -> Result<(), Box<dyn std::error::Error>> {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu)?;
    for len in 0..bytes.len() {
        let mut buffer = BytesMut::from(&bytes[..len]);
        assert!(read_pdu_from_buffer(&mut buffer, DEFAULT_MAX_PDU, true)?.is_none());
        assert_eq!(buffer.len(), len, "incomplete input must be left untouched");
    }
    Ok(())
}

#[test]
fn pdus_are_read_one_at_a_time() -> Result<(), Box<dyn std::error::Error>> {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &p_data())?;
    write_pdu(&mut bytes, &Pdu::ReleaseRQ)?;
    // half of an abort
    bytes.extend_from_slice(&[0x07, 0x00, 0x00, 0x00, 0x00]);

    let mut buffer = BytesMut::from(&bytes[..]);
    let first = read_pdu_from_buffer(&mut buffer, DEFAULT_MAX_PDU, true)?;
    assert!(matches!(first, Some(Pdu::PData { .. })));
    let second = read_pdu_from_buffer(&mut buffer, DEFAULT_MAX_PDU, true)?;
    assert_eq!(second, Some(Pdu::ReleaseRQ));
    assert_eq!(read_pdu_from_buffer(&mut buffer, DEFAULT_MAX_PDU, true)?, None);
    assert_eq!(buffer.len(), 5);
    Ok(())
}

#[test]
fn unknown_pdu_type_is_an_error() {
    let mut buffer = BytesMut::from(&[0x09, 0x00, 0x00, 0x00, 0x00, 0x00][..]);
    assert!(read_pdu_from_buffer(&mut buffer, DEFAULT_MAX_PDU, true).is_err());
}

#[test]
fn invalid_max_pdu_length_is_refused() {
    let mut buffer = BytesMut::new();
    assert!(read_pdu_from_buffer(&mut buffer, 16, true).is_err());
}
