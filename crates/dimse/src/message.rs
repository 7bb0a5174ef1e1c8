//! DIMSE message codec
//!
//! Command sets are always encoded in Implicit VR Little Endian; identifiers
//! and pushed objects use the transfer syntax negotiated for their
//! presentation context.

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::uids;
use dicom_encoding::transfer_syntax::{TransferSyntax, TransferSyntaxIndex};
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use serde::{Deserialize, Serialize};

use crate::error::{DimseError, Result};
use crate::types::text;

static REGISTRY: TransferSyntaxRegistry = TransferSyntaxRegistry;

// Command group elements (PS3.7 E.1)
const AFFECTED_SOP_CLASS_UID: Tag = Tag(0x0000, 0x0002);
const COMMAND_FIELD: Tag = Tag(0x0000, 0x0100);
const MESSAGE_ID: Tag = Tag(0x0000, 0x0110);
const MESSAGE_ID_BEING_RESPONDED_TO: Tag = Tag(0x0000, 0x0120);
const MOVE_DESTINATION: Tag = Tag(0x0000, 0x0600);
const PRIORITY: Tag = Tag(0x0000, 0x0700);
const COMMAND_DATA_SET_TYPE: Tag = Tag(0x0000, 0x0800);
const STATUS: Tag = Tag(0x0000, 0x0900);
const AFFECTED_SOP_INSTANCE_UID: Tag = Tag(0x0000, 0x1000);
const REMAINING_SUBOPERATIONS: Tag = Tag(0x0000, 0x1020);
const COMPLETED_SUBOPERATIONS: Tag = Tag(0x0000, 0x1021);
const FAILED_SUBOPERATIONS: Tag = Tag(0x0000, 0x1022);
const WARNING_SUBOPERATIONS: Tag = Tag(0x0000, 0x1023);
const MOVE_ORIGINATOR_AE_TITLE: Tag = Tag(0x0000, 0x1030);
const MOVE_ORIGINATOR_MESSAGE_ID: Tag = Tag(0x0000, 0x1031);

/// Command Data Set Type value meaning "no data set follows"
const NO_DATA_SET: u16 = 0x0101;

/// Size of a PDV item header (length + context id + control byte)
const PDV_HEADER_LEN: usize = 6;

/// Look up a transfer syntax by UID
pub fn transfer_syntax(uid: &str) -> Result<&'static TransferSyntax> {
    let uid = uid.trim_end_matches(['\0', ' ']);
    REGISTRY
        .get(uid)
        .ok_or_else(|| DimseError::NotSupported(format!("transfer syntax {}", uid)))
}

/// Transfer syntax of every command set
pub fn command_transfer_syntax() -> Result<&'static TransferSyntax> {
    transfer_syntax(uids::IMPLICIT_VR_LITTLE_ENDIAN)
}

/// DIMSE command field values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandField {
    CStoreRq,
    CStoreRsp,
    CFindRq,
    CFindRsp,
    CMoveRq,
    CMoveRsp,
    CEchoRq,
    CEchoRsp,
    CCancelRq,
    Other(u16),
}

impl CommandField {
    pub fn code(self) -> u16 {
        match self {
            CommandField::CStoreRq => 0x0001,
            CommandField::CStoreRsp => 0x8001,
            CommandField::CFindRq => 0x0020,
            CommandField::CFindRsp => 0x8020,
            CommandField::CMoveRq => 0x0021,
            CommandField::CMoveRsp => 0x8021,
            CommandField::CEchoRq => 0x0030,
            CommandField::CEchoRsp => 0x8030,
            CommandField::CCancelRq => 0x0FFF,
            CommandField::Other(code) => code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0x0001 => CommandField::CStoreRq,
            0x8001 => CommandField::CStoreRsp,
            0x0020 => CommandField::CFindRq,
            0x8020 => CommandField::CFindRsp,
            0x0021 => CommandField::CMoveRq,
            0x8021 => CommandField::CMoveRsp,
            0x0030 => CommandField::CEchoRq,
            0x8030 => CommandField::CEchoRsp,
            0x0FFF => CommandField::CCancelRq,
            other => CommandField::Other(other),
        }
    }

    /// Response field matching a request field
    pub fn response(self) -> Self {
        Self::from_code(self.code() | 0x8000)
    }
}

/// Sub-operation counters carried by C-MOVE responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubOperationCounts {
    pub remaining: Option<u16>,
    pub completed: Option<u16>,
    pub failed: Option<u16>,
    pub warning: Option<u16>,
}

impl SubOperationCounts {
    pub fn new(remaining: u16, completed: u16, failed: u16, warning: u16) -> Self {
        Self {
            remaining: Some(remaining),
            completed: Some(completed),
            failed: Some(failed),
            warning: Some(warning),
        }
    }
}

/// Typed view of a DIMSE command set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSet {
    pub command_field: CommandField,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub message_id: Option<u16>,
    pub message_id_being_responded_to: Option<u16>,
    pub priority: Option<u16>,
    pub move_destination: Option<String>,
    pub move_originator: Option<(String, u16)>,
    pub status: Option<u16>,
    pub sub_operations: SubOperationCounts,
    pub has_dataset: bool,
}

impl CommandSet {
    fn empty(command_field: CommandField) -> Self {
        Self {
            command_field,
            affected_sop_class_uid: None,
            affected_sop_instance_uid: None,
            message_id: None,
            message_id_being_responded_to: None,
            priority: None,
            move_destination: None,
            move_originator: None,
            status: None,
            sub_operations: SubOperationCounts::default(),
            has_dataset: false,
        }
    }

    fn request(command_field: CommandField, message_id: u16, sop_class_uid: &str) -> Self {
        Self {
            affected_sop_class_uid: Some(sop_class_uid.to_string()),
            message_id: Some(message_id),
            ..Self::empty(command_field)
        }
    }

    pub fn echo_rq(message_id: u16) -> Self {
        Self::request(CommandField::CEchoRq, message_id, uids::VERIFICATION)
    }

    pub fn find_rq(message_id: u16, sop_class_uid: &str, priority: u16) -> Self {
        Self {
            priority: Some(priority),
            has_dataset: true,
            ..Self::request(CommandField::CFindRq, message_id, sop_class_uid)
        }
    }

    pub fn move_rq(message_id: u16, sop_class_uid: &str, priority: u16, destination: &str) -> Self {
        Self {
            priority: Some(priority),
            move_destination: Some(destination.to_string()),
            has_dataset: true,
            ..Self::request(CommandField::CMoveRq, message_id, sop_class_uid)
        }
    }

    pub fn store_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> Self {
        Self {
            affected_sop_instance_uid: Some(sop_instance_uid.to_string()),
            priority: Some(0),
            has_dataset: true,
            ..Self::request(CommandField::CStoreRq, message_id, sop_class_uid)
        }
    }

    pub fn cancel_rq(message_id_being_responded_to: u16) -> Self {
        Self {
            message_id_being_responded_to: Some(message_id_being_responded_to),
            ..Self::empty(CommandField::CCancelRq)
        }
    }

    /// Response to `request` carrying `status`
    pub fn response_to(request: &CommandSet, status: u16) -> Self {
        Self {
            affected_sop_class_uid: request.affected_sop_class_uid.clone(),
            affected_sop_instance_uid: request.affected_sop_instance_uid.clone(),
            message_id_being_responded_to: request.message_id,
            status: Some(status),
            ..Self::empty(request.command_field.response())
        }
    }

    /// Attach move sub-operation counters
    pub fn with_sub_operations(mut self, counts: SubOperationCounts) -> Self {
        self.sub_operations = counts;
        self
    }

    /// Mark that an identifier/data set follows
    pub fn with_dataset(mut self) -> Self {
        self.has_dataset = true;
        self
    }

    /// Encode into a command set object (group length computed)
    pub fn to_object(&self) -> InMemDicomObject {
        let mut elements = Vec::with_capacity(12);
        if let Some(uid) = &self.affected_sop_class_uid {
            elements.push(DataElement::new(
                AFFECTED_SOP_CLASS_UID,
                VR::UI,
                PrimitiveValue::from(uid.as_str()),
            ));
        }
        elements.push(DataElement::new(
            COMMAND_FIELD,
            VR::US,
            PrimitiveValue::from(self.command_field.code()),
        ));
        if let Some(id) = self.message_id {
            elements.push(DataElement::new(MESSAGE_ID, VR::US, PrimitiveValue::from(id)));
        }
        if let Some(id) = self.message_id_being_responded_to {
            elements.push(DataElement::new(
                MESSAGE_ID_BEING_RESPONDED_TO,
                VR::US,
                PrimitiveValue::from(id),
            ));
        }
        if let Some(destination) = &self.move_destination {
            elements.push(DataElement::new(
                MOVE_DESTINATION,
                VR::AE,
                PrimitiveValue::from(destination.as_str()),
            ));
        }
        if let Some(priority) = self.priority {
            elements.push(DataElement::new(PRIORITY, VR::US, PrimitiveValue::from(priority)));
        }
        elements.push(DataElement::new(
            COMMAND_DATA_SET_TYPE,
            VR::US,
            PrimitiveValue::from(if self.has_dataset { 0x0000 } else { NO_DATA_SET }),
        ));
        if let Some(status) = self.status {
            elements.push(DataElement::new(STATUS, VR::US, PrimitiveValue::from(status)));
        }
        if let Some(uid) = &self.affected_sop_instance_uid {
            elements.push(DataElement::new(
                AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(uid.as_str()),
            ));
        }
        let counts = [
            (REMAINING_SUBOPERATIONS, self.sub_operations.remaining),
            (COMPLETED_SUBOPERATIONS, self.sub_operations.completed),
            (FAILED_SUBOPERATIONS, self.sub_operations.failed),
            (WARNING_SUBOPERATIONS, self.sub_operations.warning),
        ];
        for (tag, value) in counts {
            if let Some(value) = value {
                elements.push(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
            }
        }
        if let Some((ae, id)) = &self.move_originator {
            elements.push(DataElement::new(
                MOVE_ORIGINATOR_AE_TITLE,
                VR::AE,
                PrimitiveValue::from(ae.as_str()),
            ));
            elements.push(DataElement::new(
                MOVE_ORIGINATOR_MESSAGE_ID,
                VR::US,
                PrimitiveValue::from(*id),
            ));
        }
        InMemDicomObject::command_from_element_iter(elements)
    }

    /// Decode from a command set object
    pub fn from_object(obj: &InMemDicomObject) -> Result<Self> {
        let field = uint(obj, COMMAND_FIELD).ok_or_else(|| {
            DimseError::DicomParsing("command set without Command Field".to_string())
        })?;
        let originator = text(obj, MOVE_ORIGINATOR_AE_TITLE)
            .zip(uint(obj, MOVE_ORIGINATOR_MESSAGE_ID));
        Ok(Self {
            command_field: CommandField::from_code(field),
            affected_sop_class_uid: text(obj, AFFECTED_SOP_CLASS_UID),
            affected_sop_instance_uid: text(obj, AFFECTED_SOP_INSTANCE_UID),
            message_id: uint(obj, MESSAGE_ID),
            message_id_being_responded_to: uint(obj, MESSAGE_ID_BEING_RESPONDED_TO),
            priority: uint(obj, PRIORITY),
            move_destination: text(obj, MOVE_DESTINATION),
            move_originator: originator,
            status: uint(obj, STATUS),
            sub_operations: SubOperationCounts {
                remaining: uint(obj, REMAINING_SUBOPERATIONS),
                completed: uint(obj, COMPLETED_SUBOPERATIONS),
                failed: uint(obj, FAILED_SUBOPERATIONS),
                warning: uint(obj, WARNING_SUBOPERATIONS),
            },
            has_dataset: uint(obj, COMMAND_DATA_SET_TYPE).unwrap_or(NO_DATA_SET) != NO_DATA_SET,
        })
    }

    /// Encode to Implicit VR Little Endian bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(128);
        self.to_object()
            .write_dataset_with_ts(&mut bytes, command_transfer_syntax()?)
            .map_err(|e| DimseError::DicomParsing(format!("encode command: {}", e)))?;
        Ok(bytes)
    }

    /// Decode from Implicit VR Little Endian bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let obj = InMemDicomObject::read_dataset_with_ts(bytes, command_transfer_syntax()?)
            .map_err(|e| DimseError::DicomParsing(format!("decode command: {}", e)))?;
        Self::from_object(&obj)
    }
}

fn uint(obj: &InMemDicomObject, tag: Tag) -> Option<u16> {
    obj.element(tag).ok().and_then(|e| e.to_int::<u16>().ok())
}

/// One complete DIMSE message: command plus optional data set
#[derive(Debug, Clone)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: CommandSet,
    pub dataset: Option<InMemDicomObject>,
}

impl DimseMessage {
    pub fn new(presentation_context_id: u8, command: CommandSet) -> Self {
        Self {
            presentation_context_id,
            command,
            dataset: None,
        }
    }

    /// Attach a data set and flag it in the command
    pub fn with_dataset(mut self, dataset: InMemDicomObject) -> Self {
        self.command.has_dataset = true;
        self.dataset = Some(dataset);
        self
    }

    /// Status of a response message
    pub fn status(&self) -> Option<u16> {
        self.command.status
    }

    /// Split into P-DATA-TF PDUs, fragmenting at `max_pdu`
    pub fn to_pdus(&self, transfer_syntax: &TransferSyntax, max_pdu: u32) -> Result<Vec<Pdu>> {
        let chunk = (max_pdu as usize)
            .saturating_sub(PDV_HEADER_LEN)
            .max(1024);
        let mut pdus = fragment(
            self.presentation_context_id,
            PDataValueType::Command,
            self.command.encode()?,
            chunk,
        );
        if let Some(dataset) = &self.dataset {
            let mut bytes = Vec::new();
            dataset
                .write_dataset_with_ts(&mut bytes, transfer_syntax)
                .map_err(|e| DimseError::DicomParsing(format!("encode data set: {}", e)))?;
            pdus.extend(fragment(
                self.presentation_context_id,
                PDataValueType::Data,
                bytes,
                chunk,
            ));
        }
        Ok(pdus)
    }
}

fn fragment(context_id: u8, value_type: PDataValueType, bytes: Vec<u8>, chunk: usize) -> Vec<Pdu> {
    if bytes.len() <= chunk {
        return vec![Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: context_id,
                value_type,
                is_last: true,
                data: bytes,
            }],
        }];
    }
    let total = bytes.len().div_ceil(chunk);
    bytes
        .chunks(chunk)
        .enumerate()
        .map(|(i, part)| Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: context_id,
                value_type: value_type.clone(),
                is_last: i + 1 == total,
                data: part.to_vec(),
            }],
        })
        .collect()
}

/// A message whose data set has not been decoded yet
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub presentation_context_id: u8,
    pub command: CommandSet,
    pub data: Option<Vec<u8>>,
}

impl RawMessage {
    /// Decode the data set with the context's transfer syntax
    pub fn decode(self, transfer_syntax: &TransferSyntax) -> Result<DimseMessage> {
        let dataset = match self.data {
            Some(bytes) => Some(
                InMemDicomObject::read_dataset_with_ts(bytes.as_slice(), transfer_syntax)
                    .map_err(|e| DimseError::DicomParsing(format!("decode data set: {}", e)))?,
            ),
            None => None,
        };
        Ok(DimseMessage {
            presentation_context_id: self.presentation_context_id,
            command: self.command,
            dataset,
        })
    }
}

/// Reassembles command and data fragments into messages
#[derive(Debug, Default)]
pub struct MessageAssembler {
    command: Vec<u8>,
    data: Vec<u8>,
    awaiting_data: Option<(u8, CommandSet)>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the values of one P-DATA-TF PDU; returns completed messages
    pub fn feed(&mut self, values: Vec<PDataValue>) -> Result<Vec<RawMessage>> {
        let mut complete = Vec::new();
        for value in values {
            match value.value_type {
                PDataValueType::Command => {
                    if self.awaiting_data.is_some() {
                        return Err(DimseError::DicomUl(
                            "command fragment received while awaiting data".to_string(),
                        ));
                    }
                    self.command.extend_from_slice(&value.data);
                    if value.is_last {
                        let command = CommandSet::decode(&std::mem::take(&mut self.command))?;
                        if command.has_dataset {
                            self.awaiting_data = Some((value.presentation_context_id, command));
                        } else {
                            complete.push(RawMessage {
                                presentation_context_id: value.presentation_context_id,
                                command,
                                data: None,
                            });
                        }
                    }
                }
                PDataValueType::Data => {
                    if self.awaiting_data.is_none() {
                        return Err(DimseError::DicomUl(
                            "data fragment received without a command".to_string(),
                        ));
                    }
                    self.data.extend_from_slice(&value.data);
                    if value.is_last {
                        if let Some((context_id, command)) = self.awaiting_data.take() {
                            complete.push(RawMessage {
                                presentation_context_id: context_id,
                                command,
                                data: Some(std::mem::take(&mut self.data)),
                            });
                        }
                    }
                }
            }
        }
        Ok(complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_dictionary_std::tags;

    fn values(pdus: Vec<Pdu>) -> Vec<PDataValue> {
        pdus.into_iter()
            .flat_map(|pdu| match pdu {
                Pdu::PData { data } => data,
                other => panic!("unexpected pdu {:?}", other),
            })
            .collect()
    }

    #[test]
    fn move_request_command_survives_encoding() {
        let command = CommandSet::move_rq(
            7,
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
            0,
            "QRPULL",
        );
        let decoded = CommandSet::decode(&command.encode().unwrap()).unwrap();

        assert_eq!(decoded.command_field, CommandField::CMoveRq);
        assert_eq!(decoded.message_id, Some(7));
        assert_eq!(decoded.move_destination.as_deref(), Some("QRPULL"));
        assert!(decoded.has_dataset);
    }

    #[test]
    fn response_carries_counts_and_status() {
        let request = CommandSet::move_rq(3, "1.2.3", 0, "DEST");
        let response = CommandSet::response_to(&request, 0xFF00)
            .with_sub_operations(SubOperationCounts::new(4, 1, 0, 0));
        let decoded = CommandSet::decode(&response.encode().unwrap()).unwrap();

        assert_eq!(decoded.command_field, CommandField::CMoveRsp);
        assert_eq!(decoded.message_id_being_responded_to, Some(3));
        assert_eq!(decoded.status, Some(0xFF00));
        assert_eq!(decoded.sub_operations.remaining, Some(4));
        assert_eq!(decoded.sub_operations.completed, Some(1));
        assert!(!decoded.has_dataset);
    }

    #[test]
    fn assembler_joins_fragmented_command_and_data() {
        let mut identifier = InMemDicomObject::new_empty();
        identifier.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            PrimitiveValue::from("X".repeat(3000).as_str()),
        ));
        let message = DimseMessage::new(1, CommandSet::find_rq(1, "1.2.3", 0))
            .with_dataset(identifier);
        let ts = transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();
        let pdus = message.to_pdus(ts, 1030).unwrap();
        assert!(pdus.len() > 2);

        let mut assembler = MessageAssembler::new();
        let mut complete = Vec::new();
        for value in values(pdus) {
            complete.extend(assembler.feed(vec![value]).unwrap());
        }
        assert_eq!(complete.len(), 1);

        let decoded = complete.remove(0).decode(ts).unwrap();
        assert_eq!(decoded.command.command_field, CommandField::CFindRq);
        let dataset = decoded.dataset.unwrap();
        assert_eq!(text(&dataset, tags::PATIENT_ID).map(|s| s.len()), Some(3000));
    }

    #[test]
    fn assembler_rejects_orphan_data() {
        let mut assembler = MessageAssembler::new();
        let result = assembler.feed(vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0, 1, 2],
        }]);
        assert!(result.is_err());
    }

    #[test]
    fn cancel_has_no_data_set() {
        let cancel = CommandSet::cancel_rq(9);
        let decoded = CommandSet::decode(&cancel.encode().unwrap()).unwrap();
        assert_eq!(decoded.command_field, CommandField::CCancelRq);
        assert_eq!(decoded.message_id_being_responded_to, Some(9));
        assert!(!decoded.has_dataset);
    }
}
