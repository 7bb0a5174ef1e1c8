#![allow(dead_code)]

use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::InMemDicomObject;
use dimse::message::{CommandField, SubOperationCounts};
use dimse::mock::{ScriptedPeer, ScriptedStep};
use dimse::PushedObject;
use qrpull::Config;

pub fn free_port() -> u16 {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("free port")
}

/// Config pointing at a scripted archive, receiver on a free loopback port
pub fn config(cache_dir: &Path, extra: &str) -> Config {
    let toml = format!(
        r#"
        [remote]
        ae_title = "ARCHIVE"
        host = "127.0.0.1"
        port = 11112

        [local]
        ae_title = "QRPULL"
        bind_addr = "127.0.0.1"
        port = {port}
        reply_timeout_ms = 2000
        failure_grace_ms = 50

        [cache]
        dir = "{dir}"

        {extra}
        "#,
        port = free_port(),
        dir = cache_dir.display(),
        extra = extra,
    );
    Config::from_toml(&toml).expect("test config")
}

pub fn echo_peer() -> ScriptedPeer {
    ScriptedPeer::new(vec![ScriptedStep::reply(CommandField::CEchoRsp, 0x0000)])
}

fn put(obj: &mut InMemDicomObject, tag: dicom_core::Tag, vr: VR, value: &str) {
    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
}

/// C-FIND identifier of one study
pub fn study(patient_id: &str, study_uid: &str, description: &str) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    put(&mut obj, tags::QUERY_RETRIEVE_LEVEL, VR::CS, "STUDY");
    put(&mut obj, tags::PATIENT_ID, VR::LO, patient_id);
    put(&mut obj, tags::STUDY_INSTANCE_UID, VR::UI, study_uid);
    put(&mut obj, tags::STUDY_DESCRIPTION, VR::LO, description);
    put(&mut obj, tags::STUDY_DATE, VR::DA, "20240105");
    put(&mut obj, tags::STUDY_TIME, VR::TM, "101500");
    put(&mut obj, tags::REFERRING_PHYSICIAN_NAME, VR::PN, "Tyszka^Mike");
    obj
}

/// Search that answers with the given studies, all as 0xFF00 matches
pub fn find_peer(studies: Vec<InMemDicomObject>) -> ScriptedPeer {
    let mut steps: Vec<_> = studies
        .into_iter()
        .map(|s| ScriptedStep::find_match(0xFF00, s))
        .collect();
    steps.push(ScriptedStep::reply(CommandField::CFindRsp, 0x0000));
    ScriptedPeer::new(steps)
}

/// MR image as an archive would push it
pub fn mr_image(patient_id: &str, sop_instance_uid: &str, description: &str) -> PushedObject {
    let mut dataset = InMemDicomObject::new_empty();
    put(&mut dataset, tags::SOP_CLASS_UID, VR::UI, uids::MR_IMAGE_STORAGE);
    put(&mut dataset, tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid);
    put(&mut dataset, tags::PATIENT_ID, VR::LO, patient_id);
    put(&mut dataset, tags::STUDY_INSTANCE_UID, VR::UI, "1.2.826.0.1.1");
    put(&mut dataset, tags::SERIES_INSTANCE_UID, VR::UI, "1.2.826.0.1.1.1");
    put(&mut dataset, tags::SERIES_DATE, VR::DA, "20240105");
    put(&mut dataset, tags::SERIES_DESCRIPTION, VR::LO, description);
    PushedObject::from_dataset(dataset, uids::EXPLICIT_VR_LITTLE_ENDIAN).expect("object")
}

pub fn move_done(completed: u16) -> ScriptedStep {
    ScriptedStep::move_status(0x0000, SubOperationCounts::new(0, completed, 0, 0))
}

pub fn move_pending(remaining: u16, completed: u16) -> ScriptedStep {
    ScriptedStep::move_status(0xFF00, SubOperationCounts::new(remaining, completed, 0, 0))
}

/// File names directly below `dir`, sorted
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
