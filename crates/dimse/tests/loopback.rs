//! Drives the network association against a real Store Receiver on loopback.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::InMemDicomObject;
use dimse::{DimseConfig, DimseError, DimseScu, FilesystemStore, PushedObject, RemoteNode, StoreScp};

fn free_port() -> u16 {
    std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("free port")
}

fn receiver_config(port: u16, dir: &std::path::Path) -> DimseConfig {
    DimseConfig {
        local_aet: "QRPULL".to_string(),
        bind_addr: Ipv4Addr::LOCALHOST.into(),
        port,
        storage_dir: dir.to_path_buf(),
        reply_timeout_ms: 5_000,
        connect_timeout_ms: 5_000,
        ..Default::default()
    }
}

fn mr_object(sop_instance_uid: &str) -> PushedObject {
    let mut dataset = InMemDicomObject::new_empty();
    for (tag, vr, value) in [
        (tags::SOP_CLASS_UID, VR::UI, uids::MR_IMAGE_STORAGE),
        (tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid),
        (tags::PATIENT_ID, VR::LO, "QC001"),
        (tags::STUDY_INSTANCE_UID, VR::UI, "1.2.826.0.1.1"),
        (tags::SERIES_INSTANCE_UID, VR::UI, "1.2.826.0.1.1.1"),
        (tags::SERIES_DATE, VR::DA, "20240105"),
        (tags::SERIES_DESCRIPTION, VR::LO, "T1w"),
    ] {
        dataset.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    }
    PushedObject::from_dataset(dataset, uids::EXPLICIT_VR_LITTLE_ENDIAN).expect("object")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_and_store_over_loopback() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = receiver_config(port, dir.path());
    let receiver = StoreScp::new(config.clone(), Arc::new(FilesystemStore::new(dir.path())))
        .start()
        .await
        .unwrap();

    let scu = DimseScu::new(DimseConfig {
        local_aet: "LOOPBACK_SCU".to_string(),
        ..config
    });
    let node = RemoteNode::new("QRPULL", "127.0.0.1", port);

    scu.echo(&node).await.unwrap();

    let status = scu.store(&node, &mr_object("1.2.826.0.1.1.1.1")).await.unwrap();
    assert_eq!(status, 0x0000);
    let status = scu.store(&node, &mr_object("1.2.826.0.1.1.1.2")).await.unwrap();
    assert_eq!(status, 0x0000);
    // Same object again: acknowledged and written over the first copy.
    let status = scu.store(&node, &mr_object("1.2.826.0.1.1.1.1")).await.unwrap();
    assert_eq!(status, 0x0000);

    let report = receiver.stop().await;
    assert_eq!(report.stored.len(), 3);
    assert!(report.failures.is_empty());

    let files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(files.len(), 2, "files: {:?}", files);
    assert!(files.contains(&"sub-QC001_ses-20240105_T1w_1.2.826.0.1.1.1.1.dcm".to_string()));
}

#[tokio::test]
async fn nothing_listening_fails_fast() {
    let scu = DimseScu::new(DimseConfig {
        connect_timeout_ms: 2_000,
        ..Default::default()
    });
    let node = RemoteNode::new("NOBODY", "127.0.0.1", free_port());

    let err = scu.echo(&node).await.unwrap_err();
    assert!(
        matches!(err, DimseError::ConnectionLost(_) | DimseError::Timeout(_)),
        "unexpected error {:?}",
        err
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_waits_for_nothing_when_idle() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = StoreScp::new(
        receiver_config(free_port(), dir.path()),
        Arc::new(FilesystemStore::new(dir.path())),
    )
    .start()
    .await
    .unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), receiver.stop())
        .await
        .expect("stop returns promptly");
    assert!(report.stored.is_empty());
}
