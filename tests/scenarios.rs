//! End-to-end search and retrieval against a scripted archive

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use dimse::message::{CommandField, SubOperationCounts};
use dimse::mock::{ScriptedConnector, ScriptedPeer, ScriptedStep};
use dimse::{FailureReason, FilesystemStore, QueryKey, RemoteNode};
use qrpull::storage::CacheDir;
use qrpull::Workflow;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn search_skips_unprocessable_replies() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir.path().join("dicom"), "[query]\npatient_id = \"QC*\"\n");
    assert_eq!(
        config.query.to_find_query().matching[&QueryKey::PatientId],
        "QC*"
    );

    let mut refused = dicom_object::InMemDicomObject::new_empty();
    refused.put(dicom_core::DataElement::new(
        dicom_dictionary_std::tags::PATIENT_ID,
        dicom_core::VR::LO,
        dicom_core::PrimitiveValue::from("QC099"),
    ));
    let connector = ScriptedConnector::new().accept(echo_peer()).accept(ScriptedPeer::new(vec![
        ScriptedStep::find_match(0xFF00, study("QC001", "1.2.826.0.1.1", "Brain")),
        ScriptedStep::find_match(0xC000, refused),
        ScriptedStep::find_match(0xFF00, study("QC002", "1.2.826.0.1.2", "Brain")),
        ScriptedStep::reply(CommandField::CFindRsp, 0x0000),
    ]));
    let log = connector.log();
    let workflow = Workflow::new(config).with_connector(Arc::new(connector));

    let csv = dir.path().join("StudyList.csv");
    let ledger = workflow.find(Some(&csv)).await.unwrap();

    let ids: Vec<_> = ledger.matches().map(|r| r.patient_id.clone()).collect();
    assert_eq!(ids, vec!["QC001", "QC002"]);
    let skipped: Vec<_> = ledger.skipped().collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].status, 0xC000);
    assert_eq!(skipped[0].identifier.as_deref(), Some("QC099"));

    let text = std::fs::read_to_string(&csv).unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[1].starts_with("QC001,Brain,20240105,101500,Tyszka^Mike,"));
    assert!(lines[2].starts_with("QC099,"));
    assert!(lines[2].ends_with("skipped 0xC000: unable to process"));
    assert!(lines[3].starts_with("QC002,"));

    // Echo and search each ran on their own association, both released
    assert_eq!(log.opened(), 2);
    assert_eq!(log.released(), 2);
    assert_eq!(log.aborted(), 0);
    let requests = log.requests();
    assert_eq!(requests[0].command_field, CommandField::CEchoRq);
    assert_eq!(requests[1].command_field, CommandField::CFindRq);
}

#[tokio::test]
async fn retrieval_stores_pushed_objects() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("dicom");
    let config = config(&cache_dir, "");
    let store = Arc::new(FilesystemStore::new(&cache_dir));

    let connector = ScriptedConnector::new()
        .accept(echo_peer())
        .accept(find_peer(vec![study("QC001", "1.2.826.0.1.1", "Brain")]))
        .accept(
            ScriptedPeer::new(vec![
                ScriptedStep::Push(mr_image("QC001", "1.2.826.0.1.1.1.1", "T1w")),
                move_pending(1, 1),
                ScriptedStep::Push(mr_image("QC001", "1.2.826.0.1.1.1.2", "T2w")),
                move_done(2),
            ])
            .with_store(store),
        );
    let log = connector.log();
    let workflow = Workflow::new(config).with_connector(Arc::new(connector));

    let report = workflow.pull(None).await.unwrap();

    assert_eq!(report.batch.outcomes.len(), 1);
    let outcome = &report.batch.outcomes[0];
    assert!(outcome.is_success(), "{:?}", outcome);
    assert_eq!(outcome.completed, 2);
    assert_eq!(outcome.failed, 0);
    assert!(report.batch.is_clean());

    assert_eq!(
        file_names(&cache_dir),
        vec![
            "sub-QC001_ses-20240105_T1w_1.2.826.0.1.1.1.1.dcm",
            "sub-QC001_ses-20240105_T2w_1.2.826.0.1.1.1.2.dcm",
        ]
    );
    assert_eq!(CacheDir::new(&cache_dir).count_files().unwrap(), 2);
    assert_eq!(log.pushed().len(), 2);

    let requests = log.requests();
    let moves: Vec<_> = requests
        .iter()
        .filter(|r| r.command_field == CommandField::CMoveRq)
        .collect();
    assert_eq!(moves.len(), 1);
    assert_eq!(moves[0].move_destination.as_deref(), Some("QRPULL"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn receiver_accepts_pushes_while_the_move_drains() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("dicom");
    let config = config(&cache_dir, "");
    let receiver = RemoteNode::new(config.local.local_aet.clone(), "127.0.0.1", config.local.port);

    let connector = ScriptedConnector::new()
        .accept(echo_peer())
        .accept(find_peer(vec![study("QC001", "1.2.826.0.1.1", "Brain")]))
        .accept(
            ScriptedPeer::new(vec![
                ScriptedStep::Push(mr_image("QC001", "1.2.826.0.1.1.1.1", "T1w")),
                move_pending(1, 1),
                ScriptedStep::Push(mr_image("QC001", "1.2.826.0.1.1.1.2", "T2w")),
                move_done(2),
            ])
            .pushing_to(receiver),
        );
    let log = connector.log();
    let workflow = Workflow::new(config).with_connector(Arc::new(connector));

    let report = workflow.pull(None).await.unwrap();

    assert!(report.batch.is_clean(), "{:?}", report.batch.outcomes);
    assert_eq!(
        log.forwarded(),
        vec![
            ("1.2.826.0.1.1.1.1".to_string(), 0x0000),
            ("1.2.826.0.1.1.1.2".to_string(), 0x0000),
        ]
    );
    assert!(log.pushed().is_empty());
    assert_eq!(report.batch.receiver.stored.len(), 2);
    assert!(report.batch.receiver.failures.is_empty());
    assert_eq!(
        file_names(&cache_dir),
        vec![
            "sub-QC001_ses-20240105_T1w_1.2.826.0.1.1.1.1.dcm",
            "sub-QC001_ses-20240105_T2w_1.2.826.0.1.1.1.2.dcm",
        ]
    );
}

#[tokio::test]
async fn unknown_destination_fails_without_files() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("dicom");
    let config = config(&cache_dir, "");

    let connector = ScriptedConnector::new()
        .accept(echo_peer())
        .accept(find_peer(vec![
            study("QC001", "1.2.826.0.1.1", "Brain"),
            study("QC002", "1.2.826.0.1.2", "Brain"),
        ]))
        .accept(ScriptedPeer::new(vec![ScriptedStep::reply(
            CommandField::CMoveRsp,
            0xA801,
        )]));
    let log = connector.log();
    let workflow = Workflow::new(config).with_connector(Arc::new(connector));

    let report = workflow.pull(None).await.unwrap();

    assert_eq!(report.batch.outcomes.len(), 1);
    assert_eq!(
        report.batch.outcomes[0].reason(),
        Some(&FailureReason::DestinationUnknown)
    );
    assert_eq!(report.batch.outcomes[0].status, Some(0xA801));
    assert_eq!(CacheDir::new(&cache_dir).count_files().unwrap(), 0);

    // The second study is not moved to the same unknown destination
    assert_eq!(report.batch.not_attempted.len(), 1);
    assert!(report.batch.destination_error("QRPULL").is_some());
    assert_eq!(log.opened(), 3);
}

#[tokio::test]
async fn failed_target_does_not_stop_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("dicom");
    let config = config(
        &cache_dir,
        "[retrieve]\nallow_list = [\"QC001\", \"1.2.826.0.1.3\"]\n",
    );
    let store = Arc::new(FilesystemStore::new(&cache_dir));

    let connector = ScriptedConnector::new()
        .accept(echo_peer())
        .accept(find_peer(vec![
            study("QC001", "1.2.826.0.1.1", "Brain"),
            study("QC002", "1.2.826.0.1.2", "Brain"),
            study("QC003", "1.2.826.0.1.3", "Brain"),
        ]))
        .accept(ScriptedPeer::new(vec![ScriptedStep::move_status(
            0xA702,
            SubOperationCounts::new(0, 0, 1, 0),
        )]))
        .accept(
            ScriptedPeer::new(vec![
                ScriptedStep::Push(mr_image("QC003", "1.2.826.0.1.3.1.1", "T1w")),
                move_done(1),
            ])
            .with_store(store),
        );
    let workflow = Workflow::new(config).with_connector(Arc::new(connector));

    let report = workflow.pull(None).await.unwrap();

    let targets: Vec<_> = report
        .batch
        .outcomes
        .iter()
        .map(|o| o.target.patient_id.clone().unwrap_or_default())
        .collect();
    assert_eq!(targets, vec!["QC001", "QC003"]);
    assert_eq!(
        report.batch.outcomes[0].reason(),
        Some(&FailureReason::SubOperationFailure)
    );
    assert_eq!(report.batch.outcomes[0].failed, 1);
    assert!(report.batch.outcomes[1].is_success());
    assert_eq!(report.batch.succeeded(), 1);
    assert_eq!(report.batch.failed(), 1);
    assert_eq!(file_names(&cache_dir).len(), 1);
}

#[tokio::test]
async fn cancellation_mid_transfer_aborts_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = dir.path().join("dicom");
    let config = config(&cache_dir, "");

    let connector = ScriptedConnector::new()
        .accept(echo_peer())
        .accept(find_peer(vec![
            study("QC001", "1.2.826.0.1.1", "Brain"),
            study("QC002", "1.2.826.0.1.2", "Brain"),
        ]))
        .accept(
            ScriptedPeer::new(vec![
                move_pending(3, 0),
                move_pending(2, 1),
                move_pending(1, 2),
                move_done(3),
            ])
            .with_reply_delay(Duration::from_millis(300)),
        );
    let log = connector.log();

    let cancel = CancellationToken::new();
    let workflow = Workflow::new(config)
        .with_connector(Arc::new(connector))
        .with_cancellation(cancel.clone());

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(450)).await;
        cancel.cancel();
    });
    let report = workflow.pull(None).await.unwrap();
    trigger.await.unwrap();

    assert!(report.batch.cancelled);
    assert_eq!(report.batch.outcomes.len(), 1);
    assert_eq!(
        report.batch.outcomes[0].reason(),
        Some(&FailureReason::Cancelled)
    );
    assert_eq!(report.batch.not_attempted.len(), 1);
    assert_eq!(log.aborted(), 1);
    assert_eq!(log.opened(), 3);
}
