#![cfg(test)]

use std::io::Write;
use std::path::Path;

use dimse::{QueryKey, QueryLevel, QueryRoot};

use crate::config::config::{Config, ConfigError};

/// Parse a TOML string into a `Config` and run the project's validation logic.
fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let cfg: Config = toml::from_str(toml_str).expect("TOML parse error");
    cfg.validate()?;
    Ok(cfg)
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml = r#"
        [remote]
        host = "10.0.0.5"
    "#;

    let config = load_config_from_str(toml).expect("minimal config is valid");

    assert_eq!(config.remote.port, 11112);
    assert_eq!(config.remote.ae_title, "ANY-SCP");
    assert_eq!(config.local.local_aet, "QRPULL");
    assert_eq!(config.local.port, 11113);
    assert_eq!(config.output_dir(), Path::new("./dicom"));
    assert_eq!(config.query.level, QueryLevel::Study);
    assert_eq!(config.query.patient_id, "*");
    assert!(config.retrieve.halt_on_destination_unknown);
    assert!(!config.ingest.enabled);
    assert_eq!(config.ingest.program, "fw");
    assert!(config.routes.is_empty());
    assert_eq!(config.logging.log_level, "info");
}

#[test]
fn test_full_config() {
    let toml = r#"
        [remote]
        ae_title = "HOROS"
        host = "archive.local"
        port = 4242
        connect_timeout_ms = 5000

        [local]
        ae_title = "QCPULL"
        bind_addr = "127.0.0.1"
        port = 11120
        max_associations = 4

        [query]
        level = "SERIES"
        root = "patient"
        patient_id = "QC*"
        series_description = "*T1*"
        optional_keys_pending_is_match = false

        [retrieve]
        allow_list = ["QC001", "QC002"]
        halt_on_destination_unknown = false

        [cache]
        dir = "/tmp/qrpull-cache"
        clear_before_batch = true

        [ingest]
        enabled = true
        program = "fw"

        [[routes]]
        patient_id_prefix = "QC"
        referring_physician = "Tyszka^Mike"
        group = "caltech"
        project = "qc"

        [logging]
        log_level = "debug"
    "#;

    let config = load_config_from_str(toml).expect("full config is valid");

    let node = config.remote_node();
    assert_eq!(node.address(), "HOROS@archive.local:4242");
    assert_eq!(node.connect_timeout_ms, Some(5000));

    let dimse = config.dimse_config();
    assert_eq!(dimse.local_aet, "QCPULL");
    assert_eq!(dimse.port, 11120);
    assert_eq!(dimse.max_associations, 4);
    assert_eq!(dimse.storage_dir, Path::new("/tmp/qrpull-cache"));
    assert!(!dimse.optional_keys_pending_is_match);

    let query = config.query.to_find_query();
    assert_eq!(query.query_level, QueryLevel::Series);
    assert_eq!(query.root, QueryRoot::Patient);
    assert_eq!(query.matching[&QueryKey::SeriesDescription], "*T1*");
    assert_eq!(query.matching[&QueryKey::PatientId], "QC*");

    assert_eq!(config.routes.len(), 1);
    assert_eq!(config.routes[0].label(), "caltech/qc");
    let route_query = config.routes[0].to_find_query(config.query.root);
    assert_eq!(route_query.matching[&QueryKey::PatientId], "QC*");
    assert_eq!(
        route_query.matching[&QueryKey::ReferringPhysicianName],
        "Tyszka^Mike"
    );
}

#[test]
fn test_study_query_from_config() {
    let toml = r#"
        [remote]
        host = "127.0.0.1"

        [query]
        patient_id = "QC"
        referring_physician = "Tyszka^Mike"
        study_description = "Brain*"
    "#;

    let config = load_config_from_str(toml).unwrap();
    let query = config.query.to_find_query();

    assert_eq!(query.query_level, QueryLevel::Study);
    assert_eq!(query.matching[&QueryKey::PatientId], "QC*");
    assert_eq!(query.matching[&QueryKey::StudyDescription], "Brain*");
    assert!(query.return_keys.contains(&QueryKey::StudyInstanceUid));
    assert!(!query.return_keys.contains(&QueryKey::StudyDescription));
}

#[test]
fn test_missing_remote_is_a_parse_error() {
    let result: Result<Config, _> = toml::from_str("[local]\nport = 11113\n");
    assert!(result.is_err());
}

#[test]
fn test_invalid_remote_ae_title() {
    let toml = r#"
        [remote]
        ae_title = "THIS_TITLE_IS_WAY_TOO_LONG"
        host = "127.0.0.1"
    "#;

    assert!(matches!(
        load_config_from_str(toml),
        Err(ConfigError::InvalidRemote(_))
    ));
}

#[test]
fn test_invalid_local_port() {
    let toml = r#"
        [remote]
        host = "127.0.0.1"

        [local]
        port = 0
    "#;

    assert!(matches!(
        load_config_from_str(toml),
        Err(ConfigError::InvalidLocal(_))
    ));
}

#[test]
fn test_image_level_search_rejected() {
    let toml = r#"
        [remote]
        host = "127.0.0.1"

        [query]
        level = "IMAGE"
    "#;

    assert!(matches!(
        load_config_from_str(toml),
        Err(ConfigError::InvalidQuery(_))
    ));
}

#[test]
fn test_route_without_project_rejected() {
    let toml = r#"
        [remote]
        host = "127.0.0.1"

        [[routes]]
        patient_id_prefix = "QC"
        group = "caltech"
        project = ""
    "#;

    assert!(matches!(
        load_config_from_str(toml),
        Err(ConfigError::InvalidRoute { index: 0, .. })
    ));
}

#[test]
fn test_unknown_log_level_rejected() {
    let toml = r#"
        [remote]
        host = "127.0.0.1"

        [logging]
        log_level = "chatty"
    "#;

    assert!(matches!(
        load_config_from_str(toml),
        Err(ConfigError::InvalidLogging(_))
    ));
}

#[test]
fn test_allow_list_merges_inline_and_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "QC003,2024-01-05,T1w").unwrap();
    writeln!(file).unwrap();
    writeln!(file, "  \"QC004\"  ").unwrap();
    writeln!(file, "QC001").unwrap();

    let toml = format!(
        r#"
        [remote]
        host = "127.0.0.1"

        [retrieve]
        allow_list = ["QC001", "QC002"]
        allow_list_file = "{}"
        "#,
        file.path().display()
    );

    let config = load_config_from_str(&toml).unwrap();
    let allowed = config.retrieve.load_allow_list().unwrap().unwrap();

    let mut ids: Vec<_> = allowed.into_iter().collect();
    ids.sort();
    assert_eq!(ids, vec!["QC001", "QC002", "QC003", "QC004"]);
}

#[test]
fn test_no_allow_list_means_unrestricted() {
    let config = load_config_from_str("[remote]\nhost = \"127.0.0.1\"\n").unwrap();
    assert!(config.retrieve.load_allow_list().unwrap().is_none());
}

#[test]
fn test_missing_allow_list_file() {
    let toml = r#"
        [remote]
        host = "127.0.0.1"

        [retrieve]
        allow_list_file = "/nonexistent/qrpull/allow.csv"
    "#;

    let config = load_config_from_str(toml).unwrap();
    assert!(matches!(
        config.retrieve.load_allow_list(),
        Err(ConfigError::AllowList { .. })
    ));
}

#[test]
fn test_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("qrpull.toml");
    std::fs::write(&path, "[remote]\nhost = \"127.0.0.1\"\nport = 104\n").unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.remote.port, 104);

    assert!(matches!(
        Config::from_file(dir.path().join("missing.toml")),
        Err(ConfigError::Read { .. })
    ));
}

#[test]
fn test_example_config_is_valid() {
    let config = load_config_from_str(include_str!("../../qrpull.example.toml"))
        .expect("example config is valid");
    assert_eq!(config.remote.ae_title, "HOROS");
    assert_eq!(config.routes.len(), 1);
    assert_eq!(config.ingest.args.len(), 6);
}
