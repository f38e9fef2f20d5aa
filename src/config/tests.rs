use super::*;

use crate::admission::InvalidRulePolicy;

fn parse(args: &[&str]) -> CliArgs {
    CliArgs::try_parse_from(args).expect("valid arguments")
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.page_cache.ttl_seconds = Some(600);
    raw.logging.level = Some("info".to_string());

    let overrides = Overrides {
        cache_ttl_seconds: Some(120),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.page_cache.ttl_seconds, 120);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_match_component_defaults() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    assert_eq!(settings.page_cache, CacheConfig::default());
    assert_eq!(settings.admission, AdmissionConfig::default());
    assert_eq!(settings.object_cache, ObjectCacheConfig::default());
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = Overrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn zero_ttl_is_rejected() {
    let mut raw = RawSettings::default();
    raw.page_cache.ttl_seconds = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero ttl");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "page_cache.ttl_seconds",
            ..
        }
    ));
}

#[test]
fn payload_bounds_must_be_ordered() {
    let mut raw = RawSettings::default();
    raw.page_cache.min_payload_bytes = Some(1024);
    raw.page_cache.max_payload_bytes = Some(512);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn site_hosts_are_normalized() {
    let mut raw = RawSettings::default();
    raw.page_cache.site_hosts = Some(vec![" Example.COM ".to_string(), String::new()]);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.page_cache.site_hosts, vec!["example.com".to_string()]);
}

#[test]
fn backend_names_are_parsed() {
    let mut raw = RawSettings::default();
    raw.object_cache.backend = Some("APCu".to_string());
    raw.object_cache.port = Some(6380);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.object_cache.backend, BackendChoice::Shared);
    assert_eq!(settings.object_cache.port, Some(6380));

    let mut raw = RawSettings::default();
    raw.object_cache.backend = Some("couchbase".to_string());
    let err = Settings::from_raw(raw).expect_err("unknown backend");
    assert!(err.to_string().contains("couchbase"));
}

#[test]
fn empty_namespace_is_rejected() {
    let mut raw = RawSettings::default();
    raw.object_cache.namespace = Some("  ".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn admission_section_deserializes_through_config() {
    let raw: RawSettings = Config::builder()
        .add_source(config::File::from_str(
            r#"
[admission]
cache_feeds = true
invalid_rule_policy = "fail_closed"

[admission.rules]
cookies = ["comment_author_*"]
ips = ["10.0.0.0/8"]

[object_cache]
backend = "memory"
namespace = "blog"
"#,
            config::FileFormat::Toml,
        ))
        .build()
        .expect("config builds")
        .try_deserialize()
        .expect("config deserializes");
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(settings.admission.cache_feeds);
    assert_eq!(
        settings.admission.invalid_rule_policy,
        InvalidRulePolicy::FailClosed
    );
    assert_eq!(
        settings.admission.rules.cookies,
        vec!["comment_author_*".to_string()]
    );
    assert_eq!(settings.object_cache.backend, BackendChoice::Memory);
    assert_eq!(settings.object_cache.namespace, "blog");
}

#[test]
fn parse_purge_url_arguments() {
    let args = parse(&["sitecache", "purge-url", "https://example.com/blog/"]);
    match args.command {
        Command::PurgeUrl(purge) => assert_eq!(purge.url, "https://example.com/blog/"),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn parse_invalidate_arguments() {
    let args = parse(&["sitecache", "invalidate", "42", "--deleted"]);
    let Command::Invalidate(invalidate) = args.command else {
        panic!("expected invalidate command");
    };
    assert_eq!(invalidate.id, 42);
    assert!(invalidate.deleted);
    assert!(!invalidate.term);

    assert!(CliArgs::try_parse_from(["sitecache", "invalidate", "3", "--term", "--deleted"]).is_err());
}

#[test]
fn parse_check_arguments() {
    let args = parse(&[
        "sitecache",
        "check",
        "https://example.com/?s=term",
        "--method",
        "POST",
        "--cookie",
        "a=1",
        "--cookie",
        "b=2",
        "--ip",
        "10.1.2.3",
        "--ajax",
    ]);
    let Command::Check(check) = args.command else {
        panic!("expected check command");
    };
    assert_eq!(check.method, "POST");
    assert_eq!(check.cookies, vec!["a=1".to_string(), "b=2".to_string()]);
    assert_eq!(check.client_ip, Some("10.1.2.3".parse().unwrap()));
    assert!(check.ajax);
    assert!(check.role.is_none());
}

#[test]
fn global_overrides_follow_the_subcommand() {
    let args = parse(&[
        "sitecache",
        "probe",
        "--object-cache-backend",
        "redis",
        "--object-cache-port",
        "6380",
        "--log-json",
        "true",
    ]);
    assert!(matches!(args.command, Command::Probe));
    assert_eq!(args.overrides.object_cache_backend, Some(BackendArg::Redis));
    assert_eq!(args.overrides.object_cache_port, Some(6380));
    assert_eq!(args.overrides.log_json, Some(true));
}

#[test]
fn subcommand_is_required() {
    assert!(CliArgs::try_parse_from(["sitecache"]).is_err());
}
