use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.store.url = Some("redis://cache-a:6379/0".to_string());
    raw.logging.level = Some("info".to_string());

    let overrides = GlobalOverrides {
        store_url: Some("redis://cache-b:6379/1".to_string()),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_global_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.store.url, "redis://cache-b:6379/1");
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    assert_eq!(settings.store.url, DEFAULT_STORE_URL);
    assert_eq!(settings.cache.namespace, "");
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = GlobalOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_global_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn namespace_override_reaches_cache_config() {
    let mut raw = RawSettings::default();
    raw.apply_global_overrides(&GlobalOverrides {
        cache_namespace: Some("blog:".to_string()),
        ..Default::default()
    });
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.namespace, "blog:");
}

#[test]
fn govern_overrides_apply_to_governor() {
    let mut raw = RawSettings::default();
    raw.apply_govern_overrides(&GovernArgs {
        once: false,
        interval_seconds: Some(60),
        memory_threshold: Some(0.5),
    });
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.governor.interval_secs, 60);
    assert!((settings.cache.governor.memory_threshold - 0.5).abs() < f64::EPSILON);
}

#[test]
fn rejects_non_redis_store_url() {
    let mut raw = RawSettings::default();
    raw.store.url = Some("http://localhost:6379".to_string());
    let err = Settings::from_raw(raw).expect_err("must reject");
    assert!(matches!(err, LoadError::Invalid { key: "store.url", .. }));
}

#[test]
fn rejects_unparseable_log_level() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());
    let err = Settings::from_raw(raw).expect_err("must reject");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "logging.level",
            ..
        }
    ));
}

#[test]
fn rejects_quotas_above_the_ceiling() {
    let mut raw = RawSettings::default();
    raw.cache.governor.quotas.insert("article".to_string(), 0.9);
    let err = Settings::from_raw(raw).expect_err("must reject");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.governor.quotas",
            ..
        }
    ));
}

#[test]
fn rejects_unknown_quota_category() {
    let mut raw = RawSettings::default();
    raw.cache.governor.quotas.clear();
    raw.cache
        .governor
        .quotas
        .insert("thumbnail".to_string(), 0.1);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn rejects_out_of_range_threshold() {
    let mut raw = RawSettings::default();
    raw.cache.governor.memory_threshold = 1.5;
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn parse_govern_arguments() {
    let args = CliArgs::parse_from([
        "cachekeeper",
        "--store-url",
        "redis://10.0.0.5:6379/2",
        "govern",
        "--once",
        "--interval-seconds",
        "120",
    ]);

    assert_eq!(
        args.overrides.store_url.as_deref(),
        Some("redis://10.0.0.5:6379/2")
    );
    match args.command {
        Command::Govern(govern) => {
            assert!(govern.once);
            assert_eq!(govern.interval_seconds, Some(120));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn parse_memory_arguments() {
    let args = CliArgs::parse_from(["cachekeeper", "memory", "--json"]);
    match args.command {
        Command::Memory(memory) => assert!(memory.json),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn parse_flush_arguments() {
    let args = CliArgs::parse_from(["cachekeeper", "flush", "image:cover:*"]);
    match args.command {
        Command::Flush(flush) => assert_eq!(flush.pattern, "image:cover:*"),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn subcommand_is_required() {
    assert!(CliArgs::try_parse_from(["cachekeeper"]).is_err());
}
