use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use chrono_tz::UTC;
use detectlab::{
    assert_spec_compatible, build_feature_table, canonicalize, canonicalize_kind, split_dataset,
    CanonicalTable, ConfigError, EntityKey, EventKind, EventTable, FeatureConfig, FeatureError,
    FeatureTable, SchemaError, SplitConfig, Value, FEATURE_SPEC_VERSION,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use regex::Regex;

const LOGIN_COLUMNS: [&str; 13] = [
    "event_id",
    "event_ts",
    "user_id",
    "session_id",
    "ip_hash",
    "device_fingerprint_hash",
    "login_result",
    "support_contacted",
    "support_cost_usd",
    "label_replicators",
    "label_the_mule",
    "label_the_chameleon",
    "label_benign",
];

const CHECKOUT_COLUMNS: [&str; 9] = [
    "event_id",
    "event_ts",
    "user_id",
    "ip_hash",
    "device_fingerprint_hash",
    "payment_value",
    "basket_size",
    "credit_card_hash",
    "checkout_result",
];

#[test]
fn login_columns_are_keys_labels_then_sorted_features() {
    let logins = canonical_logins(&sample_logins());
    let cfg = config(&["1h"], &[EntityKey::User]);

    let table = build_feature_table(EventKind::LoginAttempt, &logins, None, &cfg)
        .expect("feature build succeeds");

    assert_eq!(
        table.key_columns(),
        ["event_id", "event_ts", "user_id", "session_id"]
    );
    assert_eq!(
        table.label_columns(),
        [
            "label_replicators",
            "label_the_mule",
            "label_the_chameleon",
            "label_benign",
            "is_fraud"
        ]
    );
    assert_eq!(
        table.feature_columns(),
        [
            "user_1h__attempt_cnt",
            "user_1h__challenge_cnt",
            "user_1h__challenge_rate",
            "user_1h__failure_cnt",
            "user_1h__failure_rate",
            "user_1h__lockout_cnt",
            "user_1h__lockout_rate",
            "user_1h__success_cnt",
            "user_1h__success_rate",
            "user_1h__support_contacted_cnt",
            "user_1h__support_cost_usd_sum",
            "user_1h__uniq_device_fingerprint_hash_cnt",
            "user_1h__uniq_ip_hash_cnt",
        ]
    );
    assert_eq!(table.len(), logins.len());
}

#[test]
fn login_features_are_strictly_past_only() {
    let logins = canonical_logins(&sample_logins());
    let cfg = config(&["1h"], &[EntityKey::User]);
    let table = build_feature_table(EventKind::LoginAttempt, &logins, None, &cfg)
        .expect("feature build succeeds");

    assert_eq!(
        table.column("user_1h__attempt_cnt").expect("column"),
        vec![0.0, 1.0, 0.0, 2.0]
    );
    assert_close(value(&table, "a2", "user_1h__failure_rate"), 0.5);
    assert_close(value(&table, "a2", "user_1h__success_rate"), 0.5);
    assert_close(value(&table, "a0", "user_1h__failure_rate"), 0.0);
    assert_close(value(&table, "a1", "user_1h__support_contacted_cnt"), 1.0);
    assert_close(value(&table, "a2", "user_1h__support_cost_usd_sum"), 2.5);
    assert_close(value(&table, "a2", "user_1h__uniq_ip_hash_cnt"), 2.0);
    assert_close(value(&table, "b0", "user_1h__attempt_cnt"), 0.0);

    let is_fraud = table.label("is_fraud").expect("derived label");
    let a0 = table.rows().iter().position(|r| r.event_id == "a0").expect("row");
    assert!(is_fraud[a0]);
    assert_eq!(is_fraud.iter().filter(|f| **f).count(), 1);
}

#[test]
fn feature_values_never_contain_nan_or_infinity() {
    let logins = canonical_logins(&sample_logins());
    let checkouts = canonical_checkouts(&sample_checkouts());

    for (kind, primary, secondary) in [
        (EventKind::LoginAttempt, &logins, &checkouts),
        (EventKind::CheckoutAttempt, &checkouts, &logins),
    ] {
        let table = build_feature_table(kind, primary, Some(secondary), &FeatureConfig::default())
            .expect("feature build succeeds");
        for row in table.rows() {
            assert!(row.values.iter().all(|v| v.is_finite()), "{}", row.event_id);
        }
    }
}

#[test]
fn inclusive_mode_counts_the_current_row_and_drops_distinct_counts() {
    let logins = canonical_logins(&sample_logins());
    let mut cfg = config(&["1h"], &[EntityKey::User]);
    cfg.strict_past_only = false;

    let table = build_feature_table(EventKind::LoginAttempt, &logins, None, &cfg)
        .expect("feature build succeeds");

    assert_close(value(&table, "a0", "user_1h__attempt_cnt"), 1.0);
    assert_close(value(&table, "a2", "user_1h__attempt_cnt"), 3.0);
    assert!(table
        .feature_columns()
        .iter()
        .all(|c| !c.contains("__uniq_")));
    assert!(!table.spec().strict_past_only);
}

#[test]
fn optional_feature_groups_follow_flags_and_available_columns() {
    let logins = canonical_logins(&sample_logins());
    let mut cfg = FeatureConfig::default();
    cfg.include_support = false;

    let table = build_feature_table(EventKind::LoginAttempt, &logins, None, &cfg)
        .expect("feature build succeeds");
    assert!(table.feature_columns().iter().all(|c| !c.contains("support_")));
    assert!(table.column("device_7d__uniq_user_id_cnt").is_some());

    let mut raw = EventTable::new(
        "login_attempt",
        ["event_id", "event_ts", "user_id", "login_result"],
    );
    raw.push_record([
        ("event_id", Value::from("x0")),
        ("event_ts", Value::from("2025-12-01T00:00:00Z")),
        ("user_id", Value::from("u1")),
        ("login_result", Value::from("success")),
    ])
    .expect("record matches columns");
    let bare = canonicalize_kind(&raw, EventKind::LoginAttempt, UTC).expect("canonicalize");

    let table = build_feature_table(EventKind::LoginAttempt, &bare, None, &FeatureConfig::default())
        .expect("feature build succeeds");
    assert!(table.feature_columns().iter().all(|c| c.starts_with("user_")));
    assert_eq!(table.key_columns(), ["event_id", "event_ts", "user_id"]);
    assert_eq!(table.label_columns(), ["is_fraud"]);
    assert_eq!(table.label("is_fraud").expect("label"), vec![false]);
}

#[test]
fn checkout_features_include_amounts_and_adverse_outcomes() {
    let checkouts = canonical_checkouts(&sample_checkouts());
    let cfg = config(&["1h"], &[EntityKey::User, EntityKey::Ip]);

    let table = build_feature_table(EventKind::CheckoutAttempt, &checkouts, None, &cfg)
        .expect("feature build succeeds");

    assert_eq!(table.label_columns(), ["is_adverse"]);
    assert_eq!(
        table.label("is_adverse").expect("label"),
        vec![true, false, false]
    );
    assert_close(value(&table, "c1", "user_1h__payment_value_sum"), 0.0);
    assert_close(value(&table, "c2", "user_1h__payment_value_sum"), 100.0);
    assert_close(value(&table, "c3", "user_1h__payment_value_sum"), 150.0);
    assert_close(value(&table, "c3", "user_1h__payment_value_mean"), 75.0);
    assert_close(value(&table, "c3", "user_1h__basket_size_mean"), 2.0);
    assert_close(value(&table, "c3", "user_1h__adverse_cnt"), 1.0);
    assert_close(value(&table, "c3", "user_1h__review_rate"), 0.5);
    assert_close(value(&table, "c3", "user_1h__uniq_credit_card_hash_cnt"), 2.0);
    assert_close(value(&table, "c3", "ip_1h__uniq_user_id_cnt"), 1.0);
    assert!(table.column("user_1h__adverse_rate").is_none());
    assert!(table.column("ip_1h__uniq_ip_hash_cnt").is_none());
}

#[test]
fn cross_event_context_uses_only_earlier_counterpart_events() {
    let logins = canonical_logins(&sample_logins());
    let checkouts = canonical_checkouts(&sample_checkouts());
    let cfg = config(&["1h"], &[EntityKey::User]);

    let table = build_feature_table(EventKind::LoginAttempt, &logins, Some(&checkouts), &cfg)
        .expect("feature build succeeds");

    let prefix = "cross__checkout_attempt__user_1h__";
    for suffix in [
        "event_cnt",
        "success_cnt",
        "success_rate",
        "failure_cnt",
        "review_cnt",
        "review_rate",
        "adverse_cnt",
        "adverse_rate",
        "payment_value_sum",
        "payment_value_mean",
    ] {
        assert!(
            table.column(&format!("{prefix}{suffix}")).is_some(),
            "missing {prefix}{suffix}"
        );
    }

    assert_close(value(&table, "a0", &format!("{prefix}event_cnt")), 0.0);
    assert_close(value(&table, "a1", &format!("{prefix}event_cnt")), 1.0);
    assert_close(value(&table, "a2", &format!("{prefix}event_cnt")), 2.0);
    assert_close(value(&table, "a2", &format!("{prefix}payment_value_sum")), 150.0);
    assert_close(value(&table, "a2", &format!("{prefix}review_rate")), 0.5);
    assert_close(value(&table, "b0", &format!("{prefix}event_cnt")), 0.0);

    let checkout_side =
        build_feature_table(EventKind::CheckoutAttempt, &checkouts, Some(&logins), &cfg)
            .expect("feature build succeeds");
    assert_close(
        value(&checkout_side, "c3", "cross__login_attempt__user_1h__event_cnt"),
        2.0,
    );
    assert!(checkout_side
        .column("cross__login_attempt__user_1h__payment_value_sum")
        .is_none());
}

#[test]
fn cross_event_is_skipped_when_disabled_or_secondary_is_empty() {
    let logins = canonical_logins(&sample_logins());
    let checkouts = canonical_checkouts(&sample_checkouts());
    let empty = checkouts.subset(|_| false);
    let mut cfg = config(&["1h"], &[EntityKey::User]);

    let with_empty = build_feature_table(EventKind::LoginAttempt, &logins, Some(&empty), &cfg)
        .expect("feature build succeeds");
    cfg.include_cross_event = false;
    let disabled = build_feature_table(EventKind::LoginAttempt, &logins, Some(&checkouts), &cfg)
        .expect("feature build succeeds");

    for table in [&with_empty, &disabled] {
        assert!(table.feature_columns().iter().all(|c| !c.starts_with("cross__")));
    }
    assert_ne!(with_empty.spec().fingerprint, disabled.spec().fingerprint);
}

#[test]
fn every_feature_name_follows_the_naming_grammar() {
    let logins = canonical_logins(&sample_logins());
    let checkouts = canonical_checkouts(&sample_checkouts());
    let plain = Regex::new(r"^(user|ip|device)_\d+[hd]__[a-z_]+$").expect("valid regex");
    let cross = Regex::new(r"^cross__(login|checkout)_attempt__(user|ip|device)_\d+[hd]__[a-z_]+$")
        .expect("valid regex");

    let table = build_feature_table(
        EventKind::LoginAttempt,
        &logins,
        Some(&checkouts),
        &FeatureConfig::default(),
    )
    .expect("feature build succeeds");

    let columns = table.feature_columns();
    assert!(columns.windows(2).all(|pair| pair[0] < pair[1]));
    for column in columns {
        assert!(
            plain.is_match(column) || cross.is_match(column),
            "unexpected feature name {column}"
        );
    }
    for window in ["1h", "6h", "24h", "7d"] {
        assert!(table.column(&format!("ip_{window}__attempt_cnt")).is_some());
    }
}

#[test]
fn builds_are_deterministic_and_ignore_input_row_order() {
    let rows = sample_logins();
    let mut reversed = rows.clone();
    reversed.reverse();
    let checkouts = canonical_checkouts(&sample_checkouts());
    let cfg = FeatureConfig::default();

    let a = build_feature_table(
        EventKind::LoginAttempt,
        &canonical_logins(&rows),
        Some(&checkouts),
        &cfg,
    )
    .expect("feature build succeeds");
    let b = build_feature_table(
        EventKind::LoginAttempt,
        &canonical_logins(&reversed),
        Some(&checkouts),
        &cfg,
    )
    .expect("feature build succeeds");

    assert_eq!(a, b);
    assert_eq!(a.content_hash(), b.content_hash());
    assert_eq!(a.content_hash().len(), 64);
}

#[test]
fn spec_compatibility_checks_version_and_fingerprint() {
    let logins = canonical_logins(&sample_logins());
    let one_hour = build_feature_table(
        EventKind::LoginAttempt,
        &logins,
        None,
        &config(&["1h"], &[EntityKey::User]),
    )
    .expect("feature build succeeds");
    let six_hours = build_feature_table(
        EventKind::LoginAttempt,
        &logins,
        None,
        &config(&["6h"], &[EntityKey::User]),
    )
    .expect("feature build succeeds");

    let spec = one_hour.spec();
    assert_eq!(spec.spec_version, FEATURE_SPEC_VERSION);
    assert_eq!(spec.windows, vec!["1h"]);
    assert!(assert_spec_compatible(FEATURE_SPEC_VERSION, &spec.fingerprint, spec).is_ok());

    assert!(matches!(
        assert_spec_compatible(FEATURE_SPEC_VERSION + 1, &spec.fingerprint, spec),
        Err(FeatureError::SpecVersionMismatch { expected, actual })
            if expected == FEATURE_SPEC_VERSION + 1 && actual == FEATURE_SPEC_VERSION
    ));
    assert!(matches!(
        assert_spec_compatible(FEATURE_SPEC_VERSION, &six_hours.spec().fingerprint, spec),
        Err(FeatureError::SpecFingerprintMismatch { .. })
    ));

    let json = serde_json::to_value(spec).expect("spec serializes");
    assert_eq!(json["event_kind"], "login_attempt");
    assert_eq!(json["entities"][0], "user");
}

#[test]
fn split_membership_is_attached_per_row() {
    let logins = canonical_logins(&sample_logins());
    let cfg = config(&["1h"], &[EntityKey::User]);
    let table = build_feature_table(EventKind::LoginAttempt, &logins, None, &cfg)
        .expect("feature build succeeds");
    let before = table.content_hash();

    let mut rng = StdRng::seed_from_u64(1337);
    let assignment =
        split_dataset(&logins, &SplitConfig::default(), &mut rng).expect("split succeeds");
    let table = table.with_splits(&assignment);

    let membership = assignment.membership();
    for row in table.rows() {
        assert_eq!(row.split, membership.get(row.event_id.as_str()).copied());
        assert!(row.split.is_some());
    }
    assert_ne!(before, table.content_hash());
}

#[test]
fn empty_primary_yields_empty_table_with_full_spec() {
    let logins = canonical_logins(&sample_logins()).subset(|_| false);
    let cfg = FeatureConfig::default();
    let table = build_feature_table(EventKind::LoginAttempt, &logins, None, &cfg)
        .expect("feature build succeeds");

    assert!(table.is_empty());
    assert!(table.column("user_24h__attempt_cnt").is_some());
}

#[test]
fn invalid_config_and_missing_outcome_column_are_errors() {
    let logins = canonical_logins(&sample_logins());
    let cfg = config(&["15m"], &[EntityKey::User]);
    assert!(matches!(
        build_feature_table(EventKind::LoginAttempt, &logins, None, &cfg),
        Err(FeatureError::Config(ConfigError::InvalidWindow(raw))) if raw == "15m"
    ));

    let cfg = config(&["1h"], &[]);
    assert!(matches!(
        build_feature_table(EventKind::LoginAttempt, &logins, None, &cfg),
        Err(FeatureError::Config(ConfigError::EmptyEntities))
    ));

    let mut raw = EventTable::new("login_attempt", ["event_id", "event_ts", "user_id"]);
    raw.push_record([
        ("event_id", Value::from("x0")),
        ("event_ts", Value::from("2025-12-01T00:00:00Z")),
        ("user_id", Value::from("u1")),
    ])
    .expect("record matches columns");
    let no_outcome = canonicalize(&raw, &[], UTC).expect("canonicalize");
    let err = build_feature_table(
        EventKind::LoginAttempt,
        &no_outcome,
        None,
        &FeatureConfig::default(),
    )
    .expect_err("login_result is required");
    assert!(matches!(
        err,
        FeatureError::Schema(SchemaError::MissingColumn { column, .. }) if column == "login_result"
    ));
}

#[derive(Clone)]
struct Login {
    id: &'static str,
    minute: i64,
    user: &'static str,
    ip: &'static str,
    result: &'static str,
    support: bool,
    cost: f64,
    mule: bool,
}

#[derive(Clone)]
struct Checkout {
    id: &'static str,
    minute: i64,
    user: &'static str,
    value: f64,
    basket: i64,
    card: &'static str,
    result: &'static str,
}

fn sample_logins() -> Vec<Login> {
    let login = |id, minute, user, ip, result| Login {
        id,
        minute,
        user,
        ip,
        result,
        support: false,
        cost: 0.0,
        mule: false,
    };
    vec![
        Login {
            support: true,
            cost: 2.5,
            mule: true,
            ..login("a0", 0, "A", "ip-1", "failure")
        },
        login("b0", 1, "B", "ip-9", "success"),
        login("a1", 1, "A", "ip-2", "success"),
        login("a2", 2, "A", "ip-2", "failure"),
    ]
}

fn sample_checkouts() -> Vec<Checkout> {
    vec![
        Checkout {
            id: "c1",
            minute: 0,
            user: "A",
            value: 100.0,
            basket: 3,
            card: "card-1",
            result: "review",
        },
        Checkout {
            id: "c2",
            minute: 1,
            user: "A",
            value: 50.0,
            basket: 1,
            card: "card-2",
            result: "success",
        },
        Checkout {
            id: "c3",
            minute: 2,
            user: "A",
            value: 20.0,
            basket: 1,
            card: "card-2",
            result: "success",
        },
    ]
}

fn canonical_logins(rows: &[Login]) -> CanonicalTable {
    let mut table = EventTable::new("login_attempt", LOGIN_COLUMNS);
    for row in rows {
        table
            .push_record([
                ("event_id", Value::from(row.id)),
                ("event_ts", Value::from(ts(row.minute))),
                ("user_id", Value::from(row.user)),
                ("session_id", Value::from(format!("s-{}", row.id))),
                ("ip_hash", Value::from(row.ip)),
                ("device_fingerprint_hash", Value::from("dev-1")),
                ("login_result", Value::from(row.result)),
                ("support_contacted", Value::from(row.support)),
                ("support_cost_usd", Value::from(row.cost)),
                ("label_replicators", Value::from(false)),
                ("label_the_mule", Value::from(row.mule)),
                ("label_the_chameleon", Value::from(false)),
                ("label_benign", Value::from(!row.mule)),
            ])
            .expect("record matches login columns");
    }
    canonicalize_kind(&table, EventKind::LoginAttempt, UTC).expect("canonicalize logins")
}

fn canonical_checkouts(rows: &[Checkout]) -> CanonicalTable {
    let mut table = EventTable::new("checkout_attempt", CHECKOUT_COLUMNS);
    for row in rows {
        table
            .push_record([
                ("event_id", Value::from(row.id)),
                ("event_ts", Value::from(ts(row.minute))),
                ("user_id", Value::from(row.user)),
                ("ip_hash", Value::from("ip-1")),
                ("device_fingerprint_hash", Value::from("dev-1")),
                ("payment_value", Value::from(row.value)),
                ("basket_size", Value::from(row.basket)),
                ("credit_card_hash", Value::from(row.card)),
                ("checkout_result", Value::from(row.result)),
            ])
            .expect("record matches checkout columns");
    }
    canonicalize_kind(&table, EventKind::CheckoutAttempt, UTC).expect("canonicalize checkouts")
}

fn config(windows: &[&str], entities: &[EntityKey]) -> FeatureConfig {
    FeatureConfig {
        windows: windows.iter().map(|w| w.to_string()).collect(),
        entities: entities.to_vec(),
        ..FeatureConfig::default()
    }
}

fn ts(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap() + TimeDelta::minutes(minute)
}

fn value(table: &FeatureTable, event_id: &str, column: &str) -> f64 {
    table
        .value(event_id, column)
        .unwrap_or_else(|| panic!("missing {event_id}/{column}"))
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-12,
        "actual={actual} expected={expected}"
    );
}
