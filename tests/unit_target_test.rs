use bluse_coordinator::core::recording::parse_target;
use bluse_coordinator::core::util::{dec_degrees, ra_degrees};

const CBF_TARGET: &str =
    "J0918-1205 | Hyd A | Hydra A | 3C 218 | PKS 0915-11, radec, 9:18:05.28, -12:05:48.9";

#[test]
fn test_parse_cbf_target() {
    let target = parse_target(CBF_TARGET, 16, '|').unwrap();
    assert_eq!(target.name, "J0918-1205");
    assert_eq!(target.ra, "9:18:05.28");
    assert_eq!(target.dec, "-12:05:48.9");
}

#[test]
fn test_outer_quotes_are_stripped() {
    let quoted = format!("'{CBF_TARGET}'");
    let target = parse_target(&quoted, 16, '|').unwrap();
    assert_eq!(target.name, "J0918-1205");
}

#[test]
fn test_punctuation_becomes_underscores_but_signs_survive() {
    let target = parse_target("3C 218 (Hyd.A), radec, 9:18:05.28, -12:05:48.9", 16, '|').unwrap();
    assert_eq!(target.name, "3C 218 _Hyd_A_");

    let target = parse_target("PKS 0915-11+x, radec, 9:18:05.28, -12:05:48.9", 16, '|').unwrap();
    assert_eq!(target.name, "PKS 0915-11+x");
}

#[test]
fn test_long_names_are_truncated() {
    let target = parse_target(
        "A very long target description indeed, radec, 1:00:00.0, -1:00:00.0",
        16,
        '|',
    )
    .unwrap();
    assert_eq!(target.name.chars().count(), 16);
}

#[test]
fn test_nameless_target_is_accepted() {
    let target = parse_target("radec, 9:18:05.28, -12:05:48.9", 16, '|').unwrap();
    assert_eq!(target.name, "NOT_PROVIDED");
    assert_eq!(target.ra, "9:18:05.28");
    assert_eq!(target.dec, "-12:05:48.9");
}

#[test]
fn test_non_radec_targets_are_rejected() {
    assert!(parse_target("azel, 120.0, 30.0", 16, '|').is_err());
    assert!(parse_target("", 16, '|').is_err());
}

#[test]
fn test_ra_degrees() {
    assert!((ra_degrees("9:18:05.28").unwrap() - 139.522).abs() < 1e-3);
    assert!((ra_degrees("0:00:00.0").unwrap()).abs() < f64::EPSILON);
}

#[test]
fn test_dec_degrees_carries_the_sign() {
    let dec = dec_degrees("-12:05:48.9").unwrap();
    assert!((dec + 12.0969).abs() < 1e-3, "got {dec}");
    let dec = dec_degrees("12:05:48.9").unwrap();
    assert!((dec - 12.0969).abs() < 1e-3, "got {dec}");
}

#[test]
fn test_target_round_trip() {
    // Extracted name, RA and Dec survive re-emission into the gateway keys.
    let target = parse_target(CBF_TARGET, 16, '|').unwrap();
    let reemitted = format!("{}, radec, {}, {}", target.name, target.ra, target.dec);
    let reparsed = parse_target(&reemitted, 16, '|').unwrap();
    assert_eq!(reparsed, target);
}
