//! Eventual-consistency merges converge regardless of order

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use swarmlease::coordination::{
    ConflictResolver, ConflictStrategy, ConflictedVersion, RegionPriorities, StampedValue,
};
use swarmlease::model::{ContentList, OperationClass};

fn list(items: &[&str], fields: &[(&str, &str, i64, &str)]) -> ContentList {
    let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let mut content = ContentList {
        items: items.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    };
    for (name, value, offset, region) in fields {
        content.set_field(
            *name,
            StampedValue::new(json!(value), base + Duration::seconds(*offset), *region),
        );
    }
    content
}

fn sorted(mut items: Vec<String>) -> Vec<String> {
    items.sort();
    items
}

#[test]
fn test_content_merge_is_commutative() {
    let p = RegionPriorities::default();
    let a = list(&["a", "b"], &[("headline", "from-us", 10, "us-east")]);
    let b = list(&["c", "a"], &[("headline", "from-eu", 20, "eu-west")]);
    let ab = a.merge(&b, &p);
    let ba = b.merge(&a, &p);
    // same members and fields; order follows whichever side was the base
    assert_eq!(ab.items, vec!["a", "b", "c"]);
    assert_eq!(ba.items, vec!["c", "a", "b"]);
    assert_eq!(sorted(ab.items.clone()), sorted(ba.items.clone()));
    assert_eq!(ab.fields, ba.fields);
    assert_eq!(ab.fields["headline"].value, json!("from-eu"));
}

#[test]
fn test_content_merge_is_idempotent() {
    let p = RegionPriorities::default();
    let a = list(&["a", "b"], &[("headline", "x", 0, "default")]);
    assert_eq!(a.merge(&a, &p), a);
}

#[test]
fn test_content_merge_is_associative() {
    let p = RegionPriorities::default();
    let a = list(&["a"], &[("mode", "one", 1, "us-east")]);
    let b = list(&["b", "a"], &[("mode", "two", 2, "eu-west")]);
    let c = list(&["c"], &[("mode", "three", 2, "us-east")]);

    let left = a.merge(&b, &p).merge(&c, &p);
    let right = a.merge(&b.merge(&c, &p), &p);
    assert_eq!(left.items, vec!["a", "b", "c"]);
    assert_eq!(left.items, right.items);
    assert_eq!(left.fields, right.fields);
    // same timestamp: us-east outranks eu-west
    assert_eq!(left.fields["mode"].value, json!("three"));
}

#[test]
fn test_resolver_outcome_ignores_input_order() {
    let resolver = ConflictResolver::default();
    let t = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let v1 = ConflictedVersion::new("eu-west", t, json!({"items": ["a"]}));
    let v2 = ConflictedVersion::new("us-east", t, json!({"items": ["b"]}));
    let earlier = t - Duration::minutes(1);
    let v3 = ConflictedVersion::new("asia-pacific", earlier, json!({"items": ["c"]}));
    let class = OperationClass::ContentUpdates;

    for strategy in [
        ConflictStrategy::LastWriterWins,
        ConflictStrategy::RegionPriority,
        ConflictStrategy::TimestampPriority,
        ConflictStrategy::SemanticMerge,
    ] {
        let forward = resolver
            .resolve(&[v1.clone(), v2.clone(), v3.clone()], class, strategy)
            .unwrap();
        let backward = resolver
            .resolve(&[v3.clone(), v2.clone(), v1.clone()], class, strategy)
            .unwrap();
        assert_eq!(forward.data, backward.data, "{:?}", strategy);
        assert_eq!(forward.conflicts_detected, 2);
    }
}
