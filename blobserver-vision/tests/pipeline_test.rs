//! Source-to-detector pipeline tests

use blobserver_core::Value;
use blobserver_vision::detectors::LightSpotsDetector;
use blobserver_vision::sources::PatternSource;
use blobserver_vision::{Detector, Source};

#[test]
fn test_pattern_feeds_light_spots() {
    let mut source = PatternSource::new(0);
    assert!(source.connect());
    source.grab();

    let mut detector = LightSpotsDetector::new();
    let report = detector.detect(&[source.retrieve_corrected()]);
    assert_eq!(report.blob_count(), 3);
    assert_eq!(report.field_count(), 5);
}

#[test]
fn test_identities_stable_over_pattern_motion() {
    let mut source = PatternSource::new(1);
    assert!(source.connect());
    let mut detector = LightSpotsDetector::new();

    source.grab();
    let first = detector.detect(&[source.retrieve_corrected()]);
    let mut first_ids: Vec<Value> = (0..first.blob_count())
        .map(|i| first.blob(i)[4].clone())
        .collect();

    // The spots drift a few pixels per frame; ids must not churn.
    for _ in 0..10 {
        source.grab();
        let report = detector.detect(&[source.retrieve_corrected()]);
        assert_eq!(report.blob_count(), first.blob_count());
        let mut ids: Vec<Value> = (0..report.blob_count())
            .map(|i| report.blob(i)[4].clone())
            .collect();
        sort_values(&mut ids);
        sort_values(&mut first_ids);
        assert_eq!(ids, first_ids);
    }
}

#[test]
fn test_detector_failure_mode_is_empty_report() {
    let mut detector = LightSpotsDetector::new();
    // A detector given no frames reports nothing and stays usable.
    assert!(detector.detect(&[]).is_empty());

    let mut source = PatternSource::new(0);
    source.connect();
    source.grab();
    assert!(!detector.detect(&[source.retrieve_corrected()]).is_empty());
}

fn sort_values(values: &mut [Value]) {
    values.sort_by_key(|v| v.as_i32().unwrap_or(i32::MAX));
}
