//! Engine integration tests: range and intra scheduling, eviction, bitmap
//! release and rendition lifecycle.

mod common;

use std::time::Duration;

use common::{approx, fast_config, MockOptions, StreamSpec, TestHarness};
use filmstrip::layout::frames_for_segment;
use filmstrip::{CacheKey, EngineStatus, IntraSegment, RenditionId};

#[tokio::test]
async fn test_packed_mode_one_entry_per_segment() {
    let h = TestHarness::new().await;
    assert_eq!(h.engine.wait_ready().await, EngineStatus::Ready);

    // 2s segments at 16px/s are 32px wide, well under a 160px thumbnail.
    assert_eq!(frames_for_segment(2.0, 16.0, 160), 1);

    h.engine.request_range(0.0, 6.0, 3.0);
    let snapshot = h.wait_for_snapshot(|s| s.len() == 3).await;

    for (segment, start) in [(0, 0.0), (1, 2.0), (2, 4.0)] {
        assert_eq!(snapshot.segment_len(segment), 1);
        assert!(snapshot.contains(&CacheKey::new(segment, start)));
    }
    // Packed decode submits each segment's sync frame only.
    let mut submitted = h.log.submitted();
    submitted.sort_by(f64::total_cmp);
    assert_eq!(submitted, vec![0.0, 2.0, 4.0]);
}

#[tokio::test]
async fn test_dense_mode_decodes_requested_count() {
    let h = TestHarness::new().await;
    h.engine.wait_ready().await;

    // 2s at 200px/s is 400px wide: three 160px thumbnails.
    let count = frames_for_segment(2.0, 200.0, 160);
    assert_eq!(count, 3);

    h.engine.request_intra_batch(
        vec![IntraSegment {
            segment_index: 1,
            frame_count: count,
        }],
        3.0,
    );
    let snapshot = h.wait_for_snapshot(|s| s.segment_len(1) == 3).await;

    let times: Vec<f64> = snapshot
        .segment_entries(1)
        .map(|(key, _)| key.timestamp())
        .collect();
    assert_eq!(times.len(), 3);
    assert!(approx(times[0], 2.0));
    assert!(times.windows(2).all(|w| w[0] < w[1]));
    assert!(times.iter().all(|&t| (2.0..4.0).contains(&t)));
}

#[tokio::test]
async fn test_repeated_viewport_decodes_once() {
    let h = TestHarness::new().await;
    h.engine.wait_ready().await;

    for _ in 0..30 {
        h.engine.request_range(0.0, 6.0, 3.0);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.wait_for_snapshot(|s| s.len() == 3).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.log.flushes(), 3);
    assert_eq!(h.log.submitted().len(), 3);
}

#[tokio::test]
async fn test_decode_order_follows_anchor() {
    let h = TestHarness::new().await;
    h.engine.wait_ready().await;

    // Anchor at the far end: nearest segment decodes first.
    h.engine.request_range(0.0, 8.0, 8.0);
    h.wait_for_snapshot(|s| s.len() == 4).await;

    assert_eq!(h.log.submitted(), vec![6.0, 4.0, 2.0, 0.0]);
}

#[tokio::test]
async fn test_eviction_keeps_cache_near_viewport() {
    let mut config = fast_config();
    config.cache.span_multiplier = 1.0;
    let h = TestHarness::builder()
        .rendition(
            "main",
            StreamSpec {
                segments: 30,
                ..Default::default()
            },
        )
        .config(config)
        .attach()
        .await;
    h.engine.wait_ready().await;

    h.engine.request_range(0.0, 4.0, 2.0);
    h.wait_for_snapshot(|s| s.len() == 2).await;

    h.engine.request_range(40.0, 44.0, 42.0);
    let snapshot = h
        .wait_for_snapshot(|s| s.contains(&CacheKey::new(20, 40.0)) && s.contains(&CacheKey::new(21, 42.0)))
        .await;

    // Visible [40, 44] with k = 1 retains [36, 48].
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot
        .entries
        .keys()
        .all(|k| (36.0..=48.0).contains(&k.timestamp())));
    assert_eq!(snapshot.stats.released, 2);
}

#[tokio::test]
async fn test_eviction_follows_zoom_in() {
    let mut config = fast_config();
    config.cache.span_multiplier = 1.0;
    let h = TestHarness::builder()
        .rendition(
            "main",
            StreamSpec {
                segments: 30,
                ..Default::default()
            },
        )
        .config(config)
        .attach()
        .await;
    h.engine.wait_ready().await;

    h.engine.request_range(0.0, 60.0, 30.0);
    h.wait_for_snapshot(|s| s.len() == 30).await;
    let decoded = h.log.submitted().len();

    // Everything visible is already cached; only the window shrinks.
    h.engine.request_range(20.0, 22.0, 21.0);
    let snapshot = h.wait_for_snapshot(|s| s.len() == 4).await;

    // Visible [20, 22] with k = 1 retains [18, 24].
    assert!(snapshot
        .entries
        .keys()
        .all(|k| (18.0..=24.0).contains(&k.timestamp())));
    assert_eq!(snapshot.stats.released, 26);
    assert_eq!(h.log.submitted().len(), decoded);
}

#[tokio::test]
async fn test_every_bitmap_released_once() {
    let h = TestHarness::new().await;
    h.engine.wait_ready().await;

    h.engine.request_range(0.0, 10.0, 5.0);
    h.wait_for_snapshot(|s| s.len() == 5).await;
    h.engine.request_intra_batch(
        vec![IntraSegment {
            segment_index: 2,
            frame_count: 4,
        }],
        5.0,
    );
    h.wait_for_snapshot(|s| s.segment_len(2) >= 4).await;

    let frame = h.engine.save_frame_at(7.3).await;
    assert!(frame.is_some());
    drop(frame);

    assert!(h.log.live_bitmaps() > 0);
    h.engine.shutdown().await;

    assert_eq!(h.engine.status(), EngineStatus::Closed);
    let last = h.engine.snapshot();
    assert!(last.is_empty());
    assert_eq!(last.stats.inserted, last.stats.released);
    drop(last);
    assert_eq!(h.log.live_bitmaps(), 0);
    assert!(h.log.bitmaps_created() > 0);
}

#[tokio::test]
async fn test_unavailable_segment_is_not_retried() {
    let h = TestHarness::new().await;
    h.engine.wait_ready().await;
    h.source.fail_url("mem://main/1.m4s");

    h.engine.request_range(0.0, 6.0, 3.0);
    let snapshot = h
        .wait_for_snapshot(|s| s.is_unavailable(1) && s.len() == 2)
        .await;
    assert!(!snapshot.contains(&CacheKey::new(1, 2.0)));

    // Pan away and back; the failed segment stays failed.
    h.engine.request_range(10.0, 12.0, 11.0);
    h.wait_for_snapshot(|s| s.contains(&CacheKey::new(5, 10.0))).await;
    h.engine.request_range(0.0, 6.0, 3.0);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let attempts = h
        .source
        .fetched()
        .iter()
        .filter(|url| url.as_str() == "mem://main/1.m4s")
        .count();
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn test_gop_structure_classifies_without_decoding() {
    let h = TestHarness::builder()
        .rendition(
            "main",
            StreamSpec {
                reorder: true,
                ..Default::default()
            },
        )
        .attach()
        .await;
    h.engine.wait_ready().await;

    let gop = h.engine.gop_structure(0).await.unwrap();
    assert_eq!(gop.pattern(), "IPBBPBBPBBPBBPBBPBBP");
    assert!(h.log.submitted().is_empty());

    let again = h.engine.gop_structure(0).await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&gop, &again));
    assert!(h.engine.gop_structure(99).await.is_err());
}

#[tokio::test]
async fn test_attach_fetches_catalog_once() {
    let h = TestHarness::new().await;
    assert_eq!(h.engine.wait_ready().await, EngineStatus::Ready);
    assert_eq!(h.source.catalog_requests(), 1);
}

#[tokio::test]
async fn test_rendition_switch_discards_state() {
    let h = TestHarness::builder()
        .rendition("low", StreamSpec::default())
        .rendition(
            "high",
            StreamSpec {
                segments: 5,
                width: 1280,
                height: 720,
                reorder: true,
                ..Default::default()
            },
        )
        .attach_to("low")
        .attach()
        .await;
    h.engine.wait_ready().await;

    let before = h.engine.gop_structure(0).await.unwrap();
    assert_eq!(before.pattern(), "I".to_string() + &"P".repeat(19));
    h.engine.request_range(0.0, 4.0, 2.0);
    h.wait_for_snapshot(|s| s.len() == 2).await;

    h.engine
        .switch_rendition(RenditionId::from("high"))
        .await
        .unwrap();

    assert_eq!(h.engine.status(), EngineStatus::Ready);
    assert_eq!(h.engine.catalog().unwrap().len(), 5);
    let snapshot = h.engine.snapshot();
    assert_eq!(snapshot.generation, 1);
    assert!(snapshot.is_empty());

    let after = h.engine.gop_structure(0).await.unwrap();
    assert_eq!(after.pattern(), "IPBBPBBPBBPBBPBBPBBP");

    let configured = h.log.configured();
    assert_eq!(configured.len(), 2);
    assert_eq!((configured[1].1, configured[1].2), (1280, 720));
    assert_eq!(h.source.catalog_requests(), 2);

    // The unchanged viewport is planned again against the new rendition.
    h.engine.request_range(0.0, 4.0, 2.0);
    h.wait_for_snapshot(|s| s.generation == 1 && s.len() == 2).await;
}

#[tokio::test]
async fn test_switch_to_unknown_rendition_keeps_current() {
    let h = TestHarness::new().await;
    h.engine.wait_ready().await;

    let err = h
        .engine
        .switch_rendition(RenditionId::from("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, filmstrip::EngineError::Catalog(_)));
    assert_eq!(h.engine.status(), EngineStatus::Ready);
    assert_eq!(h.engine.snapshot().generation, 0);
    assert!(h.engine.save_frame_at(1.0).await.is_some());
}

#[tokio::test]
async fn test_unsupported_decoder_disables_once() {
    let h = TestHarness::builder()
        .rendition("main", StreamSpec::default())
        .mock(MockOptions {
            reject: true,
            ..Default::default()
        })
        .attach()
        .await;

    let status = h.engine.wait_ready().await;
    assert!(matches!(status, EngineStatus::Unsupported { .. }));

    h.engine.request_range(0.0, 6.0, 3.0);
    assert!(h.engine.save_frame_at(1.0).await.is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.log.submitted().is_empty());
    assert!(h.engine.snapshot().is_empty());

    // Container-only queries keep working.
    assert_eq!(h.engine.gop_structure(0).await.unwrap().entries.len(), 20);
}

#[tokio::test]
async fn test_encrypted_rendition_needs_decryptor() {
    let spec = StreamSpec {
        encrypted: true,
        ..Default::default()
    };

    let without = TestHarness::builder()
        .rendition("drm", spec.clone())
        .attach_to("drm")
        .attach()
        .await;
    without.engine.wait_ready().await;
    assert!(without.engine.save_frame_at(1.0).await.is_none());
    without.engine.request_range(0.0, 2.0, 1.0);
    without.wait_for_snapshot(|s| s.is_unavailable(0)).await;
    assert!(without.log.submitted().is_empty());

    let with = TestHarness::builder()
        .rendition("drm", spec)
        .attach_to("drm")
        .with_decryptor()
        .attach()
        .await;
    with.engine.wait_ready().await;
    let frame = with.engine.save_frame_at(1.0).await.unwrap();
    assert!(approx(frame.timestamp, 1.0));
}

#[tokio::test]
async fn test_attach_fails_for_unknown_rendition() {
    let source = std::sync::Arc::new(common::MemorySource::new());
    let log = common::DecoderLog::default();
    let result = filmstrip::FilmstripEngine::builder(
        source,
        common::mock_factory(&log, MockOptions::default()),
    )
    .attach(RenditionId::from("nope"))
    .await;
    assert!(matches!(result, Err(filmstrip::EngineError::Catalog(_))));
}
