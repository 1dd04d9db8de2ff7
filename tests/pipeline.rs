//! End-to-end tests: fetch volumes from a mock source and bind them.

use seihon::error::Result;
use seihon::manifest::VolumeManifest;
use seihon::prelude::*;
use std::time::Duration;
use tokio::time::timeout;

mod common;
use common::{
    Behavior, LONG_TEST_TIMEOUT, MockPageSource, TEST_TIMEOUT, chapter_request, page_url,
    read_zip_entry, setup_test_dirs, volume_request,
};

fn config_builder(output_dir: &Path) -> SeihonConfigBuilder {
    let mut builder = SeihonConfig::builder();
    builder
        .metadata(MangaMetadata::default_with_title("Test Manga".to_string()))
        .output_dir(output_dir.to_path_buf())
        .retry_delay(Duration::from_millis(10))
        .page_timeout(Duration::from_secs(5));
    builder
}

fn two_chapter_volume(volume: &str) -> VolumeRequest {
    volume_request(
        volume,
        vec![
            chapter_request(&format!("v{}c1", volume), "1", 2),
            chapter_request(&format!("v{}c2", volume), "2", 2),
        ],
    )
}

#[tokio::test]
async fn test_process_volume_binds_complete_volume() -> Result<()> {
    let (_, _, output_dir) = setup_test_dirs("pipeline_complete").await;
    let config = config_builder(&output_dir).build()?;
    let source = Arc::new(MockPageSource::new());

    let outcome = timeout(
        LONG_TEST_TIMEOUT,
        config.process_volume(source.clone(), two_chapter_volume("1")),
    )
    .await
    .expect("Test timed out");

    let expected = config.output_path("1");
    match &outcome {
        VolumeOutcome::Complete { output } => assert_eq!(output, &expected),
        other => panic!("Expected a complete volume, got {:?}", other),
    }
    assert_eq!(source.calls(), 4);

    let report = verify_container(&expected)?;
    assert!(report.is_valid(), "invalid container: {:?}", report);
    // cover, then heading + 1 page, then heading + 2 pages
    assert_eq!(report.spine_idrefs.len(), 6);
    let opf = read_zip_entry(&expected, "OEBPS/content.opf");
    assert!(opf.contains("<dc:title>Test Manga - Volume 1</dc:title>"));
    assert!(opf.contains("properties=\"cover-image\""));
    let nav = read_zip_entry(&expected, "OEBPS/nav.xhtml");
    assert!(nav.contains(">Chapter 1</a>"));
    assert!(nav.contains(">Chapter 2</a>"));

    let manifest = VolumeManifest::load(&config.volume_path("1"))
        .await
        .expect("manifest written");
    assert_eq!(manifest.status, CompletionStatus::Complete);
    Ok(())
}

#[tokio::test]
async fn test_rerun_reuses_pages_and_keeps_file() -> Result<()> {
    let (_, _, output_dir) = setup_test_dirs("pipeline_rerun").await;
    let config = config_builder(&output_dir).build()?;
    let source = Arc::new(MockPageSource::new());

    let first = config.process_volume(source.clone(), two_chapter_volume("1")).await;
    assert!(first.is_complete());
    let bound = std::fs::read(config.output_path("1"))?;

    source.reset_calls();
    let second = timeout(
        TEST_TIMEOUT,
        config.process_volume(source.clone(), two_chapter_volume("1")),
    )
    .await
    .expect("Test timed out");
    assert!(second.is_complete());
    assert_eq!(source.calls(), 0);
    assert_eq!(std::fs::read(config.output_path("1"))?, bound);
    Ok(())
}

#[tokio::test]
async fn test_incomplete_volume_is_not_bound() -> Result<()> {
    let (_, _, output_dir) = setup_test_dirs("pipeline_incomplete").await;
    let config = config_builder(&output_dir).build()?;
    let source = Arc::new(
        MockPageSource::new().with_behavior(&page_url("v1c2", 2), Behavior::AlwaysFail),
    );

    let outcome = timeout(
        TEST_TIMEOUT,
        config.process_volume(source, two_chapter_volume("1")),
    )
    .await
    .expect("Test timed out");

    match outcome {
        VolumeOutcome::Incomplete {
            successful_chapters,
            total_chapters,
            successful_pages,
            total_pages,
            output,
        } => {
            assert_eq!((successful_chapters, total_chapters), (1, 2));
            assert_eq!((successful_pages, total_pages), (3, 4));
            assert!(output.is_none());
        }
        other => panic!("Expected an incomplete volume, got {:?}", other),
    }
    assert!(!config.output_path("1").exists());
    let manifest = VolumeManifest::load(&config.volume_path("1"))
        .await
        .expect("manifest written");
    assert_eq!(manifest.status, CompletionStatus::Incomplete);
    Ok(())
}

#[tokio::test]
async fn test_accepted_incomplete_volume_is_bound() -> Result<()> {
    let (_, _, output_dir) = setup_test_dirs("pipeline_accept").await;
    let config = config_builder(&output_dir).accept_incomplete(true).build()?;
    let source = Arc::new(
        MockPageSource::new().with_behavior(&page_url("v1c2", 2), Behavior::AlwaysFail),
    );

    let outcome = timeout(
        TEST_TIMEOUT,
        config.process_volume(source, two_chapter_volume("1")),
    )
    .await
    .expect("Test timed out");

    let VolumeOutcome::Incomplete { output: Some(output), .. } = outcome.clone() else {
        panic!("Expected a bound incomplete volume, got {:?}", outcome);
    };
    assert_eq!(output, config.output_path("1"));
    let report = verify_container(&output)?;
    assert!(report.is_valid());
    // cover, heading + 1 page, heading + 1 page
    assert_eq!(report.spine_idrefs.len(), 5);
    Ok(())
}

#[tokio::test]
async fn test_device_variant_writes_kepub() -> Result<()> {
    let (_, _, output_dir) = setup_test_dirs("pipeline_kepub").await;
    let config = config_builder(&output_dir).device_variant(true).build()?;
    let source = Arc::new(MockPageSource::new());

    let outcome = timeout(
        LONG_TEST_TIMEOUT,
        config.process_volume(source, two_chapter_volume("2")),
    )
    .await
    .expect("Test timed out");

    let VolumeOutcome::Complete { output } = outcome.clone() else {
        panic!("Expected a complete volume, got {:?}", outcome);
    };
    assert!(output.to_string_lossy().ends_with(".kepub.epub"));
    assert_eq!(output, config.output_path("2"));
    assert!(verify_container(&output)?.is_valid());
    let opf = read_zip_entry(&output, "OEBPS/content.opf");
    assert!(opf.contains("<meta name=\"book-type\" content=\"manga\"/>"));
    Ok(())
}

#[tokio::test]
async fn test_cover_disabled() -> Result<()> {
    let (_, _, output_dir) = setup_test_dirs("pipeline_no_cover").await;
    let config = config_builder(&output_dir)
        .cover_options(CoverOptions::None)
        .build()?;
    let source = Arc::new(MockPageSource::new());

    let outcome = config.process_volume(source, two_chapter_volume("1")).await;
    assert!(outcome.is_complete());
    let report = verify_container(&config.output_path("1"))?;
    // heading + 2 pages, twice
    assert_eq!(report.spine_idrefs.len(), 6);
    let opf = read_zip_entry(&config.output_path("1"), "OEBPS/content.opf");
    assert!(!opf.contains("cover-image"));
    Ok(())
}

#[tokio::test]
async fn test_process_volumes_reports_in_order() -> Result<()> {
    let (_, _, output_dir) = setup_test_dirs("pipeline_batch").await;
    let config = config_builder(&output_dir).max_concurrent_volumes(2usize).build()?;
    let source = Arc::new(
        MockPageSource::new().with_behavior(&page_url("v2c1", 1), Behavior::AlwaysFail),
    );
    let requests = vec![
        two_chapter_volume("1"),
        two_chapter_volume("2"),
        volume_request("3", Vec::new()),
    ];

    let report = timeout(LONG_TEST_TIMEOUT, config.process_volumes(source, requests))
        .await
        .expect("Test timed out");

    let labels: Vec<&str> = report.outcomes.iter().map(|(l, _)| l.as_str()).collect();
    assert_eq!(labels, vec!["1", "2", "3"]);
    assert_eq!(report.successful(), 1);
    assert_eq!(report.failed(), 2);
    assert!(report.outcomes[0].1.is_complete());
    assert!(matches!(report.outcomes[1].1, VolumeOutcome::Incomplete { output: None, .. }));
    assert!(matches!(report.outcomes[2].1, VolumeOutcome::Failed { .. }));
    assert_eq!(report.stats.downloaded, 7);
    assert_eq!(report.stats.failed, 1);
    assert!(report.completed_at >= report.started_at);
    Ok(())
}

#[tokio::test]
async fn test_builder_validation() -> Result<()> {
    let (_, _, output_dir) = setup_test_dirs("pipeline_builder").await;

    assert!(SeihonConfig::builder().build().is_err());
    assert!(config_builder(&output_dir).max_concurrent_pages(0usize).build().is_err());
    assert!(config_builder(&output_dir).max_attempts(0u32).build().is_err());
    let err = config_builder(&output_dir)
        .backoff_multiplier(0.5)
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("backoff_multiplier"));

    let config = config_builder(&output_dir).build()?;
    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.reading_direction, Direction::Rtl);
    assert!(config.check_local);
    assert!(!config.device_variant);
    assert!(config.preflight_check().is_ok());

    let file = output_dir.join("not_a_dir");
    std::fs::write(&file, b"x")?;
    let config = config_builder(&file).build()?;
    assert!(config.preflight_check().is_err());
    Ok(())
}
