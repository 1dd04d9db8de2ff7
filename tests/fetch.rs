//! Tests for the page fetcher: resume, retries, validation and cancellation.

use image::ImageFormat;
use seihon::error::Result;
use seihon::fetch::{FetchPolicy, PageFetcher, PageSource};
use seihon::manifest::VolumeManifest;
use seihon::types::{CompletionStatus, PageSpec, PageStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

mod common;
use common::{
    Behavior, MockPageSource, TEST_TIMEOUT, chapter_request, encoded_image, files_with_suffix,
    page_url, setup_test_dirs, volume_request,
};

fn fast_policy() -> FetchPolicy {
    FetchPolicy {
        retry_delay: Duration::from_millis(10),
        page_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_fetch_chapter_into_empty_dir_then_skip_on_rerun() -> Result<()> {
    let (test_dir, _, _) = setup_test_dirs("fetch_scenario").await;
    let chapter_dir = test_dir.join("chapter_0001");
    let source = Arc::new(
        MockPageSource::new()
            .with_behavior("https://x/a.jpg", Behavior::Serve(encoded_image(ImageFormat::Jpeg)))
            .with_behavior("https://x/b.png", Behavior::Serve(encoded_image(ImageFormat::Png))),
    );
    let pages = PageSpec::from_urls(["https://x/a.jpg", "https://x/b.png"]);
    let fetcher = PageFetcher::new(source.clone(), fast_policy());

    let first = timeout(
        TEST_TIMEOUT,
        fetcher.fetch_chapter("c1", &pages, &chapter_dir, None, false),
    )
    .await
    .expect("Test timed out")?;

    assert!(first.is_complete());
    assert_eq!(first.stats.downloaded, 2);
    assert_eq!(first.stats.skipped, 0);
    assert_eq!(first.stats.failed, 0);
    assert!(chapter_dir.join("001.jpg").is_file());
    assert!(chapter_dir.join("002.png").is_file());
    assert_eq!(
        first.files,
        vec![chapter_dir.join("001.jpg"), chapter_dir.join("002.png")]
    );

    let before = std::fs::read(chapter_dir.join("001.jpg"))?;
    source.reset_calls();
    let second = timeout(
        TEST_TIMEOUT,
        fetcher.fetch_chapter("c1", &pages, &chapter_dir, None, false),
    )
    .await
    .expect("Test timed out")?;

    assert_eq!(second.stats.downloaded, 0);
    assert_eq!(second.stats.skipped, 2);
    assert_eq!(second.stats.failed, 0);
    assert_eq!(source.calls(), 0);
    assert_eq!(std::fs::read(chapter_dir.join("001.jpg"))?, before);
    Ok(())
}

#[tokio::test]
async fn test_resumed_volume_skips_completed_chapter() -> Result<()> {
    let (test_dir, _, _) = setup_test_dirs("fetch_resume").await;
    let volume_path = test_dir.join("volume_1");
    let broken = page_url("c2", 2);
    let source = Arc::new(MockPageSource::new().with_behavior(&broken, Behavior::AlwaysFail));
    let request = volume_request(
        "1",
        vec![
            chapter_request("c1", "1", 3),
            chapter_request("c2", "2", 3),
            chapter_request("c3", "3", 2),
        ],
    );
    let fetcher = PageFetcher::new(source.clone(), fast_policy());

    let (report, _) = timeout(TEST_TIMEOUT, fetcher.fetch_volume(&request, &volume_path, false))
        .await
        .expect("Test timed out")?;
    assert!(!report.is_complete());
    assert_eq!(report.successful_chapters(), 2);

    let manifest = VolumeManifest::load(&volume_path)
        .await
        .expect("manifest written");
    assert_eq!(manifest.chapters["c1"].status, CompletionStatus::Complete);
    assert_eq!(manifest.chapters["c2"].status, CompletionStatus::Incomplete);
    assert_eq!(
        manifest.page_record("c2", 2).map(|p| p.status),
        Some(PageStatus::Invalid)
    );
    assert_eq!(manifest.status, CompletionStatus::Incomplete);

    source.reset_calls();
    let (rerun, _) = timeout(TEST_TIMEOUT, fetcher.fetch_volume(&request, &volume_path, false))
        .await
        .expect("Test timed out")?;

    for page in 1..=3 {
        assert_eq!(source.calls_for(&page_url("c1", page)), 0);
    }
    assert_eq!(source.calls_for(&page_url("c2", 1)), 0);
    assert_eq!(source.calls_for(&broken), 3);
    assert_eq!(rerun.stats.skipped, 7);
    assert_eq!(rerun.stats.failed, 1);
    Ok(())
}

#[tokio::test]
async fn test_unwritable_manifest_does_not_stop_fetching() -> Result<()> {
    let (test_dir, _, _) = setup_test_dirs("fetch_manifest_blocked").await;
    let volume_path = test_dir.join("volume_1");
    let manifest_path = VolumeManifest::path_in(&volume_path);
    std::fs::create_dir_all(&manifest_path)?;
    std::fs::write(manifest_path.join("occupied"), b"x")?;

    let source = Arc::new(MockPageSource::new());
    let request = volume_request(
        "1",
        vec![chapter_request("c1", "1", 2), chapter_request("c2", "2", 1)],
    );
    let fetcher = PageFetcher::new(source.clone(), fast_policy());

    let (report, handle) = timeout(TEST_TIMEOUT, fetcher.fetch_volume(&request, &volume_path, false))
        .await
        .expect("Test timed out")?;

    assert!(report.is_complete());
    assert_eq!(report.stats.downloaded, 3);
    assert_eq!(report.stats.failed, 0);
    assert_eq!(source.calls(), 3);
    assert!(volume_path.join("chapter_0001").join("001.png").is_file());
    assert!(volume_path.join("chapter_0001").join("002.png").is_file());
    assert!(volume_path.join("chapter_0002").join("001.png").is_file());

    // Progress is still tracked in memory while the file cannot be replaced.
    let snapshot = handle.snapshot().await;
    assert_eq!(snapshot.status, CompletionStatus::Complete);
    assert_eq!(snapshot.chapter_summary(), (2, 2));
    assert!(manifest_path.is_dir());
    assert!(VolumeManifest::load(&volume_path).await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_transient_failures_are_retried() -> Result<()> {
    let (test_dir, _, _) = setup_test_dirs("fetch_retry").await;
    let url = "https://x/flaky.png";
    let source = Arc::new(
        MockPageSource::new().with_behavior(url, Behavior::FailTimes(2, encoded_image(ImageFormat::Png))),
    );
    let fetcher = PageFetcher::new(source.clone(), fast_policy());

    let outcome = timeout(
        TEST_TIMEOUT,
        fetcher.fetch_chapter("c1", &PageSpec::from_urls([url]), &test_dir, None, false),
    )
    .await
    .expect("Test timed out")?;

    assert!(outcome.is_complete());
    assert_eq!(outcome.stats.retries, 2);
    assert_eq!(source.calls_for(url), 3);
    Ok(())
}

#[tokio::test]
async fn test_exhausted_page_leaves_no_partial_files() -> Result<()> {
    let (test_dir, _, _) = setup_test_dirs("fetch_exhausted").await;
    let broken = "https://x/broken.png";
    let corrupt = "https://x/corrupt.png";
    let source = Arc::new(
        MockPageSource::new()
            .with_behavior(broken, Behavior::AlwaysFail)
            .with_behavior(corrupt, Behavior::Serve(b"definitely not an image".to_vec())),
    );
    let pages = PageSpec::from_urls([broken, corrupt, "https://x/fine.png"]);
    let fetcher = PageFetcher::new(source.clone(), fast_policy());

    let outcome = timeout(
        TEST_TIMEOUT,
        fetcher.fetch_chapter("c1", &pages, &test_dir, None, false),
    )
    .await
    .expect("Test timed out")?;

    assert!(!outcome.is_complete());
    assert_eq!(outcome.successful, 1);
    assert_eq!(outcome.stats.failed, 2);
    assert_eq!(source.calls_for(broken), 3);
    assert_eq!(source.calls_for(corrupt), 3);
    assert!(!test_dir.join("001.png").exists());
    assert!(!test_dir.join("002.png").exists());
    assert!(test_dir.join("003.png").is_file());
    assert!(files_with_suffix(&test_dir, ".tmp").is_empty());
    Ok(())
}

#[tokio::test]
async fn test_stuck_page_times_out() -> Result<()> {
    let (test_dir, _, _) = setup_test_dirs("fetch_timeout").await;
    let url = "https://x/stuck.png";
    let source = Arc::new(MockPageSource::new().with_behavior(url, Behavior::Hang));
    let policy = FetchPolicy {
        max_attempts: 1,
        page_timeout: Duration::from_millis(100),
        ..fast_policy()
    };
    let fetcher = PageFetcher::new(source, policy);

    let outcome = timeout(
        TEST_TIMEOUT,
        fetcher.fetch_chapter("c1", &PageSpec::from_urls([url]), &test_dir, None, false),
    )
    .await
    .expect("Test timed out")?;

    assert_eq!(outcome.stats.failed, 1);
    assert_eq!(outcome.successful, 0);
    Ok(())
}

#[tokio::test]
async fn test_cancellation_stops_pending_pages() -> Result<()> {
    let (test_dir, _, _) = setup_test_dirs("fetch_cancel").await;
    let volume_path = test_dir.join("volume_1");
    let mut source = MockPageSource::new();
    for page in 1..=4 {
        source = source.with_behavior(&page_url("c1", page), Behavior::Hang);
    }
    let cancel = CancellationToken::new();
    let fetcher = PageFetcher::new(Arc::new(source), fast_policy()).with_cancellation(cancel.clone());
    let request = volume_request("1", vec![chapter_request("c1", "1", 4)]);

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });
    let (report, _) = timeout(TEST_TIMEOUT, fetcher.fetch_volume(&request, &volume_path, false))
        .await
        .expect("Cancellation did not stop the fetch")?;
    canceller.await?;

    assert_eq!(report.stats.failed, 4);
    assert!(!report.is_complete());
    let manifest = VolumeManifest::load(&volume_path)
        .await
        .expect("manifest stays readable after cancellation");
    assert_eq!(manifest.status, CompletionStatus::Incomplete);
    assert!(files_with_suffix(&volume_path, ".png").is_empty());
    Ok(())
}

#[tokio::test]
async fn test_force_redownload_ignores_local_files() -> Result<()> {
    let (test_dir, _, _) = setup_test_dirs("fetch_force").await;
    let source = Arc::new(MockPageSource::new());
    let pages = PageSpec::from_urls([page_url("c1", 1), page_url("c1", 2)]);
    let fetcher = PageFetcher::new(source.clone(), fast_policy());

    fetcher
        .fetch_chapter("c1", &pages, &test_dir, None, false)
        .await?;
    source.reset_calls();
    let forced = fetcher
        .fetch_chapter("c1", &pages, &test_dir, None, true)
        .await?;

    assert_eq!(forced.stats.downloaded, 2);
    assert_eq!(source.calls(), 2);
    Ok(())
}

#[tokio::test]
async fn test_fetch_volumes_keeps_request_order() -> Result<()> {
    let (test_dir, _, _) = setup_test_dirs("fetch_volumes").await;
    let source: Arc<dyn PageSource> = Arc::new(MockPageSource::new());
    let fetcher = PageFetcher::new(source, fast_policy());
    let requests = vec![
        volume_request("2", vec![chapter_request("b", "5", 1)]),
        volume_request("1", vec![chapter_request("a", "1", 2)]),
    ];

    let results = timeout(
        TEST_TIMEOUT,
        fetcher.fetch_volumes(requests, |r| test_dir.join(format!("volume_{}", r.volume)), false),
    )
    .await
    .expect("Test timed out");

    let volumes: Vec<String> = results
        .into_iter()
        .map(|r| r.map(|report| report.volume))
        .collect::<Result<_>>()?;
    assert_eq!(volumes, vec!["2".to_string(), "1".to_string()]);
    assert!(test_dir.join("volume_1").join("manifest.json").is_file());
    Ok(())
}
