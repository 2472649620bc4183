mod common;

use common::*;
use odm_catalog::config::CategorySettings;
use odm_catalog::models::{CatalogItem, Presence};
use odm_catalog::pipeline::{ErrorKind, Pipeline, PipelineError, ProgressSink};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

async fn run(
    pipeline: &Pipeline<MockTransport>,
    item: &CatalogItem,
) -> (Result<std::path::PathBuf, PipelineError>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let result = pipeline
        .run(item, &CancellationToken::new(), sink.clone() as Arc<dyn ProgressSink>)
        .await;
    (result, sink)
}

#[tokio::test]
async fn insufficient_space_fails_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let temp_dir = settings.temp_dir.clone();

    let transport = MockTransport::new();
    transport.route("http://mock/big.iso", MockResponse::ok(vec![0u8; 1000]));
    let pipeline = pipeline(transport, settings).with_space_probe(Arc::new(FixedSpace(1999)));

    let item = CatalogItem::new("big", "Big", "http://mock/big.iso", "ps2", 1000);
    let (result, sink) = run(&pipeline, &item).await;

    match result {
        Err(e @ PipelineError::InsufficientSpace { .. }) => {
            assert_eq!(e.kind(), ErrorKind::Disk);
            if let PipelineError::InsufficientSpace { required, available } = e {
                assert_eq!(required, 2000);
                assert_eq!(available, 1999);
            }
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(files_under(&temp_dir).is_empty());
    assert_eq!(sink.max_downloaded(), 0);
}

#[tokio::test]
async fn plain_file_is_moved_under_its_decoded_name() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let dest = settings.category_folder("nes").join("Some Game (USA).nes");
    let temp_dir = settings.temp_dir.clone();

    let url = "http://mock/roms/Some%20Game%20%28USA%29.nes?mirror=2";
    let transport = MockTransport::new();
    transport.route(url, MockResponse::ok(b"NES\x1a rom body".to_vec()));
    let pipeline = pipeline(transport, settings);

    let item = CatalogItem::new("g", "Some Game", url, "nes", 0);
    item.set_presence(Presence::Missing);
    let (result, sink) = run(&pipeline, &item).await;

    assert_eq!(result.unwrap(), dest);
    assert_eq!(std::fs::read(&dest).unwrap(), b"NES\x1a rom body");
    assert!(files_under(&temp_dir).is_empty());
    assert_eq!(item.presence(), Presence::Unknown);

    let (text, downloaded, total) = sink.last_progress().unwrap();
    assert_eq!(text, "Complete!");
    assert_eq!((downloaded, total), (13, 13));
    for (_, downloaded, total) in sink.progress.lock().unwrap().iter() {
        if *total > 0 {
            assert!(downloaded <= total);
        }
    }
    assert!(!*sink.extracting.lock().unwrap());
}

#[tokio::test]
async fn archives_are_extracted_into_a_per_item_folder() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());

    let archive = ZipBuilder::new()
        .stored("a.txt", b"hello")
        .deflated("b.bin", &[0u8; 10 * 1024])
        .finish();
    let transport = MockTransport::new();
    transport.route("http://mock/Crash.zip", MockResponse::ok(archive));
    let pipeline = pipeline(transport, settings.clone());

    let item = CatalogItem::new("c", "Crash: Warped", "http://mock/Crash.zip", "psx", 0);
    let (result, sink) = run(&pipeline, &item).await;

    let folder = settings.category_folder("psx").join("Crash_ Warped");
    assert_eq!(result.unwrap(), folder);
    assert_eq!(std::fs::read(folder.join("a.txt")).unwrap(), b"hello");
    assert_eq!(std::fs::read(folder.join("b.bin")).unwrap(), vec![0u8; 10 * 1024]);
    assert!(files_under(&settings.temp_dir).is_empty());

    assert!(*sink.extracting.lock().unwrap());
    let extract = sink.extract.lock().unwrap();
    assert_eq!(extract.first().unwrap().0.as_deref(), Some("a.txt"));
    let (entry, extracted, total) = extract.last().unwrap().clone();
    assert_eq!(entry, None);
    assert_eq!(extracted, total);
}

#[tokio::test]
async fn corrupt_archives_fail_and_leave_no_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let temp_dir = settings.temp_dir.clone();

    let transport = MockTransport::new();
    transport.route("http://mock/broken.zip", MockResponse::ok(b"not a zip at all".to_vec()));
    let pipeline = pipeline(transport, settings);

    let item = CatalogItem::new("x", "Broken", "http://mock/broken.zip", "snes", 0);
    let (result, _) = run(&pipeline, &item).await;

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Format);
    assert!(files_under(&temp_dir).is_empty());
}

#[tokio::test]
async fn interrupted_transfers_resume_from_the_written_offset() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let url = "http://mock/game.bin";
    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

    let transport = MockTransport::new();
    transport.route(
        url,
        MockResponse::Interrupted {
            data: data[..6000].to_vec(),
            content_length: Some(10_000),
        },
    );
    transport.route(
        url,
        MockResponse::Body {
            data: data[6000..].to_vec(),
            content_length: Some(4000),
            resumed: true,
        },
    );
    let pipeline = pipeline(transport.clone(), settings);

    let item = CatalogItem::new("g", "Game", url, "gba", 0);
    let (result, sink) = run(&pipeline, &item).await;

    assert_eq!(std::fs::read(result.unwrap()).unwrap(), data);
    assert_eq!(
        transport.opens(),
        vec![(url.to_string(), 0), (url.to_string(), 6000)]
    );
    assert_eq!(sink.last_progress().unwrap().1, 10_000);
}

#[tokio::test]
async fn a_server_ignoring_the_range_restarts_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let url = "http://mock/game.bin";
    let data = vec![5u8; 8000];

    let transport = MockTransport::new();
    transport.route(
        url,
        MockResponse::Interrupted {
            data: data[..3000].to_vec(),
            content_length: Some(8000),
        },
    );
    transport.route(url, MockResponse::ok(data.clone()));
    let pipeline = pipeline(transport, settings);

    let item = CatalogItem::new("g", "Game", url, "gba", 0);
    let (result, _) = run(&pipeline, &item).await;

    assert_eq!(std::fs::read(result.unwrap()).unwrap(), data);
}

#[tokio::test]
async fn transfer_fails_once_retries_are_used_up() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.transfer_retries = 1;
    let temp_dir = settings.temp_dir.clone();
    let url = "http://mock/game.bin";

    let transport = MockTransport::new();
    transport.route(
        url,
        MockResponse::Interrupted {
            data: vec![1u8; 100],
            content_length: Some(1000),
        },
    );
    let pipeline = pipeline(transport.clone(), settings);

    let item = CatalogItem::new("g", "Game", url, "gba", 0);
    let (result, _) = run(&pipeline, &item).await;

    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transfer);
    assert_eq!(transport.opens().len(), 2);
    assert!(files_under(&temp_dir).is_empty());
}

#[tokio::test]
async fn checksum_is_verified_when_present() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let sha_abc = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    let transport = MockTransport::new();
    transport.route("http://mock/abc.txt", MockResponse::ok(b"abc".to_vec()));
    transport.route("http://mock/abd.txt", MockResponse::ok(b"abd".to_vec()));
    let pipeline = pipeline(transport, settings.clone());

    let good = CatalogItem::new("1", "abc", "http://mock/abc.txt", "nes", 3).with_sha256(sha_abc);
    let (result, _) = run(&pipeline, &good).await;
    assert!(result.unwrap().exists());

    let bad = CatalogItem::new("2", "abd", "http://mock/abd.txt", "nes", 3).with_sha256(sha_abc);
    let (result, _) = run(&pipeline, &bad).await;
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Integrity);
    assert!(files_under(&settings.temp_dir).is_empty());
    assert!(!settings.category_folder("nes").join("abd.txt").exists());
}

#[tokio::test]
async fn cancellation_removes_the_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let temp_dir = settings.temp_dir.clone();

    let transport = MockTransport::new();
    let gate = Gate::new();
    transport.route("http://mock/slow.bin", MockResponse::gated(vec![0u8; 1000], 100, &gate));
    let pipeline = pipeline(transport, settings);

    let item = CatalogItem::new("s", "Slow", "http://mock/slow.bin", "nes", 0);
    let sink = Arc::new(RecordingSink::default());
    let token = CancellationToken::new();

    let task = {
        let pipeline = pipeline.clone();
        let token = token.clone();
        let sink = sink.clone() as Arc<dyn ProgressSink>;
        tokio::spawn(async move { pipeline.run(&item, &token, sink).await })
    };

    let watched = sink.clone();
    wait_until(move || {
        let watched = watched.clone();
        async move { watched.max_downloaded() == 100 }
    })
    .await;
    let partial = files_under(&temp_dir);
    assert_eq!(partial.len(), 1);
    assert!(partial[0].ends_with("slow.bin"));

    token.cancel();
    let result = task.await.unwrap();
    assert!(matches!(result, Err(PipelineError::Cancelled)));
    assert!(files_under(&temp_dir).is_empty());
}

#[tokio::test]
async fn connect_failures_and_relative_urls() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.categories.insert(
        "gb".to_string(),
        CategorySettings {
            folder: "ROMS/GB".into(),
            base_url: Some("http://mirror/files/".to_string()),
            per_item_folder: false,
        },
    );

    let transport = MockTransport::new();
    transport.route("http://mirror/files/tetris.gb", MockResponse::ok(b"tetris".to_vec()));
    let pipeline = pipeline(transport.clone(), settings);

    let relative = CatalogItem::new("t", "Tetris", "tetris.gb", "gb", 6);
    let (result, _) = run(&pipeline, &relative).await;
    assert!(result.unwrap().ends_with("ROMS/GB/tetris.gb"));

    let unreachable = CatalogItem::new("u", "Nowhere", "http://mock/nowhere.gb", "gb", 0);
    let (result, _) = run(&pipeline, &unreachable).await;
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Connect);

    let no_base = CatalogItem::new("n", "No base", "tetris.gb", "nes", 0);
    let (result, _) = run(&pipeline, &no_base).await;
    assert!(matches!(result, Err(PipelineError::InvalidUrl(_))));
    assert_eq!(transport.opens().len(), 2);
}
