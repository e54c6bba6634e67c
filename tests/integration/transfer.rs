//! End-to-end transfers: clean runs, concurrency, loss, and missing files.

use crate::*;

use rft_core::crypto;
use rft_core::TransferError;
use rft_engine::loss::GilbertLoss;

#[tokio::test]
async fn two_chunk_file_transfers_cleanly() {
    let root = scratch("two-chunk-root");
    let dest = scratch("two-chunk-dest");
    let data = make_file(&root.join("pair.bin"), 1024, 1);

    let server = start_server(&root).await.unwrap();
    let reports = fetch(server.addr, &dest, &["pair.bin"]).await.unwrap();

    let report = report_for(&reports, "pair.bin");
    let path = report.outcome.as_ref().expect("transfer should succeed");
    assert_eq!(std::fs::read(path).unwrap(), data);
    assert_eq!(crypto::digest_file(path).unwrap(), crypto::digest(&data));
    // A finished transfer leaves no resume bookkeeping behind.
    assert!(!dest.join("pair.bin.resume").exists());

    server.stop();
    let _ = std::fs::remove_dir_all(&root);
    let _ = std::fs::remove_dir_all(&dest);
}

#[tokio::test]
async fn short_final_chunk_is_preserved() {
    let root = scratch("short-root");
    let dest = scratch("short-dest");
    // Three chunks, the last 276 bytes.
    let data = make_file(&root.join("tail.bin"), 1300, 2);

    let server = start_server(&root).await.unwrap();
    let reports = fetch(server.addr, &dest, &["tail.bin"]).await.unwrap();

    let path = report_for(&reports, "tail.bin")
        .outcome
        .as_ref()
        .expect("transfer should succeed");
    assert_eq!(std::fs::read(path).unwrap(), data);

    server.stop();
    let _ = std::fs::remove_dir_all(&root);
    let _ = std::fs::remove_dir_all(&dest);
}

#[tokio::test]
async fn empty_file_transfers_cleanly() {
    let root = scratch("empty-root");
    let dest = scratch("empty-dest");
    make_file(&root.join("zero.bin"), 0, 0);

    let server = start_server(&root).await.unwrap();
    let reports = fetch(server.addr, &dest, &["zero.bin"]).await.unwrap();

    let path = report_for(&reports, "zero.bin")
        .outcome
        .as_ref()
        .expect("transfer should succeed");
    assert_eq!(std::fs::metadata(path).unwrap().len(), 0);

    server.stop();
    let _ = std::fs::remove_dir_all(&root);
    let _ = std::fs::remove_dir_all(&dest);
}

#[tokio::test]
async fn concurrent_requests_both_complete() {
    let root = scratch("pair-root");
    let dest = scratch("pair-dest");
    let data_a = make_file(&root.join("a.bin"), 3000, 3);
    let data_b = make_file(&root.join("b.bin"), 5000, 4);

    let server = start_server(&root).await.unwrap();
    let reports = fetch(server.addr, &dest, &["a.bin", "b.bin"]).await.unwrap();
    assert_eq!(reports.len(), 2);

    let path_a = report_for(&reports, "a.bin").outcome.as_ref().unwrap();
    let path_b = report_for(&reports, "b.bin").outcome.as_ref().unwrap();
    assert_eq!(std::fs::read(path_a).unwrap(), data_a);
    assert_eq!(std::fs::read(path_b).unwrap(), data_b);

    server.stop();
    let _ = std::fs::remove_dir_all(&root);
    let _ = std::fs::remove_dir_all(&dest);
}

#[tokio::test]
async fn transfer_survives_simulated_loss() {
    let root = scratch("lossy-root");
    let dest = scratch("lossy-dest");
    // 128 chunks; plenty of opportunities to drop payloads.
    let data = make_file(&root.join("lossy.bin"), 64 * 1024, 5);

    let server = start_server(&root).await.unwrap();
    let loss = GilbertLoss::seeded(0.15, 0.8, 42);
    let reports = fetch_with_loss(server.addr, &dest, &["lossy.bin"], loss)
        .await
        .unwrap();

    let path = report_for(&reports, "lossy.bin")
        .outcome
        .as_ref()
        .expect("transfer should survive loss");
    assert_eq!(std::fs::read(path).unwrap(), data);

    server.stop();
    let _ = std::fs::remove_dir_all(&root);
    let _ = std::fs::remove_dir_all(&dest);
}

#[tokio::test]
async fn missing_file_is_reported_not_found() {
    let root = scratch("missing-root");
    let dest = scratch("missing-dest");

    let server = start_server(&root).await.unwrap();
    let reports = fetch(server.addr, &dest, &["absent.bin"]).await.unwrap();

    let report = report_for(&reports, "absent.bin");
    assert!(
        matches!(report.outcome, Err(TransferError::FileNotFound(_))),
        "unexpected outcome: {:?}",
        report.outcome
    );
    assert!(!dest.join("absent.bin").exists());

    server.stop();
    let _ = std::fs::remove_dir_all(&root);
    let _ = std::fs::remove_dir_all(&dest);
}
