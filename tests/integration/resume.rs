//! Crash/resume behavior driven through the on-disk sidecar.

use crate::*;

use std::path::Path;

use rft_core::crypto;
use rft_core::TransferError;

/// Write the partial destination + sidecar an interrupted run would leave.
fn plant_partial(dest: &Path, name: &str, prefix: &[u8], full: &[u8]) {
    let path = dest.join(name);
    std::fs::write(&path, prefix).unwrap();
    let state = serde_json::json!({
        "checksum": hex::encode(crypto::digest(full)),
        "file_size": full.len() as u64,
        "bytes_written": prefix.len() as u64,
        "chunks_written": (prefix.len() / 512) as u64,
    });
    std::fs::write(
        dest.join(format!("{name}.resume")),
        serde_json::to_vec(&state).unwrap(),
    )
    .unwrap();
}

#[tokio::test]
async fn interrupted_transfer_resumes_and_completes() {
    let root = scratch("resume-root");
    let dest = scratch("resume-dest");
    let data = make_file(&root.join("r.bin"), 6000, 6);
    // A previous run got the first four chunks onto disk.
    plant_partial(&dest, "r.bin", &data[..2048], &data);

    let server = start_server(&root).await.unwrap();
    let reports = fetch(server.addr, &dest, &["r.bin"]).await.unwrap();

    let path = report_for(&reports, "r.bin")
        .outcome
        .as_ref()
        .expect("resumed transfer should succeed");
    assert_eq!(std::fs::read(path).unwrap(), data);
    assert!(!dest.join("r.bin.resume").exists());

    server.stop();
    let _ = std::fs::remove_dir_all(&root);
    let _ = std::fs::remove_dir_all(&dest);
}

/// The resumed run must trust the sidecar and serve only the tail. A
/// poisoned prefix therefore survives untouched until the final digest
/// check flags the file as corrupt — proof that no early chunk was
/// transferred again.
#[tokio::test]
async fn resume_serves_only_the_tail() {
    let root = scratch("poison-root");
    let dest = scratch("poison-dest");
    let data = make_file(&root.join("p.bin"), 6000, 7);
    let garbage = vec![0u8; 2048];
    plant_partial(&dest, "p.bin", &garbage, &data);

    let server = start_server(&root).await.unwrap();
    let reports = fetch(server.addr, &dest, &["p.bin"]).await.unwrap();

    let report = report_for(&reports, "p.bin");
    assert!(
        matches!(report.outcome, Err(TransferError::ChecksumMismatch(_))),
        "poisoned prefix must surface as corruption, got {:?}",
        report.outcome
    );
    // Corrupt output is deleted together with its bookkeeping.
    assert!(!dest.join("p.bin").exists());
    assert!(!dest.join("p.bin.resume").exists());

    server.stop();
    let _ = std::fs::remove_dir_all(&root);
    let _ = std::fs::remove_dir_all(&dest);
}

#[tokio::test]
async fn changed_remote_file_restarts_from_scratch() {
    let root = scratch("changed-root");
    let dest = scratch("changed-dest");
    let data = make_file(&root.join("c.bin"), 4096, 8);
    // Sidecar recorded against an older version of the file.
    let old = vec![0xAA; 4096];
    plant_partial(&dest, "c.bin", &old[..1024], &old);

    let server = start_server(&root).await.unwrap();
    let reports = fetch(server.addr, &dest, &["c.bin"]).await.unwrap();

    let path = report_for(&reports, "c.bin")
        .outcome
        .as_ref()
        .expect("fresh transfer should succeed");
    assert_eq!(std::fs::read(path).unwrap(), data);

    server.stop();
    let _ = std::fs::remove_dir_all(&root);
    let _ = std::fs::remove_dir_all(&dest);
}
