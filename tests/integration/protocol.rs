//! Wire-level conformance: these tests speak the protocol through a raw
//! socket instead of the client engine.

use crate::*;

use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;

use rft_core::puzzle;
use rft_core::wire::Packet;

/// Run the handshake from a raw socket up to the initial response.
/// Returns (connection id, file size, checksum).
async fn handshake(
    socket: &UdpSocket,
    server: std::net::SocketAddr,
    filename: &str,
) -> anyhow::Result<(u16, u64, [u8; 32])> {
    socket
        .send_to(
            &Packet::FileRequest {
                filename: filename.to_string(),
            }
            .encode(),
            server,
        )
        .await?;

    let Packet::ValidationRequest {
        difficulty,
        masked_hash,
        target_hash,
        nonce,
        ..
    } = recv_packet(socket).await?
    else {
        anyhow::bail!("expected a validation request");
    };

    let solution =
        puzzle::solve(&masked_hash, &target_hash, difficulty).expect("challenge is solvable");
    socket
        .send_to(
            &Packet::ValidationResponse {
                solution,
                nonce,
                max_throughput: 1,
                filename: filename.to_string(),
            }
            .encode(),
            server,
        )
        .await?;

    match recv_packet(socket).await? {
        Packet::InitialResponse {
            connection,
            file_size,
            checksum,
            ..
        } => Ok((connection, file_size, checksum)),
        other => anyhow::bail!("expected an initial response, got {other:?}"),
    }
}

#[tokio::test]
async fn tampered_solution_is_rejected() {
    let root = scratch("tamper-root");
    make_file(&root.join("t.bin"), 1024, 9);
    let server = start_server(&root).await.unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(
            &Packet::FileRequest {
                filename: "t.bin".into(),
            }
            .encode(),
            server.addr,
        )
        .await
        .unwrap();

    let Packet::ValidationRequest {
        difficulty,
        masked_hash,
        target_hash,
        nonce,
        ..
    } = recv_packet(&socket).await.unwrap()
    else {
        panic!("expected a validation request");
    };

    let mut solution = puzzle::solve(&masked_hash, &target_hash, difficulty).unwrap();
    solution[0] ^= 0x01;
    socket
        .send_to(
            &Packet::ValidationResponse {
                solution,
                nonce,
                max_throughput: 1,
                filename: "t.bin".into(),
            }
            .encode(),
            server.addr,
        )
        .await
        .unwrap();

    match recv_packet(&socket).await.unwrap() {
        Packet::ValidationFailed { filename } => assert_eq!(filename, "t.bin"),
        other => panic!("expected validation failure, got {other:?}"),
    }

    server.stop();
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn unknown_tags_draw_no_response() {
    let root = scratch("unknown-root");
    make_file(&root.join("u.bin"), 512, 10);
    let server = start_server(&root).await.unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&[0xEE, 0x01, 0x02, 0x03], server.addr)
        .await
        .unwrap();
    expect_silence(&socket, Duration::from_millis(300)).await;

    // The server is still alive and answering real requests.
    socket
        .send_to(
            &Packet::FileRequest {
                filename: "u.bin".into(),
            }
            .encode(),
            server.addr,
        )
        .await
        .unwrap();
    assert!(matches!(
        recv_packet(&socket).await.unwrap(),
        Packet::ValidationRequest { .. }
    ));

    server.stop();
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn payloads_follow_the_connection_to_a_new_address() {
    let root = scratch("migrate-root");
    let data = make_file(&root.join("m.bin"), 1124, 11);
    let server = start_server(&root).await.unwrap();

    // Handshake from the first address.
    let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (connection, file_size, _) = handshake(&first, server.addr, "m.bin").await.unwrap();
    assert_eq!(file_size, data.len() as u64);

    // The next request arrives from a different socket; every payload of
    // the window must follow it there.
    let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    second
        .send_to(
            &Packet::TransmissionRequest {
                connection,
                window_id: 0,
                rtt: 1_000,
                chunk_index: 0,
            }
            .encode(),
            server.addr,
        )
        .await
        .unwrap();

    let mut chunks: Vec<(u16, Bytes)> = Vec::new();
    let mut window_size = u16::MAX;
    while chunks.len() < window_size as usize {
        match recv_packet(&second).await.unwrap() {
            Packet::Payload {
                connection: cid,
                window_size: size,
                sequence,
                chunk,
                ..
            } => {
                assert_eq!(cid, connection);
                window_size = size;
                chunks.push((sequence, chunk));
            }
            other => panic!("expected payload, got {other:?}"),
        }
    }
    expect_silence(&first, Duration::from_millis(300)).await;

    chunks.sort_by_key(|(sequence, _)| *sequence);
    let assembled: Vec<u8> = chunks
        .into_iter()
        .flat_map(|(_, chunk)| chunk.to_vec())
        .collect();
    // The congestion window starts at one chunk; only the head of the
    // file arrives in the first generation.
    assert_eq!(&data[..assembled.len()], &assembled[..]);
    assert!(!assembled.is_empty());

    second
        .send_to(&Packet::Finish { connection }.encode(), server.addr)
        .await
        .unwrap();

    server.stop();
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn unknown_connection_is_answered_explicitly() {
    let root = scratch("unknown-conn-root");
    let server = start_server(&root).await.unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(
            &Packet::TransmissionRequest {
                connection: 999,
                window_id: 0,
                rtt: 1_000,
                chunk_index: 0,
            }
            .encode(),
            server.addr,
        )
        .await
        .unwrap();

    match recv_packet(&socket).await.unwrap() {
        Packet::ConnectionNotFound { connection } => assert_eq!(connection, 999),
        other => panic!("expected connection-not-found, got {other:?}"),
    }

    server.stop();
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn cleared_bitfield_bits_are_retransmitted() {
    let root = scratch("retransmit-root");
    let data = make_file(&root.join("rt.bin"), 1124, 12);
    let server = start_server(&root).await.unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (connection, ..) = handshake(&socket, server.addr, "rt.bin").await.unwrap();

    socket
        .send_to(
            &Packet::TransmissionRequest {
                connection,
                window_id: 0,
                rtt: 1_000,
                chunk_index: 0,
            }
            .encode(),
            server.addr,
        )
        .await
        .unwrap();

    // Drain the first window.
    let mut received: Vec<(u16, Bytes)> = Vec::new();
    let mut window_size = u16::MAX;
    while received.len() < window_size as usize {
        match recv_packet(&socket).await.unwrap() {
            Packet::Payload {
                window_size: size,
                sequence,
                chunk,
                ..
            } => {
                window_size = size;
                received.push((sequence, chunk));
            }
            other => panic!("expected payload, got {other:?}"),
        }
    }
    received.sort_by_key(|(sequence, _)| *sequence);
    assert_eq!(&received[0].1[..], &data[..received[0].1.len()]);

    // Pretend chunk 0 went missing: every other bit is set, bit 0 is not.
    let mut bits = rft_core::bitfield::Bitfield::new(window_size);
    for sequence in 1..window_size {
        bits.set(sequence, true);
    }
    socket
        .send_to(
            &Packet::RetransmissionRequest {
                connection,
                window_id: 0,
                bitfield: Bytes::copy_from_slice(bits.as_bytes()),
            }
            .encode(),
            server.addr,
        )
        .await
        .unwrap();

    // Exactly the missing chunk comes back.
    let again = match recv_packet(&socket).await.unwrap() {
        Packet::Payload { sequence, chunk, .. } => {
            assert_eq!(sequence, 0);
            chunk
        }
        other => panic!("expected retransmitted payload, got {other:?}"),
    };
    assert_eq!(received[0].1, again);
    expect_silence(&socket, Duration::from_millis(300)).await;

    socket
        .send_to(&Packet::Finish { connection }.encode(), server.addr)
        .await
        .unwrap();

    server.stop();
    let _ = std::fs::remove_dir_all(&root);
}
