//! 루프백 종단간 전송 테스트
//!
//! 수신자는 백그라운드 태스크에서 실행하고 송신자는 임시 파일을 전송한다.
//! 장애 테스트는 두 소켓 사이에 ACK·Data 손실, 순서 뒤바뀜, 중복, 지난 Setup 응답 재전송을 주입하는 릴레이를 둔다.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;

use rft::{Config, Error, FileSender, Packet, Receiver, MAX_PAYLOAD_SIZE};

fn test_config() -> Config {
    Config {
        retransmit_interval_ms: 100,
        ..Config::default()
    }
}

async fn start_receiver(config: Config) -> (Arc<Receiver>, SocketAddr) {
    let receiver = Receiver::bind(config, "127.0.0.1:0".parse().unwrap())
        .await
        .expect("bind receiver");
    let receiver = Arc::new(receiver);
    let addr = receiver.local_addr().unwrap();
    tokio::spawn(receiver.clone().run());
    (receiver, addr)
}

fn write_source(dir: &TempDir, len: usize) -> (std::path::PathBuf, Vec<u8>) {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    let path = dir.path().join("source.bin");
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

fn destination(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().into_owned()
}

/// 종료 콜백이 레지스트리를 비울 때까지 대기
async fn wait_until_idle(receiver: &Receiver) {
    for _ in 0..200 {
        if receiver.registry().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("전송이 레지스트리에서 제거되지 않음");
}

fn assert_same_file(path: impl AsRef<Path>, expected: &[u8]) {
    let received = std::fs::read(path).unwrap();
    assert_eq!(received.len(), expected.len(), "크기 불일치");
    assert!(received == expected, "내용 불일치");
}

/// 릴레이가 주입할 장애
#[derive(Default)]
struct Faults {
    /// 수신자 → 송신자: 한 번씩 버릴 ACK 시퀀스
    drop_acks_once: Vec<u32>,
    /// 송신자 → 수신자: 첫 전송만 버릴 Data 시퀀스
    drop_data_once: Vec<u32>,
    /// 짝수 시퀀스 Data를 다음 패킷 뒤로 미룸
    reorder_data: bool,
    /// 모든 Data를 두 번 전달
    duplicate_data: bool,
    /// Setup이 지나갈 때마다 이전 Setup 응답을 원래 받았던 주소로 다시 보냄
    replay_setup_replies: bool,
}

/// 송신자와 수신자 사이에서 장애를 주입하는 릴레이. 반환값: (릴레이 주소, 버린 패킷 수)
async fn spawn_relay(receiver: SocketAddr, faults: Faults) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let dropped = Arc::new(AtomicUsize::new(0));
    let counter = dropped.clone();

    tokio::spawn(async move {
        let mut drop_acks: HashSet<u32> = faults.drop_acks_once.iter().copied().collect();
        let mut drop_data: HashSet<u32> = faults.drop_data_once.iter().copied().collect();
        let mut sender: Option<SocketAddr> = None;
        let mut held: Option<Vec<u8>> = None;
        let mut setup_replies: Vec<(Vec<u8>, SocketAddr)> = Vec::new();
        let mut buf = [0u8; 2048];

        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                continue;
            };
            let datagram = buf[..len].to_vec();
            let packet = Packet::decode(&datagram).ok();

            if from == receiver {
                let Some(to) = sender else {
                    continue;
                };
                if let Some(packet) = &packet {
                    if packet.is_ack() && drop_acks.remove(&packet.sequence) {
                        counter.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }
                    if faults.replay_setup_replies && packet.is_ack() && packet.sequence == 0 {
                        setup_replies.push((datagram.clone(), to));
                    }
                }
                let _ = socket.send_to(&datagram, to).await;
                continue;
            }

            sender = Some(from);
            if let Some(packet) = &packet {
                if packet.is_setup() && faults.replay_setup_replies {
                    for (stale, to) in &setup_replies {
                        let _ = socket.send_to(stale, *to).await;
                    }
                }
                if packet.is_data() {
                    if drop_data.remove(&packet.sequence) {
                        counter.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }
                    if faults.reorder_data && held.is_none() && packet.sequence % 2 == 0 {
                        held = Some(datagram);
                        continue;
                    }
                    if faults.duplicate_data {
                        let _ = socket.send_to(&datagram, receiver).await;
                    }
                }
            }
            let _ = socket.send_to(&datagram, receiver).await;
            if let Some(late) = held.take() {
                let _ = socket.send_to(&late, receiver).await;
            }
        }
    });

    (addr, dropped)
}

#[tokio::test]
async fn test_lost_acks_are_recovered_by_retransmission() {
    let dir = tempfile::tempdir().unwrap();
    let (source, data) = write_source(&dir, MAX_PAYLOAD_SIZE * 2 + 500);
    let output = destination(&dir, "output.bin");

    let (receiver, receiver_addr) = start_receiver(test_config()).await;
    let faults = Faults {
        drop_acks_once: vec![1, 2],
        ..Faults::default()
    };
    let (relay_addr, dropped) = spawn_relay(receiver_addr, faults).await;

    let sender = FileSender::new(test_config(), relay_addr).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(10), sender.send_file(&source, &output))
        .await
        .expect("전송 시간 초과")
        .unwrap();

    assert_eq!(dropped.load(Ordering::SeqCst), 2);
    assert_eq!(report.in_flight, 0);
    assert_eq!(report.stats.packets_sent, 4);
    assert!(report.stats.retransmissions >= 2);
    assert_eq!(report.stats.payload_bytes, data.len() as u64);

    wait_until_idle(&receiver).await;
    assert_same_file(&output, &data);
    assert_eq!(receiver.stats().transfers_completed, 1);
}

#[tokio::test]
async fn test_lost_data_beyond_reassembly_window_is_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let (source, data) = write_source(&dir, MAX_PAYLOAD_SIZE * 400);
    let output = destination(&dir, "span.bin");
    let config = Config {
        retransmit_interval_ms: 200,
        ..Config::default()
    };

    let (receiver, receiver_addr) = start_receiver(config.clone()).await;
    let faults = Faults {
        drop_data_once: vec![1],
        ..Faults::default()
    };
    let (relay_addr, dropped) = spawn_relay(receiver_addr, faults).await;

    let sender = FileSender::new(config, relay_addr).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(30), sender.send_file(&source, &output))
        .await
        .expect("전송 시간 초과")
        .unwrap();

    assert_eq!(dropped.load(Ordering::SeqCst), 1);
    assert_eq!(report.in_flight, 0);
    assert!(report.stats.retransmissions >= 1);

    wait_until_idle(&receiver).await;
    assert_same_file(&output, &data);
    let stats = receiver.stats();
    assert_eq!(stats.transfers_completed, 1);
    assert_eq!(stats.bytes_written, data.len() as u64);
}

#[tokio::test]
async fn test_lost_reordered_and_duplicated_data() {
    let dir = tempfile::tempdir().unwrap();
    let (source, data) = write_source(&dir, MAX_PAYLOAD_SIZE * 120 + 33);
    let output = destination(&dir, "shuffled.bin");
    let config = Config {
        window_size: 8,
        reassembly_window: 16,
        ..test_config()
    };

    let (receiver, receiver_addr) = start_receiver(config.clone()).await;
    let faults = Faults {
        drop_data_once: vec![1, 9, 40, 41, 121],
        reorder_data: true,
        duplicate_data: true,
        ..Faults::default()
    };
    let (relay_addr, dropped) = spawn_relay(receiver_addr, faults).await;

    let sender = FileSender::new(config, relay_addr).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(30), sender.send_file(&source, &output))
        .await
        .expect("전송 시간 초과")
        .unwrap();

    assert_eq!(dropped.load(Ordering::SeqCst), 5);
    assert_eq!(report.in_flight, 0);
    assert_eq!(report.stats.packets_sent, 122);

    wait_until_idle(&receiver).await;
    assert_same_file(&output, &data);
    assert!(receiver.stats().duplicates > 0);
}

#[tokio::test]
async fn test_sequential_transfers_ignore_stale_setup_replies() {
    let dir = tempfile::tempdir().unwrap();
    let (receiver, receiver_addr) = start_receiver(test_config()).await;
    let faults = Faults {
        replay_setup_replies: true,
        ..Faults::default()
    };
    let (relay_addr, _) = spawn_relay(receiver_addr, faults).await;
    let sender = FileSender::new(test_config(), relay_addr).unwrap();

    let mut reports = Vec::new();
    for (name, len) in [("first", MAX_PAYLOAD_SIZE * 3), ("second", MAX_PAYLOAD_SIZE + 7)] {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        let source = dir.path().join(format!("{}.src", name));
        std::fs::write(&source, &data).unwrap();
        let output = destination(&dir, &format!("{}.out", name));

        let report = tokio::time::timeout(Duration::from_secs(10), sender.send_file(&source, &output))
            .await
            .expect("전송 시간 초과")
            .unwrap();
        wait_until_idle(&receiver).await;
        assert_same_file(&output, &data);
        reports.push(report);
    }

    assert_ne!(reports[0].transfer_id, reports[1].transfer_id);
    assert_ne!(reports[0].local_addr, reports[1].local_addr);
    assert_eq!(receiver.stats().transfers_completed, 2);
}

#[tokio::test]
async fn test_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    let (source, data) = write_source(&dir, 0);
    let output = destination(&dir, "empty.bin");

    let (receiver, addr) = start_receiver(test_config()).await;
    let sender = FileSender::new(test_config(), addr).unwrap();
    let report = sender.send_file(&source, &output).await.unwrap();

    // 종료 Ack 하나만 전송
    assert_eq!(report.stats.packets_sent, 1);
    wait_until_idle(&receiver).await;
    assert_same_file(&output, &data);
}

#[tokio::test]
async fn test_exact_multiple_of_payload_size() {
    let dir = tempfile::tempdir().unwrap();
    let (source, data) = write_source(&dir, MAX_PAYLOAD_SIZE * 3);
    let output = destination(&dir, "exact.bin");

    let (receiver, addr) = start_receiver(test_config()).await;
    let sender = FileSender::new(test_config(), addr).unwrap();
    let report = sender.send_file(&source, &output).await.unwrap();

    assert_eq!(report.stats.packets_sent, 4);
    wait_until_idle(&receiver).await;
    assert_same_file(&output, &data);
}

#[tokio::test]
async fn test_window_never_exceeds_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let (source, data) = write_source(&dir, MAX_PAYLOAD_SIZE * 40 + 17);
    let output = destination(&dir, "windowed.bin");
    let config = Config {
        window_size: 4,
        ..test_config()
    };

    let (receiver, addr) = start_receiver(config.clone()).await;
    let sender = FileSender::new(config, addr).unwrap();
    let report = sender.send_file(&source, &output).await.unwrap();

    assert!(report.stats.peak_in_flight >= 1);
    assert!(report.stats.peak_in_flight <= 4);
    assert_eq!(report.stats.packets_sent, 42);
    wait_until_idle(&receiver).await;
    assert_same_file(&output, &data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_file() {
    let dir = tempfile::tempdir().unwrap();
    let (source, data) = write_source(&dir, 1024 * 1024 + 123);
    let output = destination(&dir, "large.bin");
    let config = Config::lan();

    let (receiver, addr) = start_receiver(config.clone()).await;
    let sender = FileSender::new(config, addr).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(60), sender.send_file(&source, &output))
        .await
        .expect("전송 시간 초과")
        .unwrap();

    assert_eq!(report.in_flight, 0);
    wait_until_idle(&receiver).await;
    assert_same_file(&output, &data);
}

#[tokio::test]
async fn test_unopenable_destination_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (source, _) = write_source(&dir, 100);
    let output = destination(&dir, "missing/dir/out.bin");

    let (receiver, addr) = start_receiver(test_config()).await;
    let sender = FileSender::new(test_config(), addr).unwrap();
    let result = sender.send_file(&source, &output).await;

    assert!(matches!(result, Err(Error::TransferRejected { .. })));
    assert!(receiver.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_setup_for_same_path_yields_one_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let output = destination(&dir, "shared.bin");
    let (receiver, addr) = start_receiver(test_config()).await;

    let mut peers = JoinSet::new();
    for _ in 0..8 {
        let setup = Packet::setup(&output).encode();
        peers.spawn(async move {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            socket.send_to(&setup, addr).await.unwrap();
            let mut buf = [0u8; 64];
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
                .await
                .expect("Setup 응답 없음")
                .unwrap();
            Packet::decode(&buf[..len]).unwrap()
        });
    }

    let mut ids = HashSet::new();
    while let Some(reply) = peers.join_next().await {
        let reply = reply.unwrap();
        assert!(reply.is_ack());
        assert_eq!(reply.sequence, 0);
        ids.insert(reply.transfer_id);
    }

    assert_eq!(ids.len(), 1);
    assert_eq!(receiver.registry().len(), 1);
    assert_eq!(receiver.stats().transfers_opened, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_transfers_to_one_receiver() {
    let dir = tempfile::tempdir().unwrap();
    let (receiver, addr) = start_receiver(test_config()).await;

    let mut transfers = JoinSet::new();
    for index in 0..3 {
        let mut data = vec![0u8; MAX_PAYLOAD_SIZE * (index + 5) + index];
        rand::thread_rng().fill_bytes(&mut data);
        let source = dir.path().join(format!("source-{}.bin", index));
        std::fs::write(&source, &data).unwrap();
        let output = destination(&dir, &format!("output-{}.bin", index));

        transfers.spawn(async move {
            let sender = FileSender::new(test_config(), addr).unwrap();
            let report = sender.send_file(&source, &output).await.unwrap();
            (report, output, data)
        });
    }

    let mut ids = HashSet::new();
    let mut outputs = Vec::new();
    while let Some(joined) = transfers.join_next().await {
        let (report, output, data) = joined.unwrap();
        ids.insert(report.transfer_id);
        outputs.push((output, data));
    }
    assert_eq!(ids.len(), 3);

    wait_until_idle(&receiver).await;
    for (output, data) in outputs {
        assert_same_file(&output, &data);
    }
}
