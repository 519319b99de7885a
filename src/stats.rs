//! 전송 통계

use std::time::{Duration, Instant};

/// 송신측 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 종료 시간 (완료 전에는 None)
    pub finish_time: Option<Instant>,

    /// 첫 전송된 패킷 수 (Data + 종료 Ack)
    pub packets_sent: u64,

    /// 총 송신 횟수 (재전송 포함)
    pub transmissions: u64,

    /// 재전송 횟수
    pub retransmissions: u64,

    /// 윈도우에서 해제된 ACK 수
    pub acks_received: u64,

    /// 윈도우에 없는 시퀀스의 ACK 수
    pub duplicate_acks: u64,

    /// 검증 실패로 버린 패킷 수
    pub invalid_packets: u64,

    /// 전송한 파일 바이트
    pub payload_bytes: u64,

    /// 동시에 ACK를 기다린 최대 패킷 수
    pub peak_in_flight: usize,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            finish_time: None,
            packets_sent: 0,
            transmissions: 0,
            retransmissions: 0,
            acks_received: 0,
            duplicate_acks: 0,
            invalid_packets: 0,
            payload_bytes: 0,
            peak_in_flight: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.finish_time
            .unwrap_or_else(Instant::now)
            .duration_since(self.start_time)
    }

    /// 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.payload_bytes as f64 / elapsed
    }

    /// 재전송 비율
    pub fn retransmission_rate(&self) -> f64 {
        if self.transmissions == 0 {
            return 0.0;
        }
        self.retransmissions as f64 / self.transmissions as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Packets: {} | Bytes: {} | Throughput: {:.2} KB/s | Retransmits: {} ({:.1}%) | Dup ACKs: {} | Peak in-flight: {}",
            self.elapsed().as_secs_f64(),
            self.packets_sent,
            self.payload_bytes,
            self.throughput() / 1_000.0,
            self.retransmissions,
            self.retransmission_rate() * 100.0,
            self.duplicate_acks,
            self.peak_in_flight,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 수신측 통계
#[derive(Debug, Clone, Default)]
pub struct ReceiverStats {
    /// 수신한 데이터그램 수
    pub datagrams: u64,

    /// 검증 실패로 버린 패킷 수
    pub invalid_packets: u64,

    /// 중복 또는 윈도우 밖이라 버린 패킷 수
    pub duplicates: u64,

    /// 알 수 없는 transfer ID를 가진 패킷 수
    pub unknown_transfer: u64,

    /// 보낸 ACK 수
    pub acks_sent: u64,

    /// 생성된 전송 수
    pub transfers_opened: u64,

    /// 완료된 전송 수
    pub transfers_completed: u64,

    /// 파일에 기록한 바이트
    pub bytes_written: u64,
}

impl ReceiverStats {
    pub fn summary(&self) -> String {
        format!(
            "Datagrams: {} | Invalid: {} | Duplicates: {} | Transfers: {}/{} | Bytes: {}",
            self.datagrams,
            self.invalid_packets,
            self.duplicates,
            self.transfers_completed,
            self.transfers_opened,
            self.bytes_written,
        )
    }
}
