//! 프로토콜 설정

use std::time::Duration;

use crate::{Error, Result, DEFAULT_RETRANSMIT_INTERVAL_MS, DEFAULT_WINDOW_SIZE};

/// RFT 프로토콜 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 송신 윈도우 크기 (동시에 ACK를 기다리는 최대 패킷 수)
    /// 송신 워커 수와 같다
    pub window_size: usize,

    /// 재전송 주기 (밀리초)
    pub retransmit_interval_ms: u64,

    /// 수신측 동시 처리 워커 수
    pub dispatch_workers: usize,

    /// 재조립 윈도우 (next_expected 이후로 버퍼링할 최대 시퀀스 범위)
    ///
    /// 송신측은 이 값을 시퀀스 범위로 쓴다: 가장 작은 미확인 시퀀스 + 이 값 이상의
    /// 시퀀스는 할당하지 않는다. 송신측 값은 수신자의 값보다 크면 안 된다.
    pub reassembly_window: u32,

    /// 소켓 수신 버퍼 크기 (패킷 단위 아님, 바이트)
    pub recv_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            retransmit_interval_ms: DEFAULT_RETRANSMIT_INTERVAL_MS,
            dispatch_workers: 8,
            reassembly_window: 128,
            recv_buffer_size: 2048,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 재전송 주기
    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms)
    }

    /// 설정값 검증
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::InvalidConfig("window_size는 1 이상이어야 함".into()));
        }
        if self.dispatch_workers == 0 {
            return Err(Error::InvalidConfig("dispatch_workers는 1 이상이어야 함".into()));
        }
        if self.retransmit_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "retransmit_interval_ms는 0보다 커야 함".into(),
            ));
        }
        if (self.reassembly_window as usize) < self.window_size {
            return Err(Error::InvalidConfig(format!(
                "reassembly_window({})가 window_size({})보다 작음",
                self.reassembly_window, self.window_size
            )));
        }
        if self.recv_buffer_size < crate::MAX_PACKET_SIZE {
            return Err(Error::InvalidConfig(format!(
                "recv_buffer_size는 최소 {} 바이트",
                crate::MAX_PACKET_SIZE
            )));
        }
        Ok(())
    }

    /// 지연이 짧은 LAN용 설정
    pub fn lan() -> Self {
        Self {
            window_size: 32,
            retransmit_interval_ms: 100,
            dispatch_workers: 16,
            reassembly_window: 256,
            recv_buffer_size: 2048,
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            window_size: 4,
            retransmit_interval_ms: 1500,
            dispatch_workers: 8,
            reassembly_window: 128,
            recv_buffer_size: 2048,
        }
    }
}
