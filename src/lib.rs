//! # RFT (Reliable File Transfer)
//!
//! UDP 위에서 동작하는 순서 보장 파일 전송 프로토콜
//!
//! ## 핵심 특징
//! - **패킷 단위 ACK**: 모든 패킷은 재조립 버퍼에 넘긴 뒤 ACK로 응답
//! - **고정 주기 재전송**: ACK가 올 때까지 같은 패킷을 일정 간격으로 재전송
//! - **윈도우 파이프라인**: 최대 W개의 미확인 패킷을 동시에 전송
//! - **재조립 버퍼**: 순서가 뒤바뀐 패킷을 모아 시퀀스 순서대로만 파일에 기록
//! - **멀티 전송**: 수신자는 경로별 transfer ID로 여러 전송을 동시에 처리

pub mod config;
pub mod error;
pub mod packet;
pub mod reassembly;
pub mod receiver;
pub mod retransmit;
pub mod sender;
pub mod stats;

pub use config::Config;
pub use error::{Error, Result};
pub use packet::{InvalidPacket, Packet, PacketKind};
pub use reassembly::{Drained, Reassembly};
pub use receiver::{Receiver, Registry, Transfer};
pub use retransmit::{RetransmitHandle, Retransmitter, SchedulerState};
pub use sender::{FileSender, TransferReport};
pub use stats::{ReceiverStats, TransferStats};

/// 최대 패킷 크기 (헤더 포함, 바이트)
pub const MAX_PACKET_SIZE: usize = 1000;

/// 고정 헤더 크기 (바이트)
pub const HEADER_SIZE: usize = 20;

/// 패킷당 최대 페이로드 크기
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// transfer ID 마스크 (하위 30비트)
pub const TRANSFER_ID_MASK: u32 = 0x3FFF_FFFF;

/// 시퀀스 번호 마스크 (31비트)
pub const SEQUENCE_MASK: u32 = 0x7FFF_FFFF;

/// 기본 윈도우 크기 (동시 미확인 패킷 수)
pub const DEFAULT_WINDOW_SIZE: usize = 8;

/// 기본 재전송 주기 (밀리초)
pub const DEFAULT_RETRANSMIT_INTERVAL_MS: u64 = 1000;
