//! 에러 타입 정의

use std::net::SocketAddr;

use thiserror::Error;

/// RFT 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("재전송 실패: sequence={sequence}, target={target}: {source}")]
    Retransmit {
        sequence: u32,
        target: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("수신자가 전송을 거부함: destination={destination}")]
    TransferRejected { destination: String },

    #[error("유효하지 않은 경로: {0:?}")]
    InvalidDestination(String),

    #[error("시퀀스 번호 소진: 31비트 범위를 넘는 전송")]
    SequenceExhausted,

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("워커 태스크 실패: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("연결 종료")]
    ConnectionClosed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
