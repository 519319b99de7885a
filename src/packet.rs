//! 패킷 와이어 포맷
//!
//! ```text
//!    0                             31
//!    +-----------------------------+
//!  0 |                             |
//!    |     CHECKSUM (64-bit)       |   CRC-32를 64비트로 확장해 저장
//!  4 |                             |
//!    +-----------------------------+
//!  8 |     TOTAL SIZE (32-bit)     |   헤더 + 페이로드
//!    +-----------------------------+
//! 12 |     SEQUENCE (32-bit)       |
//!    +--+--------------------------+
//! 16 |K |   TRANSFER ID (30-bit)   |   K = 패킷 종류 (상위 2비트)
//!    +--+--------------------------+
//! 20 |          PAYLOAD            |   최대 980 바이트
//!    :                             :
//! ```
//!
//! 모든 필드는 네트워크 바이트 순서(big-endian)
//!
//! 종류 비트: `00` Data, `01` Nak, `10` Ack, `11` Setup.
//! Setup은 항상 sequence=0, transfer_id=0 으로 인코딩되며 이 조건을 어긴
//! Setup은 디코딩 시 무효로 처리한다.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{HEADER_SIZE, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE, SEQUENCE_MASK, TRANSFER_ID_MASK};

/// 체크섬 필드 크기
const CHECKSUM_SIZE: usize = 8;

/// 종류 비트 위치
const KIND_SHIFT: u32 = 30;

/// 패킷 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// 파일 데이터 청크
    Data = 0b00,

    /// 에러 알림 (setup 실패 등)
    Nak = 0b01,

    /// 응답 / 핸드쉐이크 응답 / 스트림 종료 표시
    Ack = 0b10,

    /// 핸드쉐이크 (목적지 경로 전달)
    Setup = 0b11,
}

impl PacketKind {
    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b00 => PacketKind::Data,
            0b01 => PacketKind::Nak,
            0b10 => PacketKind::Ack,
            _ => PacketKind::Setup,
        }
    }

    fn bits(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketKind::Data => "DATA",
            PacketKind::Nak => "NAK",
            PacketKind::Ack => "ACK",
            PacketKind::Setup => "SETUP",
        }
    }
}

/// 디코딩 실패 사유
///
/// 불안정한 채널에서는 정상적으로 발생하는 상황이므로 에러로 전파하지 않고
/// 로그만 남기고 버린다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPacket {
    #[error("패킷이 헤더보다 짧음: {len} bytes")]
    TooShort { len: usize },

    #[error("선언된 크기가 유효하지 않음: declared={declared}, received={received}")]
    BadSize { declared: u32, received: usize },

    #[error("체크섬 불일치: expected {expected:016X}, got {got:016X}")]
    ChecksumMismatch { expected: u64, got: u64 },

    #[error("종류와 필드가 맞지 않음: {kind:?}")]
    MalformedKind { kind: PacketKind },
}

/// 디코딩된 패킷 (생성 후 불변)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub sequence: u32,
    pub transfer_id: u32,
    pub payload: Bytes,
}

impl Packet {
    /// Setup 패킷 생성. 경로는 앞뒤 공백을 제거해서 싣는다.
    pub fn setup(destination: &str) -> Self {
        let path = destination.trim().as_bytes();
        Self {
            kind: PacketKind::Setup,
            sequence: 0,
            transfer_id: 0,
            payload: Bytes::copy_from_slice(&path[..path.len().min(MAX_PAYLOAD_SIZE)]),
        }
    }

    /// Data 패킷 생성. 최대 크기를 넘는 페이로드는 잘라낸다.
    pub fn data(sequence: u32, transfer_id: u32, payload: impl Into<Bytes>) -> Self {
        let mut payload: Bytes = payload.into();
        payload.truncate(MAX_PAYLOAD_SIZE);
        Self {
            kind: PacketKind::Data,
            sequence: sequence & SEQUENCE_MASK,
            transfer_id: transfer_id & TRANSFER_ID_MASK,
            payload,
        }
    }

    pub fn ack(sequence: u32, transfer_id: u32) -> Self {
        Self::meta(PacketKind::Ack, sequence, transfer_id)
    }

    pub fn nak(sequence: u32, transfer_id: u32) -> Self {
        Self::meta(PacketKind::Nak, sequence, transfer_id)
    }

    fn meta(kind: PacketKind, sequence: u32, transfer_id: u32) -> Self {
        Self {
            kind,
            sequence: sequence & SEQUENCE_MASK,
            transfer_id: transfer_id & TRANSFER_ID_MASK,
            payload: Bytes::new(),
        }
    }

    /// 와이어 포맷으로 직렬화
    pub fn encode(&self) -> Bytes {
        encode(self.kind, self.sequence, self.transfer_id, &self.payload)
    }

    /// 와이어 포맷에서 역직렬화
    pub fn decode(bytes: &[u8]) -> Result<Self, InvalidPacket> {
        decode(bytes)
    }

    /// 직렬화된 전체 크기
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Setup 패킷의 목적지 경로
    pub fn destination(&self) -> Option<&str> {
        if self.kind != PacketKind::Setup {
            return None;
        }
        std::str::from_utf8(&self.payload)
            .ok()
            .map(str::trim)
            .filter(|path| !path.is_empty())
    }

    pub fn is_setup(&self) -> bool {
        self.kind == PacketKind::Setup
    }

    pub fn is_data(&self) -> bool {
        self.kind == PacketKind::Data
    }

    pub fn is_ack(&self) -> bool {
        self.kind == PacketKind::Ack
    }

    pub fn is_nak(&self) -> bool {
        self.kind == PacketKind::Nak
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PacketKind::Setup => write!(
                f,
                "[ #{} {} id={} \"{}\" ]",
                self.sequence,
                self.kind.name(),
                self.transfer_id,
                String::from_utf8_lossy(&self.payload)
            ),
            _ if self.payload.is_empty() => write!(
                f,
                "[ #{} {} id={} EMPTY ]",
                self.sequence,
                self.kind.name(),
                self.transfer_id
            ),
            _ => write!(
                f,
                "[ #{} {} id={} {} bytes ]",
                self.sequence,
                self.kind.name(),
                self.transfer_id,
                self.payload.len()
            ),
        }
    }
}

/// 헤더와 페이로드를 한 버퍼에 직렬화하고 그 버퍼로 체크섬을 계산한다
///
/// Ack/Nak는 페이로드를 싣지 않는다. Setup은 sequence/transfer_id를 0으로 고정한다.
pub fn encode(kind: PacketKind, sequence: u32, transfer_id: u32, payload: &[u8]) -> Bytes {
    let (sequence, transfer_id, payload) = match kind {
        PacketKind::Setup => (0, 0, payload),
        PacketKind::Data => (sequence & SEQUENCE_MASK, transfer_id & TRANSFER_ID_MASK, payload),
        PacketKind::Ack | PacketKind::Nak => {
            (sequence & SEQUENCE_MASK, transfer_id & TRANSFER_ID_MASK, &[][..])
        }
    };
    let payload = &payload[..payload.len().min(MAX_PAYLOAD_SIZE)];
    let total_size = HEADER_SIZE + payload.len();

    let mut buf = BytesMut::with_capacity(total_size);
    buf.put_u64(0);
    buf.put_u32(total_size as u32);
    buf.put_u32(sequence);
    buf.put_u32((kind.bits() << KIND_SHIFT) | transfer_id);
    buf.put_slice(payload);

    let checksum = checksum(&buf[CHECKSUM_SIZE..]);
    buf[..CHECKSUM_SIZE].copy_from_slice(&checksum.to_be_bytes());
    buf.freeze()
}

/// 수신 데이터그램 검증 및 파싱
///
/// 선언된 크기보다 긴 데이터그램은 선언된 크기까지만 해석한다.
pub fn decode(bytes: &[u8]) -> Result<Packet, InvalidPacket> {
    if bytes.len() < HEADER_SIZE {
        return Err(InvalidPacket::TooShort { len: bytes.len() });
    }

    let mut header = &bytes[..HEADER_SIZE];
    let stored = header.get_u64();
    let declared = header.get_u32();

    let total_size = declared as usize;
    if !(HEADER_SIZE..=MAX_PACKET_SIZE).contains(&total_size) || total_size > bytes.len() {
        return Err(InvalidPacket::BadSize {
            declared,
            received: bytes.len(),
        });
    }

    let computed = checksum(&bytes[CHECKSUM_SIZE..total_size]);
    if computed != stored {
        return Err(InvalidPacket::ChecksumMismatch {
            expected: computed,
            got: stored,
        });
    }

    let sequence = header.get_u32();
    let flags = header.get_u32();
    let kind = PacketKind::from_bits(flags >> KIND_SHIFT);
    let transfer_id = flags & TRANSFER_ID_MASK;
    let payload = &bytes[HEADER_SIZE..total_size];

    let consistent = match kind {
        PacketKind::Setup => sequence == 0 && transfer_id == 0,
        PacketKind::Data => transfer_id != 0 && sequence & !SEQUENCE_MASK == 0,
        PacketKind::Ack | PacketKind::Nak => payload.is_empty() && sequence & !SEQUENCE_MASK == 0,
    };
    if !consistent {
        return Err(InvalidPacket::MalformedKind { kind });
    }

    Ok(Packet {
        kind,
        sequence,
        transfer_id,
        payload: Bytes::copy_from_slice(payload),
    })
}

fn checksum(bytes: &[u8]) -> u64 {
    crc32fast::hash(bytes) as u64
}
