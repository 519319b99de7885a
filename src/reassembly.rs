//! 전송별 재조립 버퍼
//!
//! 도착 순서와 관계없이 Data/Ack 패킷을 받아 시퀀스 순서대로만 출력에 기록한다.
//! 중복 판정은 `next_expected`부터 `window` 범위 안에서만 추적한다.

use std::collections::BTreeMap;
use std::io::{self, Write};

use tracing::{debug, trace};

use crate::packet::{Packet, PacketKind};

/// 종료 콜백
type TerminationHandler = Box<dyn FnOnce() + Send>;

/// `accept` 한 번의 결과
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Drained {
    /// 이번 호출에서 출력으로 내보낸 시퀀스 (오름차순)
    pub flushed: Vec<u32>,

    /// 이번 호출에서 출력에 기록한 바이트
    pub bytes: u64,

    /// 종료 Ack까지 내보내고 출력을 닫았는지
    pub terminated: bool,

    /// 중복이거나 윈도우 밖이라 버린 패킷인지
    pub discarded: bool,
}

/// 재조립 버퍼
pub struct Reassembly<W: Write> {
    output: Option<W>,
    next_expected: u32,
    pending: BTreeMap<u32, Packet>,
    window: u32,
    handlers: Vec<TerminationHandler>,
    bytes_written: u64,
}

impl<W: Write> Reassembly<W> {
    /// `window`: next_expected 이후로 버퍼링할 수 있는 시퀀스 개수
    pub fn new(output: W, window: u32) -> Self {
        Self {
            output: Some(output),
            next_expected: 1,
            pending: BTreeMap::new(),
            window: window.max(1),
            handlers: Vec::new(),
            bytes_written: 0,
        }
    }

    /// 종료 시 실행할 콜백 등록
    pub fn on_terminate(&mut self, handler: impl FnOnce() + Send + 'static) {
        self.handlers.push(Box::new(handler));
    }

    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    /// 순서를 기다리는 패킷 수
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_closed(&self) -> bool {
        self.output.is_none()
    }

    /// 패킷을 버퍼에 넣고 이어지는 시퀀스를 출력으로 내보낸다
    pub fn accept(&mut self, packet: Packet) -> io::Result<Drained> {
        let mut drained = Drained::default();

        if self.is_closed() || !matches!(packet.kind, PacketKind::Data | PacketKind::Ack) {
            drained.discarded = true;
            return Ok(drained);
        }

        let sequence = packet.sequence;
        if sequence < self.next_expected || self.pending.contains_key(&sequence) {
            trace!("중복 패킷 폐기: sequence={}", sequence);
            drained.discarded = true;
            return Ok(drained);
        }
        if sequence - self.next_expected >= self.window {
            debug!(
                "윈도우 밖 패킷 폐기: sequence={}, next_expected={}",
                sequence, self.next_expected
            );
            drained.discarded = true;
            return Ok(drained);
        }

        self.pending.insert(sequence, packet);

        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.next_expected {
                break;
            }
            let packet = entry.remove();

            match packet.kind {
                PacketKind::Data => {
                    if let Some(output) = self.output.as_mut() {
                        output.write_all(&packet.payload)?;
                    }
                    self.bytes_written += packet.payload.len() as u64;
                    drained.bytes += packet.payload.len() as u64;
                    drained.flushed.push(packet.sequence);
                    self.next_expected += 1;
                }
                _ => {
                    // 종료 Ack
                    if let Some(mut output) = self.output.take() {
                        output.flush()?;
                    }
                    drained.flushed.push(packet.sequence);
                    drained.terminated = true;
                    self.next_expected += 1;
                    self.pending.clear();

                    debug!(
                        "재조립 종료: sequence={}, {} bytes",
                        packet.sequence, self.bytes_written
                    );
                    for handler in self.handlers.drain(..) {
                        handler();
                    }
                    break;
                }
            }
        }

        Ok(drained)
    }
}
