//! 고정 주기 재전송 스케줄러
//!
//! - [`RetransmitHandle`]: 패킷 하나를 소유하고 `New → Running → Terminated` 상태를 가짐
//! - [`Retransmitter`]: 한 전송의 모든 핸들이 공유하는 타이머 태스크
//!
//! 패킷마다 타이머를 따로 두지 않고 전송 단위로 하나의 지연 큐(마감 시각 순)를
//! 돌린다. `start()` 직후 첫 전송이 일어나고 이후 `period`마다 다시 보낸다.
//! 재전송 중 송신 실패는 내부에서 재시도하지 않고 타이머 태스크의 에러로 끝난다.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::packet::Packet;
use crate::{Error, Result};

/// 핸들 상태 (역방향 전이 없음)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    New = 0,
    Running = 1,
    Terminated = 2,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SchedulerState::New,
            1 => SchedulerState::Running,
            _ => SchedulerState::Terminated,
        }
    }
}

/// 큐에 올라간 패킷
struct Scheduled {
    sequence: u32,
    bytes: Bytes,
    due: Instant,
    sent: u64,
}

/// 마감 시각 순 지연 큐
#[derive(Default)]
struct DelayQueue {
    entries: HashMap<u64, Scheduled>,
    deadlines: BTreeSet<(Instant, u64)>,
}

impl DelayQueue {
    fn insert(&mut self, key: u64, sequence: u32, bytes: Bytes, due: Instant) {
        self.deadlines.insert((due, key));
        self.entries.insert(
            key,
            Scheduled {
                sequence,
                bytes,
                due,
                sent: 0,
            },
        );
    }

    fn remove(&mut self, key: u64) -> bool {
        match self.entries.remove(&key) {
            Some(entry) => {
                self.deadlines.remove(&(entry.due, key));
                true
            }
            None => false,
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.deadlines.first().map(|(due, _)| *due)
    }

    /// 마감이 지난 항목을 꺼내 다음 주기로 다시 예약
    fn pop_due(&mut self, now: Instant, period: Duration) -> Vec<(u32, Bytes, bool)> {
        let mut due = Vec::new();
        while let Some(&(deadline, key)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            self.deadlines.remove(&(deadline, key));
            if let Some(entry) = self.entries.get_mut(&key) {
                let first = entry.sent == 0;
                entry.sent += 1;
                entry.due = now + period;
                self.deadlines.insert((entry.due, key));
                due.push((entry.sequence, entry.bytes.clone(), first));
            }
        }
        due
    }
}

/// 타이머 태스크와 핸들이 공유하는 상태
struct Shared {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    period: Duration,
    queue: Mutex<DelayQueue>,
    wake: Notify,
    closed: AtomicBool,
    next_key: AtomicU64,
    transmissions: AtomicU64,
    retransmissions: AtomicU64,
}

/// 전송 하나에 대한 재전송 타이머
///
/// 드롭되면 타이머 태스크도 종료된다.
pub struct Retransmitter {
    shared: Arc<Shared>,
}

impl Retransmitter {
    /// 타이머 태스크 시작
    ///
    /// 반환된 `JoinHandle`은 [`Retransmitter::shutdown`] 이후 `Ok(())`로,
    /// 송신 실패 시 [`Error::Retransmit`]으로 끝난다.
    pub fn spawn(
        socket: Arc<UdpSocket>,
        target: SocketAddr,
        period: Duration,
    ) -> (Self, JoinHandle<Result<()>>) {
        let shared = Arc::new(Shared {
            socket,
            target,
            period,
            queue: Mutex::new(DelayQueue::default()),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            next_key: AtomicU64::new(0),
            transmissions: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
        });

        let task = tokio::spawn(run_timer(shared.clone()));
        (Self { shared }, task)
    }

    /// 패킷 하나를 담당할 핸들 생성 (아직 `New` 상태)
    pub fn schedule(&self, packet: &Packet) -> RetransmitHandle {
        RetransmitHandle {
            key: self.shared.next_key.fetch_add(1, Ordering::Relaxed),
            sequence: packet.sequence,
            bytes: packet.encode(),
            state: AtomicU8::new(SchedulerState::New as u8),
            shared: self.shared.clone(),
        }
    }

    /// 타이머 정지. 남아 있는 패킷은 더 이상 전송되지 않는다.
    pub fn shutdown(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.wake.notify_one();
        }
    }

    /// 아직 해결되지 않은 패킷 수
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().entries.len()
    }

    /// 총 송신 횟수 (첫 전송 포함)
    pub fn transmissions(&self) -> u64 {
        self.shared.transmissions.load(Ordering::Relaxed)
    }

    /// 재전송 횟수 (첫 전송 제외)
    pub fn retransmissions(&self) -> u64 {
        self.shared.retransmissions.load(Ordering::Relaxed)
    }
}

impl Drop for Retransmitter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_timer(shared: Arc<Shared>) -> Result<()> {
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let next_due = shared.queue.lock().next_due();
        match next_due {
            None => shared.wake.notified().await,
            Some(due) if due > Instant::now() => {
                tokio::select! {
                    _ = tokio::time::sleep_until(due) => {}
                    _ = shared.wake.notified() => {}
                }
            }
            Some(_) => {
                let due = shared.queue.lock().pop_due(Instant::now(), shared.period);
                for (sequence, bytes, first) in due {
                    if let Err(source) = shared.socket.send_to(&bytes, shared.target).await {
                        warn!("재전송 실패: sequence={}, target={}: {}", sequence, shared.target, source);
                        return Err(Error::Retransmit {
                            sequence,
                            target: shared.target,
                            source,
                        });
                    }

                    shared.transmissions.fetch_add(1, Ordering::Relaxed);
                    if first {
                        trace!("전송: sequence={}", sequence);
                    } else {
                        shared.retransmissions.fetch_add(1, Ordering::Relaxed);
                        debug!("재전송: sequence={}", sequence);
                    }
                }
            }
        }
    }
}

/// 패킷 하나의 재전송 핸들
pub struct RetransmitHandle {
    key: u64,
    sequence: u32,
    bytes: Bytes,
    state: AtomicU8,
    shared: Arc<Shared>,
}

impl RetransmitHandle {
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// 주기적 전송 시작. `New` 상태가 아니면 아무 일도 하지 않는다.
    pub fn start(&self) -> bool {
        if !self.transition(SchedulerState::New, SchedulerState::Running) {
            return false;
        }

        self.shared.queue.lock().insert(
            self.key,
            self.sequence,
            self.bytes.clone(),
            Instant::now(),
        );
        self.shared.wake.notify_one();
        true
    }

    /// 상대가 ACK 했으므로 재전송 중단. `Running` 상태가 아니면 아무 일도 하지 않는다.
    pub fn resolve(&self) -> bool {
        self.stop()
    }

    /// 재전송 취소. `resolve`와 같은 전이
    pub fn stop(&self) -> bool {
        if !self.transition(SchedulerState::Running, SchedulerState::Terminated) {
            return false;
        }
        self.shared.queue.lock().remove(self.key);
        true
    }

    fn transition(&self, from: SchedulerState, to: SchedulerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Drop for RetransmitHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for RetransmitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetransmitHandle")
            .field("sequence", &self.sequence)
            .field("state", &self.state())
            .finish()
    }
}
