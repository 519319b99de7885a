//! 송신자
//!
//! - Setup 핸드쉐이크로 수신자에게서 transfer ID를 받음
//! - W개 워커가 (파일 청크, 시퀀스 번호)를 한 번에 할당받아 전송
//! - ACK 수집기가 윈도우에서 패킷을 해제
//! - 파일 끝에서 다음 시퀀스로 종료 Ack를 같은 경로로 전송
//!
//! 전송마다 새 소켓을 바인딩하므로 이전 전송의 늦은 응답이 다음 전송에 섞이지 않는다.

use std::collections::BTreeMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::packet::Packet;
use crate::retransmit::{RetransmitHandle, Retransmitter};
use crate::stats::TransferStats;
use crate::{Config, Error, Result, MAX_PAYLOAD_SIZE, SEQUENCE_MASK};

/// 완료된 전송 결과
#[derive(Debug, Clone)]
pub struct TransferReport {
    /// 수신자가 할당한 transfer ID
    pub transfer_id: u32,

    /// 수신측 목적지 경로
    pub destination: String,

    /// 이 전송에 사용한 로컬 주소
    pub local_addr: SocketAddr,

    /// 완료 시점에 남아 있던 미확인 패킷 수 (정상 완료 시 0)
    pub in_flight: usize,

    /// 전송 통계
    pub stats: TransferStats,
}

/// 윈도우 슬롯. 드롭되면 퍼밋이 반환된다.
struct Slot {
    handle: RetransmitHandle,
    _permit: OwnedSemaphorePermit,
}

#[derive(Default)]
struct InFlight {
    slots: BTreeMap<u32, Slot>,
    /// 종료 Ack가 등록되었는지
    exhausted: bool,
}

/// 미확인 패킷 윈도우
///
/// 두 가지를 제한한다.
/// - 개수: 세마포어 퍼밋 `capacity`개. 퍼밋은 슬롯이 소유하므로 ACK나 드롭으로 반환된다.
/// - 범위: 새 시퀀스는 가장 작은 미확인 시퀀스 + `span` 미만이어야 한다.
///   수신자가 재조립 윈도우 밖이라 버릴 시퀀스를 보내지 않기 위함이다.
pub struct Window {
    slots: Arc<Semaphore>,
    capacity: usize,
    span: u32,
    in_flight: Mutex<InFlight>,
    advanced: Notify,
    peak: AtomicUsize,
}

impl Window {
    pub fn new(capacity: usize, span: u32) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            span: span.max(1),
            in_flight: Mutex::new(InFlight::default()),
            advanced: Notify::new(),
            peak: AtomicUsize::new(0),
        }
    }

    /// 빈 슬롯이 생길 때까지 대기
    pub async fn reserve(&self) -> Result<OwnedSemaphorePermit> {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// `sequence`가 범위 안에 들어올 때까지 대기
    pub async fn admit(&self, sequence: u32) {
        loop {
            let advanced = self.advanced.notified();
            tokio::pin!(advanced);
            advanced.as_mut().enable();

            if self.admits(sequence) {
                return;
            }
            trace!("시퀀스 범위 대기: sequence={}", sequence);
            advanced.await;
        }
    }

    fn admits(&self, sequence: u32) -> bool {
        match self.in_flight.lock().slots.keys().next() {
            Some(&lowest) => (sequence as u64) < lowest as u64 + self.span as u64,
            None => true,
        }
    }

    /// 패킷을 윈도우에 등록하고 전송을 시작한다
    ///
    /// 시작과 등록(종료 표시 포함)이 같은 잠금 안에서 일어나므로 ACK가 먼저 처리되지 않는다.
    pub fn insert(&self, handle: RetransmitHandle, permit: OwnedSemaphorePermit, terminal: bool) {
        let mut in_flight = self.in_flight.lock();
        if terminal {
            in_flight.exhausted = true;
        }
        handle.start();
        in_flight.slots.insert(
            handle.sequence(),
            Slot {
                handle,
                _permit: permit,
            },
        );
        self.peak.fetch_max(in_flight.slots.len(), Ordering::SeqCst);
    }

    /// ACK된 시퀀스를 해제. 윈도우에 없으면 false (중복 ACK)
    pub fn acknowledge(&self, sequence: u32) -> bool {
        let slot = self.in_flight.lock().slots.remove(&sequence);
        match slot {
            Some(slot) => {
                slot.handle.resolve();
                self.advanced.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// 종료 Ack까지 모두 ACK 되었는지
    pub fn is_complete(&self) -> bool {
        let in_flight = self.in_flight.lock();
        in_flight.exhausted && in_flight.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.in_flight.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.lock().slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn span(&self) -> u32 {
        self.span
    }

    /// 지금까지 동시에 등록된 최대 패킷 수
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// 파일 읽기 위치와 다음 시퀀스. 둘은 항상 같은 잠금 안에서만 바뀐다.
struct Cursor<R> {
    reader: R,
    next_sequence: u32,
    exhausted: bool,
}

impl<R> Cursor<R> {
    /// 다음 시퀀스 할당. 31비트를 넘기면 0(예약값)으로 돌아가지 않고 에러.
    fn claim(&mut self) -> Result<u32> {
        let sequence = self.next_sequence;
        if sequence == 0 || sequence > SEQUENCE_MASK {
            return Err(Error::SequenceExhausted);
        }
        self.next_sequence = sequence + 1;
        Ok(sequence)
    }
}

/// 전송 하나 동안만 유지되는 소켓, 타이머, 통계
struct Session {
    socket: Arc<UdpSocket>,
    retransmitter: Arc<Retransmitter>,
    stats: Arc<RwLock<TransferStats>>,
    transfer_id: AtomicU32,
}

/// 전송 하나를 위해 워커들이 공유하는 상태
struct Pipeline<R> {
    transfer_id: u32,
    socket: Arc<UdpSocket>,
    retransmitter: Arc<Retransmitter>,
    window: Window,
    cursor: tokio::sync::Mutex<Cursor<R>>,
    stats: Arc<RwLock<TransferStats>>,
    recv_buffer_size: usize,
}

/// 파일 송신자
pub struct FileSender {
    config: Config,
    bind_addr: SocketAddr,
    target: SocketAddr,
}

impl FileSender {
    /// 전송마다 임시 포트에 바인딩해 `target`으로 보내는 송신자
    pub fn new(config: Config, target: SocketAddr) -> Result<Self> {
        let bind_addr: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        Self::with_bind_addr(config, bind_addr, target)
    }

    /// 바인딩 주소 지정. 포트를 고정하면 연속 전송 사이에 이전 응답이 남아 있을 수 있다.
    pub fn with_bind_addr(config: Config, bind_addr: SocketAddr, target: SocketAddr) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            bind_addr,
            target,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// 파일 전송
    pub async fn send_file(
        &self,
        source: impl AsRef<Path>,
        destination: &str,
    ) -> Result<TransferReport> {
        let file = File::open(source.as_ref()).await?;
        self.send_stream(BufReader::new(file), destination).await
    }

    /// 임의의 바이트 스트림 전송
    ///
    /// 소켓 또는 읽기 에러는 치명적이며 진행 중인 모든 워커를 중단한다.
    pub async fn send_stream<R>(&self, reader: R, destination: &str) -> Result<TransferReport>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let destination = destination.trim();
        if destination.is_empty() || destination.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::InvalidDestination(destination.to_string()));
        }

        let socket = Arc::new(UdpSocket::bind(self.bind_addr).await?);
        let local_addr = socket.local_addr()?;
        debug!("전송 소켓 바인딩: {}", local_addr);

        let (retransmitter, mut timer) = Retransmitter::spawn(
            socket.clone(),
            self.target,
            self.config.retransmit_interval(),
        );
        let session = Session {
            socket,
            retransmitter: Arc::new(retransmitter),
            stats: Arc::new(RwLock::new(TransferStats::new())),
            transfer_id: AtomicU32::new(0),
        };

        let result = tokio::select! {
            result = self.run(reader, destination, &session) => result,
            joined = &mut timer => match joined {
                Ok(Ok(())) => Err(Error::ConnectionClosed),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e.into()),
            },
        };
        session.retransmitter.shutdown();

        let in_flight = match result {
            Ok(in_flight) => in_flight,
            Err(e) => {
                warn!("전송 실패: destination={}: {}", destination, e);
                let id = session.transfer_id.load(Ordering::SeqCst);
                if id != 0 {
                    // 상대에게 중단을 알리는 것은 최선 노력
                    let _ = session
                        .socket
                        .send_to(&Packet::nak(0, id).encode(), self.target)
                        .await;
                }
                return Err(e);
            }
        };

        let stats = {
            let mut stats = session.stats.write();
            stats.finish_time = Some(Instant::now());
            stats.transmissions = session.retransmitter.transmissions();
            stats.retransmissions = session.retransmitter.retransmissions();
            stats.clone()
        };
        let transfer_id = session.transfer_id.load(Ordering::SeqCst);
        info!("전송 완료: id={}, {}", transfer_id, stats.summary());

        Ok(TransferReport {
            transfer_id,
            destination: destination.to_string(),
            local_addr,
            in_flight,
            stats,
        })
    }

    async fn run<R>(&self, reader: R, destination: &str, session: &Session) -> Result<usize>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let id = self.handshake(destination, session).await?;
        session.transfer_id.store(id, Ordering::SeqCst);
        info!(
            "전송 시작: id={}, destination={}, window={}, span={}",
            id, destination, self.config.window_size, self.config.reassembly_window
        );

        let pipeline = Arc::new(Pipeline {
            transfer_id: id,
            socket: session.socket.clone(),
            retransmitter: session.retransmitter.clone(),
            window: Window::new(self.config.window_size, self.config.reassembly_window),
            cursor: tokio::sync::Mutex::new(Cursor {
                reader,
                next_sequence: 1,
                exhausted: false,
            }),
            stats: session.stats.clone(),
            recv_buffer_size: self.config.recv_buffer_size,
        });

        let mut workers = JoinSet::new();
        for worker in 0..self.config.window_size {
            workers.spawn(produce(worker, pipeline.clone()));
        }
        workers.spawn(collect_acks(pipeline.clone()));

        // 하나라도 실패하면 JoinSet 드롭으로 나머지가 중단된다
        while let Some(joined) = workers.join_next().await {
            joined??;
        }

        session.stats.write().peak_in_flight = pipeline.window.peak();
        Ok(pipeline.window.len())
    }

    /// Setup을 ACK가 올 때까지 재전송하고 할당된 transfer ID를 반환
    async fn handshake(&self, destination: &str, session: &Session) -> Result<u32> {
        let setup = session.retransmitter.schedule(&Packet::setup(destination));
        setup.start();
        debug!("Setup 전송: destination={}, target={}", destination, self.target);

        let mut buf = vec![0u8; self.config.recv_buffer_size];
        loop {
            let (len, from) = session.socket.recv_from(&mut buf).await?;
            let reply = match Packet::decode(&buf[..len]) {
                Ok(reply) => reply,
                Err(reason) => {
                    session.stats.write().invalid_packets += 1;
                    trace!("무효 패킷 폐기 (from {}): {}", from, reason);
                    continue;
                }
            };

            if reply.sequence != 0 || !(reply.is_ack() || reply.is_nak()) {
                trace!("핸드쉐이크 중 예상하지 않은 패킷: {}", reply);
                continue;
            }

            setup.resolve();
            if reply.is_nak() || reply.transfer_id == 0 {
                warn!("수신자가 Setup을 거부함: destination={}", destination);
                return Err(Error::TransferRejected {
                    destination: destination.to_string(),
                });
            }
            return Ok(reply.transfer_id);
        }
    }
}

/// 버퍼가 가득 차거나 스트림이 끝날 때까지 읽는다
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// 전송 워커: 슬롯 확보 → 시퀀스 할당 → 범위 대기 → 청크 읽기 → 윈도우 등록
async fn produce<R>(worker: usize, pipeline: Arc<Pipeline<R>>) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    loop {
        let permit = pipeline.window.reserve().await?;

        let mut cursor = pipeline.cursor.lock().await;
        if cursor.exhausted {
            break;
        }

        let sequence = cursor.claim()?;
        pipeline.window.admit(sequence).await;

        let mut buf = BytesMut::zeroed(MAX_PAYLOAD_SIZE);
        let len = read_chunk(&mut cursor.reader, &mut buf).await?;
        buf.truncate(len);

        let terminal = len == 0;
        let packet = if terminal {
            Packet::ack(sequence, pipeline.transfer_id)
        } else {
            Packet::data(sequence, pipeline.transfer_id, buf.freeze())
        };
        pipeline
            .window
            .insert(pipeline.retransmitter.schedule(&packet), permit, terminal);

        {
            let mut stats = pipeline.stats.write();
            stats.packets_sent += 1;
            stats.payload_bytes += len as u64;
        }

        if terminal {
            cursor.exhausted = true;
            debug!("워커 {}: 종료 Ack 등록 sequence={}", worker, sequence);
            break;
        }
        trace!("워커 {}: sequence={} ({} bytes)", worker, sequence, len);
    }
    Ok(())
}

/// ACK 수집기: 윈도우에 있는 시퀀스의 ACK만 해제
async fn collect_acks<R>(pipeline: Arc<Pipeline<R>>) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; pipeline.recv_buffer_size];

    while !pipeline.window.is_complete() {
        let (len, from) = pipeline.socket.recv_from(&mut buf).await?;
        let packet = match Packet::decode(&buf[..len]) {
            Ok(packet) => packet,
            Err(reason) => {
                pipeline.stats.write().invalid_packets += 1;
                trace!("무효 패킷 폐기 (from {}): {}", from, reason);
                continue;
            }
        };

        if !packet.is_ack() || packet.transfer_id != pipeline.transfer_id {
            trace!("예상하지 않은 패킷 폐기: {}", packet);
            continue;
        }

        if pipeline.window.acknowledge(packet.sequence) {
            pipeline.stats.write().acks_received += 1;
            trace!("ACK: sequence={}", packet.sequence);
        } else {
            pipeline.stats.write().duplicate_acks += 1;
            trace!("중복 ACK 폐기: sequence={}", packet.sequence);
        }
    }

    Ok(())
}
