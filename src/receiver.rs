//! 수신자
//!
//! - 하나의 소켓에서 모든 전송의 데이터그램을 받아 워커 태스크로 분배
//! - Setup 경로별로 transfer ID 할당 (같은 경로는 같은 ID)
//! - 구조적으로 유효한 Data/Ack는 해당 전송의 재조립 버퍼에 전달한 뒤 무조건 ACK
//! - 파일 생성과 기록은 블로킹 I/O이므로 `spawn_blocking`에서 실행

use std::fs::File;
use std::io::{self, BufWriter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::packet::{Packet, PacketKind};
use crate::reassembly::{Drained, Reassembly};
use crate::stats::ReceiverStats;
use crate::{Config, Error, Result, TRANSFER_ID_MASK};

/// 수신 중인 파일 하나
pub struct Transfer {
    id: u32,
    destination: String,
    reassembly: Mutex<Reassembly<BufWriter<File>>>,
}

impl Transfer {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn next_expected(&self) -> u32 {
        self.reassembly.lock().next_expected()
    }

    pub fn is_closed(&self) -> bool {
        self.reassembly.lock().is_closed()
    }

    /// 재조립 버퍼로 전달. 같은 전송에 대해 한 번에 하나만 실행된다.
    pub fn accept(&self, packet: Packet) -> io::Result<Drained> {
        self.reassembly.lock().accept(packet)
    }
}

/// 경로 → ID, ID → 전송 매핑
///
/// 종료된 전송은 재조립 버퍼의 종료 콜백에서 두 매핑 모두 제거된다.
/// 복제본은 같은 매핑을 공유한다.
#[derive(Clone)]
pub struct Registry {
    paths: Arc<DashMap<String, u32>>,
    transfers: Arc<DashMap<u32, Arc<Transfer>>>,
    next_id: Arc<AtomicU32>,
    reassembly_window: u32,
}

impl Registry {
    pub fn new(reassembly_window: u32) -> Self {
        Self {
            paths: Arc::new(DashMap::new()),
            transfers: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU32::new(1)),
            reassembly_window,
        }
    }

    /// 경로에 대한 전송을 찾거나 새로 만든다
    ///
    /// 반환값: (transfer ID, 새로 생성했는지). 파일을 열 수 없으면 아무 상태도 남기지 않는다.
    /// 파일 생성 동안 해당 경로의 엔트리 잠금을 쥐고 있으므로 블로킹 스레드에서 호출한다.
    pub fn open(&self, destination: &str) -> io::Result<(u32, bool)> {
        // 같은 경로의 Setup은 이 엔트리 잠금 안에서 직렬화된다
        match self.paths.entry(destination.to_string()) {
            Entry::Occupied(entry) => Ok((*entry.get(), false)),
            Entry::Vacant(entry) => {
                let file = File::create(destination)?;
                let id = self.allocate_id();

                let mut reassembly = Reassembly::new(BufWriter::new(file), self.reassembly_window);
                let paths = Arc::downgrade(&self.paths);
                let transfers = Arc::downgrade(&self.transfers);
                let path = destination.to_string();
                reassembly.on_terminate(move || {
                    if let Some(transfers) = transfers.upgrade() {
                        transfers.remove(&id);
                    }
                    if let Some(paths) = paths.upgrade() {
                        paths.remove_if(&path, |_, current| *current == id);
                    }
                });

                self.transfers.insert(
                    id,
                    Arc::new(Transfer {
                        id,
                        destination: destination.to_string(),
                        reassembly: Mutex::new(reassembly),
                    }),
                );
                entry.insert(id);
                Ok((id, true))
            }
        }
    }

    /// 다음 ID. 30비트를 넘으면 1로 돌아가며 사용 중인 ID는 건너뛴다.
    fn allocate_id(&self) -> u32 {
        loop {
            let id = match self.next_id.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                Some(if id >= TRANSFER_ID_MASK { 1 } else { id + 1 })
            }) {
                Ok(id) | Err(id) => id,
            };
            if !self.transfers.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<Arc<Transfer>> {
        self.transfers.get(&id).map(|transfer| transfer.clone())
    }

    pub fn lookup(&self, destination: &str) -> Option<u32> {
        self.paths.get(destination).map(|id| *id)
    }

    /// 진행 중인 전송 수
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    #[cfg(test)]
    fn set_next_id(&self, id: u32) {
        self.next_id.store(id, Ordering::SeqCst);
    }
}

/// 파일 수신자
pub struct Receiver {
    config: Config,
    socket: UdpSocket,
    registry: Registry,
    stats: RwLock<ReceiverStats>,
    workers: Arc<Semaphore>,
}

impl Receiver {
    pub async fn bind(config: Config, addr: SocketAddr) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(addr).await?;
        info!("수신자 바인딩: {}", socket.local_addr()?);

        Ok(Self {
            registry: Registry::new(config.reassembly_window),
            workers: Arc::new(Semaphore::new(config.dispatch_workers)),
            stats: RwLock::new(ReceiverStats::default()),
            socket,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats.read().clone()
    }

    /// 수신 루프. 치명적인 I/O 에러가 나기 전까지 반환하지 않는다.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; self.config.recv_buffer_size];
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = received?;
                    let permit = self
                        .workers
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::ConnectionClosed)?;
                    let datagram = Bytes::copy_from_slice(&buf[..len]);
                    let receiver = self.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        receiver.handle_datagram(&datagram, from).await
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined? {
                        error!("수신 워커 실패: {}", e);
                        return Err(e);
                    }
                }
            }
        }
    }

    /// 데이터그램 하나 처리
    pub async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) -> Result<()> {
        self.stats.write().datagrams += 1;

        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(reason) => {
                self.stats.write().invalid_packets += 1;
                trace!("무효 패킷 폐기 (from {}): {}", from, reason);
                return Ok(());
            }
        };
        trace!("수신: {} from {}", packet, from);

        match packet.kind {
            PacketKind::Setup => self.handle_setup(&packet, from).await,
            PacketKind::Data | PacketKind::Ack => {
                // 버퍼에 넣은 뒤 ACK: ACK된 시퀀스는 항상 기록되었거나 버퍼에 있다
                let ack = Packet::ack(packet.sequence, packet.transfer_id);
                self.deliver(packet, from).await?;
                self.reply(&ack, from).await
            }
            PacketKind::Nak => {
                debug!("NAK 수신 (무시): {} from {}", packet, from);
                Ok(())
            }
        }
    }

    async fn handle_setup(&self, packet: &Packet, from: SocketAddr) -> Result<()> {
        let Some(destination) = packet.destination() else {
            warn!("경로가 없는 Setup (from {})", from);
            return self.reply(&Packet::nak(0, 0), from).await;
        };

        let registry = self.registry.clone();
        let path = destination.to_string();
        let opened = tokio::task::spawn_blocking(move || registry.open(&path)).await?;

        match opened {
            Ok((id, created)) => {
                if created {
                    self.stats.write().transfers_opened += 1;
                    info!("전송 생성: id={}, destination={}, from {}", id, destination, from);
                } else {
                    debug!("Setup 재수신: id={}, destination={}", id, destination);
                }
                self.reply(&Packet::ack(0, id), from).await
            }
            Err(e) => {
                warn!("파일을 열 수 없음: {}: {}", destination, e);
                self.reply(&Packet::nak(0, 0), from).await
            }
        }
    }

    async fn deliver(&self, packet: Packet, from: SocketAddr) -> Result<()> {
        let Some(transfer) = self.registry.get(packet.transfer_id) else {
            self.stats.write().unknown_transfer += 1;
            trace!("알 수 없는 전송: {} from {}", packet, from);
            return Ok(());
        };

        let writer = transfer.clone();
        let accepted = tokio::task::spawn_blocking(move || writer.accept(packet)).await?;
        let drained = match accepted {
            Ok(drained) => drained,
            Err(e) => {
                error!("파일 기록 실패: id={}, {}: {}", transfer.id, transfer.destination, e);
                let _ = self
                    .socket
                    .send_to(&Packet::nak(0, transfer.id).encode(), from)
                    .await;
                return Err(e.into());
            }
        };

        let mut stats = self.stats.write();
        stats.bytes_written += drained.bytes;
        if drained.discarded {
            stats.duplicates += 1;
        }
        if drained.terminated {
            stats.transfers_completed += 1;
            info!("전송 완료: id={}, destination={}", transfer.id, transfer.destination);
        }
        Ok(())
    }

    /// 응답 전송. 실패하면 상대에게 NAK를 시도한 뒤 에러를 반환한다.
    async fn reply(&self, packet: &Packet, to: SocketAddr) -> Result<()> {
        if let Err(e) = self.socket.send_to(&packet.encode(), to).await {
            error!("응답 전송 실패: {} to {}: {}", packet, to, e);
            let _ = self
                .socket
                .send_to(&Packet::nak(0, packet.transfer_id).encode(), to)
                .await;
            return Err(e.into());
        }
        if packet.is_ack() {
            self.stats.write().acks_sent += 1;
        }
        Ok(())
    }
}
