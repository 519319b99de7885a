//! RFT 송신자
//!
//! 로컬 파일을 수신자의 목적지 경로로 전송한다.
//!
//! 사용법:
//!   cargo run --release --bin rft-send -- <HOST:PORT> <SOURCE> <DESTINATION> [OPTIONS]
//!
//! 예시:
//!   # 기본 전송
//!   cargo run --release --bin rft-send -- 127.0.0.1:9000 data.bin /tmp/data.bin
//!
//!   # 손실이 많은 네트워크
//!   cargo run --release --bin rft-send -- host:9000 data.bin out.bin --unstable

use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rft::{Config, FileSender};

const USAGE: &str = r#"RFT Sender - Reliable File Transfer over UDP

사용법:
  rft-send <HOST:PORT> <SOURCE> <DESTINATION> [OPTIONS]

인자:
  HOST:PORT               수신자 주소
  SOURCE                  전송할 로컬 파일
  DESTINATION             수신측에 생성할 파일 경로

옵션:
  -w, --window <N>        동시 미확인 패킷 수 (기본: 8)
  -i, --interval <MS>     재전송 주기 밀리초 (기본: 1000)
  --span <N>              최소 미확인 시퀀스로부터의 최대 범위 (기본: 128)
                          수신자의 --reassembly 값 이하여야 함
  --lan                   LAN 프리셋 (큰 윈도우, 짧은 재전송 주기)
  --unstable              불안정 네트워크 프리셋
  -h, --help              이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조절 (기본: info)
"#;

/// 송신자 인자
struct SendArgs {
    target: String,
    source: PathBuf,
    destination: String,
    config: Config,
}

fn parse_args() -> Result<SendArgs, Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();
    let mut window = None;
    let mut interval = None;
    let mut span = None;
    let mut positional = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--window" | "-w" => {
                let value = args.get(i + 1).ok_or("--window 값 필요")?;
                window = Some(value.parse::<usize>()?);
                i += 1;
            }
            "--interval" | "-i" => {
                let value = args.get(i + 1).ok_or("--interval 값 필요")?;
                interval = Some(value.parse::<u64>()?);
                i += 1;
            }
            "--span" => {
                let value = args.get(i + 1).ok_or("--span 값 필요")?;
                span = Some(value.parse::<u32>()?);
                i += 1;
            }
            "--lan" => config = Config::lan(),
            "--unstable" => config = Config::unstable_network(),
            "--help" | "-h" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    // 프리셋 이후에 개별 옵션 적용
    if let Some(window) = window {
        config.window_size = window;
    }
    if let Some(span) = span {
        config.reassembly_window = span;
    }
    if let Some(interval) = interval {
        config.retransmit_interval_ms = interval;
    }

    let [target, source, destination]: [String; 3] = positional
        .try_into()
        .map_err(|_| format!("인자 3개 필요\n\n{}", USAGE))?;

    Ok(SendArgs {
        target,
        source: PathBuf::from(source),
        destination,
        config,
    })
}

async fn resolve(target: &str) -> Result<SocketAddr, Box<dyn Error>> {
    tokio::net::lookup_host(target)
        .await?
        .next()
        .ok_or_else(|| format!("주소를 찾을 수 없음: {}", target).into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args()?;
    let target = resolve(&args.target).await?;

    info!("RFT Sender starting...");
    info!("Target: {}", target);
    info!("Window size: {}", args.config.window_size);
    info!("Sequence span: {}", args.config.reassembly_window);
    info!("Retransmit interval: {} ms", args.config.retransmit_interval_ms);

    let sender = FileSender::new(args.config, target)?;
    info!("Sending {:?} -> {}", args.source, args.destination);

    let report = sender.send_file(&args.source, &args.destination).await?;

    info!("Transfer {} complete (from {})", report.transfer_id, report.local_addr);
    info!("{}", report.stats.summary());
    Ok(())
}
