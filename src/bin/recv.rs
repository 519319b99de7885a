//! RFT 수신자
//!
//! 하나의 UDP 포트에서 여러 송신자의 파일을 동시에 받는다.
//!
//! 사용법:
//!   cargo run --release --bin rft-recv -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin rft-recv -- --bind 0.0.0.0:9000 --workers 16

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rft::{Config, Receiver};

const USAGE: &str = r#"RFT Receiver - Reliable File Transfer over UDP

사용법:
  rft-recv [OPTIONS]

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:9000)
  -w, --workers <N>       동시 처리 워커 수 (기본: 8)
  --reassembly <N>        전송별 재조립 윈도우 (기본: 128)
  -h, --help              이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조절 (기본: info)
"#;

/// 수신자 인자
struct RecvArgs {
    bind_addr: SocketAddr,
    config: Config,
}

fn parse_args() -> Result<RecvArgs, Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = RecvArgs {
        bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
        config: Config::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                let value = args.get(i + 1).ok_or("--bind 값 필요")?;
                parsed.bind_addr = value.parse()?;
                i += 1;
            }
            "--workers" | "-w" => {
                let value = args.get(i + 1).ok_or("--workers 값 필요")?;
                parsed.config.dispatch_workers = value.parse()?;
                i += 1;
            }
            "--reassembly" => {
                let value = args.get(i + 1).ok_or("--reassembly 값 필요")?;
                parsed.config.reassembly_window = value.parse()?;
                i += 1;
            }
            "--help" | "-h" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other => return Err(format!("알 수 없는 인자: {}\n\n{}", other, USAGE).into()),
        }
        i += 1;
    }

    Ok(parsed)
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

    info!("RFT Receiver starting...");
    info!("Dispatch workers: {}", args.config.dispatch_workers);
    info!("Reassembly window: {}", args.config.reassembly_window);

    let receiver = Arc::new(Receiver::bind(args.config, args.bind_addr).await?);
    info!("Listening on {}", receiver.local_addr()?);

    tokio::select! {
        result = receiver.clone().run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    info!("{}", receiver.stats().summary());
    Ok(())
}
