//! fileshare 루프백 데모
//!
//! 한 프로세스 안에서 송신자 1개와 수신자 N개를 허브로 연결하고
//! 그룹 대상으로 파일을 보낸다. 일부 수신자는 오프라인으로 시작해
//! 알림 확인(ready) 후 전송을 받는다.
//!
//! 사용법:
//!   cargo run --release --bin fileshare-loopback -- [OPTIONS]
//!
//! 예시:
//!   # 1MB 더미 데이터, 수신자 3개 중 1개 오프라인
//!   cargo run --release --bin fileshare-loopback -- --receivers 3 --offline 1
//!
//!   # Direct 차단 (Relay 대체 확인)
//!   RUST_LOG=debug cargo run --release --bin fileshare-loopback -- -f data.bin --block-direct

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fileshare::loopback::{LoopbackHub, MemoryDirectory};
use fileshare::{
    Config, Decision, FileSource, OutgoingFile, ProgressEvent, TargetSelector, PROTOCOL_VERSION,
};

const SENDER: i64 = 1;
const GROUP: TargetSelector = TargetSelector::Group(1);

/// 데모 설정
struct DemoConfig {
    file_path: Option<PathBuf>,
    size: usize,
    receivers: usize,
    offline: usize,
    block_direct: bool,
    config: Config,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            file_path: None,
            size: 1024 * 1024,
            receivers: 2,
            offline: 0,
            block_direct: false,
            config: Config {
                big_chunk_size: 256 * 1024,
                ..Config::default()
            },
        }
    }
}

fn parse_args() -> DemoConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = DemoConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    config.file_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--size" | "-s" => {
                if i + 1 < args.len() {
                    config.size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--receivers" | "-r" => {
                if i + 1 < args.len() {
                    config.receivers = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--offline" => {
                if i + 1 < args.len() {
                    config.offline = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--big-chunk" => {
                if i + 1 < args.len() {
                    config.config.big_chunk_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--small-chunk" => {
                if i + 1 < args.len() {
                    config.config.small_chunk_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--download-dir" | "-o" => {
                if i + 1 < args.len() {
                    config.config.download_dir = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--relay-only" => {
                config.config.direct_enabled = false;
            }
            "--block-direct" => {
                config.block_direct = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"fileshare loopback - 프로세스 내 피어 파일 전송 데모

옵션:
  -f, --file <PATH>         보낼 파일 (없으면 더미 데이터)
  -s, --size <BYTES>        더미 데이터 크기 (기본: 1048576)
  -r, --receivers <N>       수신 기기 수 (기본: 2)
      --offline <N>         오프라인으로 시작하는 수신 기기 수 (기본: 0)
      --big-chunk <SIZE>    BigChunk 크기 바이트 (기본: 262144)
      --small-chunk <SIZE>  SmallChunk 크기 바이트 (기본: 16384)
  -o, --download-dir <DIR>  수신 파일 저장 경로
      --relay-only          Direct 채널 사용 안 함
      --block-direct        Direct 연결을 막아 Relay 대체 유도
  -h, --help                이 도움말 출력

로그 레벨은 RUST_LOG로 지정 (기본: info)
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let demo = parse_args();
    demo.config.validate()?;

    info!("fileshare loopback (protocol v{})", PROTOCOL_VERSION);
    info!("BigChunk: {} bytes", demo.config.big_chunk_size);
    info!("SmallChunk: {} bytes", demo.config.small_chunk_size);
    info!("Receivers: {} ({} offline)", demo.receivers, demo.offline);

    let file = match &demo.file_path {
        Some(path) => {
            info!("Loading file: {:?}", path);
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".into());
            OutgoingFile::new(name, FileSource::from_path(path).await?)
        }
        None => {
            info!("Using test data ({} bytes)", demo.size);
            let data: Vec<u8> = (0..demo.size).map(|i| (i % 251) as u8).collect();
            OutgoingFile::from_bytes("dummy.bin", data)
        }
    };
    let file_len = file.source.len();

    let hub = LoopbackHub::new();
    if demo.block_direct {
        hub.block_direct();
    }

    // 송신 기기
    let receiver_ids: Vec<i64> = (0..demo.receivers as i64).map(|n| SENDER + 1 + n).collect();
    let online_count = demo.receivers.saturating_sub(demo.offline);
    let sender_dir = MemoryDirectory::new(SENDER).with_target(GROUP, receiver_ids.clone());
    for id in receiver_ids.iter().take(online_count) {
        sender_dir.set_online(*id, true);
    }
    let sender = hub.spawn(demo.config.clone(), sender_dir)?;

    // 수신 기기 (요청은 모두 수락)
    let mut receivers = Vec::new();
    for id in &receiver_ids {
        let dir = MemoryDirectory::new(*id);
        dir.allow(SENDER, GROUP);
        let peer = hub.spawn(demo.config.clone(), dir)?;

        let handle = peer.handle.clone();
        let mut events = handle.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let ProgressEvent::IncomingRequest {
                    transfer_id,
                    auto_accepted: false,
                    ..
                } = event
                {
                    if let Err(e) = handle.decide(transfer_id, Decision::Accept).await {
                        warn!("수락 실패: {}", e);
                    }
                }
            }
        });
        receivers.push(peer);
    }

    let start = Instant::now();
    let transfer_id = sender.handle.initiate_transfer(GROUP, vec![file]).await?;
    info!("Transfer {} started", transfer_id);

    // 오프라인 기기: 알림 확인 후 ready
    for (device, notification) in sender.notifier.take() {
        tokio::time::sleep(Duration::from_millis(200)).await;
        sender.directory.set_online(device, true);
        if let Some(peer) = receivers.iter().find(|p| p.handle.local_device() == device) {
            info!("Device {} came online, acknowledging notification", device);
            peer.handle.acknowledge_notification(notification).await?;
        }
    }

    for peer in &mut receivers {
        let device = peer.handle.local_device();
        match tokio::time::timeout(Duration::from_secs(60), peer.received.recv()).await {
            Ok(Some(file)) => info!(
                "Device {} received {} ({} bytes) in {:.2}s",
                device,
                file.name,
                file.bytes.len(),
                start.elapsed().as_secs_f64()
            ),
            Ok(None) => warn!("Device {} session closed", device),
            Err(_) => warn!("Device {} timed out", device),
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    let stats = sender.handle.stats().await?;
    info!("{}", stats.summary());
    info!(
        "Throughput: {:.2} MB/s per receiver",
        file_len as f64 / elapsed.max(f64::EPSILON) / 1_000_000.0
    );
    info!(
        "Frames: {} direct, {} relay",
        hub.direct_frames(),
        hub.relay_frames()
    );
    info!("Recent send rate: {:.2} MB/s", stats.send_throughput() / 1_000_000.0);
    for peer in &receivers {
        let received = peer.handle.stats().await?;
        info!(
            "Device {} recent receive rate: {:.2} MB/s",
            peer.handle.local_device(),
            received.recv_throughput() / 1_000_000.0
        );
    }

    sender.handle.stop()?;
    for peer in &receivers {
        peer.handle.stop()?;
    }
    Ok(())
}
