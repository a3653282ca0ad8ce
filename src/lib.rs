//! # fileshare
//!
//! 피어 간 종단 간 암호화 파일 전송
//!
//! ## 핵심 특징
//! - **전송 대체**: Direct 채널 우선, 연결 시간 초과 시 Relay로 교체 (큐 유지)
//! - **링크 암호화**: X25519 키 교환 + ChaCha20-Poly1305, 키 교환 전 송수신 보류
//! - **청크 전송**: BigChunk(파일 읽기) / SmallChunk(와이어) 2단 분할
//! - **누락 재전송**: 파일 끝에서 누락 목록을 받아 해당 청크만 재전송
//! - **팬아웃**: 대상 하나를 여러 기기로 전개, 오프라인 기기는 알림 + ready 핸드셰이크
//! - **단일 이벤트 루프**: 링크와 전송 상태는 세션 태스크만 변경

pub mod chunk;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod loopback;
pub mod manager;
pub mod message;
pub mod progress;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod session;
pub mod stats;
pub mod transport;

pub use chunk::{FileSource, OutgoingFile};
pub use config::{Config, GuestLink, GuestLinkMode};
pub use crypto::{KeyAnnouncement, KeyPair, LinkCrypto};
pub use directory::{
    DeviceId, Directory, FileId, Notification, NotificationId, Notifier, TargetSelector,
    TransferId,
};
pub use error::{Error, Result};
pub use manager::{CancelTarget, Decision};
pub use message::{Envelope, FileInfo};
pub use progress::{ProgressEvent, SendState};
pub use receiver::ReceivedFile;
pub use registry::CloseSelector;
pub use sender::RecipientState;
pub use session::{Session, SessionHandle};
pub use stats::TransferStats;
pub use transport::{DirectChannel, DirectConnector, DirectEvent, DirectEvents, Rendezvous};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 기본 BigChunk 크기 (바이트)
pub const DEFAULT_BIG_CHUNK_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// 기본 SmallChunk 크기 (바이트)
pub const DEFAULT_SMALL_CHUNK_SIZE: usize = 16 * 1024; // 16KB
