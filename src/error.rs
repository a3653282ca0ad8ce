//! 에러 타입 정의

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::directory::{DeviceId, TransferId};

/// 파일 공유 계층 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("암호화 에러: {0}")]
    Crypto(#[from] CryptoError),

    /// 실행 중인 전송에 속하지 않거나 관계 검증에 실패한 메시지
    #[error("인증되지 않은 메시지: device={device}, transfer={transfer_id}")]
    Unauthorized {
        device: DeviceId,
        transfer_id: TransferId,
    },

    /// 키 교환이 끝나기 전의 암호화/복호화 시도
    #[error("키 교환 미완료: device={0}")]
    KeyNotReady(DeviceId),

    #[error("연결되지 않은 피어: device={0}")]
    LinkNotConnected(DeviceId),

    #[error("전송을 찾을 수 없음: transfer={0}")]
    TransferNotFound(TransferId),

    #[error("파일을 찾을 수 없음: transfer={transfer_id}, file={file_id}")]
    FileNotFound { transfer_id: TransferId, file_id: u32 },

    #[error("전송 계층 에러: device={device}: {reason}")]
    Transport { device: DeviceId, reason: String },

    #[error("유효하지 않은 프레임: {0}")]
    InvalidFrame(String),

    #[error("유효하지 않은 메시지: {0}")]
    InvalidMessage(String),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("세션 채널 종료")]
    ChannelClosed,
}

impl Error {
    /// 전송 계층 에러 생성
    pub fn transport(device: DeviceId, reason: impl Into<String>) -> Self {
        Error::Transport {
            device,
            reason: reason.into(),
        }
    }

    /// 링크가 끊겨 생긴 에러인지 (전송 상태는 유지)
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::LinkNotConnected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(Error::transport(3, "down").is_transport());
        assert!(Error::LinkNotConnected(3).is_transport());
        assert!(!Error::KeyNotReady(3).is_transport());
        assert!(!Error::TransferNotFound(1).is_transport());
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
