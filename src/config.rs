//! 전송 설정

use std::path::PathBuf;
use std::time::Duration;

use crate::directory::{DeviceId, TransferId};
use crate::{Error, Result, DEFAULT_BIG_CHUNK_SIZE, DEFAULT_SMALL_CHUNK_SIZE};

/// 게스트 링크 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestLinkMode {
    /// 소유자가 게스트에게 파일을 보냄
    Download,
    /// 게스트가 소유자에게 파일을 올림
    Upload,
}

/// 게스트 링크 세션 정보
///
/// 게스트 페이지는 한 명의 소유자(owner)와 하나의 링크만 다룬다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestLink {
    /// 링크를 만든 기기
    pub owner: DeviceId,

    /// 링크가 가리키는 전송
    pub transfer_id: TransferId,

    pub mode: GuestLinkMode,
}

/// 세션 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// BigChunk 크기 (바이트) - 파일 읽기 단위
    pub big_chunk_size: usize,

    /// SmallChunk 크기 (바이트) - 와이어 전송 단위
    pub small_chunk_size: usize,

    /// Direct 채널 연결 대기 시간 (밀리초)
    /// 초과 시 Relay로 대체
    pub fallback_timeout_ms: u64,

    /// 종료 상태(sent/rejected/...)가 Idle로 돌아가기까지의 시간 (밀리초)
    pub state_reset_delay_ms: u64,

    /// Direct 채널 사용 여부 (false면 항상 Relay)
    pub direct_enabled: bool,

    /// 게스트 링크 세션이면 Some
    pub guest_link: Option<GuestLink>,

    /// 수신 완료 파일 저장 경로 (None이면 저장하지 않음)
    pub download_dir: Option<PathBuf>,

    /// 진행 상황 브로드캐스트 채널 크기
    pub progress_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            big_chunk_size: DEFAULT_BIG_CHUNK_SIZE,
            small_chunk_size: DEFAULT_SMALL_CHUNK_SIZE,
            fallback_timeout_ms: 1500,   // 1.5초
            state_reset_delay_ms: 3000,  // 3초
            direct_enabled: true,
            guest_link: None,
            download_dir: None,
            progress_capacity: 1024,
        }
    }
}

impl Config {
    /// Direct 채널 없이 Relay만 사용하는 설정
    pub fn relay_only() -> Self {
        Self {
            direct_enabled: false,
            ..Self::default()
        }
    }

    /// 테스트용 설정 (작은 청크, 짧은 타이머)
    pub fn testing() -> Self {
        Self {
            big_chunk_size: 16_384,
            small_chunk_size: 4,
            fallback_timeout_ms: 50,
            state_reset_delay_ms: 50,
            ..Self::default()
        }
    }

    /// 게스트 링크 세션 설정 (소유자의 파일을 받음)
    pub fn guest(owner: DeviceId, transfer_id: TransferId) -> Self {
        Self {
            guest_link: Some(GuestLink {
                owner,
                transfer_id,
                mode: GuestLinkMode::Download,
            }),
            ..Self::default()
        }
    }

    /// 업로드 링크 게스트 세션 설정 (소유자에게 파일을 보냄)
    pub fn guest_upload(owner: DeviceId, transfer_id: TransferId) -> Self {
        Self {
            guest_link: Some(GuestLink {
                owner,
                transfer_id,
                mode: GuestLinkMode::Upload,
            }),
            ..Self::default()
        }
    }

    /// BigChunk당 SmallChunk 수
    pub fn small_chunks_per_big(&self) -> usize {
        (self.big_chunk_size + self.small_chunk_size - 1) / self.small_chunk_size
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }

    pub fn state_reset_delay(&self) -> Duration {
        Duration::from_millis(self.state_reset_delay_ms)
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.small_chunk_size == 0 {
            return Err(Error::InvalidConfig("small_chunk_size는 0일 수 없음".into()));
        }
        if self.small_chunk_size >= self.big_chunk_size {
            return Err(Error::InvalidConfig(format!(
                "small_chunk_size({})는 big_chunk_size({})보다 작아야 함",
                self.small_chunk_size, self.big_chunk_size
            )));
        }
        if self.progress_capacity == 0 {
            return Err(Error::InvalidConfig("채널 크기는 0일 수 없음".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.small_chunks_per_big(), 1024);
        assert_eq!(config.fallback_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_testing_preset() {
        let config = Config::testing();
        assert!(config.validate().is_ok());
        assert_eq!(config.small_chunks_per_big(), 4096);
    }

    #[test]
    fn test_invalid_sizes() {
        let config = Config {
            small_chunk_size: 1024,
            big_chunk_size: 1024,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = Config {
            small_chunk_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_guest_presets() {
        let link = Config::guest(1, 9).guest_link.unwrap();
        assert_eq!((link.owner, link.transfer_id, link.mode), (1, 9, GuestLinkMode::Download));
        let link = Config::guest_upload(1, 9).guest_link.unwrap();
        assert_eq!(link.mode, GuestLinkMode::Upload);
        assert!(Config::guest_upload(1, 9).validate().is_ok());
    }
}
