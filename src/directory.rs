//! 외부 협력자 인터페이스 - 기기/연락처/그룹 디렉터리와 푸시 알림
//!
//! 디렉터리와 알림 서비스는 이 크레이트 밖에 있다.
//! 세션은 여기 정의된 트레잇을 통해서만 접근한다.

use serde::{Deserialize, Serialize};

/// 원격 기기 ID
///
/// 0 이상이면 등록 기기, 음수면 게스트 인덱스
pub type DeviceId = i64;

/// 전송 ID (발신자 기준 고유)
pub type TransferId = u64;

/// 파일 ID (전송 내 고유)
pub type FileId = u32;

/// 알림 ID
pub type NotificationId = u64;

/// 게스트 기기 여부
pub fn is_guest(device: DeviceId) -> bool {
    device < 0
}

/// 전송 대상 지정자
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetSelector {
    /// 같은 사용자의 특정 기기
    Device(DeviceId),

    /// 연락처의 모든 기기
    Contact(u64),

    /// 그룹 구성원의 모든 기기
    Group(u64),

    /// 게스트 링크 (링크가 가리키는 전송 ID)
    Guest(TransferId),
}

impl TargetSelector {
    pub fn is_guest(&self) -> bool {
        matches!(self, TargetSelector::Guest(_))
    }
}

/// 디렉터리/프레즌스 서비스
///
/// 모든 조회는 호출 시점의 스냅샷 기준이다.
pub trait Directory: Send + Sync {
    /// 로컬 기기 ID
    fn local_device(&self) -> DeviceId;

    /// 대상 지정자를 기기 집합으로 변환 (로컬 기기 제외)
    fn resolve(&self, target: &TargetSelector) -> Vec<DeviceId>;

    /// 기기 온라인 여부
    fn is_online(&self, device: DeviceId) -> bool;

    /// `remote`가 `claimed` 관계(자기 기기/연락처/그룹)를 통해
    /// 로컬 기기에 보낼 자격이 있는지 검증
    fn relationship(&self, remote: DeviceId, claimed: &TargetSelector) -> bool;
}

/// 오프라인 기기에 보내는 푸시 알림
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: NotificationId,
    pub transfer_id: TransferId,
    /// 발신 기기
    pub from: DeviceId,
    /// 파일 이름 요약
    pub summary: String,
}

/// 푸시 알림 서비스
pub trait Notifier: Send + Sync {
    fn notify(&self, device: DeviceId, notification: Notification);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_ids() {
        assert!(is_guest(-1));
        assert!(!is_guest(0));
        assert!(!is_guest(42));
        assert!(TargetSelector::Guest(7).is_guest());
        assert!(!TargetSelector::Group(7).is_guest());
    }
}
