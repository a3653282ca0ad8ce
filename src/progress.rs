//! 진행 상황 스트림과 UI 송신 상태
//!
//! - `Progress`: 세션 이벤트를 구독자에게 브로드캐스트 (구독자가 없어도 됨)
//! - `SendStateBoard`: 전송별 송신 상태를 대상 단위로 요약, 종료 상태는 일정 시간 뒤 Idle로 복귀

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::directory::{DeviceId, FileId, NotificationId, TargetSelector, TransferId};
use crate::message::FileInfo;
use crate::sender::RecipientState;

/// 세션 진행 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// 사용자 결정이 필요한 수신 요청 (auto_accepted면 이미 수락됨)
    IncomingRequest {
        transfer_id: TransferId,
        from: DeviceId,
        files: Vec<FileInfo>,
        auto_accepted: bool,
    },
    RecipientChanged {
        transfer_id: TransferId,
        device: DeviceId,
        state: RecipientState,
    },
    /// 파일 하나의 청크 송신 완료
    FileSent {
        transfer_id: TransferId,
        device: DeviceId,
        file_id: FileId,
        chunks: u32,
    },
    Retransmitting {
        transfer_id: TransferId,
        device: DeviceId,
        file_id: FileId,
        chunks: usize,
    },
    FileReceived {
        transfer_id: TransferId,
        from: DeviceId,
        file_id: FileId,
        name: String,
    },
    TransferReceived {
        transfer_id: TransferId,
        from: DeviceId,
    },
    /// 오프라인 기기에 알림 발송
    Notified {
        transfer_id: TransferId,
        device: DeviceId,
        notification_id: NotificationId,
    },
    PeerGone {
        remote: DeviceId,
        reason: String,
    },
    /// 상대가 보낸 error 메시지
    RemoteError {
        transfer_id: TransferId,
        from: DeviceId,
        message: String,
    },
}

/// 진행 이벤트 송신기
#[derive(Debug, Clone)]
pub struct Progress {
    tx: broadcast::Sender<ProgressEvent>,
}

impl Progress {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ProgressEvent) {
        // 구독자가 없으면 버림
        let _ = self.tx.send(event);
    }
}

/// UI에 표시하는 대상별 송신 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendState {
    #[default]
    Idle,
    Requesting,
    Sending,
    Sent,
    Rejected,
    Canceled,
    Failed,
}

impl SendState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SendState::Sent | SendState::Rejected | SendState::Canceled | SendState::Failed
        )
    }

    /// 수신자 상태 목록을 대상 하나의 상태로 요약
    ///
    /// 진행 중인 수신자가 있으면 진행 상태가 우선한다.
    pub fn summarize<I>(states: I) -> SendState
    where
        I: IntoIterator<Item = RecipientState>,
    {
        let mut summary = SendState::Idle;
        for state in states {
            let candidate = SendState::from(state);
            if candidate.priority() > summary.priority() {
                summary = candidate;
            }
        }
        summary
    }

    fn priority(self) -> u8 {
        match self {
            SendState::Idle => 0,
            SendState::Canceled => 1,
            SendState::Rejected => 2,
            SendState::Failed => 3,
            SendState::Sent => 4,
            SendState::Requesting => 5,
            SendState::Sending => 6,
        }
    }
}

impl From<RecipientState> for SendState {
    fn from(state: RecipientState) -> Self {
        match state {
            RecipientState::Requesting => SendState::Requesting,
            RecipientState::Sending => SendState::Sending,
            RecipientState::Sent => SendState::Sent,
            RecipientState::Rejected => SendState::Rejected,
            RecipientState::Canceled => SendState::Canceled,
            RecipientState::Failed => SendState::Failed,
        }
    }
}

/// 보드에 기록된 전송 하나의 상태
#[derive(Debug, Clone, Copy)]
struct BoardEntry {
    target: TargetSelector,
    state: SendState,
    stamp: u64,
}

/// 대상별 송신 상태 보드 (핸들과 세션이 공유)
///
/// 전송마다 따로 기록하고, 대상 조회 시 같은 대상의 전송들을 요약한다.
#[derive(Debug, Clone)]
pub struct SendStateBoard {
    entries: Arc<RwLock<HashMap<TransferId, BoardEntry>>>,
    reset_delay: Duration,
}

impl SendStateBoard {
    pub fn new(reset_delay: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            reset_delay,
        }
    }

    pub fn get(&self, target: &TargetSelector) -> SendState {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.target == *target)
            .map(|entry| entry.state)
            .max_by_key(|state| state.priority())
            .unwrap_or_default()
    }

    /// 전송 상태 갱신
    ///
    /// 종료 상태는 `reset_delay` 뒤 보드에서 빠진다 (대상은 Idle로 보임).
    /// 그 사이 다른 상태가 기록되면 빠지지 않는다.
    pub fn set(&self, transfer_id: TransferId, target: TargetSelector, state: SendState) {
        let stamp = {
            let mut entries = self.entries.write();
            let entry = entries.entry(transfer_id).or_insert(BoardEntry {
                target,
                state: SendState::Idle,
                stamp: 0,
            });
            if entry.state == state {
                return;
            }
            entry.state = state;
            entry.stamp += 1;
            entry.stamp
        };

        if state.is_terminal() {
            let entries = self.entries.clone();
            let delay = self.reset_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut entries = entries.write();
                if entries.get(&transfer_id).is_some_and(|e| e.stamp == stamp) {
                    entries.remove(&transfer_id);
                }
            });
        }
    }
}
