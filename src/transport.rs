//! 전송 계층 - Direct(저지연, 피어 간) / Relay(시그널링 연결 경유)
//!
//! Direct 채널의 NAT 통과 내부는 이 크레이트 범위 밖이다.
//! 여기서는 연결 시도, 시간 초과, 대체에 필요한 계약만 정의한다.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::warn;

use crate::directory::DeviceId;
use crate::session::SessionEvent;
use crate::Result;

/// 시그널링 데이터 (offer/answer/candidate 등, 내용은 불투명)
pub type SignalPayload = Bytes;

/// 링크 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// 전송 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Direct,
    Relay,
}

/// Direct 채널
#[async_trait]
pub trait DirectChannel: Send + Sync {
    /// 상대가 보낸 시그널링 데이터 전달
    fn signal(&self, payload: SignalPayload) -> Result<()>;

    /// 프레임 하나 쓰기 (완료될 때까지 대기)
    async fn write(&self, frame: Bytes) -> Result<()>;

    fn close(&self);
}

/// Direct 채널 생성기
#[async_trait]
pub trait DirectConnector: Send + Sync {
    /// 이 환경에서 Direct 채널을 쓸 수 있는지
    fn is_available(&self) -> bool;

    /// 채널 열기
    ///
    /// 채널은 이후 모든 상태 변화를 `events`로 알린다.
    async fn open(
        &self,
        remote: DeviceId,
        initiator: bool,
        events: DirectEvents,
    ) -> Result<Arc<dyn DirectChannel>>;
}

/// 시그널링 랑데부 (인증된 시그널링 연결)
///
/// Relay 전송도 같은 연결을 통해 흐른다.
pub trait Rendezvous: Send + Sync {
    /// 시그널링 데이터 중계
    fn relay_signal(&self, remote: DeviceId, payload: SignalPayload) -> Result<()>;

    /// 데이터 프레임 중계 (실패는 호출자에게 즉시 반환)
    fn relay_data(&self, remote: DeviceId, frame: Bytes) -> Result<()>;
}

/// Direct 채널이 세션에 알리는 이벤트
pub enum DirectEvent {
    /// `open` 완료
    Opened(Arc<dyn DirectChannel>),
    OpenFailed(String),
    /// 랑데부로 보낼 로컬 시그널링 데이터
    Signal(SignalPayload),
    Connected,
    Data(Bytes),
    Closed,
    Error(String),
}

impl std::fmt::Debug for DirectEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectEvent::Opened(_) => f.write_str("Opened"),
            DirectEvent::OpenFailed(reason) => write!(f, "OpenFailed({})", reason),
            DirectEvent::Signal(payload) => write!(f, "Signal({} bytes)", payload.len()),
            DirectEvent::Connected => f.write_str("Connected"),
            DirectEvent::Data(data) => write!(f, "Data({} bytes)", data.len()),
            DirectEvent::Closed => f.write_str("Closed"),
            DirectEvent::Error(reason) => write!(f, "Error({})", reason),
        }
    }
}

/// 전송 계층에서 세션 이벤트 루프로 들어오는 이벤트
#[derive(Debug)]
pub enum LinkEvent {
    Direct {
        remote: DeviceId,
        generation: u64,
        event: DirectEvent,
    },
    FallbackTimeout {
        remote: DeviceId,
        generation: u64,
    },
    WriteDone {
        remote: DeviceId,
        generation: u64,
        result: Result<()>,
    },
}

/// Direct 채널용 이벤트 송신 핸들
///
/// generation이 다른(교체된) 전송의 이벤트는 레지스트리가 무시한다.
#[derive(Clone)]
pub struct DirectEvents {
    tx: mpsc::UnboundedSender<SessionEvent>,
    remote: DeviceId,
    generation: u64,
}

impl DirectEvents {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<SessionEvent>,
        remote: DeviceId,
        generation: u64,
    ) -> Self {
        Self {
            tx,
            remote,
            generation,
        }
    }

    pub fn remote(&self) -> DeviceId {
        self.remote
    }

    /// 이벤트 전달 (세션이 끝났으면 false)
    pub fn emit(&self, event: DirectEvent) -> bool {
        self.tx
            .send(SessionEvent::Link(LinkEvent::Direct {
                remote: self.remote,
                generation: self.generation,
                event,
            }))
            .is_ok()
    }
}

/// Direct 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectState {
    /// `open` 진행 중
    Opening,
    /// 채널 있음, 연결 대기
    Establishing,
    Connected,
}

/// Direct 전송
pub struct DirectTransport {
    pub(crate) state: DirectState,
    pub(crate) channel: Option<Arc<dyn DirectChannel>>,
    /// 채널이 열리기 전에 도착한 시그널링
    pub(crate) pending_signals: Vec<SignalPayload>,
    /// initiator만 가지는 대체 타이머
    pub(crate) fallback_timer: Option<AbortHandle>,
}

impl DirectTransport {
    pub(crate) fn opening(fallback_timer: Option<AbortHandle>) -> Self {
        Self {
            state: DirectState::Opening,
            channel: None,
            pending_signals: Vec::new(),
            fallback_timer,
        }
    }

    /// 채널 열림: 대기 중인 시그널링 전달
    pub(crate) fn opened(&mut self, channel: Arc<dyn DirectChannel>) {
        for payload in self.pending_signals.drain(..) {
            if let Err(e) = channel.signal(payload) {
                warn!("대기 시그널 전달 실패: {}", e);
            }
        }
        self.channel = Some(channel);
        if self.state == DirectState::Opening {
            self.state = DirectState::Establishing;
        }
    }

    pub(crate) fn cancel_timer(&mut self) {
        if let Some(timer) = self.fallback_timer.take() {
            timer.abort();
        }
    }

    fn close(&mut self) {
        self.cancel_timer();
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }
}

/// Relay 전송 (핸드셰이크 없음, 항상 연결 상태)
pub struct RelayTransport {
    rendezvous: Arc<dyn Rendezvous>,
}

impl RelayTransport {
    pub fn new(rendezvous: Arc<dyn Rendezvous>) -> Self {
        Self { rendezvous }
    }

    pub(crate) fn write(&self, remote: DeviceId, frame: Bytes) -> Result<()> {
        self.rendezvous.relay_data(remote, frame)
    }
}

/// 링크의 현재 전송
pub enum Transport {
    Direct(DirectTransport),
    Relay(RelayTransport),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Direct(_) => TransportKind::Direct,
            Transport::Relay(_) => TransportKind::Relay,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Transport::Direct(direct) => direct.state == DirectState::Connected,
            Transport::Relay(_) => true,
        }
    }

    pub(crate) fn close(&mut self) {
        if let Transport::Direct(direct) = self {
            direct.close();
        }
    }
}
