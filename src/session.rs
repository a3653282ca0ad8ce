//! 세션 - 피어 레지스트리와 전송 관리자를 소유하는 단일 이벤트 루프
//!
//! 로컬 명령, 랑데부 전달, Direct 채널 이벤트, 대체 타이머, 쓰기 완료가
//! 모두 하나의 큐로 들어온다. 링크와 전송 상태는 이 태스크만 변경한다.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::chunk::OutgoingFile;
use crate::crypto::KeyPair;
use crate::directory::{DeviceId, Directory, Notification, Notifier, TargetSelector, TransferId};
use crate::manager::{CancelTarget, Decision, TransferManager};
use crate::message::Envelope;
use crate::progress::{Progress, ProgressEvent, SendState, SendStateBoard};
use crate::receiver::ReceivedFile;
use crate::registry::{CloseSelector, LinkOutcome, PeerRegistry};
use crate::stats::TransferStats;
use crate::transport::{DirectConnector, LinkEvent, Rendezvous, SignalPayload, TransportKind};
use crate::{Config, Error, Result};

/// 핸들에서 세션으로 보내는 명령
pub enum SessionCommand {
    Initiate {
        target: TargetSelector,
        files: Vec<OutgoingFile>,
        reply: oneshot::Sender<Result<TransferId>>,
    },
    Decide {
        transfer_id: TransferId,
        decision: Decision,
        reply: oneshot::Sender<Result<()>>,
    },
    CreateGuestLink {
        files: Vec<OutgoingFile>,
        reply: oneshot::Sender<Result<TransferId>>,
    },
    JoinGuestLink {
        reply: oneshot::Sender<Result<()>>,
    },
    CreateGuestUploadLink {
        reply: oneshot::Sender<TransferId>,
    },
    UploadToGuestLink {
        files: Vec<OutgoingFile>,
        reply: oneshot::Sender<Result<TransferId>>,
    },
    AcknowledgeNotification {
        notification: Notification,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        target: CancelTarget,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        selector: CloseSelector,
        reply: oneshot::Sender<Vec<DeviceId>>,
    },
    Stats {
        reply: oneshot::Sender<TransferStats>,
    },
}

/// 세션 이벤트 큐 항목
pub enum SessionEvent {
    Command(SessionCommand),
    /// 랑데부로 도착한 시그널링 데이터
    Signal {
        from: DeviceId,
        payload: SignalPayload,
    },
    /// 랑데부로 도착한 Relay 프레임
    Relay {
        from: DeviceId,
        frame: Bytes,
    },
    Link(LinkEvent),
    Stop,
}

/// 세션 핸들 (복제 가능)
#[derive(Clone)]
pub struct SessionHandle {
    local: DeviceId,
    tx: mpsc::UnboundedSender<SessionEvent>,
    progress: Progress,
    board: SendStateBoard,
}

impl SessionHandle {
    pub fn local_device(&self) -> DeviceId {
        self.local
    }

    fn post(&self, event: SessionEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| Error::ChannelClosed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.post(SessionEvent::Command(command(reply)))?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// 랑데부가 받은 시그널링 데이터 전달
    pub fn deliver_signal(&self, from: DeviceId, payload: SignalPayload) -> Result<()> {
        self.post(SessionEvent::Signal { from, payload })
    }

    /// 랑데부가 받은 Relay 프레임 전달
    pub fn deliver_relay(&self, from: DeviceId, frame: Bytes) -> Result<()> {
        self.post(SessionEvent::Relay { from, frame })
    }

    /// 파일 송신 시작
    pub async fn initiate_transfer(
        &self,
        target: TargetSelector,
        files: Vec<OutgoingFile>,
    ) -> Result<TransferId> {
        self.request(|reply| SessionCommand::Initiate {
            target,
            files,
            reply,
        })
        .await?
    }

    pub async fn decide(&self, transfer_id: TransferId, decision: Decision) -> Result<()> {
        self.request(|reply| SessionCommand::Decide {
            transfer_id,
            decision,
            reply,
        })
        .await?
    }

    pub async fn create_guest_link(&self, files: Vec<OutgoingFile>) -> Result<TransferId> {
        self.request(|reply| SessionCommand::CreateGuestLink { files, reply })
            .await?
    }

    pub async fn join_guest_link(&self) -> Result<()> {
        self.request(|reply| SessionCommand::JoinGuestLink { reply })
            .await?
    }

    /// 게스트가 파일을 올릴 수 있는 링크 생성
    pub async fn create_guest_upload_link(&self) -> Result<TransferId> {
        self.request(|reply| SessionCommand::CreateGuestUploadLink { reply })
            .await
    }

    /// 업로드 링크 게스트 세션에서 소유자에게 송신
    pub async fn upload_to_guest_link(&self, files: Vec<OutgoingFile>) -> Result<TransferId> {
        self.request(|reply| SessionCommand::UploadToGuestLink { files, reply })
            .await?
    }

    pub async fn acknowledge_notification(&self, notification: Notification) -> Result<()> {
        self.request(|reply| SessionCommand::AcknowledgeNotification {
            notification,
            reply,
        })
        .await?
    }

    pub async fn cancel(&self, target: CancelTarget) -> Result<()> {
        self.request(|reply| SessionCommand::Cancel { target, reply })
            .await?
    }

    /// 링크 닫기, 닫힌 기기 목록 반환
    pub async fn close(&self, selector: CloseSelector) -> Result<Vec<DeviceId>> {
        self.request(|reply| SessionCommand::Close { selector, reply })
            .await
    }

    /// 프레즌스 변경: 온라인 집합에 없는 기기의 링크를 닫음
    pub async fn presence_changed(&self, online: HashSet<DeviceId>) -> Result<Vec<DeviceId>> {
        self.close(CloseSelector::NotIn(online)).await
    }

    pub async fn stats(&self) -> Result<TransferStats> {
        self.request(|reply| SessionCommand::Stats { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    /// 대상별 UI 송신 상태
    pub fn send_state(&self, target: &TargetSelector) -> SendState {
        self.board.get(target)
    }

    /// 세션 종료 (모든 링크를 닫음)
    pub fn stop(&self) -> Result<()> {
        self.post(SessionEvent::Stop)
    }
}

/// 세션 (이벤트 루프 태스크가 소유)
pub struct Session {
    local: DeviceId,
    registry: PeerRegistry,
    manager: TransferManager,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Session {
    /// 세션 시작
    ///
    /// 이벤트 루프를 스폰하고 핸들과 수신 완료 파일 스트림을 돌려준다.
    pub fn start(
        config: Config,
        directory: Arc<dyn Directory>,
        notifier: Arc<dyn Notifier>,
        rendezvous: Arc<dyn Rendezvous>,
        direct: Option<Arc<dyn DirectConnector>>,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<ReceivedFile>)> {
        config.validate()?;

        let (tx, events) = mpsc::unbounded_channel();
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let progress = Progress::new(config.progress_capacity);
        let board = SendStateBoard::new(config.state_reset_delay());
        let local = directory.local_device();

        let registry = PeerRegistry::new(
            &config,
            Arc::new(KeyPair::generate()),
            rendezvous,
            direct,
            tx.clone(),
        );
        let manager = TransferManager::new(
            config,
            directory,
            notifier,
            progress.clone(),
            board.clone(),
            received_tx,
        );

        let session = Session {
            local,
            registry,
            manager,
            events,
        };
        tokio::spawn(session.run());

        let handle = SessionHandle {
            local,
            tx,
            progress,
            board,
        };
        Ok((handle, received_rx))
    }

    async fn run(mut self) {
        info!("세션 시작: device={}", self.local);

        while let Some(event) = self.events.recv().await {
            match event {
                SessionEvent::Stop => break,
                SessionEvent::Command(command) => self.on_command(command).await,
                SessionEvent::Signal { from, payload } => {
                    if let Err(e) = self.registry.signal(from, payload) {
                        warn!("시그널 처리 실패: device={}, {}", from, e);
                    }
                }
                SessionEvent::Relay { from, frame } => {
                    match self.registry.handle_frame(from, frame, TransportKind::Relay) {
                        Ok(envelopes) => self.dispatch(from, envelopes).await,
                        Err(e) => warn!("Relay 프레임 거부: device={}, {}", from, e),
                    }
                }
                SessionEvent::Link(event) => match self.registry.on_link_event(event) {
                    LinkOutcome::Nothing => {}
                    LinkOutcome::Inbound { from, envelopes } => self.dispatch(from, envelopes).await,
                    LinkOutcome::PeerGone { remote, reason } => self.manager.peer_gone(remote, reason),
                },
            }

            for (remote, reason) in self.registry.take_gone() {
                self.manager.peer_gone(remote, reason);
            }
        }

        let closed = self.registry.close(CloseSelector::All);
        info!("세션 종료: device={}, 닫은 링크 {}개", self.local, closed.len());
        debug!("{}", self.manager.stats().summary());
    }

    async fn dispatch(&mut self, from: DeviceId, envelopes: Vec<Envelope>) {
        for envelope in envelopes {
            self.manager.dispatch(from, envelope, &mut self.registry).await;
        }
    }

    async fn on_command(&mut self, command: SessionCommand) {
        // 응답 수신자가 사라졌으면 결과를 버림
        match command {
            SessionCommand::Initiate {
                target,
                files,
                reply,
            } => {
                let result = self
                    .manager
                    .initiate_transfer(target, files, &mut self.registry)
                    .await;
                let _ = reply.send(result);
            }
            SessionCommand::Decide {
                transfer_id,
                decision,
                reply,
            } => {
                let result = self
                    .manager
                    .decide(transfer_id, decision, &mut self.registry);
                let _ = reply.send(result);
            }
            SessionCommand::CreateGuestLink { files, reply } => {
                let _ = reply.send(self.manager.create_guest_link(files));
            }
            SessionCommand::JoinGuestLink { reply } => {
                let _ = reply.send(self.manager.join_guest_link(&mut self.registry));
            }
            SessionCommand::CreateGuestUploadLink { reply } => {
                let _ = reply.send(self.manager.create_guest_upload_link());
            }
            SessionCommand::UploadToGuestLink { files, reply } => {
                let result = self.manager.upload_to_guest_link(files, &mut self.registry);
                let _ = reply.send(result);
            }
            SessionCommand::AcknowledgeNotification {
                notification,
                reply,
            } => {
                let result = self
                    .manager
                    .acknowledge_notification(&notification, &mut self.registry);
                let _ = reply.send(result);
            }
            SessionCommand::Cancel { target, reply } => {
                let _ = reply.send(self.manager.cancel(target, &mut self.registry));
            }
            SessionCommand::Close { selector, reply } => {
                let closed = self.registry.close(selector);
                for remote in &closed {
                    self.manager.peer_gone(*remote, "링크 닫음".into());
                }
                let _ = reply.send(closed);
            }
            SessionCommand::Stats { reply } => {
                let _ = reply.send(self.manager.stats().clone());
            }
        }
    }
}
