//! 전송 관리자 - 메시지 분배, 인증, ready 핸드셰이크
//!
//! (원격 기기, 전송 ID, 메시지 종류)로 송신/수신 인스턴스에 분배한다.
//! ready를 제외한 모든 메시지는 실행 중인 전송에 속해야 하고,
//! request는 디렉터리로 관계를 검증한다. 게스트의 request는 이전 전송 ID가
//! 로컬 업로드 링크를 가리켜야 한다. 실패하면 unauthorized 에러로 응답하고 버린다.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chunk::OutgoingFile;
use crate::directory::{
    is_guest, DeviceId, Directory, FileId, Notification, NotificationId, Notifier, TargetSelector,
    TransferId,
};
use crate::message::{ChunkIndex, ChunkMessage, Envelope, RequestMessage, UNAUTHORIZED};
use crate::progress::{Progress, ProgressEvent, SendStateBoard};
use crate::receiver::{IncomingState, IncomingTransfer, ReceivedFile};
use crate::registry::Outbox;
use crate::sender::{OutgoingTransfer, RecipientState};
use crate::stats::TransferStats;
use crate::config::{GuestLink, GuestLinkMode};
use crate::{Config, Error, Result};

/// 상태기계가 쓰는 출력 묶음
pub struct TransferCtx<'a> {
    pub out: &'a mut dyn Outbox,
    pub stats: &'a mut TransferStats,
    pub progress: &'a Progress,
}

impl<'a> TransferCtx<'a> {
    pub fn new(
        out: &'a mut dyn Outbox,
        stats: &'a mut TransferStats,
        progress: &'a Progress,
    ) -> Self {
        Self {
            out,
            stats,
            progress,
        }
    }
}

/// 수신 요청에 대한 사용자 결정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

/// 취소 대상
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelTarget {
    Transfer(TransferId),
    All,
}

fn authorized(
    outgoing: &mut HashMap<TransferId, OutgoingTransfer>,
    from: DeviceId,
    transfer_id: TransferId,
) -> Result<&mut OutgoingTransfer> {
    match outgoing.get_mut(&transfer_id) {
        Some(transfer) if transfer.recipient(from).is_some() => Ok(transfer),
        _ => Err(Error::Unauthorized {
            device: from,
            transfer_id,
        }),
    }
}

/// 경로 구분자를 제거한 저장용 파일 이름
fn storage_name(file: &ReceivedFile) -> String {
    Path::new(&file.name)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("file-{}-{}", file.transfer_id, file.file_id))
}

/// 전송 관리자 (세션 태스크 전용)
pub struct TransferManager {
    config: Config,
    directory: Arc<dyn Directory>,
    notifier: Arc<dyn Notifier>,
    outgoing: HashMap<TransferId, OutgoingTransfer>,
    incoming: HashMap<(DeviceId, TransferId), IncomingTransfer>,
    /// 오프라인 기기에 보낸 알림 → 송신 전송
    notifications: HashMap<NotificationId, TransferId>,
    /// 로컬에서 ready로 응답한 알림 (해당 request는 자동 수락)
    acknowledged: HashSet<NotificationId>,
    /// 게스트에게서 파일을 받는 링크
    upload_links: HashSet<TransferId>,
    next_transfer_id: TransferId,
    next_notification_id: NotificationId,
    stats: TransferStats,
    progress: Progress,
    board: SendStateBoard,
    received_tx: mpsc::UnboundedSender<ReceivedFile>,
}

impl TransferManager {
    pub fn new(
        config: Config,
        directory: Arc<dyn Directory>,
        notifier: Arc<dyn Notifier>,
        progress: Progress,
        board: SendStateBoard,
        received_tx: mpsc::UnboundedSender<ReceivedFile>,
    ) -> Self {
        Self {
            config,
            directory,
            notifier,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            notifications: HashMap::new(),
            acknowledged: HashSet::new(),
            upload_links: HashSet::new(),
            next_transfer_id: rand::random::<u32>() as TransferId + 1,
            next_notification_id: rand::random::<u32>() as NotificationId + 1,
            stats: TransferStats::new(),
            progress,
            board,
            received_tx,
        }
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn local_device(&self) -> DeviceId {
        self.directory.local_device()
    }

    pub fn outgoing_state(&self, transfer_id: TransferId, device: DeviceId) -> Option<RecipientState> {
        self.outgoing
            .get(&transfer_id)
            .and_then(|t| t.recipient(device))
            .map(|r| r.state)
    }

    pub fn outgoing_transfer(&self, transfer_id: TransferId) -> Option<&OutgoingTransfer> {
        self.outgoing.get(&transfer_id)
    }

    pub fn incoming_state(&self, from: DeviceId, transfer_id: TransferId) -> Option<IncomingState> {
        self.incoming.get(&(from, transfer_id)).map(|t| t.state())
    }

    fn allocate_transfer_id(&mut self) -> TransferId {
        let id = self.next_transfer_id;
        self.next_transfer_id = self.next_transfer_id.wrapping_add(1).max(1);
        id
    }

    fn allocate_notification_id(&mut self) -> NotificationId {
        let id = self.next_notification_id;
        self.next_notification_id = self.next_notification_id.wrapping_add(1).max(1);
        id
    }

    /// 송신 시작
    ///
    /// 온라인 기기에는 바로 request, 오프라인 기기에는 알림만 보낸다.
    pub async fn initiate_transfer(
        &mut self,
        target: TargetSelector,
        files: Vec<OutgoingFile>,
        out: &mut dyn Outbox,
    ) -> Result<TransferId> {
        if target.is_guest() {
            return Err(Error::InvalidMessage(
                "게스트 대상은 create_guest_link로만 생성".into(),
            ));
        }

        let local = self.directory.local_device();
        let devices: Vec<DeviceId> = self
            .directory
            .resolve(&target)
            .into_iter()
            .filter(|device| *device != local)
            .collect();
        if devices.is_empty() {
            return Err(Error::InvalidMessage(format!("대상 기기 없음: {:?}", target)));
        }

        let id = self.allocate_transfer_id();
        let mut transfer = OutgoingTransfer::new(id, target, files, None, &self.config)?;
        let (online, offline): (Vec<DeviceId>, Vec<DeviceId>) = devices
            .into_iter()
            .partition(|device| self.directory.is_online(*device));

        if !offline.is_empty() {
            let notification_id = self.allocate_notification_id();
            transfer.set_notification_id(notification_id);
            self.notifications.insert(notification_id, id);
        }

        info!(
            "송신 시작: transfer={}, target={:?}, online={}, offline={}",
            id,
            target,
            online.len(),
            offline.len()
        );

        let mut ctx = TransferCtx::new(out, &mut self.stats, &self.progress);
        for device in online {
            transfer.add_recipient(device);
            if let Err(e) = transfer.send_request(device, &mut ctx) {
                transfer.on_send_error(device, &e, &mut ctx);
            }
        }

        if let Some(notification_id) = transfer.notification_id() {
            let summary = transfer
                .file_infos()
                .iter()
                .map(|f| f.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            for device in offline {
                transfer.add_recipient(device);
                self.notifier.notify(
                    device,
                    Notification {
                        notification_id,
                        transfer_id: id,
                        from: local,
                        summary: summary.clone(),
                    },
                );
                debug!("알림 발송: transfer={}, device={}", id, device);
                self.progress.emit(ProgressEvent::Notified {
                    transfer_id: id,
                    device,
                    notification_id,
                });
            }
        }

        self.outgoing.insert(id, transfer);
        self.settle(id);
        Ok(id)
    }

    /// 게스트 링크 생성 (수신자 없이 대기)
    pub fn create_guest_link(&mut self, files: Vec<OutgoingFile>) -> Result<TransferId> {
        let id = self.allocate_transfer_id();
        let transfer = OutgoingTransfer::new(id, TargetSelector::Guest(id), files, None, &self.config)?;
        info!("게스트 링크 생성: transfer={}", id);
        self.outgoing.insert(id, transfer);
        Ok(id)
    }

    /// 업로드 링크 생성 (게스트가 보내는 request를 받음)
    pub fn create_guest_upload_link(&mut self) -> TransferId {
        let id = self.allocate_transfer_id();
        self.upload_links.insert(id);
        info!("업로드 링크 생성: transfer={}", id);
        id
    }

    fn guest_link(&self, mode: GuestLinkMode) -> Result<GuestLink> {
        match self.config.guest_link {
            Some(link) if link.mode == mode => Ok(link),
            Some(_) => Err(Error::InvalidConfig(format!("{:?} 링크가 아님", mode))),
            None => Err(Error::InvalidConfig("게스트 세션이 아님".into())),
        }
    }

    /// 업로드 링크 게스트 세션에서 소유자에게 파일 송신
    pub fn upload_to_guest_link(
        &mut self,
        files: Vec<OutgoingFile>,
        out: &mut dyn Outbox,
    ) -> Result<TransferId> {
        let link = self.guest_link(GuestLinkMode::Upload)?;
        let id = self.allocate_transfer_id();
        let mut transfer = OutgoingTransfer::new(
            id,
            TargetSelector::Device(link.owner),
            files,
            Some(link.transfer_id),
            &self.config,
        )?;
        info!(
            "업로드 링크로 송신: owner={}, link={}, transfer={}",
            link.owner, link.transfer_id, id
        );

        transfer.add_recipient(link.owner);
        let mut ctx = TransferCtx::new(out, &mut self.stats, &self.progress);
        let result = transfer.send_request(link.owner, &mut ctx);
        if let Err(e) = &result {
            transfer.on_send_error(link.owner, e, &mut ctx);
        }
        self.outgoing.insert(id, transfer);
        self.settle(id);
        match result {
            Err(e) if !e.is_transport() => Err(e),
            _ => Ok(id),
        }
    }

    /// 게스트 세션에서 링크 소유자에게 참가 알림
    pub fn join_guest_link(&mut self, out: &mut dyn Outbox) -> Result<()> {
        let link = self.guest_link(GuestLinkMode::Download)?;
        info!("게스트 링크 참가: owner={}, transfer={}", link.owner, link.transfer_id);
        out.send(
            link.owner,
            Envelope::Accept {
                transfer_id: link.transfer_id,
                guest: true,
            },
        )
    }

    /// 푸시 알림 확인: ready 전송, 이어지는 request는 자동 수락
    pub fn acknowledge_notification(
        &mut self,
        notification: &Notification,
        out: &mut dyn Outbox,
    ) -> Result<()> {
        self.acknowledged.insert(notification.notification_id);
        out.send(
            notification.from,
            Envelope::Ready {
                transfer_id: notification.transfer_id,
                notification_id: notification.notification_id,
            },
        )
    }

    /// 사용자 결정 반영
    pub fn decide(
        &mut self,
        transfer_id: TransferId,
        decision: Decision,
        out: &mut dyn Outbox,
    ) -> Result<()> {
        let key = self
            .incoming
            .iter()
            .find(|(_, t)| t.id() == transfer_id && t.state() == IncomingState::Infos)
            .map(|(key, _)| *key)
            .ok_or(Error::TransferNotFound(transfer_id))?;

        match decision {
            Decision::Accept => match self.incoming.get_mut(&key) {
                Some(transfer) => transfer.accept(out),
                None => Err(Error::TransferNotFound(transfer_id)),
            },
            Decision::Reject => match self.incoming.remove(&key) {
                Some(mut transfer) => transfer.reject(out),
                None => Err(Error::TransferNotFound(transfer_id)),
            },
        }
    }

    /// 송신 취소 (보내지 않은 큐는 비움, 상대에게 알리지 않음)
    pub fn cancel(&mut self, target: CancelTarget, out: &mut dyn Outbox) -> Result<()> {
        let ids: Vec<TransferId> = match target {
            CancelTarget::Transfer(id) if self.upload_links.remove(&id) => {
                info!("업로드 링크 닫음: transfer={}", id);
                return Ok(());
            }
            CancelTarget::Transfer(id) if self.outgoing.contains_key(&id) => vec![id],
            CancelTarget::Transfer(id) => return Err(Error::TransferNotFound(id)),
            CancelTarget::All => {
                self.upload_links.clear();
                self.outgoing.keys().copied().collect()
            }
        };

        for id in ids {
            if let Some(mut transfer) = self.outgoing.remove(&id) {
                let mut ctx = TransferCtx::new(out, &mut self.stats, &self.progress);
                transfer.cancel(&mut ctx);
                self.board.set(transfer.id(), *transfer.target(), transfer.summary_state());
                self.notifications.retain(|_, t| *t != id);
                info!("송신 취소: transfer={}", id);
            }
        }
        Ok(())
    }

    /// 링크가 끊김 (전송 상태는 그대로)
    pub fn peer_gone(&mut self, remote: DeviceId, reason: String) {
        info!("피어 연결 끊김: device={}, {}", remote, reason);
        self.progress.emit(ProgressEvent::PeerGone { remote, reason });
    }

    /// 수신 메시지 분배
    pub async fn dispatch(&mut self, from: DeviceId, envelope: Envelope, out: &mut dyn Outbox) {
        let Some(transfer_id) = envelope.transfer_id() else {
            debug!("전송 ID 없는 메시지 무시: from={}", from);
            return;
        };
        let kind = envelope.msg_type();

        let result = match envelope {
            Envelope::KeyAnnouncement(_) => Ok(()),
            Envelope::Request(request) => self.on_request(from, request, out),
            Envelope::Ready {
                notification_id, ..
            } => self.on_ready(from, transfer_id, notification_id, out),
            Envelope::Accept { guest, .. } => self.on_accept(from, transfer_id, guest, out).await,
            Envelope::Reject { .. } => self.on_reject(from, transfer_id, out),
            Envelope::Chunk(chunk) => self.on_chunk(from, chunk, out).await,
            Envelope::FileFinish {
                file_id, missing, ..
            } => {
                self.on_file_finish(from, transfer_id, file_id, missing, out)
                    .await
            }
            Envelope::TransferFinish { .. } => self.on_transfer_finish(from, transfer_id, out),
            Envelope::Error { message, .. } => {
                self.on_error(from, transfer_id, message, out);
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(Error::Unauthorized {
                device,
                transfer_id,
            }) => {
                warn!(
                    "인증되지 않은 {} 메시지: from={}, transfer={}",
                    kind, device, transfer_id
                );
                self.stats.unauthorized += 1;
                if let Err(e) = out.send(device, Envelope::unauthorized(transfer_id)) {
                    warn!("에러 응답 실패: device={}, {}", device, e);
                }
            }
            Err(e) => warn!("{} 메시지 처리 실패: from={}, {}", kind, from, e),
        }
    }

    fn on_request(&mut self, from: DeviceId, request: RequestMessage, out: &mut dyn Outbox) -> Result<()> {
        let transfer_id = request.transfer_id;
        let unauthorized = Error::Unauthorized {
            device: from,
            transfer_id,
        };

        let guest_accept = match self.config.guest_link {
            Some(link) => {
                // 게스트 세션은 링크 소유자의 해당 전송만 받음
                if link.mode != GuestLinkMode::Download
                    || from != link.owner
                    || transfer_id != link.transfer_id
                {
                    return Err(unauthorized);
                }
                true
            }
            None if is_guest(from) => {
                // 게스트 업로드는 로컬 업로드 링크를 가리켜야 함
                match request.previous_transfer_id {
                    Some(link) if self.upload_links.contains(&link) => {
                        debug!("업로드 링크로 온 request: from={}, link={}", from, link);
                        false
                    }
                    _ => return Err(unauthorized),
                }
            }
            None => {
                if request.target.is_guest() || !self.directory.relationship(from, &request.target) {
                    return Err(unauthorized);
                }
                false
            }
        };

        if let Some(existing) = self.incoming.get(&(from, transfer_id)) {
            if existing.state() != IncomingState::Infos {
                debug!("중복 request 무시: from={}, transfer={}", from, transfer_id);
                return Ok(());
            }
        }

        let mut transfer = IncomingTransfer::new(from, &request);
        let acknowledged = request
            .notification_id
            .is_some_and(|id| self.acknowledged.remove(&id));
        let auto_accept = guest_accept || acknowledged;

        info!(
            "수신 요청: from={}, transfer={}, files={}, auto_accept={}",
            from,
            transfer_id,
            request.files.len(),
            auto_accept
        );
        self.progress.emit(ProgressEvent::IncomingRequest {
            transfer_id,
            from,
            files: request.files.clone(),
            auto_accepted: auto_accept,
        });

        if auto_accept {
            transfer.accept(out)?;
        }
        self.incoming.insert((from, transfer_id), transfer);
        Ok(())
    }

    /// ready: 원래 대상에 아직 속하는지 다시 확인한 뒤 request 전송
    fn on_ready(
        &mut self,
        from: DeviceId,
        transfer_id: TransferId,
        notification_id: NotificationId,
        out: &mut dyn Outbox,
    ) -> Result<()> {
        let unauthorized = Error::Unauthorized {
            device: from,
            transfer_id,
        };
        if self.notifications.get(&notification_id) != Some(&transfer_id) {
            return Err(unauthorized);
        }
        let Some(transfer) = self.outgoing.get_mut(&transfer_id) else {
            return Err(unauthorized);
        };
        if !self.directory.resolve(transfer.target()).contains(&from) {
            return Err(unauthorized);
        }

        if transfer.add_recipient(from) {
            debug!("ready로 새 수신자 추가: transfer={}, device={}", transfer_id, from);
        }
        info!("ready 수신: transfer={}, device={}", transfer_id, from);

        let mut ctx = TransferCtx::new(out, &mut self.stats, &self.progress);
        let result = transfer.send_request(from, &mut ctx);
        if let Err(e) = &result {
            transfer.on_send_error(from, e, &mut ctx);
        }
        self.settle(transfer_id);
        result
    }

    async fn on_accept(
        &mut self,
        from: DeviceId,
        transfer_id: TransferId,
        guest: bool,
        out: &mut dyn Outbox,
    ) -> Result<()> {
        if guest {
            let transfer = match self.outgoing.get_mut(&transfer_id) {
                Some(t) if t.target().is_guest() && is_guest(from) => t,
                _ => {
                    return Err(Error::Unauthorized {
                        device: from,
                        transfer_id,
                    })
                }
            };
            if transfer.add_recipient(from) {
                info!("게스트 참가: transfer={}, device={}", transfer_id, from);
            }
            let mut ctx = TransferCtx::new(out, &mut self.stats, &self.progress);
            transfer.send_request(from, &mut ctx)?;
        } else {
            let transfer = authorized(&mut self.outgoing, from, transfer_id)?;
            let mut ctx = TransferCtx::new(out, &mut self.stats, &self.progress);
            transfer.on_accept(from, &mut ctx).await?;
        }
        self.settle(transfer_id);
        Ok(())
    }

    fn on_reject(&mut self, from: DeviceId, transfer_id: TransferId, out: &mut dyn Outbox) -> Result<()> {
        let transfer = authorized(&mut self.outgoing, from, transfer_id)?;
        let mut ctx = TransferCtx::new(out, &mut self.stats, &self.progress);
        transfer.on_reject(from, &mut ctx);
        self.settle(transfer_id);
        Ok(())
    }

    async fn on_chunk(&mut self, from: DeviceId, chunk: ChunkMessage, out: &mut dyn Outbox) -> Result<()> {
        let key = (from, chunk.transfer_id);
        let Some(transfer) = self.incoming.get_mut(&key) else {
            return Err(Error::Unauthorized {
                device: from,
                transfer_id: chunk.transfer_id,
            });
        };

        let mut ctx = TransferCtx::new(out, &mut self.stats, &self.progress);
        if let Some(files) = transfer.on_chunk(chunk, &mut ctx)? {
            self.incoming.remove(&key);
            for file in files {
                self.deliver(file).await;
            }
        }
        Ok(())
    }

    async fn on_file_finish(
        &mut self,
        from: DeviceId,
        transfer_id: TransferId,
        file_id: FileId,
        missing: Option<Vec<ChunkIndex>>,
        out: &mut dyn Outbox,
    ) -> Result<()> {
        let transfer = authorized(&mut self.outgoing, from, transfer_id)?;
        let mut ctx = TransferCtx::new(out, &mut self.stats, &self.progress);
        transfer.on_file_finish(from, file_id, missing, &mut ctx).await?;
        self.settle(transfer_id);
        Ok(())
    }

    fn on_transfer_finish(
        &mut self,
        from: DeviceId,
        transfer_id: TransferId,
        out: &mut dyn Outbox,
    ) -> Result<()> {
        let transfer = authorized(&mut self.outgoing, from, transfer_id)?;
        let mut ctx = TransferCtx::new(out, &mut self.stats, &self.progress);
        transfer.on_transfer_finish(from, &mut ctx);
        self.settle(transfer_id);
        Ok(())
    }

    /// 상대가 보낸 error: 기록만 하고 응답하지 않음
    fn on_error(&mut self, from: DeviceId, transfer_id: TransferId, message: String, out: &mut dyn Outbox) {
        warn!("상대 에러: from={}, transfer={}, {}", from, transfer_id, message);
        if message == UNAUTHORIZED {
            if let Some(transfer) = self.outgoing.get_mut(&transfer_id) {
                let mut ctx = TransferCtx::new(out, &mut self.stats, &self.progress);
                transfer.fail(from, &mut ctx);
                self.settle(transfer_id);
            }
        }
        self.progress.emit(ProgressEvent::RemoteError {
            transfer_id,
            from,
            message,
        });
    }

    /// UI 상태 갱신, 모든 수신자가 끝난 전송 정리
    fn settle(&mut self, transfer_id: TransferId) {
        let Some(transfer) = self.outgoing.get(&transfer_id) else {
            return;
        };
        self.board.set(transfer.id(), *transfer.target(), transfer.summary_state());
        if transfer.is_done() {
            self.outgoing.remove(&transfer_id);
            self.notifications.retain(|_, t| *t != transfer_id);
            self.stats.transfers_sent += 1;
            info!("송신 전송 종료: transfer={}", transfer_id);
        }
    }

    /// 완성 파일 전달 (다운로드 경로가 있으면 저장)
    async fn deliver(&mut self, file: ReceivedFile) {
        if let Some(dir) = &self.config.download_dir {
            let path = dir.join(storage_name(&file));
            let written = async {
                tokio::fs::create_dir_all(dir).await?;
                tokio::fs::write(&path, &file.bytes).await
            }
            .await;
            match written {
                Ok(()) => info!("파일 저장: {}", path.display()),
                Err(e) => warn!("파일 저장 실패: {}: {}", path.display(), e),
            }
        }
        if let Err(mpsc::error::SendError(file)) = self.received_tx.send(file) {
            warn!(
                "수신 파일 채널 닫힘, 전달 못함: transfer={}, file={}",
                file.transfer_id, file.name
            );
        }
    }
}
