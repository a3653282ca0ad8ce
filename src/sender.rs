//! 송신 측 전송 상태기계
//!
//! 수신자별: requesting → sending → {sent | rejected | canceled | failed}
//! - 파일은 하나씩 순서대로, 마지막 청크에 last 표시
//! - 누락 보고가 오면 캐시에서 그 청크만 재전송
//! - 빈 누락 보고가 와야 다음 파일로 넘어감

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::chunk::{ChunkCache, ChunkLayout, FileSource, OutgoingFile};
use crate::directory::{DeviceId, FileId, NotificationId, TargetSelector, TransferId};
use crate::manager::TransferCtx;
use crate::message::{ChunkIndex, ChunkMessage, Envelope, FileInfo, RequestMessage};
use crate::progress::{ProgressEvent, SendState};
use crate::{Config, Error, Result};

/// 수신자 상태 (앞으로만 진행)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecipientState {
    Requesting,
    Sending,
    Sent,
    Rejected,
    Canceled,
    Failed,
}

impl RecipientState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RecipientState::Requesting | RecipientState::Sending)
    }

    fn can_move_to(self, next: RecipientState) -> bool {
        use RecipientState::*;
        match (self, next) {
            (Requesting, Sending) => true,
            (Sending, Sent) => true,
            (Requesting | Sending, Rejected | Canceled | Failed) => true,
            _ => false,
        }
    }
}

/// 수신자 기록
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub device: DeviceId,
    pub state: RecipientState,
    /// 누락 없이 끝난 파일 수 (= 현재 파일 인덱스)
    pub files_sent: usize,
    /// request를 이미 보냈는지 (오프라인 기기는 ready 전까지 false)
    pub request_sent: bool,
}

/// 송신 파일 상태
struct OutgoingFileState {
    info: FileInfo,
    source: FileSource,
    cache: ChunkCache,
}

/// 송신 전송
pub struct OutgoingTransfer {
    id: TransferId,
    target: TargetSelector,
    notification_id: Option<NotificationId>,
    previous_transfer_id: Option<TransferId>,
    files: Vec<OutgoingFileState>,
    recipients: BTreeMap<DeviceId, Recipient>,
}

impl OutgoingTransfer {
    pub fn new(
        id: TransferId,
        target: TargetSelector,
        files: Vec<OutgoingFile>,
        previous_transfer_id: Option<TransferId>,
        config: &Config,
    ) -> Result<Self> {
        if files.is_empty() {
            return Err(Error::InvalidMessage("보낼 파일 없음".into()));
        }

        let files = files
            .into_iter()
            .enumerate()
            .map(|(i, file)| {
                let layout = ChunkLayout::new(
                    file.source.len(),
                    config.big_chunk_size,
                    config.small_chunk_size,
                );
                OutgoingFileState {
                    info: FileInfo {
                        file_id: i as FileId,
                        name: file.name,
                        size: file.source.len(),
                        chunk_count: layout.chunk_count(),
                    },
                    source: file.source,
                    cache: ChunkCache::new(layout),
                }
            })
            .collect();

        Ok(Self {
            id,
            target,
            notification_id: None,
            previous_transfer_id,
            files,
            recipients: BTreeMap::new(),
        })
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn target(&self) -> &TargetSelector {
        &self.target
    }

    pub fn notification_id(&self) -> Option<NotificationId> {
        self.notification_id
    }

    pub fn set_notification_id(&mut self, notification_id: NotificationId) {
        self.notification_id = Some(notification_id);
    }

    pub fn file_infos(&self) -> Vec<FileInfo> {
        self.files.iter().map(|f| f.info.clone()).collect()
    }

    pub fn recipient(&self, device: DeviceId) -> Option<&Recipient> {
        self.recipients.get(&device)
    }

    pub fn recipients(&self) -> impl Iterator<Item = &Recipient> {
        self.recipients.values()
    }

    /// 전송 요청 메시지
    pub fn request(&self) -> RequestMessage {
        RequestMessage {
            transfer_id: self.id,
            target: self.target,
            files: self.file_infos(),
            previous_transfer_id: self.previous_transfer_id,
            notification_id: self.notification_id,
        }
    }

    /// 수신자 추가 (이미 있으면 false)
    pub fn add_recipient(&mut self, device: DeviceId) -> bool {
        if self.recipients.contains_key(&device) {
            return false;
        }
        self.recipients.insert(
            device,
            Recipient {
                device,
                state: RecipientState::Requesting,
                files_sent: 0,
                request_sent: false,
            },
        );
        true
    }

    /// request 전송 (requesting 상태에서만)
    pub fn send_request(&mut self, device: DeviceId, ctx: &mut TransferCtx<'_>) -> Result<()> {
        let request = Envelope::Request(self.request());
        let recipient = self
            .recipients
            .get_mut(&device)
            .ok_or(Error::Unauthorized {
                device,
                transfer_id: self.id,
            })?;
        if recipient.state != RecipientState::Requesting {
            return Ok(());
        }

        ctx.out.send(device, request)?;
        recipient.request_sent = true;
        debug!("request 전송: transfer={}, device={}", self.id, device);
        Ok(())
    }

    fn transition(&mut self, device: DeviceId, next: RecipientState, ctx: &TransferCtx<'_>) -> bool {
        let Some(recipient) = self.recipients.get_mut(&device) else {
            return false;
        };
        if !recipient.state.can_move_to(next) {
            debug!(
                "상태 전이 무시: transfer={}, device={}, {:?} -> {:?}",
                self.id, device, recipient.state, next
            );
            return false;
        }

        info!(
            "수신자 상태: transfer={}, device={}, {:?} -> {:?}",
            self.id, device, recipient.state, next
        );
        recipient.state = next;
        ctx.progress.emit(ProgressEvent::RecipientChanged {
            transfer_id: self.id,
            device,
            state: next,
        });
        if next.is_terminal() {
            self.evict_finished();
        }
        true
    }

    /// accept 수신: sending으로 전이하고 첫 파일 전송
    pub async fn on_accept(&mut self, device: DeviceId, ctx: &mut TransferCtx<'_>) -> Result<()> {
        if !self.transition(device, RecipientState::Sending, ctx) {
            return Ok(());
        }
        let file_index = self.recipients.get(&device).map_or(0, |r| r.files_sent);
        self.send_or_fail(device, file_index, ctx).await;
        Ok(())
    }

    pub fn on_reject(&mut self, device: DeviceId, ctx: &mut TransferCtx<'_>) {
        self.transition(device, RecipientState::Rejected, ctx);
    }

    async fn send_or_fail(&mut self, device: DeviceId, file_index: usize, ctx: &mut TransferCtx<'_>) {
        if let Err(e) = self.send_chunked(device, file_index, ctx).await {
            self.on_send_error(device, &e, ctx);
        }
    }

    /// 송신 실패 처리
    ///
    /// 링크가 끊긴 경우는 마지막으로 확인된 상태를 유지한다 (peer gone으로 보고됨).
    /// 그 밖의 에러는 수신자를 failed로 만든다.
    pub fn on_send_error(&mut self, device: DeviceId, error: &Error, ctx: &mut TransferCtx<'_>) {
        if error.is_transport() {
            warn!(
                "링크 끊김, 상태 유지: transfer={}, device={}, {}",
                self.id, device, error
            );
            return;
        }
        warn!(
            "송신 실패: transfer={}, device={}, {}",
            self.id, device, error
        );
        self.fail(device, ctx);
    }

    /// 파일 하나의 모든 청크를 순서대로 전송
    pub async fn send_chunked(
        &mut self,
        device: DeviceId,
        file_index: usize,
        ctx: &mut TransferCtx<'_>,
    ) -> Result<()> {
        let transfer_id = self.id;
        let file = self.files.get_mut(file_index).ok_or(Error::FileNotFound {
            transfer_id,
            file_id: file_index as FileId,
        })?;

        let count = file.info.chunk_count;
        for index in 0..count {
            let bytes = file.cache.get(&file.source, index).await?;
            let size = bytes.len();
            ctx.out.send(
                device,
                Envelope::Chunk(ChunkMessage {
                    transfer_id,
                    file_id: file.info.file_id,
                    chunk_index: index,
                    crc32: crc32fast::hash(&bytes),
                    bytes,
                    last: index + 1 == count,
                }),
            )?;
            ctx.stats.record_sent(size, false);
        }

        debug!(
            "파일 전송: transfer={}, device={}, file={} ({} chunks)",
            transfer_id, device, file.info.file_id, count
        );
        ctx.progress.emit(ProgressEvent::FileSent {
            transfer_id,
            device,
            file_id: file.info.file_id,
            chunks: count,
        });
        Ok(())
    }

    /// 누락된 청크만 캐시에서 재전송 (마지막에 last 표시)
    async fn retransmit(
        &mut self,
        device: DeviceId,
        file_index: usize,
        missing: &[ChunkIndex],
        ctx: &mut TransferCtx<'_>,
    ) -> Result<()> {
        let transfer_id = self.id;
        let file = self.files.get_mut(file_index).ok_or(Error::FileNotFound {
            transfer_id,
            file_id: file_index as FileId,
        })?;

        let count = file.info.chunk_count;
        let valid: Vec<ChunkIndex> = missing.iter().copied().filter(|i| *i < count).collect();
        if valid.len() != missing.len() {
            warn!(
                "범위 밖 누락 인덱스 무시: transfer={}, file={}",
                transfer_id, file.info.file_id
            );
        }
        if valid.is_empty() {
            return Ok(());
        }

        info!(
            "재전송: transfer={}, device={}, file={}, {} chunks",
            transfer_id,
            device,
            file.info.file_id,
            valid.len()
        );

        for (n, &index) in valid.iter().enumerate() {
            let bytes = file.cache.get(&file.source, index).await?;
            let size = bytes.len();
            ctx.out.send(
                device,
                Envelope::Chunk(ChunkMessage {
                    transfer_id,
                    file_id: file.info.file_id,
                    chunk_index: index,
                    crc32: crc32fast::hash(&bytes),
                    bytes,
                    last: n + 1 == valid.len(),
                }),
            )?;
            ctx.stats.record_sent(size, true);
        }

        ctx.progress.emit(ProgressEvent::Retransmitting {
            transfer_id,
            device,
            file_id: file.info.file_id,
            chunks: valid.len(),
        });
        Ok(())
    }

    /// file-finish 수신
    ///
    /// 누락 목록이 있으면 재전송, 없으면 다음 파일로 진행
    pub async fn on_file_finish(
        &mut self,
        device: DeviceId,
        file_id: FileId,
        missing: Option<Vec<ChunkIndex>>,
        ctx: &mut TransferCtx<'_>,
    ) -> Result<()> {
        let Some(recipient) = self.recipients.get_mut(&device) else {
            return Ok(());
        };
        if recipient.state != RecipientState::Sending {
            debug!(
                "sending 상태가 아닌 수신자의 file-finish 무시: transfer={}, device={}",
                self.id, device
            );
            return Ok(());
        }

        let current = recipient.files_sent;
        let current_id = self.files.get(current).map(|f| f.info.file_id);
        if current_id != Some(file_id) {
            debug!(
                "지난 파일의 file-finish 무시: transfer={}, device={}, file={}",
                self.id, device, file_id
            );
            return Ok(());
        }

        match missing {
            Some(missing) => {
                ctx.stats.missing_reports += 1;
                if let Err(e) = self.retransmit(device, current, &missing, ctx).await {
                    self.on_send_error(device, &e, ctx);
                }
            }
            None => {
                recipient.files_sent += 1;
                let next = recipient.files_sent;
                ctx.stats.files_sent += 1;
                self.evict_finished();
                if next < self.files.len() {
                    self.send_or_fail(device, next, ctx).await;
                }
            }
        }
        Ok(())
    }

    /// transfer-finish 수신: 모든 파일을 보낸 수신자만 sent
    pub fn on_transfer_finish(&mut self, device: DeviceId, ctx: &mut TransferCtx<'_>) {
        let all_sent = self
            .recipients
            .get(&device)
            .is_some_and(|r| r.files_sent >= self.files.len());
        if !all_sent {
            warn!(
                "파일이 남은 수신자의 transfer-finish: transfer={}, device={}",
                self.id, device
            );
            return;
        }
        self.transition(device, RecipientState::Sent, ctx);
    }

    pub fn fail(&mut self, device: DeviceId, ctx: &mut TransferCtx<'_>) {
        if self.transition(device, RecipientState::Failed, ctx) {
            ctx.out.clear_queue(device);
        }
    }

    /// 종료되지 않은 모든 수신자 취소
    pub fn cancel(&mut self, ctx: &mut TransferCtx<'_>) {
        let active: Vec<DeviceId> = self
            .recipients
            .values()
            .filter(|r| !r.state.is_terminal())
            .map(|r| r.device)
            .collect();
        for device in active {
            self.transition(device, RecipientState::Canceled, ctx);
            ctx.out.clear_queue(device);
        }
    }

    /// 모든 수신자가 종료 상태인지
    ///
    /// 게스트 링크 전송은 취소될 때까지 남는다.
    pub fn is_done(&self) -> bool {
        !self.target.is_guest()
            && !self.recipients.is_empty()
            && self.recipients.values().all(|r| r.state.is_terminal())
    }

    /// UI 표시용 요약 상태
    pub fn summary_state(&self) -> SendState {
        SendState::summarize(self.recipients.values().map(|r| r.state))
    }

    /// 보내는 중인 수신자가 모두 지나간 파일의 캐시 해제
    ///
    /// 늦게 합류한 수신자가 캐시를 다시 채울 수 있으므로 매번 다시 확인한다.
    fn evict_finished(&mut self) {
        for (index, file) in self.files.iter_mut().enumerate() {
            if file.cache.cached_big_chunks() == 0 {
                continue;
            }
            let still_needed = self
                .recipients
                .values()
                .any(|r| r.state == RecipientState::Sending && r.files_sent <= index);
            if !still_needed {
                debug!("캐시 해제: transfer={}, file={}", self.id, file.info.file_id);
                file.cache.release();
            }
        }
    }

    #[cfg(test)]
    fn cached_big_chunks(&self, file_index: usize) -> usize {
        self.files[file_index].cache.cached_big_chunks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::TestOutbox;
    use crate::progress::Progress;
    use crate::stats::TransferStats;

    fn transfer(files: Vec<OutgoingFile>) -> OutgoingTransfer {
        OutgoingTransfer::new(7, TargetSelector::Device(2), files, None, &Config::testing()).unwrap()
    }

    fn chunk_ids(outbox: &TestOutbox) -> Vec<(FileId, ChunkIndex, bool)> {
        outbox
            .sent
            .iter()
            .filter_map(|(_, envelope)| match envelope {
                Envelope::Chunk(c) => Some((c.file_id, c.chunk_index, c.last)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_forward_only_transitions() {
        use RecipientState::*;
        assert!(Requesting.can_move_to(Sending));
        assert!(Sending.can_move_to(Sent));
        assert!(!Requesting.can_move_to(Sent));
        assert!(!Sent.can_move_to(Canceled));
        assert!(!Rejected.can_move_to(Sending));
        assert!(!Sending.can_move_to(Requesting));
    }

    #[test]
    fn test_request_describes_files() {
        let t = transfer(vec![
            OutgoingFile::from_bytes("a.txt", vec![1u8; 10]),
            OutgoingFile::from_bytes("empty", Vec::new()),
        ]);
        let request = t.request();
        assert_eq!(request.files.len(), 2);
        assert_eq!(request.files[0].chunk_count, 3);
        assert_eq!(request.files[1].chunk_count, 1);
        assert_eq!(request.files[1].file_id, 1);
        assert!(Envelope::Request(request).validate().is_ok());
    }

    #[tokio::test]
    async fn test_files_sent_one_at_a_time() {
        let mut t = transfer(vec![
            OutgoingFile::from_bytes("a", vec![1u8; 10]),
            OutgoingFile::from_bytes("b", vec![2u8; 5]),
        ]);
        let mut outbox = TestOutbox::default();
        let mut stats = TransferStats::new();
        let progress = Progress::new(16);
        let mut ctx = TransferCtx::new(&mut outbox, &mut stats, &progress);

        t.add_recipient(2);
        t.send_request(2, &mut ctx).unwrap();
        t.on_accept(2, &mut ctx).await.unwrap();
        assert_eq!(t.recipient(2).unwrap().state, RecipientState::Sending);

        // 빈 누락 보고 전에는 다음 파일을 보내지 않음
        t.on_file_finish(2, 0, Some(vec![1]), &mut ctx).await.unwrap();
        t.on_file_finish(2, 0, None, &mut ctx).await.unwrap();
        t.on_file_finish(2, 1, None, &mut ctx).await.unwrap();
        t.on_transfer_finish(2, &mut ctx);
        assert_eq!(t.recipient(2).unwrap().state, RecipientState::Sent);
        assert!(t.is_done());
        drop(ctx);

        assert_eq!(
            chunk_ids(&outbox),
            vec![
                (0, 0, false),
                (0, 1, false),
                (0, 2, true),
                (0, 1, true),
                (1, 0, false),
                (1, 1, true),
            ]
        );
        assert_eq!(stats.chunks_retransmitted, 1);
        assert_eq!(stats.files_sent, 2);
    }

    #[tokio::test]
    async fn test_cancel_is_terminal() {
        let mut t = transfer(vec![OutgoingFile::from_bytes("a", vec![1u8; 10])]);
        let mut outbox = TestOutbox::default();
        let mut stats = TransferStats::new();
        let progress = Progress::new(16);
        let mut ctx = TransferCtx::new(&mut outbox, &mut stats, &progress);

        t.add_recipient(2);
        t.add_recipient(3);
        t.on_reject(3, &mut ctx);
        t.cancel(&mut ctx);
        assert_eq!(t.recipient(2).unwrap().state, RecipientState::Canceled);
        assert_eq!(t.recipient(3).unwrap().state, RecipientState::Rejected);

        // 취소 후 accept는 무시
        t.on_accept(2, &mut ctx).await.unwrap();
        assert_eq!(t.recipient(2).unwrap().state, RecipientState::Canceled);
        assert!(t.is_done());
        drop(ctx);
        assert_eq!(outbox.cleared, vec![2]);
    }

    #[tokio::test]
    async fn test_cache_released_after_file() {
        let mut t = transfer(vec![OutgoingFile::from_bytes("a", vec![1u8; 10])]);
        let mut outbox = TestOutbox::default();
        let mut stats = TransferStats::new();
        let progress = Progress::new(16);
        let mut ctx = TransferCtx::new(&mut outbox, &mut stats, &progress);

        t.add_recipient(2);
        t.on_accept(2, &mut ctx).await.unwrap();
        assert_eq!(t.cached_big_chunks(0), 1);

        t.on_file_finish(2, 0, None, &mut ctx).await.unwrap();
        assert_eq!(t.cached_big_chunks(0), 0);
    }

    #[tokio::test]
    async fn test_cache_released_again_for_late_recipient() {
        let mut t = transfer(vec![OutgoingFile::from_bytes("a", vec![1u8; 10])]);
        let mut outbox = TestOutbox::default();
        let mut stats = TransferStats::new();
        let progress = Progress::new(16);
        let mut ctx = TransferCtx::new(&mut outbox, &mut stats, &progress);

        t.add_recipient(2);
        t.on_accept(2, &mut ctx).await.unwrap();
        t.on_file_finish(2, 0, None, &mut ctx).await.unwrap();
        assert_eq!(t.cached_big_chunks(0), 0);

        // ready로 늦게 합류한 수신자가 캐시를 다시 채움
        t.add_recipient(3);
        t.on_accept(3, &mut ctx).await.unwrap();
        assert_eq!(t.cached_big_chunks(0), 1);
        t.on_file_finish(3, 0, None, &mut ctx).await.unwrap();
        assert_eq!(t.cached_big_chunks(0), 0);

        // 도중에 실패한 수신자도 캐시를 붙잡지 않음
        t.add_recipient(4);
        t.on_accept(4, &mut ctx).await.unwrap();
        assert_eq!(t.cached_big_chunks(0), 1);
        t.fail(4, &mut ctx);
        assert_eq!(t.cached_big_chunks(0), 0);
    }

    /// 청크 전송에서 링크가 끊기는 outbox
    #[derive(Default)]
    struct BrokenLinkOutbox {
        requests: usize,
        cleared: Vec<DeviceId>,
    }

    impl crate::registry::Outbox for BrokenLinkOutbox {
        fn send(&mut self, to: DeviceId, envelope: Envelope) -> Result<()> {
            match envelope {
                Envelope::Request(_) => {
                    self.requests += 1;
                    Ok(())
                }
                _ => Err(Error::transport(to, "relay down")),
            }
        }

        fn clear_queue(&mut self, to: DeviceId) {
            self.cleared.push(to);
        }
    }

    #[tokio::test]
    async fn test_link_loss_keeps_recipient_state() {
        let mut t = transfer(vec![OutgoingFile::from_bytes("a", vec![1u8; 10])]);
        let mut outbox = BrokenLinkOutbox::default();
        let mut stats = TransferStats::new();
        let progress = Progress::new(16);
        let mut ctx = TransferCtx::new(&mut outbox, &mut stats, &progress);

        t.add_recipient(2);
        t.send_request(2, &mut ctx).unwrap();
        t.on_accept(2, &mut ctx).await.unwrap();
        assert_eq!(t.recipient(2).unwrap().state, RecipientState::Sending);

        t.on_file_finish(2, 0, Some(vec![0, 1]), &mut ctx).await.unwrap();
        assert_eq!(t.recipient(2).unwrap().state, RecipientState::Sending);
        assert!(!t.is_done());

        // 링크와 무관한 에러는 failed
        t.on_send_error(2, &Error::TransferNotFound(7), &mut ctx);
        assert_eq!(t.recipient(2).unwrap().state, RecipientState::Failed);
        drop(ctx);
        assert_eq!(outbox.requests, 1);
        assert_eq!(outbox.cleared, vec![2]);
    }
}
