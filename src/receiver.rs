//! 수신 측 전송 상태기계
//!
//! infos → receiving → received (거절하면 폐기)
//! - 청크는 희소 저장, 같은 인덱스는 덮어씀
//! - last 청크에서 누락 목록 계산 후 file-finish
//! - 모든 파일이 완성되면 transfer-finish

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::chunk::ChunkAssembly;
use crate::directory::{DeviceId, FileId, TransferId};
use crate::manager::TransferCtx;
use crate::message::{ChunkMessage, Envelope, RequestMessage};
use crate::progress::ProgressEvent;
use crate::registry::Outbox;
use crate::{Error, Result};

/// 수신 전송 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingState {
    /// 요청만 받음, 결정 대기
    Infos,
    Receiving,
    Received,
}

/// 완성된 수신 파일
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub transfer_id: TransferId,
    pub from: DeviceId,
    pub file_id: FileId,
    pub name: String,
    pub bytes: Bytes,
}

/// 수신 전송
pub struct IncomingTransfer {
    id: TransferId,
    from: DeviceId,
    state: IncomingState,
    files: Vec<ChunkAssembly>,
    /// file-finish(누락 없음)를 보낸 파일
    finished: Vec<bool>,
}

impl IncomingTransfer {
    pub fn new(from: DeviceId, request: &RequestMessage) -> Self {
        let files = request
            .files
            .iter()
            .map(|f| ChunkAssembly::new(f.file_id, f.name.clone(), f.chunk_count))
            .collect();
        Self {
            id: request.transfer_id,
            from,
            state: IncomingState::Infos,
            finished: vec![false; request.files.len()],
            files,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn from(&self) -> DeviceId {
        self.from
    }

    pub fn state(&self) -> IncomingState {
        self.state
    }

    /// 수락: accept 전송 후 receiving
    pub fn accept(&mut self, out: &mut dyn Outbox) -> Result<()> {
        if self.state != IncomingState::Infos {
            return Ok(());
        }
        out.send(
            self.from,
            Envelope::Accept {
                transfer_id: self.id,
                guest: false,
            },
        )?;
        self.state = IncomingState::Receiving;
        info!("수신 수락: transfer={}, from={}", self.id, self.from);
        Ok(())
    }

    /// 거절: reject 전송 (호출자가 인스턴스를 버림)
    pub fn reject(&mut self, out: &mut dyn Outbox) -> Result<()> {
        info!("수신 거절: transfer={}, from={}", self.id, self.from);
        out.send(
            self.from,
            Envelope::Reject {
                transfer_id: self.id,
            },
        )
    }

    /// 청크 수신
    ///
    /// 전송이 완성되면 파일 목록을 돌려준다.
    pub fn on_chunk(
        &mut self,
        chunk: ChunkMessage,
        ctx: &mut TransferCtx<'_>,
    ) -> Result<Option<Vec<ReceivedFile>>> {
        if self.state != IncomingState::Receiving {
            debug!(
                "receiving 상태가 아닌 전송의 청크 무시: transfer={}, state={:?}",
                self.id, self.state
            );
            return Ok(None);
        }

        let position = self
            .files
            .iter()
            .position(|f| f.file_id == chunk.file_id)
            .ok_or(Error::FileNotFound {
                transfer_id: self.id,
                file_id: chunk.file_id,
            })?;
        let assembly = &mut self.files[position];

        if !chunk.verify_crc() {
            warn!(
                "CRC 불일치: transfer={}, file={}, chunk={}",
                self.id, chunk.file_id, chunk.chunk_index
            );
            ctx.stats.crc_failures += 1;
        } else {
            let before = assembly.received_count();
            let size = chunk.bytes.len();
            if assembly.insert(chunk.chunk_index, chunk.bytes) {
                ctx.stats
                    .record_received(size, assembly.received_count() == before);
            } else {
                warn!(
                    "범위 밖 청크: transfer={}, file={}, chunk={}",
                    self.id, chunk.file_id, chunk.chunk_index
                );
            }
        }

        if !chunk.last {
            return Ok(None);
        }

        let missing = assembly.missing();
        if !missing.is_empty() {
            debug!(
                "누락 보고: transfer={}, file={}, {} chunks",
                self.id,
                chunk.file_id,
                missing.len()
            );
            ctx.out.send(
                self.from,
                Envelope::FileFinish {
                    transfer_id: self.id,
                    file_id: chunk.file_id,
                    missing: Some(missing),
                },
            )?;
            return Ok(None);
        }

        ctx.out.send(
            self.from,
            Envelope::FileFinish {
                transfer_id: self.id,
                file_id: chunk.file_id,
                missing: None,
            },
        )?;

        if !self.finished[position] {
            self.finished[position] = true;
            ctx.stats.files_received += 1;
            ctx.progress.emit(ProgressEvent::FileReceived {
                transfer_id: self.id,
                from: self.from,
                file_id: chunk.file_id,
                name: self.files[position].name.clone(),
            });
        }

        if !self.files.iter().all(|f| f.is_complete()) {
            return Ok(None);
        }

        ctx.out.send(
            self.from,
            Envelope::TransferFinish {
                transfer_id: self.id,
            },
        )?;
        self.state = IncomingState::Received;
        ctx.stats.transfers_received += 1;
        ctx.progress.emit(ProgressEvent::TransferReceived {
            transfer_id: self.id,
            from: self.from,
        });
        info!("수신 완료: transfer={}, from={}", self.id, self.from);

        Ok(Some(self.materialize()))
    }

    fn materialize(&self) -> Vec<ReceivedFile> {
        self.files
            .iter()
            .filter_map(|f| {
                f.assemble().map(|bytes| ReceivedFile {
                    transfer_id: self.id,
                    from: self.from,
                    file_id: f.file_id,
                    name: f.name.clone(),
                    bytes,
                })
            })
            .collect()
    }
}
