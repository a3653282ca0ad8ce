//! 프로토콜 메시지 정의
//!
//! 모든 메시지는 닫힌 enum(`Envelope`) 하나로 표현되고
//! 필드를 읽기 전에 경계에서 검증된다.
//!
//! 와이어 프레임: 첫 바이트 = 암호화 플래그 (0 평문 / 1 암호문)
//! 나머지 = 직렬화된 envelope 또는 nonce‖ciphertext(envelope)

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::crypto::KeyAnnouncement;
use crate::directory::{FileId, NotificationId, TargetSelector, TransferId};
use crate::{Error, Result};

/// 청크 인덱스 (파일 내 SmallChunk 식별자)
pub type ChunkIndex = u32;

/// 프로토콜 에러 응답 본문
pub const UNAUTHORIZED: &str = "unauthorized";

/// 프레임 암호화 플래그
pub const FLAG_PLAINTEXT: u8 = 0;
pub const FLAG_ENCRYPTED: u8 = 1;

/// 메시지 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    KeyAnnouncement = 1,
    Request = 2,
    Accept = 3,
    Reject = 4,
    Chunk = 5,
    FileFinish = 6,
    TransferFinish = 7,
    Ready = 8,
    Error = 9,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::KeyAnnouncement => "key-announcement",
            MessageType::Request => "request",
            MessageType::Accept => "accept",
            MessageType::Reject => "reject",
            MessageType::Chunk => "chunk",
            MessageType::FileFinish => "file-finish",
            MessageType::TransferFinish => "transfer-finish",
            MessageType::Ready => "ready",
            MessageType::Error => "error",
        };
        f.write_str(name)
    }
}

/// 요청에 실리는 파일 정보
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_id: FileId,
    pub name: String,
    /// 전체 바이트 수
    pub size: u64,
    /// SmallChunk 수
    pub chunk_count: u32,
}

/// 전송 요청
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub transfer_id: TransferId,
    pub target: TargetSelector,
    pub files: Vec<FileInfo>,
    pub previous_transfer_id: Option<TransferId>,
    pub notification_id: Option<NotificationId>,
}

/// 데이터 청크
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMessage {
    pub transfer_id: TransferId,
    pub file_id: FileId,
    pub chunk_index: ChunkIndex,
    pub bytes: Bytes,
    /// CRC32 체크섬
    pub crc32: u32,
    /// 이번 전송 묶음의 마지막 청크
    pub last: bool,
}

impl ChunkMessage {
    /// CRC 검증
    pub fn verify_crc(&self) -> bool {
        crc32fast::hash(&self.bytes) == self.crc32
    }
}

/// 통합 메시지 enum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    KeyAnnouncement(KeyAnnouncement),
    Request(RequestMessage),
    Accept {
        transfer_id: TransferId,
        guest: bool,
    },
    Reject {
        transfer_id: TransferId,
    },
    Chunk(ChunkMessage),
    FileFinish {
        transfer_id: TransferId,
        file_id: FileId,
        /// None이면 누락 없음
        missing: Option<Vec<ChunkIndex>>,
    },
    TransferFinish {
        transfer_id: TransferId,
    },
    Ready {
        transfer_id: TransferId,
        notification_id: NotificationId,
    },
    Error {
        transfer_id: TransferId,
        message: String,
    },
}

impl Envelope {
    /// 메시지 타입 반환
    pub fn msg_type(&self) -> MessageType {
        match self {
            Envelope::KeyAnnouncement(_) => MessageType::KeyAnnouncement,
            Envelope::Request(_) => MessageType::Request,
            Envelope::Accept { .. } => MessageType::Accept,
            Envelope::Reject { .. } => MessageType::Reject,
            Envelope::Chunk(_) => MessageType::Chunk,
            Envelope::FileFinish { .. } => MessageType::FileFinish,
            Envelope::TransferFinish { .. } => MessageType::TransferFinish,
            Envelope::Ready { .. } => MessageType::Ready,
            Envelope::Error { .. } => MessageType::Error,
        }
    }

    /// 키 공지를 제외한 모든 메시지는 transfer_id를 가진다
    pub fn transfer_id(&self) -> Option<TransferId> {
        match self {
            Envelope::KeyAnnouncement(_) => None,
            Envelope::Request(request) => Some(request.transfer_id),
            Envelope::Chunk(chunk) => Some(chunk.transfer_id),
            Envelope::Accept { transfer_id, .. }
            | Envelope::Reject { transfer_id }
            | Envelope::FileFinish { transfer_id, .. }
            | Envelope::TransferFinish { transfer_id }
            | Envelope::Ready { transfer_id, .. }
            | Envelope::Error { transfer_id, .. } => Some(*transfer_id),
        }
    }

    /// 인증되지 않은 메시지에 대한 에러 응답
    pub fn unauthorized(transfer_id: TransferId) -> Self {
        Envelope::Error {
            transfer_id,
            message: UNAUTHORIZED.to_string(),
        }
    }

    /// 구조 검증
    pub fn validate(&self) -> Result<()> {
        match self {
            Envelope::Request(request) => {
                if request.files.is_empty() {
                    return Err(Error::InvalidMessage("파일 없는 요청".into()));
                }
                let mut ids: Vec<FileId> = request.files.iter().map(|f| f.file_id).collect();
                ids.sort_unstable();
                ids.dedup();
                if ids.len() != request.files.len() {
                    return Err(Error::InvalidMessage("중복된 file_id".into()));
                }
                if request.files.iter().any(|f| f.chunk_count == 0) {
                    return Err(Error::InvalidMessage("chunk_count는 1 이상이어야 함".into()));
                }
            }
            Envelope::FileFinish {
                missing: Some(missing),
                ..
            } if missing.is_empty() => {
                return Err(Error::InvalidMessage("빈 missing 목록은 생략해야 함".into()));
            }
            _ => {}
        }
        Ok(())
    }

    /// envelope 직렬화
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// envelope 역직렬화 + 검증
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope = bincode::deserialize(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }
}

/// 와이어 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// 평문 envelope 바이트
    Plain(Bytes),
    /// nonce‖ciphertext
    Encrypted(Bytes),
}

impl Frame {
    /// 프레임 인코딩 (플래그 1바이트 + 본문)
    pub fn encode(&self) -> Bytes {
        let (flag, body) = match self {
            Frame::Plain(body) => (FLAG_PLAINTEXT, body),
            Frame::Encrypted(body) => (FLAG_ENCRYPTED, body),
        };
        let mut buf = BytesMut::with_capacity(1 + body.len());
        buf.put_u8(flag);
        buf.extend_from_slice(body);
        buf.freeze()
    }

    /// 프레임 디코딩
    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidFrame("빈 프레임".into()));
        }
        let flag = bytes[0];
        let body = bytes.split_off(1);
        match flag {
            FLAG_PLAINTEXT => Ok(Frame::Plain(body)),
            FLAG_ENCRYPTED => Ok(Frame::Encrypted(body)),
            other => Err(Error::InvalidFrame(format!("알 수 없는 플래그: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyEpoch;

    fn sample_request() -> RequestMessage {
        RequestMessage {
            transfer_id: 7,
            target: TargetSelector::Group(3),
            files: vec![
                FileInfo {
                    file_id: 0,
                    name: "a.txt".into(),
                    size: 10,
                    chunk_count: 3,
                },
                FileInfo {
                    file_id: 1,
                    name: "b.bin".into(),
                    size: 0,
                    chunk_count: 1,
                },
            ],
            previous_transfer_id: None,
            notification_id: Some(99),
        }
    }

    #[test]
    fn test_envelope_serialization() {
        let envelope = Envelope::Request(sample_request());
        let bytes = envelope.to_bytes().unwrap();
        let restored = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(envelope, restored);
        assert_eq!(restored.msg_type(), MessageType::Request);
        assert_eq!(restored.transfer_id(), Some(7));
    }

    #[test]
    fn test_key_announcement_has_no_transfer() {
        let envelope = Envelope::KeyAnnouncement(KeyAnnouncement {
            public_key: [1u8; 32],
            epoch: KeyEpoch::One,
            initiator: true,
        });
        assert_eq!(envelope.transfer_id(), None);
        assert_eq!(envelope.msg_type().to_string(), "key-announcement");
    }

    #[test]
    fn test_validation_rejects_malformed() {
        let mut request = sample_request();
        request.files[1].file_id = 0;
        assert!(Envelope::Request(request).validate().is_err());

        let mut request = sample_request();
        request.files.clear();
        assert!(Envelope::Request(request).validate().is_err());

        let finish = Envelope::FileFinish {
            transfer_id: 1,
            file_id: 0,
            missing: Some(vec![]),
        };
        let bytes = finish.to_bytes().unwrap();
        assert!(matches!(
            Envelope::from_bytes(&bytes),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Envelope::from_bytes(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]).is_err());
    }

    #[test]
    fn test_frame_flags() {
        let frame = Frame::Encrypted(Bytes::from_static(b"cipher"));
        let encoded = frame.encode();
        assert_eq!(encoded[0], FLAG_ENCRYPTED);
        assert_eq!(Frame::decode(encoded).unwrap(), frame);

        let plain = Frame::Plain(Bytes::from_static(b"plain")).encode();
        assert_eq!(plain[0], FLAG_PLAINTEXT);

        assert!(Frame::decode(Bytes::new()).is_err());
        assert!(Frame::decode(Bytes::from_static(&[7, 1, 2])).is_err());
    }

    #[test]
    fn test_chunk_crc() {
        let bytes = Bytes::from_static(b"abcd");
        let mut chunk = ChunkMessage {
            transfer_id: 1,
            file_id: 0,
            chunk_index: 0,
            crc32: crc32fast::hash(&bytes),
            bytes,
            last: true,
        };
        assert!(chunk.verify_crc());
        chunk.bytes = Bytes::from_static(b"abce");
        assert!(!chunk.verify_crc());
    }
}
