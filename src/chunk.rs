//! 청크 정의
//!
//! - BigChunk: 파일을 읽는 단위 (기본 16MB), 필요할 때만 읽음
//! - SmallChunk: 와이어 전송 단위 (기본 16KB), 처음 보낼 때 분할 후 캐시
//!
//! SmallChunk 식별자 = big_index * small_per_big + small_index
//! 마지막 BigChunk를 제외하면 모두 꽉 차 있으므로 식별자는 0..chunk_count로 연속이다.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::directory::FileId;
use crate::message::ChunkIndex;
use crate::{Error, Result};

/// 파일 원본
#[derive(Debug, Clone)]
pub enum FileSource {
    /// 메모리에 있는 데이터
    Memory(Bytes),
    /// 디스크 파일 (길이는 생성 시 확정)
    Disk { path: PathBuf, len: u64 },
}

impl FileSource {
    /// 디스크 파일에서 생성
    pub async fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let len = tokio::fs::metadata(&path).await?.len();
        Ok(FileSource::Disk { path, len })
    }

    pub fn len(&self) -> u64 {
        match self {
            FileSource::Memory(data) => data.len() as u64,
            FileSource::Disk { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 지정 구간 읽기
    async fn read_range(&self, offset: u64, len: usize) -> Result<Bytes> {
        match self {
            FileSource::Memory(data) => {
                let start = offset as usize;
                Ok(data.slice(start..start + len))
            }
            FileSource::Disk { path, .. } => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                let mut buf = BytesMut::zeroed(len);
                file.read_exact(&mut buf).await?;
                Ok(buf.freeze())
            }
        }
    }
}

/// 보낼 파일
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub source: FileSource,
}

impl OutgoingFile {
    pub fn new(name: impl Into<String>, source: FileSource) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }

    /// 메모리 데이터로 생성
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::new(name, FileSource::Memory(data.into()))
    }
}

/// 파일의 2단계 청크 배치
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub file_len: u64,
    pub big_size: usize,
    pub small_size: usize,
}

impl ChunkLayout {
    pub fn new(file_len: u64, big_size: usize, small_size: usize) -> Self {
        Self {
            file_len,
            big_size,
            small_size,
        }
    }

    /// BigChunk당 SmallChunk 수
    pub fn small_per_big(&self) -> u32 {
        ((self.big_size + self.small_size - 1) / self.small_size) as u32
    }

    /// BigChunk 수 (빈 파일도 1개)
    pub fn big_count(&self) -> u32 {
        let count = (self.file_len + self.big_size as u64 - 1) / self.big_size as u64;
        count.max(1) as u32
    }

    /// 특정 BigChunk의 길이
    pub fn big_len(&self, big_index: u32) -> usize {
        let start = big_index as u64 * self.big_size as u64;
        let end = (start + self.big_size as u64).min(self.file_len);
        end.saturating_sub(start) as usize
    }

    /// 특정 BigChunk 안의 SmallChunk 수 (빈 BigChunk도 1개)
    pub fn small_count_in(&self, big_index: u32) -> u32 {
        let len = self.big_len(big_index);
        (((len + self.small_size - 1) / self.small_size) as u32).max(1)
    }

    /// 전체 SmallChunk 수
    pub fn chunk_count(&self) -> u32 {
        let last = self.big_count() - 1;
        last * self.small_per_big() + self.small_count_in(last)
    }

    /// 식별자 → (big_index, small_index)
    pub fn locate(&self, index: ChunkIndex) -> Option<(u32, u32)> {
        if index >= self.chunk_count() {
            return None;
        }
        let per_big = self.small_per_big();
        Some((index / per_big, index % per_big))
    }

    /// (big_index, small_index) → 식별자
    pub fn index_of(&self, big_index: u32, small_index: u32) -> ChunkIndex {
        big_index * self.small_per_big() + small_index
    }
}

/// 필요할 때 읽히는 BigChunk
#[derive(Debug, Clone)]
pub struct BigChunk {
    pub index: u32,
    pub offset: u64,
    pub len: usize,
}

impl BigChunk {
    /// 실제 바이트 읽기
    pub async fn materialize(&self, source: &FileSource) -> Result<Bytes> {
        source.read_range(self.offset, self.len).await
    }
}

/// 파일을 BigChunk로 나눔 (읽지 않음)
pub fn chunk_big(layout: &ChunkLayout) -> Vec<BigChunk> {
    (0..layout.big_count())
        .map(|index| BigChunk {
            index,
            offset: index as u64 * layout.big_size as u64,
            len: layout.big_len(index),
        })
        .collect()
}

/// BigChunk 데이터를 SmallChunk로 나눔
pub fn chunk_small(data: &Bytes, small_size: usize) -> Vec<Bytes> {
    if data.is_empty() {
        return vec![Bytes::new()];
    }
    (0..data.len())
        .step_by(small_size)
        .map(|start| data.slice(start..(start + small_size).min(data.len())))
        .collect()
}

/// 송신 측 SmallChunk 캐시
///
/// BigChunk를 처음 보낼 때 한 번 분할하고, 재전송은 캐시에서만 한다.
#[derive(Debug)]
pub struct ChunkCache {
    layout: ChunkLayout,
    big_chunks: Vec<BigChunk>,
    small: HashMap<u32, Vec<Bytes>>,
}

impl ChunkCache {
    pub fn new(layout: ChunkLayout) -> Self {
        let big_chunks = chunk_big(&layout);
        Self {
            layout,
            big_chunks,
            small: HashMap::new(),
        }
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// SmallChunk 가져오기 (해당 BigChunk가 캐시에 없으면 읽어서 분할)
    pub async fn get(&mut self, source: &FileSource, index: ChunkIndex) -> Result<Bytes> {
        let (big, small) = self
            .layout
            .locate(index)
            .ok_or_else(|| Error::InvalidMessage(format!("청크 인덱스 범위 초과: {}", index)))?;

        if !self.small.contains_key(&big) {
            let data = self.big_chunks[big as usize].materialize(source).await?;
            self.small
                .insert(big, chunk_small(&data, self.layout.small_size));
        }

        self.small
            .get(&big)
            .and_then(|chunks| chunks.get(small as usize))
            .cloned()
            .ok_or_else(|| Error::InvalidMessage(format!("청크 없음: {}", index)))
    }

    /// 캐시된 BigChunk 수
    pub fn cached_big_chunks(&self) -> usize {
        self.small.len()
    }

    /// 캐시 해제 (다시 필요하면 원본에서 읽음)
    pub fn release(&mut self) {
        self.small.clear();
    }
}

/// 수신 측 파일 조립 (희소 저장)
#[derive(Debug)]
pub struct ChunkAssembly {
    pub file_id: FileId,
    pub name: String,
    pub expected: u32,
    received: BTreeMap<ChunkIndex, Bytes>,
}

impl ChunkAssembly {
    pub fn new(file_id: FileId, name: impl Into<String>, expected: u32) -> Self {
        Self {
            file_id,
            name: name.into(),
            expected,
            received: BTreeMap::new(),
        }
    }

    /// 청크 저장 (같은 인덱스는 덮어씀)
    ///
    /// 범위를 벗어나면 false
    pub fn insert(&mut self, index: ChunkIndex, data: Bytes) -> bool {
        if index >= self.expected {
            return false;
        }
        self.received.insert(index, data);
        true
    }

    pub fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    /// 누락된 청크 인덱스 목록
    pub fn missing(&self) -> Vec<ChunkIndex> {
        (0..self.expected)
            .filter(|index| !self.received.contains_key(index))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() as u32 == self.expected
    }

    /// 오름차순으로 이어붙여 원본 복원
    pub fn assemble(&self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        let total: usize = self.received.values().map(|chunk| chunk.len()).sum();
        let mut buf = BytesMut::with_capacity(total);
        for chunk in self.received.values() {
            buf.extend_from_slice(chunk);
        }
        Some(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_layout_counts() {
        let layout = ChunkLayout::new(40_000, 16_384, 4);
        assert_eq!(layout.big_count(), 3);
        assert_eq!(layout.small_per_big(), 4096);
        assert_eq!(layout.chunk_count(), 10_000);
        assert_eq!(layout.locate(5000), Some((1, 904)));
        assert_eq!(layout.index_of(1, 904), 5000);
        assert_eq!(layout.locate(10_000), None);

        let empty = ChunkLayout::new(0, 16_384, 4);
        assert_eq!(empty.big_count(), 1);
        assert_eq!(empty.chunk_count(), 1);
    }

    #[test]
    fn test_chunk_small_uneven() {
        let data = pattern(10);
        let chunks = chunk_small(&data, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 2);
        assert_eq!(chunk_small(&Bytes::new(), 4).len(), 1);
    }

    #[tokio::test]
    async fn test_reassembly_matches_original() {
        // (파일 길이, big, small) 조합
        let cases = [
            (1usize, 8usize, 3usize),
            (250, 100, 7),
            (1000, 64, 16),
            (4097, 1024, 1000),
            (40_000, 16_384, 4),
        ];

        for (len, big, small) in cases {
            let data = pattern(len);
            let source = FileSource::Memory(data.clone());
            let layout = ChunkLayout::new(len as u64, big, small);
            let mut cache = ChunkCache::new(layout);
            let mut assembly = ChunkAssembly::new(0, "f", layout.chunk_count());

            // 역순으로 넣어도 결과는 같아야 함
            for index in (0..layout.chunk_count()).rev() {
                let chunk = cache.get(&source, index).await.unwrap();
                assert!(assembly.insert(index, chunk));
            }

            assert!(assembly.missing().is_empty());
            assert_eq!(assembly.assemble().unwrap(), data, "len={} big={} small={}", len, big, small);
        }
    }

    #[tokio::test]
    async fn test_cache_materializes_lazily() {
        let data = pattern(300);
        let source = FileSource::Memory(data);
        let mut cache = ChunkCache::new(ChunkLayout::new(300, 100, 10));
        assert_eq!(cache.cached_big_chunks(), 0);

        cache.get(&source, 0).await.unwrap();
        cache.get(&source, 5).await.unwrap();
        assert_eq!(cache.cached_big_chunks(), 1);

        cache.get(&source, 25).await.unwrap();
        assert_eq!(cache.cached_big_chunks(), 2);

        assert!(cache.get(&source, 30).await.is_err());

        cache.release();
        assert_eq!(cache.cached_big_chunks(), 0);
        assert_eq!(cache.get(&source, 25).await.unwrap(), cache.get(&source, 25).await.unwrap());
        assert_eq!(cache.cached_big_chunks(), 1);
    }

    #[tokio::test]
    async fn test_disk_source() {
        let data = pattern(5000);
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), &data).unwrap();

        let source = FileSource::from_path(file.path()).await.unwrap();
        assert_eq!(source.len(), 5000);

        let layout = ChunkLayout::new(5000, 2048, 512);
        let mut cache = ChunkCache::new(layout);
        let mut assembly = ChunkAssembly::new(1, "disk", layout.chunk_count());
        for index in 0..layout.chunk_count() {
            assembly.insert(index, cache.get(&source, index).await.unwrap());
        }
        assert_eq!(assembly.assemble().unwrap(), data);
    }

    #[test]
    fn test_overwrite_is_idempotent() {
        let mut assembly = ChunkAssembly::new(0, "f", 3);
        assembly.insert(0, Bytes::from_static(b"ab"));
        assembly.insert(2, Bytes::from_static(b"ef"));
        assert_eq!(assembly.missing(), vec![1]);

        assembly.insert(1, Bytes::from_static(b"cd"));
        assembly.insert(1, Bytes::from_static(b"cd"));
        assembly.insert(0, Bytes::from_static(b"ab"));
        assert_eq!(assembly.received_count(), 3);
        assert_eq!(assembly.assemble().unwrap(), Bytes::from_static(b"abcdef"));

        assert!(!assembly.insert(3, Bytes::from_static(b"xx")));
    }
}
