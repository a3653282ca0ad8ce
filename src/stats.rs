//! 전송 통계

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 최근 처리율 계산용 윈도우 크기
const RATE_WINDOW: usize = 256;

/// 청크 기록
#[derive(Debug, Clone, Copy)]
struct ChunkSample {
    timestamp: Instant,
    size: usize,
}

/// 최근 청크 기반 처리율
#[derive(Debug, Clone)]
pub struct RateWindow {
    samples: VecDeque<ChunkSample>,
    window_size: usize,
}

impl RateWindow {
    pub fn new(window_size: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window_size),
            window_size: window_size.max(2),
        }
    }

    pub fn record(&mut self, size: usize) {
        if self.samples.len() >= self.window_size {
            self.samples.pop_front();
        }
        self.samples.push_back(ChunkSample {
            timestamp: Instant::now(),
            size,
        });
    }

    /// 바이트 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let duration = last.timestamp.duration_since(first.timestamp);
        if self.samples.len() < 2 || duration.is_zero() {
            return 0.0;
        }

        let total: usize = self.samples.iter().skip(1).map(|s| s.size).sum();
        total as f64 / duration.as_secs_f64()
    }
}

/// 세션 전체 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 보낸 청크 수 (재전송 포함)
    pub chunks_sent: u64,

    /// 재전송 청크 수
    pub chunks_retransmitted: u64,

    /// 보낸 페이로드 바이트
    pub bytes_sent: u64,

    /// 받은 청크 수 (중복 포함)
    pub chunks_received: u64,

    /// 받은 페이로드 바이트
    pub bytes_received: u64,

    /// CRC 불일치로 버린 청크 수
    pub crc_failures: u64,

    /// 같은 인덱스로 다시 받은 청크 수
    pub duplicate_chunks: u64,

    /// 받은 누락 보고(file-finish with missing) 수
    pub missing_reports: u64,

    pub files_sent: u64,
    pub files_received: u64,

    /// 모든 수신자가 종료 상태에 도달한 송신 전송 수
    pub transfers_sent: u64,
    pub transfers_received: u64,

    /// 인증 실패로 거부한 메시지 수
    pub unauthorized: u64,

    send_rate: RateWindow,
    recv_rate: RateWindow,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            chunks_sent: 0,
            chunks_retransmitted: 0,
            bytes_sent: 0,
            chunks_received: 0,
            bytes_received: 0,
            crc_failures: 0,
            duplicate_chunks: 0,
            missing_reports: 0,
            files_sent: 0,
            files_received: 0,
            transfers_sent: 0,
            transfers_received: 0,
            unauthorized: 0,
            send_rate: RateWindow::new(RATE_WINDOW),
            recv_rate: RateWindow::new(RATE_WINDOW),
        }
    }

    pub fn record_sent(&mut self, size: usize, retransmit: bool) {
        self.chunks_sent += 1;
        self.bytes_sent += size as u64;
        if retransmit {
            self.chunks_retransmitted += 1;
        }
        self.send_rate.record(size);
    }

    pub fn record_received(&mut self, size: usize, duplicate: bool) {
        self.chunks_received += 1;
        self.bytes_received += size as u64;
        if duplicate {
            self.duplicate_chunks += 1;
        }
        self.recv_rate.record(size);
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 최근 송신 처리율 (bytes/sec)
    pub fn send_throughput(&self) -> f64 {
        self.send_rate.throughput()
    }

    /// 최근 수신 처리율 (bytes/sec)
    pub fn recv_throughput(&self) -> f64 {
        self.recv_rate.throughput()
    }

    /// 재전송 비율
    pub fn retransmit_ratio(&self) -> f64 {
        if self.chunks_sent == 0 {
            return 0.0;
        }
        self.chunks_retransmitted as f64 / self.chunks_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Sent: {} chunks / {} bytes | Retransmit: {:.2}% | Received: {} chunks / {} bytes | CRC fail: {} | Files: {} out, {} in",
            self.elapsed().as_secs_f64(),
            self.chunks_sent,
            self.bytes_sent,
            self.retransmit_ratio() * 100.0,
            self.chunks_received,
            self.bytes_received,
            self.crc_failures,
            self.files_sent,
            self.files_received,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retransmit_ratio() {
        let mut stats = TransferStats::new();
        assert_eq!(stats.retransmit_ratio(), 0.0);

        for _ in 0..9 {
            stats.record_sent(4, false);
        }
        stats.record_sent(4, true);
        assert_eq!(stats.chunks_sent, 10);
        assert_eq!(stats.bytes_sent, 40);
        assert!((stats.retransmit_ratio() - 0.1).abs() < f64::EPSILON);
        assert!(stats.summary().contains("Retransmit: 10.00%"));
    }

    #[test]
    fn test_throughput_per_direction() {
        let mut stats = TransferStats::new();
        assert_eq!(stats.send_throughput(), 0.0);

        stats.record_sent(1_000, false);
        std::thread::sleep(Duration::from_millis(20));
        stats.record_sent(1_000, false);
        assert!(stats.send_throughput() > 0.0);
        // 수신 기록이 한 번뿐이면 처리율 없음
        stats.record_received(1_000, false);
        assert_eq!(stats.recv_throughput(), 0.0);
    }

    #[test]
    fn test_rate_window_bounded() {
        let mut window = RateWindow::new(4);
        assert_eq!(window.throughput(), 0.0);
        for _ in 0..10 {
            window.record(100);
        }
        assert_eq!(window.samples.len(), 4);
    }
}
