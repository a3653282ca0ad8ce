//! 암호화 모듈 - 링크별 X25519 키 합의 + ChaCha20-Poly1305 대칭 암호화
//!
//! 흐름:
//! 1. 프로세스 수명 동안 유지되는 X25519 키쌍 하나를 모든 링크가 공유
//! 2. 평문 키 공지(KeyAnnouncement)로 공개키 교환
//! 3. 공유 비밀 계산 후 링크 암호화기 생성
//! 4. nonce = 랜덤 8바이트 ‖ 카운터 4바이트, nonce를 AAD로 사용

use std::sync::Arc;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use x25519_dalek::{PublicKey, StaticSecret};

/// X25519 공개키 (32 bytes)
pub const PUBLIC_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce 크기 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// nonce 앞부분 랜덤 바이트 수
pub const NONCE_RANDOM_SIZE: usize = 8;

/// ChaCha20-Poly1305 태그 크기 (16 bytes)
pub const TAG_SIZE: usize = 16;

/// 암호화 오류
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("키 교환 실패")]
    KeyExchangeFailed,
    #[error("키 교환 미완료")]
    KeyNotReady,
    #[error("암호화 실패: {0}")]
    EncryptionFailed(String),
    #[error("복호화 실패: {0}")]
    DecryptionFailed(String),
    #[error("nonce 카운터 소진")]
    CounterExhausted,
}

/// 키 공지 슬롯 (1비트)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyEpoch {
    #[default]
    Zero,
    One,
}

impl KeyEpoch {
    pub fn flip(self) -> Self {
        match self {
            KeyEpoch::Zero => KeyEpoch::One,
            KeyEpoch::One => KeyEpoch::Zero,
        }
    }
}

/// 평문으로 전송되는 공개키 공지
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAnnouncement {
    pub public_key: [u8; PUBLIC_KEY_SIZE],

    /// 공지한 쪽의 슬롯
    pub epoch: KeyEpoch,

    /// true면 상대가 자기 공지로 응답해야 함
    pub initiator: bool,
}

/// 로컬 키쌍 (프로세스 수명)
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// 새 키쌍 생성
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// 공개키를 바이트로 변환
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// 상대방 공개키로 공유 비밀 계산
    ///
    /// 저차수 점처럼 기여하지 않는 공개키는 거부
    pub fn compute_shared_secret(
        &self,
        peer_public: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<[u8; 32], CryptoError> {
        let peer_public = PublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer_public);
        if !shared.was_contributory() {
            return Err(CryptoError::KeyExchangeFailed);
        }
        Ok(*shared.as_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

/// 링크 암호화기
pub struct LinkCipher {
    cipher: ChaCha20Poly1305,

    /// 마지막으로 사용한 송신 카운터
    send_counter: u32,

    /// 지금까지 받은 가장 큰 카운터
    recv_counter: Option<u32>,
}

impl LinkCipher {
    /// 공유 비밀로 암호화기 생성
    pub fn new(shared_secret: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(shared_secret.into()),
            send_counter: 0,
            recv_counter: None,
        }
    }

    /// 다음 nonce 생성 (랜덤 8바이트 + 증가 카운터)
    fn next_nonce(&mut self) -> Result<[u8; NONCE_SIZE], CryptoError> {
        let counter = self
            .send_counter
            .checked_add(1)
            .ok_or(CryptoError::CounterExhausted)?;
        self.send_counter = counter;

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce[..NONCE_RANDOM_SIZE]);
        nonce[NONCE_RANDOM_SIZE..].copy_from_slice(&counter.to_be_bytes());
        Ok(nonce)
    }

    /// 암호화
    /// 반환: nonce(12) + ciphertext(원본 + 16바이트 태그)
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes = self.next_nonce()?;
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &nonce_bytes,
                },
            )
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// 복호화
    /// 입력: nonce(12) + ciphertext
    pub fn decrypt(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if encrypted.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed("데이터가 너무 짧음".into()));
        }

        let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: nonce_bytes,
                },
            )
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

        let mut counter_bytes = [0u8; 4];
        counter_bytes.copy_from_slice(&nonce_bytes[NONCE_RANDOM_SIZE..]);
        let counter = u32::from_be_bytes(counter_bytes);
        match self.recv_counter {
            Some(last) if counter <= last => {
                warn!("카운터 역행: received={}, last={}", counter, last);
            }
            _ => self.recv_counter = Some(counter),
        }

        Ok(plaintext)
    }

    /// 상대가 새로 공지를 시작하면 수신 카운터 추적을 초기화
    fn reset_recv_counter(&mut self) {
        self.recv_counter = None;
    }

    pub fn send_counter(&self) -> u32 {
        self.send_counter
    }
}

/// 키 공지 처리 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUpdate {
    /// 파생 키가 새로 만들어졌는지
    pub changed: bool,

    /// 상대에게 돌려보낼 공지
    pub reply: Option<KeyAnnouncement>,
}

/// 링크별 암호화 상태
pub struct LinkCrypto {
    local: Arc<KeyPair>,
    remote_public_key: Option<[u8; PUBLIC_KEY_SIZE]>,
    cipher: Option<LinkCipher>,
    epoch: KeyEpoch,
    announced: bool,
}

impl LinkCrypto {
    pub fn new(local: Arc<KeyPair>) -> Self {
        Self {
            local,
            remote_public_key: None,
            cipher: None,
            epoch: KeyEpoch::Zero,
            announced: false,
        }
    }

    /// 파생 키 준비 여부
    pub fn is_ready(&self) -> bool {
        self.cipher.is_some()
    }

    /// 이미 공지를 보냈는지
    pub fn announced(&self) -> bool {
        self.announced
    }

    /// 자기 공지 생성
    pub fn announcement(&mut self, initiator: bool) -> KeyAnnouncement {
        self.announced = true;
        KeyAnnouncement {
            public_key: self.local.public_key_bytes(),
            epoch: self.epoch,
            initiator,
        }
    }

    /// 상대 공지 반영
    ///
    /// 공개키가 바뀌면 파생 키와 카운터를 초기화한다.
    /// initiator 공지에는 반대 슬롯으로 응답한다.
    pub fn apply_announcement(
        &mut self,
        announcement: &KeyAnnouncement,
    ) -> Result<KeyUpdate, CryptoError> {
        let changed = self.remote_public_key != Some(announcement.public_key);

        if changed {
            let shared = self.local.compute_shared_secret(&announcement.public_key)?;
            self.cipher = Some(LinkCipher::new(&shared));
            self.remote_public_key = Some(announcement.public_key);
            debug!("파생 키 갱신 (remote epoch {:?})", announcement.epoch);
        }

        let reply = if announcement.initiator {
            if let Some(cipher) = self.cipher.as_mut() {
                cipher.reset_recv_counter();
            }
            self.epoch = announcement.epoch.flip();
            Some(self.announcement(false))
        } else {
            None
        };

        Ok(KeyUpdate { changed, reply })
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .as_mut()
            .ok_or(CryptoError::KeyNotReady)?
            .encrypt(plaintext)
    }

    pub fn decrypt(&mut self, encrypted: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .as_mut()
            .ok_or(CryptoError::KeyNotReady)?
            .decrypt(encrypted)
    }

    pub fn epoch(&self) -> KeyEpoch {
        self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn linked_pair() -> (LinkCrypto, LinkCrypto) {
        let mut alice = LinkCrypto::new(Arc::new(KeyPair::generate()));
        let mut bob = LinkCrypto::new(Arc::new(KeyPair::generate()));

        let offer = alice.announcement(true);
        let update = bob.apply_announcement(&offer).unwrap();
        let reply = update.reply.expect("initiator 공지에는 응답해야 함");
        let update = alice.apply_announcement(&reply).unwrap();
        assert!(update.changed);
        assert!(update.reply.is_none());

        (alice, bob)
    }

    #[test]
    fn test_key_exchange() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let alice_shared = alice.compute_shared_secret(&bob.public_key_bytes()).unwrap();
        let bob_shared = bob.compute_shared_secret(&alice.public_key_bytes()).unwrap();

        assert_eq!(alice_shared, bob_shared);
    }

    #[test]
    fn test_rejects_low_order_key() {
        let alice = KeyPair::generate();
        assert!(matches!(
            alice.compute_shared_secret(&[0u8; 32]),
            Err(CryptoError::KeyExchangeFailed)
        ));
    }

    #[test]
    fn test_encrypt_decrypt() {
        let (mut alice, mut bob) = linked_pair();

        let plaintext = b"Hello, fileshare! This is encrypted data.";
        let encrypted = alice.encrypt(plaintext).unwrap();
        let decrypted = bob.decrypt(&encrypted).unwrap();
        assert_eq!(plaintext.as_slice(), decrypted.as_slice());

        let answer = bob.encrypt(b"ack").unwrap();
        assert_eq!(alice.decrypt(&answer).unwrap(), b"ack");
    }

    #[test]
    fn test_nonce_never_reused() {
        let (mut alice, mut bob) = linked_pair();
        let mut nonces = HashSet::new();
        let mut last_counter = 0u32;

        for i in 0..500u32 {
            let encrypted = alice.encrypt(&i.to_le_bytes()).unwrap();
            let nonce: [u8; NONCE_SIZE] = encrypted[..NONCE_SIZE].try_into().unwrap();
            assert!(nonces.insert(nonce));

            let counter = u32::from_be_bytes(nonce[NONCE_RANDOM_SIZE..].try_into().unwrap());
            assert!(counter > last_counter);
            last_counter = counter;

            assert_eq!(bob.decrypt(&encrypted).unwrap(), i.to_le_bytes());
        }
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let (mut alice, mut bob) = linked_pair();
        let mut encrypted = alice.encrypt(b"payload").unwrap();
        encrypted[0] ^= 0xFF;
        assert!(bob.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_not_ready() {
        let mut crypto = LinkCrypto::new(Arc::new(KeyPair::generate()));
        assert!(!crypto.is_ready());
        assert!(matches!(crypto.encrypt(b"x"), Err(CryptoError::KeyNotReady)));
        assert!(matches!(crypto.decrypt(&[0u8; 40]), Err(CryptoError::KeyNotReady)));
    }

    #[test]
    fn test_new_remote_key_resets_counter() {
        let (mut alice, mut bob) = linked_pair();
        for _ in 0..3 {
            alice.encrypt(b"x").unwrap();
        }
        assert_eq!(alice.cipher.as_ref().unwrap().send_counter(), 3);

        // bob 재시작: 새 키쌍
        bob = LinkCrypto::new(Arc::new(KeyPair::generate()));
        let offer = bob.announcement(true);
        let update = alice.apply_announcement(&offer).unwrap();
        assert!(update.changed);
        assert_eq!(alice.cipher.as_ref().unwrap().send_counter(), 0);

        bob.apply_announcement(&update.reply.unwrap()).unwrap();
        let encrypted = alice.encrypt(b"after restart").unwrap();
        assert_eq!(bob.decrypt(&encrypted).unwrap(), b"after restart");
    }

    #[test]
    fn test_simultaneous_announcements_keep_key() {
        let mut alice = LinkCrypto::new(Arc::new(KeyPair::generate()));
        let mut bob = LinkCrypto::new(Arc::new(KeyPair::generate()));

        let alice_offer = alice.announcement(true);
        let bob_offer = bob.announcement(true);

        let alice_reply = alice.apply_announcement(&bob_offer).unwrap().reply.unwrap();
        let bob_reply = bob.apply_announcement(&alice_offer).unwrap().reply.unwrap();
        assert_eq!(alice_reply.epoch, KeyEpoch::One);

        // 응답은 같은 공개키이므로 키를 다시 만들지 않음
        let encrypted = alice.encrypt(b"before replies").unwrap();
        assert!(!alice.apply_announcement(&bob_reply).unwrap().changed);
        assert!(!bob.apply_announcement(&alice_reply).unwrap().changed);
        assert_eq!(bob.decrypt(&encrypted).unwrap(), b"before replies");
    }
}
