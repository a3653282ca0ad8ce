//! 피어 레지스트리 - 원격 기기당 링크 하나
//!
//! - 링크 생성 (Direct 우선, 불가하면 Relay)
//! - 키 교환 전 송수신 보류
//! - 링크별 FIFO 송신 큐 (한 번에 한 프레임)
//! - Direct 연결 시간 초과 시 Relay로 교체 (큐 유지)

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crypto::{CryptoError, KeyAnnouncement, KeyPair, LinkCrypto};
use crate::directory::DeviceId;
use crate::message::{Envelope, Frame, FLAG_PLAINTEXT};
use crate::session::SessionEvent;
use crate::transport::{
    DirectConnector, DirectEvent, DirectEvents, DirectState, DirectTransport, LinkEvent,
    RelayTransport, Rendezvous, Role, SignalPayload, Transport, TransportKind,
};
use crate::{Config, Error, Result};

/// 전송 상태기계가 메시지를 내보내는 통로
pub trait Outbox: Send {
    /// 암호화해서 전송 (키 교환 전이면 보류)
    fn send(&mut self, to: DeviceId, envelope: Envelope) -> Result<()>;

    /// 아직 나가지 않은 송신 작업 제거
    fn clear_queue(&mut self, to: DeviceId);
}

/// 송신 큐 소비 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainState {
    Idle,
    /// Direct 쓰기 진행 중
    Working,
}

/// 원격 기기와의 링크
pub struct Link {
    remote: DeviceId,
    role: Role,
    crypto: LinkCrypto,
    transport: Transport,
    /// 전송이 바뀔 때마다 증가
    generation: u64,
    queue: VecDeque<Bytes>,
    drain: DrainState,
    /// 키 교환을 기다리는 송신 메시지
    held_outbound: VecDeque<Envelope>,
    /// 키 교환 전에 도착한 암호문
    held_inbound: VecDeque<Bytes>,
}

impl Link {
    fn new(
        remote: DeviceId,
        role: Role,
        crypto: LinkCrypto,
        transport: Transport,
        generation: u64,
    ) -> Self {
        Self {
            remote,
            role,
            crypto,
            transport,
            generation,
            queue: VecDeque::new(),
            drain: DrainState::Idle,
            held_outbound: VecDeque::new(),
            held_inbound: VecDeque::new(),
        }
    }

    pub fn remote(&self) -> DeviceId {
        self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn key_ready(&self) -> bool {
        self.crypto.is_ready()
    }

    /// 큐에 남은 프레임 수
    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    pub fn held_outbound(&self) -> usize {
        self.held_outbound.len()
    }

    fn enqueue(&mut self, frame: Bytes, immediate: bool) {
        if immediate {
            self.queue.push_front(frame);
        } else {
            self.queue.push_back(frame);
        }
    }

    fn seal(&mut self, envelope: &Envelope) -> Result<Bytes> {
        let plain = envelope.to_bytes()?;
        let remote = self.remote;
        let sealed = self
            .crypto
            .encrypt(&plain)
            .map_err(|e| crypto_error(remote, e))?;
        Ok(Frame::Encrypted(sealed.into()).encode())
    }

    fn open(&mut self, body: &[u8]) -> Result<Envelope> {
        let remote = self.remote;
        let plain = self
            .crypto
            .decrypt(body)
            .map_err(|e| crypto_error(remote, e))?;
        let envelope = Envelope::from_bytes(&plain)?;
        if matches!(envelope, Envelope::KeyAnnouncement(_)) {
            return Err(Error::InvalidFrame("암호화된 키 공지".into()));
        }
        Ok(envelope)
    }
}

fn crypto_error(remote: DeviceId, error: CryptoError) -> Error {
    match error {
        CryptoError::KeyNotReady => Error::KeyNotReady(remote),
        other => Error::Crypto(other),
    }
}

fn plain_announcement(announcement: KeyAnnouncement) -> Result<Bytes> {
    let body = Envelope::KeyAnnouncement(announcement).to_bytes()?;
    Ok(Frame::Plain(body.into()).encode())
}

/// 닫을 링크 선택
#[derive(Debug, Clone)]
pub enum CloseSelector {
    One(DeviceId),
    /// 주어진 온라인 집합에 없는 링크
    NotIn(HashSet<DeviceId>),
    /// Relay로 동작 중인 링크만
    Relay,
    All,
}

/// 전송 계층 이벤트 처리 결과
#[derive(Debug)]
pub enum LinkOutcome {
    Nothing,
    Inbound {
        from: DeviceId,
        envelopes: Vec<Envelope>,
    },
    PeerGone {
        remote: DeviceId,
        reason: String,
    },
}

/// 피어 레지스트리 (세션 태스크 전용)
pub struct PeerRegistry {
    keys: Arc<KeyPair>,
    links: HashMap<DeviceId, Link>,
    rendezvous: Arc<dyn Rendezvous>,
    direct: Option<Arc<dyn DirectConnector>>,
    direct_enabled: bool,
    fallback_timeout: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
    next_generation: u64,
    /// 송신 중 전송 에러로 닫힌 링크
    gone: Vec<(DeviceId, String)>,
}

impl PeerRegistry {
    pub fn new(
        config: &Config,
        keys: Arc<KeyPair>,
        rendezvous: Arc<dyn Rendezvous>,
        direct: Option<Arc<dyn DirectConnector>>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            keys,
            links: HashMap::new(),
            rendezvous,
            direct,
            direct_enabled: config.direct_enabled,
            fallback_timeout: config.fallback_timeout(),
            events,
            next_generation: 0,
            gone: Vec::new(),
        }
    }

    pub fn link(&self, remote: DeviceId) -> Option<&Link> {
        self.links.get(&remote)
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// 송신 중 닫힌 링크 목록 (호출하면 비워짐)
    pub fn take_gone(&mut self) -> Vec<(DeviceId, String)> {
        std::mem::take(&mut self.gone)
    }

    fn link_mut(&mut self, remote: DeviceId) -> Result<&mut Link> {
        self.links
            .get_mut(&remote)
            .ok_or(Error::LinkNotConnected(remote))
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn relay(&self) -> Transport {
        Transport::Relay(RelayTransport::new(self.rendezvous.clone()))
    }

    /// 새 전송 생성 (Direct가 가능하면 Direct)
    fn new_transport(&mut self, remote: DeviceId, role: Role) -> (Transport, u64) {
        let generation = self.bump_generation();
        let connector = match &self.direct {
            Some(connector) if self.direct_enabled && connector.is_available() => connector.clone(),
            _ => return (self.relay(), generation),
        };

        let initiator = role == Role::Initiator;
        let events = DirectEvents::new(self.events.clone(), remote, generation);
        tokio::spawn(async move {
            match connector.open(remote, initiator, events.clone()).await {
                Ok(channel) => events.emit(DirectEvent::Opened(channel)),
                Err(e) => events.emit(DirectEvent::OpenFailed(e.to_string())),
            };
        });

        // 대체 타이머는 initiator만
        let timer = initiator.then(|| {
            let tx = self.events.clone();
            let timeout = self.fallback_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = tx.send(SessionEvent::Link(LinkEvent::FallbackTimeout {
                    remote,
                    generation,
                }));
            })
            .abort_handle()
        });

        (Transport::Direct(DirectTransport::opening(timer)), generation)
    }

    fn insert_link(&mut self, remote: DeviceId, role: Role, transport: Transport, generation: u64) {
        debug!(
            "링크 생성: device={}, role={:?}, transport={:?}",
            remote,
            role,
            transport.kind()
        );
        let crypto = LinkCrypto::new(self.keys.clone());
        self.links
            .insert(remote, Link::new(remote, role, crypto, transport, generation));
    }

    /// 링크 확보 (이미 있으면 그대로)
    pub fn connect(&mut self, remote: DeviceId, role: Role) -> TransportKind {
        if let Some(link) = self.links.get(&remote) {
            return link.kind();
        }
        let (transport, generation) = self.new_transport(remote, role);
        let kind = transport.kind();
        self.insert_link(remote, role, transport, generation);
        kind
    }

    /// 전송 교체 (큐와 보류 작업은 유지)
    pub fn replace(&mut self, remote: DeviceId, transport: Transport) -> Result<()> {
        let generation = self.bump_generation();
        let link = self.link_mut(remote)?;
        let mut old = std::mem::replace(&mut link.transport, transport);
        old.close();
        link.generation = generation;
        link.drain = DrainState::Idle;
        self.drain(remote)
    }

    fn fallback_to_relay(&mut self, remote: DeviceId, reason: &str) -> LinkOutcome {
        info!("Relay로 전환: device={}, {}", remote, reason);
        let relay = self.relay();
        match self.replace(remote, relay) {
            Ok(()) => LinkOutcome::Nothing,
            Err(e) => self.teardown(remote, e.to_string()),
        }
    }

    fn teardown(&mut self, remote: DeviceId, reason: String) -> LinkOutcome {
        if let Some(mut link) = self.links.remove(&remote) {
            link.transport.close();
            warn!("링크 종료: device={}, {}", remote, reason);
        }
        LinkOutcome::PeerGone { remote, reason }
    }

    /// 상대가 보낸 시그널링 데이터 처리
    ///
    /// 링크가 없으면 responder 링크를 먼저 만든다.
    pub fn signal(&mut self, remote: DeviceId, payload: SignalPayload) -> Result<()> {
        self.connect(remote, Role::Responder);
        let link = self.link_mut(remote)?;
        match &mut link.transport {
            Transport::Direct(direct) => match &direct.channel {
                Some(channel) => channel.signal(payload)?,
                None => direct.pending_signals.push(payload),
            },
            Transport::Relay(_) => {
                warn!("Relay 링크로 온 시그널 무시: device={}", remote);
            }
        }
        Ok(())
    }

    /// 메시지 전송
    ///
    /// `immediate`는 큐 맨 앞에 넣는다 (평문 키 공지 전용).
    pub fn send_envelope(
        &mut self,
        remote: DeviceId,
        envelope: Envelope,
        encrypt: bool,
        immediate: bool,
    ) -> Result<()> {
        self.connect(remote, Role::Initiator);
        let link = self.link_mut(remote)?;

        let frame = if !encrypt {
            Frame::Plain(envelope.to_bytes()?.into()).encode()
        } else if link.crypto.is_ready() {
            link.seal(&envelope)?
        } else {
            link.held_outbound.push_back(envelope);
            if link.crypto.announced() {
                return Ok(());
            }
            debug!("키 공지 전송: device={}", remote);
            let announcement = link.crypto.announcement(true);
            link.enqueue(plain_announcement(announcement)?, true);
            return self.drain(remote);
        };

        link.enqueue(frame, immediate);
        self.drain(remote)
    }

    /// 큐 소비 (Direct는 한 번에 한 프레임, Relay는 동기 전송)
    fn drain(&mut self, remote: DeviceId) -> Result<()> {
        let events = self.events.clone();
        let Some(link) = self.links.get_mut(&remote) else {
            return Ok(());
        };

        while link.drain == DrainState::Idle && link.transport.is_connected() {
            let Some(frame) = link.queue.pop_front() else {
                break;
            };
            match &link.transport {
                Transport::Relay(relay) => {
                    if let Err(e) = relay.write(remote, frame.clone()) {
                        link.queue.push_front(frame);
                        return Err(e);
                    }
                }
                Transport::Direct(direct) => {
                    let Some(channel) = direct.channel.clone() else {
                        link.queue.push_front(frame);
                        break;
                    };
                    link.drain = DrainState::Working;
                    let generation = link.generation;
                    let events = events.clone();
                    tokio::spawn(async move {
                        let result = channel.write(frame).await;
                        let _ = events.send(SessionEvent::Link(LinkEvent::WriteDone {
                            remote,
                            generation,
                            result,
                        }));
                    });
                }
            }
        }
        Ok(())
    }

    /// 수신 프레임 처리
    ///
    /// 복호화된 메시지를 돌려준다. 키 공지는 여기서 소비된다.
    pub fn handle_frame(
        &mut self,
        remote: DeviceId,
        bytes: Bytes,
        via: TransportKind,
    ) -> Result<Vec<Envelope>> {
        let connected = self.links.get(&remote).map(|link| link.is_connected());
        match connected {
            None if via == TransportKind::Relay => {
                let generation = self.bump_generation();
                let relay = self.relay();
                self.insert_link(remote, Role::Responder, relay, generation);
            }
            None => {
                self.connect(remote, Role::Responder);
            }
            Some(false) if via == TransportKind::Relay => {
                // 상대가 이미 Relay로 넘어감
                info!("상대가 Relay 사용 중, 링크 전환: device={}", remote);
                let relay = self.relay();
                self.replace(remote, relay)?;
            }
            Some(_) => {}
        }

        let link = self.link_mut(remote)?;
        match Frame::decode(bytes)? {
            Frame::Plain(body) => match Envelope::from_bytes(&body)? {
                Envelope::KeyAnnouncement(announcement) => {
                    self.apply_announcement(remote, announcement)
                }
                other => Err(Error::InvalidFrame(format!(
                    "암호화되지 않은 {} 메시지",
                    other.msg_type()
                ))),
            },
            Frame::Encrypted(body) => {
                if !link.crypto.is_ready() {
                    debug!("키 교환 전 암호문 보류: device={}", remote);
                    link.held_inbound.push_back(body);
                    // 상대는 이전 링크의 키를 쓰고 있을 수 있음
                    if !link.crypto.announced() {
                        debug!("키 공지 전송: device={}", remote);
                        let announcement = link.crypto.announcement(true);
                        link.enqueue(plain_announcement(announcement)?, true);
                        self.drain(remote)?;
                    }
                    return Ok(Vec::new());
                }
                Ok(vec![link.open(&body)?])
            }
        }
    }

    fn apply_announcement(
        &mut self,
        remote: DeviceId,
        announcement: KeyAnnouncement,
    ) -> Result<Vec<Envelope>> {
        let link = self.link_mut(remote)?;
        let update = link.crypto.apply_announcement(&announcement)?;
        if update.changed {
            info!("키 교환 완료: device={}", remote);
        }
        if let Some(reply) = update.reply {
            link.enqueue(plain_announcement(reply)?, true);
        }

        let mut inbound = Vec::new();
        for body in std::mem::take(&mut link.held_inbound) {
            match link.open(&body) {
                Ok(envelope) => inbound.push(envelope),
                Err(e) => warn!("보류된 프레임 복호화 실패: device={}, {}", remote, e),
            }
        }

        let held: Vec<Envelope> = link.held_outbound.drain(..).collect();
        for envelope in held {
            let frame = link.seal(&envelope)?;
            link.enqueue(frame, false);
        }

        if let Err(e) = self.drain(remote) {
            warn!("송신 실패: device={}, {}", remote, e);
        }
        Ok(inbound)
    }

    fn is_current(&self, remote: DeviceId, generation: u64) -> bool {
        self.links
            .get(&remote)
            .is_some_and(|link| link.generation == generation)
    }

    /// 전송 계층 이벤트 처리
    pub fn on_link_event(&mut self, event: LinkEvent) -> LinkOutcome {
        match event {
            LinkEvent::Direct {
                remote,
                generation,
                event,
            } => {
                if !self.is_current(remote, generation) {
                    if let DirectEvent::Opened(channel) = event {
                        channel.close();
                    }
                    debug!("교체된 전송의 이벤트 무시: device={}", remote);
                    return LinkOutcome::Nothing;
                }
                self.on_direct_event(remote, event)
            }
            LinkEvent::FallbackTimeout { remote, generation } => {
                let establishing = self
                    .links
                    .get(&remote)
                    .is_some_and(|link| link.generation == generation && !link.is_connected());
                if establishing {
                    self.fallback_to_relay(remote, "Direct 연결 시간 초과")
                } else {
                    LinkOutcome::Nothing
                }
            }
            LinkEvent::WriteDone {
                remote,
                generation,
                result,
            } => {
                if !self.is_current(remote, generation) {
                    return LinkOutcome::Nothing;
                }
                if let Err(e) = result {
                    return self.teardown(remote, e.to_string());
                }
                if let Some(link) = self.links.get_mut(&remote) {
                    link.drain = DrainState::Idle;
                }
                match self.drain(remote) {
                    Ok(()) => LinkOutcome::Nothing,
                    Err(e) => self.teardown(remote, e.to_string()),
                }
            }
        }
    }

    fn on_direct_event(&mut self, remote: DeviceId, event: DirectEvent) -> LinkOutcome {
        let Some(link) = self.links.get_mut(&remote) else {
            return LinkOutcome::Nothing;
        };
        let role = link.role;
        let connected = link.is_connected();

        match event {
            DirectEvent::Opened(channel) => {
                if let Transport::Direct(direct) = &mut link.transport {
                    direct.opened(channel);
                }
                match self.drain(remote) {
                    Ok(()) => LinkOutcome::Nothing,
                    Err(e) => self.teardown(remote, e.to_string()),
                }
            }
            DirectEvent::Signal(payload) => {
                if let Err(e) = self.rendezvous.relay_signal(remote, payload) {
                    warn!("시그널 중계 실패: device={}, {}", remote, e);
                }
                LinkOutcome::Nothing
            }
            DirectEvent::Connected => {
                if let Transport::Direct(direct) = &mut link.transport {
                    direct.state = DirectState::Connected;
                    direct.cancel_timer();
                }
                info!("Direct 연결됨: device={}", remote);
                match self.drain(remote) {
                    Ok(()) => LinkOutcome::Nothing,
                    Err(e) => self.teardown(remote, e.to_string()),
                }
            }
            DirectEvent::Data(bytes) => match self.handle_frame(remote, bytes, TransportKind::Direct) {
                Ok(envelopes) if envelopes.is_empty() => LinkOutcome::Nothing,
                Ok(envelopes) => LinkOutcome::Inbound {
                    from: remote,
                    envelopes,
                },
                Err(e) => {
                    warn!("수신 프레임 거부: device={}, {}", remote, e);
                    LinkOutcome::Nothing
                }
            },
            DirectEvent::OpenFailed(reason) | DirectEvent::Error(reason)
                if role == Role::Initiator && !connected =>
            {
                self.fallback_to_relay(remote, &reason)
            }
            DirectEvent::OpenFailed(reason) | DirectEvent::Error(reason) => {
                self.teardown(remote, reason)
            }
            DirectEvent::Closed => self.teardown(remote, "Direct 채널 닫힘".into()),
        }
    }

    /// 링크 닫기, 닫힌 기기 목록 반환
    pub fn close(&mut self, selector: CloseSelector) -> Vec<DeviceId> {
        let targets: Vec<DeviceId> = self
            .links
            .values()
            .filter(|link| match &selector {
                CloseSelector::One(remote) => link.remote == *remote,
                CloseSelector::NotIn(online) => !online.contains(&link.remote),
                CloseSelector::Relay => link.kind() == TransportKind::Relay,
                CloseSelector::All => true,
            })
            .map(|link| link.remote)
            .collect();

        for remote in &targets {
            if let Some(mut link) = self.links.remove(remote) {
                link.transport.close();
                debug!("링크 닫음: device={}", remote);
            }
        }
        targets
    }
}

impl Outbox for PeerRegistry {
    fn send(&mut self, to: DeviceId, envelope: Envelope) -> Result<()> {
        let result = self.send_envelope(to, envelope, true, false);
        if let Err(e @ Error::Transport { .. }) = &result {
            if let LinkOutcome::PeerGone { remote, reason } = self.teardown(to, e.to_string()) {
                self.gone.push((remote, reason));
            }
        }
        result
    }

    /// 암호문과 보류 메시지만 지운다 (키 공지는 남김)
    fn clear_queue(&mut self, to: DeviceId) {
        if let Some(link) = self.links.get_mut(&to) {
            link.queue.retain(|frame| frame.first() == Some(&FLAG_PLAINTEXT));
            link.held_outbound.clear();
        }
    }
}
