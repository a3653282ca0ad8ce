//! 프로세스 내 협력자 구현
//!
//! 디렉터리, 알림, 랑데부, Direct 채널을 메모리에서 흉내낸다.
//! 여러 세션을 한 프로세스에서 연결해 전체 흐름을 돌려볼 수 있다.
//!
//! Direct 채널은 offer/answer 시그널링을 흉내내며,
//! `block_direct()` 이후에는 answer를 보내지 않아 Relay 대체를 유도한다.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use crate::directory::{DeviceId, Directory, Notification, Notifier, TargetSelector};
use crate::receiver::ReceivedFile;
use crate::session::{Session, SessionHandle};
use crate::transport::{
    DirectChannel, DirectConnector, DirectEvent, DirectEvents, Rendezvous, SignalPayload,
};
use crate::{Config, Error, Result};

const OFFER: &[u8] = b"offer";
const ANSWER: &[u8] = b"answer";

#[derive(Default)]
struct DirectoryState {
    targets: HashMap<TargetSelector, Vec<DeviceId>>,
    online: HashSet<DeviceId>,
    /// (원격 기기, 원격이 주장하는 관계)
    relationships: HashSet<(DeviceId, TargetSelector)>,
}

/// 메모리 디렉터리
pub struct MemoryDirectory {
    local: DeviceId,
    state: RwLock<DirectoryState>,
}

impl MemoryDirectory {
    pub fn new(local: DeviceId) -> Self {
        Self {
            local,
            state: RwLock::new(DirectoryState::default()),
        }
    }

    pub fn with_target(self, target: TargetSelector, devices: impl IntoIterator<Item = DeviceId>) -> Self {
        self.set_target(target, devices);
        self
    }

    pub fn set_target(&self, target: TargetSelector, devices: impl IntoIterator<Item = DeviceId>) {
        self.state
            .write()
            .targets
            .insert(target, devices.into_iter().collect());
    }

    pub fn set_online(&self, device: DeviceId, online: bool) {
        let mut state = self.state.write();
        if online {
            state.online.insert(device);
        } else {
            state.online.remove(&device);
        }
    }

    /// `remote`가 `claimed` 관계로 보내는 것을 허용
    pub fn allow(&self, remote: DeviceId, claimed: TargetSelector) {
        self.state.write().relationships.insert((remote, claimed));
    }

    pub fn revoke(&self, remote: DeviceId, claimed: TargetSelector) {
        self.state.write().relationships.remove(&(remote, claimed));
    }
}

impl Directory for MemoryDirectory {
    fn local_device(&self) -> DeviceId {
        self.local
    }

    fn resolve(&self, target: &TargetSelector) -> Vec<DeviceId> {
        self.state
            .read()
            .targets
            .get(target)
            .map(|devices| devices.iter().copied().filter(|d| *d != self.local).collect())
            .unwrap_or_default()
    }

    fn is_online(&self, device: DeviceId) -> bool {
        self.state.read().online.contains(&device)
    }

    fn relationship(&self, remote: DeviceId, claimed: &TargetSelector) -> bool {
        self.state.read().relationships.contains(&(remote, *claimed))
    }
}

/// 보낸 알림을 기록만 하는 알림 서비스
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(DeviceId, Notification)>>,
}

impl RecordingNotifier {
    pub fn take(&self) -> Vec<(DeviceId, Notification)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, device: DeviceId, notification: Notification) {
        debug!("알림 기록: device={}, transfer={}", device, notification.transfer_id);
        self.sent.lock().push((device, notification));
    }
}

#[derive(Default)]
struct HubInner {
    sessions: DashMap<DeviceId, SessionHandle>,
    /// (로컬, 원격) → 로컬 쪽 Direct 채널
    channels: DashMap<(DeviceId, DeviceId), Arc<LoopbackChannel>>,
    direct_blocked: AtomicBool,
    relay_frames: AtomicU64,
    direct_frames: AtomicU64,
}

/// 세션 라우팅 허브
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

/// 허브에 연결된 세션 하나
pub struct LoopbackPeer {
    pub handle: SessionHandle,
    pub received: mpsc::UnboundedReceiver<ReceivedFile>,
    pub directory: Arc<MemoryDirectory>,
    pub notifier: Arc<RecordingNotifier>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 세션을 시작하고 허브에 등록
    pub fn spawn(&self, config: Config, directory: MemoryDirectory) -> Result<LoopbackPeer> {
        let local = directory.local_device();
        let directory = Arc::new(directory);
        let notifier = Arc::new(RecordingNotifier::default());
        let rendezvous = Arc::new(HubRendezvous {
            local,
            hub: self.clone(),
        });
        let direct: Arc<dyn DirectConnector> = Arc::new(LoopbackConnector {
            local,
            hub: self.clone(),
        });

        let (handle, received) = Session::start(
            config,
            directory.clone(),
            notifier.clone(),
            rendezvous,
            Some(direct),
        )?;
        self.inner.sessions.insert(local, handle.clone());

        Ok(LoopbackPeer {
            handle,
            received,
            directory,
            notifier,
        })
    }

    /// 허브에서 세션 제거 (이후 이 기기로의 중계는 실패)
    pub fn unregister(&self, device: DeviceId) {
        self.inner.sessions.remove(&device);
    }

    /// 이후 Direct 채널이 연결되지 않음
    pub fn block_direct(&self) {
        self.inner.direct_blocked.store(true, Ordering::SeqCst);
    }

    pub fn relay_frames(&self) -> u64 {
        self.inner.relay_frames.load(Ordering::Relaxed)
    }

    pub fn direct_frames(&self) -> u64 {
        self.inner.direct_frames.load(Ordering::Relaxed)
    }

    fn session(&self, device: DeviceId) -> Result<SessionHandle> {
        self.inner
            .sessions
            .get(&device)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::transport(device, "허브에 없는 기기"))
    }
}

/// 허브 경유 랑데부
struct HubRendezvous {
    local: DeviceId,
    hub: LoopbackHub,
}

impl Rendezvous for HubRendezvous {
    fn relay_signal(&self, remote: DeviceId, payload: SignalPayload) -> Result<()> {
        self.hub.session(remote)?.deliver_signal(self.local, payload)
    }

    fn relay_data(&self, remote: DeviceId, frame: Bytes) -> Result<()> {
        self.hub.inner.relay_frames.fetch_add(1, Ordering::Relaxed);
        self.hub
            .session(remote)?
            .deliver_relay(self.local, frame)
            .map_err(|e| Error::transport(remote, e.to_string()))
    }
}

struct LoopbackConnector {
    local: DeviceId,
    hub: LoopbackHub,
}

#[async_trait]
impl DirectConnector for LoopbackConnector {
    fn is_available(&self) -> bool {
        true
    }

    async fn open(
        &self,
        remote: DeviceId,
        initiator: bool,
        events: DirectEvents,
    ) -> Result<Arc<dyn DirectChannel>> {
        let channel = Arc::new(LoopbackChannel {
            local: self.local,
            remote,
            events: events.clone(),
            hub: self.hub.clone(),
        });
        self.hub
            .inner
            .channels
            .insert((self.local, remote), channel.clone());

        if initiator {
            events.emit(DirectEvent::Signal(Bytes::from_static(OFFER)));
        }
        Ok(channel)
    }
}

/// 메모리 Direct 채널 (쓰기는 상대 채널의 Data 이벤트가 됨)
struct LoopbackChannel {
    local: DeviceId,
    remote: DeviceId,
    events: DirectEvents,
    hub: LoopbackHub,
}

#[async_trait]
impl DirectChannel for LoopbackChannel {
    fn signal(&self, payload: SignalPayload) -> Result<()> {
        if self.hub.inner.direct_blocked.load(Ordering::SeqCst) {
            debug!("Direct 차단, 시그널 무시: {} -> {}", self.remote, self.local);
            return Ok(());
        }
        match payload.as_ref() {
            OFFER => {
                self.events.emit(DirectEvent::Signal(Bytes::from_static(ANSWER)));
                self.events.emit(DirectEvent::Connected);
            }
            ANSWER => {
                self.events.emit(DirectEvent::Connected);
            }
            other => {
                return Err(Error::transport(
                    self.remote,
                    format!("알 수 없는 시그널 {} bytes", other.len()),
                ))
            }
        }
        Ok(())
    }

    async fn write(&self, frame: Bytes) -> Result<()> {
        let peer = self
            .hub
            .inner
            .channels
            .get(&(self.remote, self.local))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::transport(self.remote, "상대 채널 없음"))?;
        self.hub.inner.direct_frames.fetch_add(1, Ordering::Relaxed);
        if peer.events.emit(DirectEvent::Data(frame)) {
            Ok(())
        } else {
            Err(Error::transport(self.remote, "상대 세션 종료"))
        }
    }

    fn close(&self) {
        // 같은 쌍에 새 채널이 등록됐으면 그대로 둠
        self.hub
            .inner
            .channels
            .remove_if(&(self.local, self.remote), |_, current| {
                std::ptr::eq(Arc::as_ptr(current), self)
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::OutgoingFile;
    use crate::manager::Decision;
    use crate::progress::{ProgressEvent, SendState};
    use crate::sender::RecipientState;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(10);

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    /// 수동 수락이 필요한 요청을 모두 수락
    fn auto_decide(peer: &LoopbackPeer) {
        let handle = peer.handle.clone();
        let mut events = handle.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let ProgressEvent::IncomingRequest {
                    transfer_id,
                    auto_accepted: false,
                    ..
                } = event
                {
                    let _ = handle.decide(transfer_id, Decision::Accept).await;
                }
            }
        });
    }

    async fn wait_for<F>(events: &mut broadcast::Receiver<ProgressEvent>, mut wanted: F) -> ProgressEvent
    where
        F: FnMut(&ProgressEvent) -> bool,
    {
        timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(event) if wanted(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("progress closed"),
                }
            }
        })
        .await
        .unwrap()
    }

    fn pair(hub: &LoopbackHub, config: Config) -> (LoopbackPeer, LoopbackPeer) {
        let sender_dir = MemoryDirectory::new(1).with_target(TargetSelector::Device(2), [2]);
        sender_dir.set_online(2, true);
        let receiver_dir = MemoryDirectory::new(2);
        receiver_dir.allow(1, TargetSelector::Device(2));

        let sender = hub.spawn(config.clone(), sender_dir).unwrap();
        let receiver = hub.spawn(config, receiver_dir).unwrap();
        (sender, receiver)
    }

    #[tokio::test]
    async fn test_transfer_over_direct() {
        let hub = LoopbackHub::new();
        let config = Config {
            fallback_timeout_ms: 5_000,
            ..Config::testing()
        };
        let (sender, mut receiver) = pair(&hub, config);
        auto_decide(&receiver);

        let data = payload(2_000);
        let mut events = sender.handle.subscribe();
        let transfer_id = sender
            .handle
            .initiate_transfer(
                TargetSelector::Device(2),
                vec![OutgoingFile::from_bytes("direct.bin", data.clone())],
            )
            .await
            .unwrap();

        let file = timeout(WAIT, receiver.received.recv()).await.unwrap().unwrap();
        assert_eq!(file.transfer_id, transfer_id);
        assert_eq!(file.from, 1);
        assert_eq!(file.bytes.as_ref(), data.as_slice());

        wait_for(&mut events, |e| {
            matches!(e, ProgressEvent::RecipientChanged { state: RecipientState::Sent, .. })
        })
        .await;
        assert!(hub.direct_frames() > 0);
        assert_eq!(hub.relay_frames(), 0);

        let stats = sender.handle.stats().await.unwrap();
        assert_eq!(stats.chunks_sent, 500);
        assert_eq!(stats.transfers_sent, 1);
    }

    #[tokio::test]
    async fn test_fallback_to_relay() {
        let hub = LoopbackHub::new();
        hub.block_direct();
        let (sender, mut receiver) = pair(&hub, Config::testing());
        auto_decide(&receiver);

        let data = payload(1_000);
        sender
            .handle
            .initiate_transfer(
                TargetSelector::Device(2),
                vec![
                    OutgoingFile::from_bytes("first", data.clone()),
                    OutgoingFile::from_bytes("second", Vec::new()),
                ],
            )
            .await
            .unwrap();

        let first = timeout(WAIT, receiver.received.recv()).await.unwrap().unwrap();
        let second = timeout(WAIT, receiver.received.recv()).await.unwrap().unwrap();
        assert_eq!(first.name, "first");
        assert_eq!(first.bytes.as_ref(), data.as_slice());
        assert_eq!(second.name, "second");
        assert!(second.bytes.is_empty());

        assert_eq!(hub.direct_frames(), 0);
        assert!(hub.relay_frames() > 0);
    }

    #[tokio::test]
    async fn test_offline_device_ready_handshake() {
        let hub = LoopbackHub::new();
        hub.block_direct();
        let group = TargetSelector::Group(5);

        let sender_dir = MemoryDirectory::new(1).with_target(group, [2, 3]);
        sender_dir.set_online(2, true);
        let sender = hub.spawn(Config::testing(), sender_dir).unwrap();

        let mut receivers = Vec::new();
        for id in [2, 3] {
            let dir = MemoryDirectory::new(id);
            dir.allow(1, group);
            receivers.push(hub.spawn(Config::testing(), dir).unwrap());
        }
        auto_decide(&receivers[0]);

        let data = payload(64);
        let mut events = sender.handle.subscribe();
        let transfer_id = sender
            .handle
            .initiate_transfer(group, vec![OutgoingFile::from_bytes("g.txt", data.clone())])
            .await
            .unwrap();

        let online = timeout(WAIT, receivers[0].received.recv()).await.unwrap().unwrap();
        assert_eq!(online.bytes.as_ref(), data.as_slice());
        wait_for(&mut events, |e| {
            matches!(e, ProgressEvent::RecipientChanged { device: 2, state: RecipientState::Sent, .. })
        })
        .await;
        assert_eq!(sender.handle.send_state(&group), SendState::Requesting);

        let notified = sender.notifier.take();
        assert_eq!(notified.len(), 1);
        let (device, notification) = notified.into_iter().next().unwrap();
        assert_eq!(device, 3);
        assert_eq!(notification.transfer_id, transfer_id);

        // 기기 3이 온라인이 되어 알림을 확인
        sender.directory.set_online(3, true);
        let late = &mut receivers[1];
        let mut late_events = late.handle.subscribe();
        late.handle.acknowledge_notification(notification).await.unwrap();

        let file = timeout(WAIT, late.received.recv()).await.unwrap().unwrap();
        assert_eq!(file.bytes.as_ref(), data.as_slice());
        wait_for(&mut late_events, |e| {
            matches!(e, ProgressEvent::IncomingRequest { auto_accepted: true, .. })
        })
        .await;

        wait_for(&mut events, |e| {
            matches!(e, ProgressEvent::RecipientChanged { device: 3, state: RecipientState::Sent, .. })
        })
        .await;
        assert_eq!(sender.handle.stats().await.unwrap().transfers_sent, 1);
    }

    #[tokio::test]
    async fn test_guest_link() {
        let hub = LoopbackHub::new();
        let owner = hub.spawn(Config::testing(), MemoryDirectory::new(1)).unwrap();

        let data = payload(300);
        let transfer_id = owner
            .handle
            .create_guest_link(vec![OutgoingFile::from_bytes("link.dat", data.clone())])
            .await
            .unwrap();

        let mut guest = hub
            .spawn(Config::guest(1, transfer_id), MemoryDirectory::new(-1))
            .unwrap();
        guest.handle.join_guest_link().await.unwrap();

        let file = timeout(WAIT, guest.received.recv()).await.unwrap().unwrap();
        assert_eq!(file.name, "link.dat");
        assert_eq!(file.bytes.as_ref(), data.as_slice());

        // 등록 기기는 게스트 세션에 참가할 수 없음
        assert!(matches!(
            owner.handle.join_guest_link().await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_guest_upload_link() {
        let hub = LoopbackHub::new();
        let mut owner = hub.spawn(Config::testing(), MemoryDirectory::new(1)).unwrap();
        auto_decide(&owner);
        let link = owner.handle.create_guest_upload_link().await.unwrap();

        let guest = hub
            .spawn(Config::guest_upload(1, link), MemoryDirectory::new(-2))
            .unwrap();
        let data = payload(900);
        let transfer_id = guest
            .handle
            .upload_to_guest_link(vec![OutgoingFile::from_bytes("up.bin", data.clone())])
            .await
            .unwrap();

        let file = timeout(WAIT, owner.received.recv()).await.unwrap().unwrap();
        assert_eq!(file.transfer_id, transfer_id);
        assert_eq!(file.from, -2);
        assert_eq!(file.bytes.as_ref(), data.as_slice());

        // 업로드 링크 게스트는 다운로드 참가를 할 수 없음
        assert!(matches!(
            guest.handle.join_guest_link().await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_unread_received_files_do_not_stall_session() {
        let hub = LoopbackHub::new();
        hub.block_direct();
        let (sender, receiver) = pair(&hub, Config::testing());
        auto_decide(&receiver);

        let mut events = receiver.handle.subscribe();
        for name in ["a", "b", "c"] {
            sender
                .handle
                .initiate_transfer(
                    TargetSelector::Device(2),
                    vec![OutgoingFile::from_bytes(name, payload(40))],
                )
                .await
                .unwrap();
        }
        for _ in 0..3 {
            wait_for(&mut events, |e| matches!(e, ProgressEvent::TransferReceived { .. })).await;
        }

        // received를 읽지 않아도 세션은 명령에 응답
        let stats = timeout(Duration::from_secs(2), receiver.handle.stats())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.transfers_received, 3);
        assert_eq!(stats.files_received, 3);
    }

    #[tokio::test]
    async fn test_closing_stale_channel_keeps_newer() {
        let hub = LoopbackHub::new();
        let connector = LoopbackConnector {
            local: 1,
            hub: hub.clone(),
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let stale = connector
            .open(2, false, DirectEvents::new(tx.clone(), 2, 1))
            .await
            .unwrap();
        let fresh = connector
            .open(2, false, DirectEvents::new(tx, 2, 2))
            .await
            .unwrap();

        stale.close();
        assert_eq!(hub.inner.channels.len(), 1);
        fresh.close();
        assert!(hub.inner.channels.is_empty());
    }

    #[tokio::test]
    async fn test_reject_and_state_reset() {
        let hub = LoopbackHub::new();
        hub.block_direct();
        let (sender, receiver) = pair(&hub, Config::testing());

        let handle = receiver.handle.clone();
        let mut incoming = handle.subscribe();
        let mut events = sender.handle.subscribe();
        let transfer_id = sender
            .handle
            .initiate_transfer(
                TargetSelector::Device(2),
                vec![OutgoingFile::from_bytes("no.txt", vec![1u8; 8])],
            )
            .await
            .unwrap();

        wait_for(&mut incoming, |e| matches!(e, ProgressEvent::IncomingRequest { .. })).await;
        handle.decide(transfer_id, Decision::Reject).await.unwrap();

        wait_for(&mut events, |e| {
            matches!(e, ProgressEvent::RecipientChanged { state: RecipientState::Rejected, .. })
        })
        .await;
        let target = TargetSelector::Device(2);
        assert_eq!(sender.handle.send_state(&target), SendState::Rejected);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sender.handle.send_state(&target), SendState::Idle);
    }

    #[tokio::test]
    async fn test_stop_closes_session() {
        let hub = LoopbackHub::new();
        let peer = hub.spawn(Config::testing(), MemoryDirectory::new(1)).unwrap();
        peer.handle.stop().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(peer.handle.stats().await, Err(Error::ChannelClosed)));
    }
}
