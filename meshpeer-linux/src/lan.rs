//! LAN transport: UDP multicast beacons for discovery, one TCP link per connected peer.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use meshpeer_core::wire::frame_len;
use meshpeer_core::{
    decode_frame, encode_frame, ConnectionState, Message, PeerId, PeerIdentity, ResourceProgress, SendMode,
    TransferError, Transport, TransportBinding, TransportError, TransportEvent, PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

/// Multicast group for beacons (same subnet only).
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
/// Beacon interval while advertising.
const BEACON_INTERVAL: Duration = Duration::from_secs(3);
/// Advertiser considered lost after this long without a beacon.
const PEER_TIMEOUT: Duration = Duration::from_secs(12);
/// Resource chunk size on the wire.
const RESOURCE_CHUNK: usize = 64 * 1024;
/// Frames queued per link before sends start failing.
const LINK_BACKLOG: usize = 256;
/// How long a locally closed link may spend writing its `Leave` frame.
const LEAVE_GRACE: Duration = Duration::from_secs(1);

/// Where and how the transport binds.
#[derive(Debug, Clone)]
pub struct LanOptions {
    pub transport_addr: SocketAddr,
    pub discovery_port: u16,
    /// How long an inbound invite waits for the application's decision.
    pub invite_timeout: Duration,
    pub download_dir: PathBuf,
}

struct Advertiser {
    identity: PeerIdentity,
    addr: SocketAddr,
    last_seen: Instant,
    /// Found was delivered; lost is only delivered for reported advertisers.
    reported: bool,
}

struct Link {
    tx: mpsc::Sender<Message>,
}

struct Shared {
    handle: Handle,
    binding: Mutex<Option<TransportBinding>>,
    advertising: AtomicBool,
    browsing: AtomicBool,
    advertisers: Mutex<HashMap<PeerId, Advertiser>>,
    links: Mutex<HashMap<PeerId, Link>>,
    /// Bumped by `disconnect`; every live link closes when it changes.
    disconnects: watch::Sender<u64>,
    discovery: Result<Arc<UdpSocket>, String>,
    discovery_port: u16,
    transport_port: u16,
    invite_timeout: Duration,
    download_dir: PathBuf,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn binding(&self) -> Option<TransportBinding> {
        lock(&self.binding).clone()
    }

    fn deliver(&self, event: TransportEvent) {
        let events = lock(&self.binding)
            .as_ref()
            .and_then(|b| b.events.upgrade());
        if let Some(events) = events {
            events.deliver(event);
        }
    }

    fn state_changed(&self, peer: PeerIdentity, state: ConnectionState) {
        self.deliver(TransportEvent::StateChanged { peer, state });
    }

    fn link_sender(&self, peer: &PeerId) -> Option<mpsc::Sender<Message>> {
        lock(&self.links).get(peer).map(|l| l.tx.clone())
    }
}

/// [`Transport`] over the local network. Must be created inside a tokio runtime.
pub struct LanTransport {
    shared: Arc<Shared>,
}

impl LanTransport {
    /// Bind the TCP listener and the multicast socket, then spawn the background loops.
    /// A multicast failure is not fatal: it surfaces as a start error when discovery is started.
    pub async fn bind(options: LanOptions) -> io::Result<Self> {
        let listener = TcpListener::bind(options.transport_addr).await?;
        let transport_port = listener.local_addr()?.port();
        let discovery = make_multicast_socket(options.discovery_port)
            .map(Arc::new)
            .map_err(|e| e.to_string());
        if let Err(e) = &discovery {
            tracing::warn!(error = %e, "multicast discovery unavailable");
        }
        let shared = Arc::new(Shared {
            handle: Handle::current(),
            binding: Mutex::new(None),
            advertising: AtomicBool::new(false),
            browsing: AtomicBool::new(false),
            advertisers: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            disconnects: watch::channel(0).0,
            discovery,
            discovery_port: options.discovery_port,
            transport_port,
            invite_timeout: options.invite_timeout,
            download_dir: options.download_dir,
        });

        tokio::spawn(accept_loop(shared.clone(), listener));
        if let Ok(socket) = &shared.discovery {
            tokio::spawn(beacon_loop(shared.clone(), socket.clone()));
            tokio::spawn(recv_loop(shared.clone(), socket.clone()));
            tokio::spawn(expiry_loop(shared.clone()));
        }
        tracing::info!(port = transport_port, "lan transport listening");
        Ok(Self { shared })
    }

    pub fn transport_port(&self) -> u16 {
        self.shared.transport_port
    }

    #[cfg(test)]
    fn remember_advertiser(&self, identity: PeerIdentity, addr: SocketAddr) {
        lock(&self.shared.advertisers).insert(
            identity.id(),
            Advertiser {
                identity,
                addr,
                last_seen: Instant::now(),
                reported: true,
            },
        );
    }
}

impl Transport for LanTransport {
    fn attach(&self, binding: TransportBinding) {
        *lock(&self.shared.binding) = Some(binding);
    }

    fn start_advertising(&self) {
        if let Err(e) = &self.shared.discovery {
            self.shared
                .deliver(TransportEvent::AdvertisingFailed(e.clone()));
            return;
        }
        self.shared.advertising.store(true, Ordering::Release);
    }

    fn stop_advertising(&self) {
        if !self.shared.advertising.swap(false, Ordering::AcqRel) {
            return;
        }
        let (Ok(socket), Some(binding)) = (&self.shared.discovery, self.shared.binding()) else {
            return;
        };
        let socket = socket.clone();
        let dest = SocketAddr::from((MULTICAST_GROUP, self.shared.discovery_port));
        let goodbye = Message::Goodbye {
            service_type: binding.service_type,
            peer: binding.local,
        };
        self.shared.handle.spawn(async move {
            if let Ok(frame) = encode_frame(&goodbye) {
                let _ = socket.send_to(&frame, dest).await;
            }
        });
    }

    fn start_browsing(&self) {
        if let Err(e) = &self.shared.discovery {
            self.shared
                .deliver(TransportEvent::BrowsingFailed(e.clone()));
            return;
        }
        self.shared.browsing.store(true, Ordering::Release);
    }

    fn stop_browsing(&self) {
        // Addresses stay until lost or expiry so already-visible peers remain invitable.
        self.shared.browsing.store(false, Ordering::Release);
    }

    fn invite_peer(&self, peer: &PeerIdentity, context: Option<&[u8]>, timeout: Duration) {
        let addr = lock(&self.shared.advertisers)
            .get(&peer.id())
            .map(|a| a.addr);
        let Some(addr) = addr else {
            tracing::debug!(%peer, "invite to a peer that is not advertising");
            self.shared
                .state_changed(peer.clone(), ConnectionState::NotConnected);
            return;
        };
        self.shared.handle.spawn(dial(
            self.shared.clone(),
            peer.clone(),
            addr,
            context.map(<[u8]>::to_vec),
            timeout,
        ));
    }

    fn disconnect(&self) {
        lock(&self.shared.links).clear();
        self.shared.disconnects.send_modify(|n| *n += 1);
    }

    fn send(&self, payload: &[u8], peers: &[PeerIdentity], _mode: SendMode) -> Result<(), TransportError> {
        // Unreliable sends share the link; TCP only strengthens the guarantee.
        let senders = {
            let links = lock(&self.shared.links);
            peers
                .iter()
                .map(|p| {
                    links
                        .get(&p.id())
                        .map(|l| l.tx.clone())
                        .ok_or_else(|| TransportError::SendFailed(format!("no link to {p}")))
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        for tx in senders {
            tx.try_send(Message::Data {
                payload: payload.to_vec(),
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => TransportError::SendFailed("link backlog full".into()),
                TrySendError::Closed(_) => TransportError::ChannelClosed,
            })?;
        }
        Ok(())
    }

    fn send_resource(
        &self,
        path: &Path,
        name: &str,
        peer: &PeerIdentity,
        progress: ResourceProgress,
    ) -> Result<(), TransportError> {
        let tx = self
            .shared
            .link_sender(&peer.id())
            .ok_or_else(|| TransportError::SendFailed(format!("no link to {peer}")))?;
        std::fs::metadata(path).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let path = path.to_path_buf();
        let name = name.to_string();
        let peer = peer.clone();
        self.shared.handle.spawn(async move {
            if let Err(e) = stream_resource(&tx, &path, &name, &progress).await {
                tracing::warn!(%peer, %name, error = %e, "resource send aborted");
                let _ = tx
                    .send(Message::ResourceAbort {
                        name,
                        reason: e.to_string(),
                    })
                    .await;
            }
        });
        Ok(())
    }
}

fn make_multicast_socket(discovery_port: u16) -> io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn beacon_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let dest = SocketAddr::from((MULTICAST_GROUP, shared.discovery_port));
    let mut ticker = tokio::time::interval(BEACON_INTERVAL);
    loop {
        ticker.tick().await;
        if !shared.advertising.load(Ordering::Acquire) {
            continue;
        }
        let Some(binding) = shared.binding() else {
            continue;
        };
        let beacon = Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            service_type: binding.service_type,
            peer: binding.local,
            info: binding.discovery_info,
            listen_port: shared.transport_port,
        };
        let frame = match encode_frame(&beacon) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "beacon does not fit in a frame");
                continue;
            }
        };
        if let Err(e) = socket.send_to(&frame, dest).await {
            if shared.advertising.swap(false, Ordering::AcqRel) {
                shared.deliver(TransportEvent::AdvertisingFailed(e.to_string()));
            }
        }
    }
}

async fn recv_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                tracing::warn!(error = %e, "multicast receive failed");
                if shared.browsing.swap(false, Ordering::AcqRel) {
                    shared.deliver(TransportEvent::BrowsingFailed(e.to_string()));
                }
                tokio::time::sleep(BEACON_INTERVAL).await;
                continue;
            }
        };
        let Ok((msg, _)) = decode_frame(&buf[..n]) else {
            continue;
        };
        let Some(binding) = shared.binding() else {
            continue;
        };
        match msg {
            Message::Beacon {
                protocol_version,
                service_type,
                peer,
                info,
                listen_port,
            } => {
                if protocol_version != PROTOCOL_VERSION
                    || service_type != binding.service_type
                    || peer == binding.local
                {
                    continue;
                }
                let browsing = shared.browsing.load(Ordering::Acquire);
                let report = {
                    let mut ads = lock(&shared.advertisers);
                    let ad = ads.entry(peer.id()).or_insert_with(|| Advertiser {
                        identity: peer.clone(),
                        addr: SocketAddr::new(from.ip(), listen_port),
                        last_seen: Instant::now(),
                        reported: false,
                    });
                    ad.identity = peer.clone();
                    ad.addr = SocketAddr::new(from.ip(), listen_port);
                    ad.last_seen = Instant::now();
                    let report = browsing && !ad.reported;
                    ad.reported |= report;
                    report
                };
                if report {
                    shared.deliver(TransportEvent::PeerFound { peer, info });
                }
            }
            Message::Goodbye { service_type, peer } => {
                if service_type != binding.service_type {
                    continue;
                }
                let removed = lock(&shared.advertisers).remove(&peer.id());
                if removed.is_some_and(|a| a.reported) {
                    shared.deliver(TransportEvent::PeerLost { peer });
                }
            }
            _ => {}
        }
    }
}

async fn expiry_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(BEACON_INTERVAL);
    loop {
        ticker.tick().await;
        let now = Instant::now();
        let lost: Vec<PeerIdentity> = {
            let mut ads = lock(&shared.advertisers);
            let overdue: Vec<PeerId> = ads
                .iter()
                .filter(|(_, a)| now.duration_since(a.last_seen) >= PEER_TIMEOUT)
                .map(|(id, _)| *id)
                .collect();
            overdue
                .iter()
                .filter_map(|id| ads.remove(id))
                .filter(|a| a.reported)
                .map(|a| a.identity)
                .collect()
        };
        for peer in lost {
            shared.deliver(TransportEvent::PeerLost { peer });
        }
    }
}

fn invalid_data<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}

async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Message> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = frame_len(&header).map_err(invalid_data)?;
    let mut frame = vec![0u8; header.len() + len];
    frame[..header.len()].copy_from_slice(&header);
    reader.read_exact(&mut frame[header.len()..]).await?;
    let (msg, _) = decode_frame(&frame).map_err(invalid_data)?;
    Ok(msg)
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> io::Result<()> {
    let frame = encode_frame(msg).map_err(invalid_data)?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_inbound(shared, stream).await {
                        tracing::debug!(%addr, error = %e, "inbound link ended");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed; no more inbound invitations");
                break;
            }
        }
    }
}

/// Invitee side: read the invite, ask the application, answer, then run the link.
async fn handle_inbound(shared: Arc<Shared>, mut stream: TcpStream) -> io::Result<()> {
    let first = tokio::time::timeout(shared.invite_timeout, read_message(&mut stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no invite received"))??;
    let Message::Invite { peer, context } = first else {
        return Err(invalid_data("expected invite"));
    };
    let (tx, rx) = oneshot::channel();
    shared.deliver(TransportEvent::InvitationReceived {
        from: peer.clone(),
        context,
        respond: Box::new(move |accepted: bool| {
            let _ = tx.send(accepted);
        }),
    });
    // A dropped or late decision counts as a decline.
    let accepted = matches!(
        tokio::time::timeout(shared.invite_timeout, rx).await,
        Ok(Ok(true))
    );
    write_message(&mut stream, &Message::InviteResponse { accepted }).await?;
    if accepted {
        run_link(shared, stream, peer).await;
    }
    Ok(())
}

/// Inviter side of the handshake. `None` when the invitee declined.
async fn handshake(addr: SocketAddr, local: PeerIdentity, context: Option<Vec<u8>>) -> io::Result<Option<TcpStream>> {
    let mut stream = TcpStream::connect(addr).await?;
    write_message(&mut stream, &Message::Invite { peer: local, context }).await?;
    match read_message(&mut stream).await? {
        Message::InviteResponse { accepted: true } => Ok(Some(stream)),
        Message::InviteResponse { accepted: false } => Ok(None),
        _ => Err(invalid_data("expected invite response")),
    }
}

/// Connect and invite; the answer must arrive within `timeout`.
async fn dial(
    shared: Arc<Shared>,
    peer: PeerIdentity,
    addr: SocketAddr,
    context: Option<Vec<u8>>,
    timeout: Duration,
) {
    let Some(local) = shared.binding().map(|b| b.local) else {
        return;
    };
    match tokio::time::timeout(timeout, handshake(addr, local, context)).await {
        Ok(Ok(Some(stream))) => run_link(shared, stream, peer).await,
        Ok(Ok(None)) => {
            tracing::debug!(%peer, "invitation declined");
            shared.state_changed(peer, ConnectionState::NotConnected);
        }
        Ok(Err(e)) => {
            tracing::debug!(%peer, error = %e, "invitation failed");
            shared.state_changed(peer, ConnectionState::NotConnected);
        }
        Err(_) => {
            tracing::debug!(%peer, "invitation timed out");
            shared.state_changed(peer, ConnectionState::NotConnected);
        }
    }
}

/// Inbound resource being written to disk.
struct Incoming {
    path: PathBuf,
    file: tokio::fs::File,
    progress: ResourceProgress,
    written: u64,
}

impl Incoming {
    async fn create(dir: &Path, total: u64) -> io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(PeerId::generate().to_string());
        let file = tokio::fs::File::create(&path).await?;
        Ok(Self {
            path,
            file,
            progress: ResourceProgress::new(total),
            written: 0,
        })
    }

    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes).await?;
        self.written += bytes.len() as u64;
        self.progress.advance_to(self.written);
        Ok(())
    }

    async fn finish(mut self) -> Result<PathBuf, TransferError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(self.path)
    }

    async fn discard(self) {
        drop(self.file);
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

/// Connected link: register, report Connected, pump frames until either side leaves or `disconnect` fires.
async fn run_link(shared: Arc<Shared>, stream: TcpStream, peer: PeerIdentity) {
    let mut closing = shared.disconnects.subscribe();
    let mut writer_closing = shared.disconnects.subscribe();
    let (tx, mut rx) = mpsc::channel::<Message>(LINK_BACKLOG);
    lock(&shared.links).insert(peer.id(), Link { tx: tx.clone() });
    shared.state_changed(peer.clone(), ConnectionState::Connected);

    let (mut reader, mut writer) = stream.into_split();
    let mut writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = writer_closing.changed() => {
                    let _ = write_message(&mut writer, &Message::Leave).await;
                    break;
                }
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        if write_message(&mut writer, &msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut incoming: HashMap<String, Incoming> = HashMap::new();
    let mut closed_locally = false;
    loop {
        let msg = tokio::select! {
            res = read_message(&mut reader) => match res {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "link closed");
                    break;
                }
            },
            _ = closing.changed() => {
                tracing::debug!(%peer, "link closed locally");
                closed_locally = true;
                break;
            }
        };
        match msg {
            Message::Data { payload } => shared.deliver(TransportEvent::DataReceived {
                from: peer.clone(),
                payload,
            }),
            Message::ResourceStart { name, total } => {
                match Incoming::create(&shared.download_dir, total).await {
                    Ok(inc) => {
                        shared.deliver(TransportEvent::ResourceStarted {
                            from: peer.clone(),
                            name: name.clone(),
                            progress: inc.progress.clone(),
                        });
                        incoming.insert(name, inc);
                    }
                    Err(e) => shared.deliver(TransportEvent::ResourceFinished {
                        from: peer.clone(),
                        name,
                        result: Err(e.into()),
                    }),
                }
            }
            Message::ResourceChunk { name, bytes } => {
                let Some(inc) = incoming.get_mut(&name) else {
                    continue;
                };
                match inc.write(&bytes).await {
                    Ok(()) => {
                        let completed = inc.written;
                        shared.deliver(TransportEvent::ResourceProgressed {
                            from: peer.clone(),
                            name,
                            completed,
                        });
                    }
                    Err(e) => {
                        if let Some(inc) = incoming.remove(&name) {
                            inc.discard().await;
                        }
                        shared.deliver(TransportEvent::ResourceFinished {
                            from: peer.clone(),
                            name,
                            result: Err(e.into()),
                        });
                    }
                }
            }
            Message::ResourceEnd { name } => {
                if let Some(inc) = incoming.remove(&name) {
                    let result = inc.finish().await;
                    shared.deliver(TransportEvent::ResourceFinished {
                        from: peer.clone(),
                        name,
                        result,
                    });
                }
            }
            Message::ResourceAbort { name, reason } => {
                if let Some(inc) = incoming.remove(&name) {
                    inc.discard().await;
                }
                shared.deliver(TransportEvent::ResourceFinished {
                    from: peer.clone(),
                    name,
                    result: Err(TransferError::Other(reason)),
                });
            }
            Message::Leave => break,
            _ => tracing::debug!(%peer, "unexpected frame on link"),
        }
    }

    // A newer link for the same peer owns the connection state from here on.
    let displaced = {
        let mut links = lock(&shared.links);
        match links.get(&peer.id()).map(|l| l.tx.same_channel(&tx)) {
            Some(true) => {
                links.remove(&peer.id());
                false
            }
            Some(false) => true,
            None => false,
        }
    };
    drop(tx);
    // A stalled remote must not hold the link open; the grace only bounds the Leave write.
    if !closed_locally || tokio::time::timeout(LEAVE_GRACE, &mut writer_task).await.is_err() {
        writer_task.abort();
    }
    for (name, inc) in incoming.drain() {
        inc.discard().await;
        shared.deliver(TransportEvent::ResourceFinished {
            from: peer.clone(),
            name,
            result: Err(TransferError::PeerDisconnected),
        });
    }
    if displaced {
        tracing::debug!(%peer, "superseded link ended");
    } else {
        shared.state_changed(peer, ConnectionState::NotConnected);
    }
}

async fn stream_resource(
    tx: &mpsc::Sender<Message>,
    path: &Path,
    name: &str,
    progress: &ResourceProgress,
) -> io::Result<()> {
    let closed = || io::Error::new(io::ErrorKind::BrokenPipe, "link closed");
    let mut file = tokio::fs::File::open(path).await?;
    let total = file.metadata().await?.len();
    progress.set_total(total);
    tx.send(Message::ResourceStart {
        name: name.to_string(),
        total,
    })
    .await
    .map_err(|_| closed())?;

    let mut buf = vec![0u8; RESOURCE_CHUNK];
    let mut sent = 0u64;
    loop {
        if progress.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
        }
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        tx.send(Message::ResourceChunk {
            name: name.to_string(),
            bytes: buf[..n].to_vec(),
        })
        .await
        .map_err(|_| closed())?;
        sent += n as u64;
        progress.advance_to(sent);
    }
    tx.send(Message::ResourceEnd {
        name: name.to_string(),
    })
    .await
    .map_err(|_| closed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshpeer_core::{DiscoveryInfo, EventSink, InvitationDecision, Role, SessionConfig, SessionManager};
    use std::path::Path as StdPath;

    #[derive(Default)]
    struct TestSink {
        accept: bool,
        data: Mutex<Vec<(PeerIdentity, Vec<u8>)>>,
        finished: Mutex<Vec<(String, Result<PathBuf, TransferError>)>>,
    }

    impl EventSink for TestSink {
        fn found_peer(&self, _peer: &PeerIdentity, _info: Option<&DiscoveryInfo>) {}
        fn lost_peer(&self, _peer: &PeerIdentity) {}

        fn received_invite(&self, _from: &PeerIdentity, _context: Option<&[u8]>, decision: InvitationDecision) {
            let _ = decision.decide(self.accept);
        }

        fn did_receive_data(&self, data: &[u8], from: &PeerIdentity) {
            lock(&self.data).push((from.clone(), data.to_vec()));
        }

        fn did_finish_receiving_resource(
            &self,
            name: &str,
            _from: &PeerIdentity,
            result: Result<&StdPath, &TransferError>,
        ) {
            let result = result.map(StdPath::to_path_buf).map_err(Clone::clone);
            lock(&self.finished).push((name.to_string(), result));
        }
    }

    fn options(dir: &StdPath) -> LanOptions {
        LanOptions {
            transport_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            discovery_port: 0,
            invite_timeout: Duration::from_secs(5),
            download_dir: dir.to_path_buf(),
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..250 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    async fn solo(name: &str, accept: bool, dir: &StdPath) -> (Arc<SessionManager<LanTransport>>, Arc<TestSink>) {
        let sink = Arc::new(TestSink {
            accept,
            ..TestSink::default()
        });
        let transport = LanTransport::bind(options(dir)).await.unwrap();
        let manager = SessionManager::new(SessionConfig::new("lan-test", name), transport, sink.clone()).unwrap();
        (manager, sink)
    }

    fn listen_addr(manager: &SessionManager<LanTransport>) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, manager.transport().transport_port()))
    }

    async fn pair(
        b_accepts: bool,
        dir: &StdPath,
    ) -> (
        Arc<SessionManager<LanTransport>>,
        Arc<SessionManager<LanTransport>>,
        Arc<TestSink>,
    ) {
        let (a, _) = solo("A", false, dir).await;
        let (b, b_sink) = solo("B", b_accepts, dir).await;
        a.transport()
            .remember_advertiser(b.local_peer().clone(), listen_addr(&b));
        (a, b, b_sink)
    }

    /// Hand-driven remote: invite `addr` as `me` and return the accepted stream.
    async fn raw_invite(addr: SocketAddr, me: &PeerIdentity) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message(
            &mut stream,
            &Message::Invite {
                peer: me.clone(),
                context: None,
            },
        )
        .await
        .unwrap();
        match read_message(&mut stream).await.unwrap() {
            Message::InviteResponse { accepted: true } => stream,
            other => panic!("invite not accepted: {other:?}"),
        }
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("meshpeer-lan-{}", PeerId::generate()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invite_send_and_disconnect() {
        let dir = temp_dir();
        let (a, b, b_sink) = pair(true, &dir).await;

        a.invite(b.local_peer());
        wait_until(|| a.is_connected(b.local_peer()) && b.is_connected(a.local_peer())).await;

        a.send_to_all(b"ping").unwrap();
        wait_until(|| !lock(&b_sink.data).is_empty()).await;
        assert_eq!(
            lock(&b_sink.data)[0],
            (a.local_peer().clone(), b"ping".to_vec())
        );

        a.stop(Role::AllConnections);
        wait_until(|| !b.is_connected(a.local_peer()) && !a.is_connected(b.local_peer())).await;
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn declined_invite_never_connects() {
        let dir = temp_dir();
        let (a, b, _) = pair(false, &dir).await;
        a.invite(b.local_peer());
        wait_until(|| a.connection_state(b.local_peer()) == ConnectionState::NotConnected).await;
        assert_eq!(b.num_connected(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invite_unknown_peer_reports_not_connected() {
        let dir = temp_dir();
        let (a, _, _) = pair(true, &dir).await;
        let stranger = PeerIdentity::new("stranger");
        a.invite(&stranger);
        assert_eq!(a.connection_state(&stranger), ConnectionState::NotConnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resource_lands_on_disk() {
        let dir = temp_dir();
        let (a, b, b_sink) = pair(true, &dir.join("in")).await;
        a.invite(b.local_peer());
        wait_until(|| a.is_connected(b.local_peer())).await;

        std::fs::create_dir_all(&dir).unwrap();
        let src = dir.join("big.bin");
        let content: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        std::fs::write(&src, &content).unwrap();

        let progress = a.send_resource(&src, "big.bin", b.local_peer()).unwrap();
        wait_until(|| !lock(&b_sink.finished).is_empty()).await;
        let (name, result) = lock(&b_sink.finished)[0].clone();
        assert_eq!(name, "big.bin");
        assert_eq!(std::fs::read(result.unwrap()).unwrap(), content);
        assert_eq!(progress.completed(), content.len() as u64);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_closes_link_to_a_stalled_peer() {
        let dir = temp_dir();
        let (a, _) = solo("A", false, &dir.join("in")).await;
        let stalled = PeerIdentity::new("stalled");
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        a.transport()
            .remember_advertiser(stalled.clone(), listener.local_addr().unwrap());
        let remote = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _invite = read_message(&mut stream).await.unwrap();
            write_message(&mut stream, &Message::InviteResponse { accepted: true })
                .await
                .unwrap();
            // Never reads again, so the link's queue and socket buffers fill up.
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(stream);
        });

        a.invite(&stalled);
        wait_until(|| a.is_connected(&stalled)).await;

        std::fs::create_dir_all(&dir).unwrap();
        let src = dir.join("huge.bin");
        std::fs::write(&src, vec![0u8; 25 * 1024 * 1024]).unwrap();
        a.send_resource(&src, "huge.bin", &stalled).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        a.stop(Role::AllConnections);
        wait_until(|| !a.is_connected(&stalled)).await;
        assert_eq!(a.num_connected(), 0);
        assert!(a
            .send(b"late", std::slice::from_ref(&stalled))
            .is_err());
        remote.abort();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_link_fails_half_received_resource() {
        let dir = temp_dir();
        let (b, b_sink) = solo("B", true, &dir).await;
        let sender = PeerIdentity::new("sender");
        let mut stream = raw_invite(listen_addr(&b), &sender).await;
        wait_until(|| b.is_connected(&sender)).await;

        write_message(
            &mut stream,
            &Message::ResourceStart {
                name: "half.bin".into(),
                total: 1000,
            },
        )
        .await
        .unwrap();
        write_message(
            &mut stream,
            &Message::ResourceChunk {
                name: "half.bin".into(),
                bytes: vec![7; 100],
            },
        )
        .await
        .unwrap();
        wait_until(|| {
            b.transfer(&sender, "half.bin")
                .is_some_and(|r| r.progress.completed() == 100)
        })
        .await;

        drop(stream);
        wait_until(|| !lock(&b_sink.finished).is_empty()).await;
        assert_eq!(
            lock(&b_sink.finished)[0],
            ("half.bin".to_string(), Err(TransferError::PeerDisconnected))
        );
        wait_until(|| !b.is_connected(&sender)).await;
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn visible_peer_stays_invitable_after_browsing_stops() {
        let dir = temp_dir();
        let (a, b, _) = pair(true, &dir).await;
        a.transport().stop_browsing();
        a.invite(b.local_peer());
        wait_until(|| a.is_connected(b.local_peer()) && b.is_connected(a.local_peer())).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn superseded_link_ending_keeps_peer_connected() {
        let dir = temp_dir();
        let (a, a_sink) = solo("A", true, &dir).await;
        let twin = PeerIdentity::new("twin");
        let first = raw_invite(listen_addr(&a), &twin).await;
        wait_until(|| a.is_connected(&twin)).await;

        let mut second = raw_invite(listen_addr(&a), &twin).await;
        write_message(
            &mut second,
            &Message::Data {
                payload: b"via second".to_vec(),
            },
        )
        .await
        .unwrap();
        wait_until(|| lock(&a_sink.data).iter().any(|(_, d)| d == b"via second")).await;

        drop(first);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(a.is_connected(&twin));

        a.send_to_all(b"still here").unwrap();
        match read_message(&mut second).await.unwrap() {
            Message::Data { payload } => assert_eq!(payload, b"still here"),
            other => panic!("expected data, got {other:?}"),
        }
    }
}
