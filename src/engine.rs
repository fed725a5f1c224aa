use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{AnswerCache, CacheKey};
use crate::codec;
use crate::config::Settings;

/// Wake at least this often when nothing has a deadline.
const IDLE_WAKE: Duration = Duration::from_secs(60);

/// 内部事件队列长度 / internal event queue depth
const EVENT_QUEUE: usize = 1024;

/// The four listening sockets inherited from the monitor.
pub struct Listeners {
    pub udp4: UdpSocket,
    pub udp6: UdpSocket,
    pub tcp4: TcpListener,
    pub tcp6: TcpListener,
}

/// Messages flowing from spawned I/O tasks back into the event loop. Tasks
/// never touch engine state themselves; all mutation happens here.
#[derive(Debug)]
pub enum Event {
    /// Datagram received on a request's upstream socket.
    Upstream { req_id: u64, datagram: Bytes },
    /// A TCP relay task ran to completion.
    TcpClosed { req_id: u64 },
}

/// One outstanding client query awaiting an upstream answer.
struct Request {
    client: SocketAddr,
    /// Which UDP listener the query arrived on, for the reply.
    v6: bool,
    is_tcp: bool,
    client_id: u16,
    /// Original (uncased) question name bytes as the client sent them.
    client_qname: Option<Vec<u8>>,
    /// Randomized tokens a response must echo to be accepted.
    outbound_id: u16,
    outbound_qname: Option<Vec<u8>>,
    /// Cache entry awaiting commit; moved into the cache at most once, and
    /// only after a validated response.
    pending_key: Option<CacheKey>,
    deadline: Instant,
    /// Upstream reader or TCP relay task, aborted when the request dies.
    task: JoinHandle<()>,
}

/// 单线程事件循环的共享属主：缓存、在途请求、计数器全部归它所有
/// The single owner of all mutable proxy state. Runs inside one task on a
/// current-thread runtime; no locks, no atomics, no partially observable
/// state between two readiness waits.
pub struct Engine {
    settings: Settings,
    upstream: SocketAddr,
    listeners: Listeners,
    cache: AnswerCache,
    requests: FxHashMap<u64, Request>,
    /// Creation-ordered request ids; creation order approximates deadline
    /// order because the deadline offset is fixed. Ids already destroyed
    /// elsewhere are skipped lazily.
    fifo: VecDeque<u64>,
    next_req_id: u64,
    /// Lifetime client connection count (UDP queries plus TCP accepts).
    connections: u64,
    rng: SmallRng,
    events_tx: mpsc::Sender<Event>,
    accept_paused_until: Option<Instant>,
}

impl Engine {
    pub fn new(
        listeners: Listeners,
        upstream: SocketAddr,
        settings: Settings,
    ) -> (Self, mpsc::Receiver<Event>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let cache = AnswerCache::new(
            settings.max_cache_entries,
            Duration::from_secs(settings.ttl_ceiling_secs),
        );
        let engine = Self {
            settings,
            upstream,
            listeners,
            cache,
            requests: FxHashMap::default(),
            fifo: VecDeque::new(),
            next_req_id: 1,
            connections: 0,
            rng: SmallRng::from_entropy(),
            events_tx,
            accept_paused_until: None,
        };
        (engine, events_rx)
    }

    /// Run until a reload or terminate signal. One multiplexed wait per
    /// iteration, one handler per ready event, then the eviction and
    /// deadline sweeps.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) -> Result<()> {
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut stats =
            tokio::time::interval(Duration::from_secs(self.settings.stats_interval_secs.max(1)));
        stats.tick().await; // skip the immediate first tick

        let mut buf4 = [0u8; codec::MAX_MSG];
        let mut buf6 = [0u8; codec::MAX_MSG];

        info!(upstream = %self.upstream, "event loop started");

        enum Step {
            Udp4(io::Result<(usize, SocketAddr)>),
            Udp6(io::Result<(usize, SocketAddr)>),
            Tcp(io::Result<(TcpStream, SocketAddr)>),
            Internal(Option<Event>),
            Reload,
            Stats,
            Terminate,
            Timer,
        }

        loop {
            let now = Instant::now();
            let wake_at = self.next_wake(now);
            let accepting = !self.accepting_paused(now);

            let step = tokio::select! {
                r = self.listeners.udp4.recv_from(&mut buf4) => Step::Udp4(r),
                r = self.listeners.udp6.recv_from(&mut buf6) => Step::Udp6(r),
                r = self.listeners.tcp4.accept(), if accepting => Step::Tcp(r),
                r = self.listeners.tcp6.accept(), if accepting => Step::Tcp(r),
                ev = events.recv() => Step::Internal(ev),
                _ = sighup.recv() => Step::Reload,
                _ = sigusr1.recv() => Step::Stats,
                _ = stats.tick() => Step::Stats,
                _ = sigterm.recv() => Step::Terminate,
                _ = tokio::time::sleep_until(wake_at.into()) => Step::Timer,
            };

            let now = Instant::now();
            match step {
                Step::Udp4(Ok((len, peer))) => {
                    self.on_client_query(&buf4[..len], peer, false, now).await;
                }
                Step::Udp6(Ok((len, peer))) => {
                    self.on_client_query(&buf6[..len], peer, true, now).await;
                }
                Step::Udp4(Err(err)) | Step::Udp6(Err(err)) => {
                    debug!(error = %err, "udp recv error");
                }
                Step::Tcp(Ok((stream, peer))) => self.on_tcp_accept(stream, peer, now),
                Step::Tcp(Err(err)) => self.on_accept_error(err, now),
                Step::Internal(Some(ev)) => self.on_event(ev, now).await,
                // the engine holds a sender, so the channel cannot drain shut
                Step::Internal(None) => {}
                Step::Reload => {
                    info!("reload signal, exiting for restart");
                    return Ok(());
                }
                Step::Terminate => {
                    info!("terminate signal, exiting");
                    return Ok(());
                }
                Step::Stats => self.log_stats(),
                Step::Timer => {}
            }

            // soft-timer work runs every iteration regardless of what woke us
            let now = Instant::now();
            self.cache.evict_expired(now);
            self.cache.evict_over_capacity();
            self.sweep_deadlines(now);
        }
    }

    /// min(soonest request deadline, soonest cache expiry, accept resume),
    /// clamped to at least one second so a busy proxy cannot spin on the
    /// timer while backpressure is active.
    fn next_wake(&mut self, now: Instant) -> Instant {
        while let Some(id) = self.fifo.front() {
            if self.requests.contains_key(id) {
                break;
            }
            self.fifo.pop_front();
        }
        let mut soonest = self
            .fifo
            .front()
            .and_then(|id| self.requests.get(id))
            .map(|r| r.deadline);
        for t in [self.cache.next_expiry(), self.accept_paused_until] {
            soonest = match (soonest, t) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        match soonest {
            Some(t) => t.max(now + Duration::from_secs(1)),
            None => now + IDLE_WAKE,
        }
    }

    fn accepting_paused(&mut self, now: Instant) -> bool {
        match self.accept_paused_until {
            Some(t) if now < t => true,
            Some(_) => {
                self.accept_paused_until = None;
                info!("tcp accept resumed");
                false
            }
            None => false,
        }
    }

    /// Descriptor exhaustion pauses the TCP listeners for a bounded window
    /// instead of retrying a failing accept immediately.
    fn on_accept_error(&mut self, err: io::Error, now: Instant) {
        if matches!(
            err.raw_os_error(),
            Some(libc::EMFILE) | Some(libc::ENFILE)
        ) {
            let window = Duration::from_millis(self.settings.accept_backoff_ms);
            self.accept_paused_until = Some(now + window);
            warn!(
                error = %err,
                backoff_ms = self.settings.accept_backoff_ms,
                "accept failed, tcp listeners paused"
            );
        } else {
            debug!(error = %err, "accept error");
        }
    }

    /// 客户端查询入口：缓存命中直接改写返回，未命中则转发上游
    /// Client query entry: parse, try the cache, otherwise forward.
    async fn on_client_query(&mut self, raw: &[u8], peer: SocketAddr, v6: bool, now: Instant) {
        // malformed input is dropped, never answered
        let Some(info) = codec::parse_minimal(raw) else {
            debug!(client = %peer, "dropping unparseable query");
            return;
        };
        self.connections += 1;

        // only clean single-question messages are cacheable
        let key = info
            .has_question()
            .then(|| CacheKey::new(raw, info.qname.clone()));
        if let Some(key) = &key {
            if let Some(answer) = self.cache.lookup(key, now) {
                let mut resp = answer.to_vec();
                codec::rewrite_for_client(&mut resp, info.id, info.qname_bytes(raw));
                self.reply_udp(&resp, peer, v6).await;
                return;
            }
        }

        if self.requests.len() >= self.settings.max_requests {
            self.shed_oldest();
        }

        let out = codec::prepare_outbound(&mut self.rng, raw, &info);

        let bind_addr = if self.upstream.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let sock = match UdpSocket::bind(bind_addr).await {
            Ok(sock) => sock,
            Err(err) => {
                warn!(error = %err, "upstream socket bind failed, dropping query");
                return;
            }
        };
        if let Err(err) = sock.connect(self.upstream).await {
            self.upstream_unreachable(err, raw, peer, v6).await;
            return;
        }
        if let Err(err) = sock.send(&out.packet).await {
            self.upstream_unreachable(err, raw, peer, v6).await;
            return;
        }

        let req_id = self.next_req_id;
        self.next_req_id += 1;

        // the reader owns the upstream socket and only ships datagrams back;
        // invalid ones are ignored here and it keeps reading
        let tx = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; codec::MAX_MSG];
            loop {
                match sock.recv(&mut buf).await {
                    Ok(len) => {
                        let datagram = Bytes::copy_from_slice(&buf[..len]);
                        if tx.send(Event::Upstream { req_id, datagram }).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        self.requests.insert(
            req_id,
            Request {
                client: peer,
                v6,
                is_tcp: false,
                client_id: info.id,
                client_qname: info.qname_bytes(raw).map(|b| b.to_vec()),
                outbound_id: out.id,
                outbound_qname: out.qname,
                pending_key: key,
                deadline: now + Duration::from_secs(self.settings.request_timeout_secs),
                task,
            },
        );
        self.fifo.push_back(req_id);
    }

    /// Taxonomy of connect-time failures: an unusable local/remote pairing
    /// is answered with SERVFAIL, everything else is dropped and left to
    /// the client's own timeout.
    async fn upstream_unreachable(
        &mut self,
        err: io::Error,
        raw: &[u8],
        peer: SocketAddr,
        v6: bool,
    ) {
        if err.kind() == io::ErrorKind::AddrNotAvailable {
            if let Some(pkt) = codec::make_servfail(raw) {
                self.reply_udp(&pkt, peer, v6).await;
            }
            warn!(error = %err, upstream = %self.upstream, "upstream unreachable, servfail sent");
        } else {
            debug!(error = %err, "upstream send failed, dropping query");
        }
    }

    async fn on_event(&mut self, ev: Event, now: Instant) {
        match ev {
            Event::Upstream { req_id, datagram } => {
                self.on_upstream_datagram(req_id, datagram, now).await;
            }
            Event::TcpClosed { req_id } => self.destroy_request(req_id, "tcp closed"),
        }
    }

    /// A datagram arrived on a request's upstream socket. Reject anything
    /// that does not echo both anti-spoofing tokens; the request keeps
    /// waiting for a correct answer until its deadline.
    async fn on_upstream_datagram(&mut self, req_id: u64, datagram: Bytes, now: Instant) {
        let Some(req) = self.requests.get(&req_id) else {
            return;
        };
        if !codec::validate_inbound(&datagram, req.outbound_id, req.outbound_qname.as_deref()) {
            debug!(req_id, "response failed validation, ignored");
            return;
        }
        let Some(mut req) = self.requests.remove(&req_id) else {
            return;
        };

        let mut resp = datagram.to_vec();
        codec::rewrite_for_client(&mut resp, req.client_id, req.client_qname.as_deref());
        self.reply_udp(&resp, req.client, req.v6).await;

        // ownership of the pending entry moves into the cache, exactly once
        if let Some(cache_key) = req.pending_key.take() {
            let ttl = codec::min_answer_ttl(&datagram).unwrap_or(0);
            self.cache.insert(cache_key, datagram, ttl, now);
        }
        req.task.abort();
    }

    /// TCP 连接：接受后整条透传给上游，不解析也不缓存
    fn on_tcp_accept(&mut self, client: TcpStream, peer: SocketAddr, now: Instant) {
        self.connections += 1;
        if self.requests.len() >= self.settings.max_requests {
            self.shed_oldest();
        }

        let req_id = self.next_req_id;
        self.next_req_id += 1;
        let upstream = self.upstream;
        let tx = self.events_tx.clone();
        let task = tokio::spawn(async move {
            relay_tcp(client, upstream).await;
            let _ = tx.send(Event::TcpClosed { req_id }).await;
        });

        self.requests.insert(
            req_id,
            Request {
                client: peer,
                v6: peer.is_ipv6(),
                is_tcp: true,
                client_id: 0,
                client_qname: None,
                outbound_id: 0,
                outbound_qname: None,
                pending_key: None,
                deadline: now + Duration::from_secs(self.settings.request_timeout_secs),
                task,
            },
        );
        self.fifo.push_back(req_id);
        debug!(client = %peer, req_id, "tcp connection accepted");
    }

    fn destroy_request(&mut self, req_id: u64, reason: &str) {
        if let Some(req) = self.requests.remove(&req_id) {
            req.task.abort();
            debug!(req_id, tcp = req.is_tcp, reason, "request destroyed");
        }
    }

    /// Destroy requests whose deadline has passed. No reply is sent; the
    /// client's own retry governs recovery.
    fn sweep_deadlines(&mut self, now: Instant) {
        loop {
            let Some(&id) = self.fifo.front() else {
                break;
            };
            match self.requests.get(&id) {
                None => {
                    self.fifo.pop_front();
                }
                Some(req) if req.deadline <= now => {
                    self.fifo.pop_front();
                    self.destroy_request(id, "deadline");
                }
                Some(_) => break,
            }
        }
    }

    /// Backpressure: admission beyond the request limit destroys the
    /// single oldest in-flight request, and says so in the log.
    fn shed_oldest(&mut self) {
        while let Some(id) = self.fifo.pop_front() {
            if self.requests.contains_key(&id) {
                warn!(req_id = id, "request limit reached, shedding oldest in-flight request");
                self.destroy_request(id, "shed");
                return;
            }
        }
    }

    async fn reply_udp(&self, resp: &[u8], peer: SocketAddr, v6: bool) {
        let sock = if v6 {
            &self.listeners.udp6
        } else {
            &self.listeners.udp4
        };
        if let Err(err) = sock.send_to(resp, peer).await {
            debug!(error = %err, client = %peer, "reply send failed");
        }
    }

    fn log_stats(&self) {
        info!(
            target = "stats",
            active_requests = self.requests.len(),
            active_cache_entries = self.cache.len(),
            lifetime_connections = self.connections,
            lifetime_cache_hits = self.cache.hits,
            "runtime counters"
        );
    }
}

/// TCP relay: accepted → connecting → relaying. After the upstream connect
/// completes the two sockets are handed to the splice capability, falling
/// back to a userspace byte pump; payloads are never parsed or cached.
async fn relay_tcp(mut client: TcpStream, upstream: SocketAddr) {
    match TcpStream::connect(upstream).await {
        Ok(mut remote) => {
            if try_splice(&client, &remote) {
                return;
            }
            let _ = tokio::io::copy_bidirectional(&mut client, &mut remote).await;
        }
        Err(err) if err.kind() == io::ErrorKind::AddrNotAvailable => {
            let _ = tcp_servfail(&mut client).await;
        }
        Err(err) => {
            debug!(error = %err, upstream = %upstream, "tcp connect failed");
        }
    }
}

/// Capability hook for a kernel-level socket splice. No platform backend is
/// wired in; the byte pump behaves identically from the client's side.
fn try_splice(_client: &TcpStream, _remote: &TcpStream) -> bool {
    false
}

/// The upstream pairing cannot work at all: read the length-prefixed query
/// to learn its id, answer SERVFAIL, hang up.
async fn tcp_servfail(client: &mut TcpStream) -> io::Result<()> {
    let mut len_buf = [0u8; 2];
    client.read_exact(&mut len_buf).await?;
    let frame_len = u16::from_be_bytes(len_buf) as usize;
    if frame_len < codec::HEADER_LEN || frame_len > codec::MAX_MSG {
        return Ok(());
    }
    let mut frame = vec![0u8; frame_len];
    client.read_exact(&mut frame).await?;
    if let Some(pkt) = codec::make_servfail(&frame) {
        client.write_all(&(pkt.len() as u16).to_be_bytes()).await?;
        client.write_all(&pkt).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::{build_answer, build_query};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn test_settings() -> Settings {
        Settings {
            max_cache_entries: 16,
            max_requests: 8,
            request_timeout_secs: 5,
            ttl_ceiling_secs: 300,
            stats_interval_secs: 60,
            accept_backoff_ms: 100,
        }
    }

    async fn bind_listeners() -> (Listeners, SocketAddr, SocketAddr) {
        let udp4 = UdpSocket::bind("127.0.0.1:0").await.expect("bind udp4");
        let udp6 = UdpSocket::bind("[::1]:0").await.expect("bind udp6");
        let tcp4 = TcpListener::bind("127.0.0.1:0").await.expect("bind tcp4");
        let tcp6 = TcpListener::bind("[::1]:0").await.expect("bind tcp6");
        let udp4_addr = udp4.local_addr().unwrap();
        let tcp4_addr = tcp4.local_addr().unwrap();
        (
            Listeners {
                udp4,
                udp6,
                tcp4,
                tcp6,
            },
            udp4_addr,
            tcp4_addr,
        )
    }

    #[tokio::test]
    async fn forwards_and_restores_client_identity() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let (listeners, udp_addr, _) = bind_listeners().await;
        let (engine, events) = Engine::new(listeners, upstream_addr, test_settings());
        tokio::spawn(engine.run(events));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = build_query(0x1234, "Example.Com", 1);
        client.send_to(&query, udp_addr).await.unwrap();

        // upstream sees the same shape with randomized id and name casing
        let mut buf = [0u8; 512];
        let (len, from) = timeout(WAIT, upstream.recv_from(&mut buf))
            .await
            .expect("forwarded query")
            .unwrap();
        let fwd = buf[..len].to_vec();
        assert_eq!(fwd.len(), query.len());
        let finfo = codec::parse_minimal(&fwd).unwrap();
        let sent_name = finfo.qname_bytes(&fwd).unwrap();
        assert!(sent_name.eq_ignore_ascii_case(b"\x07Example\x03Com\x00"));

        let resp = build_answer(&fwd, 300, [93, 184, 216, 34]);
        upstream.send_to(&resp, from).await.unwrap();

        let (len, _) = timeout(WAIT, client.recv_from(&mut buf))
            .await
            .expect("reply")
            .unwrap();
        let reply = &buf[..len];
        let rinfo = codec::parse_minimal(reply).unwrap();
        assert_eq!(rinfo.id, 0x1234);
        assert_eq!(rinfo.qname_bytes(reply).unwrap(), b"\x07Example\x03Com\x00");
        assert_eq!(&reply[reply.len() - 4..], &[93, 184, 216, 34]);
    }

    #[tokio::test]
    async fn cached_answer_serves_second_client_without_upstream() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let (listeners, udp_addr, _) = bind_listeners().await;
        let (engine, events) = Engine::new(listeners, upstream_addr, test_settings());
        tokio::spawn(engine.run(events));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 512];

        client
            .send_to(&build_query(0x1111, "example.com", 1), udp_addr)
            .await
            .unwrap();
        let (len, from) = timeout(WAIT, upstream.recv_from(&mut buf))
            .await
            .expect("forwarded query")
            .unwrap();
        let fwd = buf[..len].to_vec();
        upstream
            .send_to(&build_answer(&fwd, 300, [93, 184, 216, 34]), from)
            .await
            .unwrap();
        timeout(WAIT, client.recv_from(&mut buf))
            .await
            .expect("first reply")
            .unwrap();

        // same question, new id and casing: served from cache
        client
            .send_to(&build_query(0x5678, "EXAMPLE.com", 1), udp_addr)
            .await
            .unwrap();
        let (len, _) = timeout(WAIT, client.recv_from(&mut buf))
            .await
            .expect("cached reply")
            .unwrap();
        let reply = &buf[..len];
        let rinfo = codec::parse_minimal(reply).unwrap();
        assert_eq!(rinfo.id, 0x5678);
        assert_eq!(rinfo.qname_bytes(reply).unwrap(), b"\x07EXAMPLE\x03com\x00");
        assert_eq!(&reply[reply.len() - 4..], &[93, 184, 216, 34]);

        // and the upstream saw no second query
        assert!(
            timeout(Duration::from_millis(300), upstream.recv_from(&mut buf))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn spoofed_response_is_ignored_until_the_real_one() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let (listeners, udp_addr, _) = bind_listeners().await;
        let (engine, events) = Engine::new(listeners, upstream_addr, test_settings());
        tokio::spawn(engine.run(events));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 512];
        client
            .send_to(&build_query(0x2222, "example.org", 1), udp_addr)
            .await
            .unwrap();
        let (len, from) = timeout(WAIT, upstream.recv_from(&mut buf))
            .await
            .expect("forwarded query")
            .unwrap();
        let fwd = buf[..len].to_vec();

        // wrong transaction id: must be ignored, request keeps waiting
        let mut spoof = build_answer(&fwd, 300, [6, 6, 6, 6]);
        let bad_id = u16::from_be_bytes([spoof[0], spoof[1]]).wrapping_add(1);
        spoof[0..2].copy_from_slice(&bad_id.to_be_bytes());
        upstream.send_to(&spoof, from).await.unwrap();

        upstream
            .send_to(&build_answer(&fwd, 300, [7, 7, 7, 7]), from)
            .await
            .unwrap();
        let (len, _) = timeout(WAIT, client.recv_from(&mut buf))
            .await
            .expect("reply")
            .unwrap();
        let reply = &buf[..len];
        assert_eq!(&reply[reply.len() - 4..], &[7, 7, 7, 7]);
    }

    #[tokio::test]
    async fn concurrent_requests_are_matched_independently() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let (listeners, udp_addr, _) = bind_listeners().await;
        let (engine, events) = Engine::new(listeners, upstream_addr, test_settings());
        tokio::spawn(engine.run(events));

        let names = ["a.example", "b.example", "c.example"];
        let mut clients = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            client
                .send_to(&build_query(0x4000 + i as u16, name, 1), udp_addr)
                .await
                .unwrap();
            clients.push(client);
        }

        // collect all three forwarded queries, then answer in reverse order
        let mut forwarded = Vec::new();
        let mut buf = [0u8; 512];
        for _ in 0..names.len() {
            let (len, from) = timeout(WAIT, upstream.recv_from(&mut buf))
                .await
                .expect("forwarded query")
                .unwrap();
            forwarded.push((buf[..len].to_vec(), from));
        }
        for (i, (fwd, from)) in forwarded.iter().enumerate().rev() {
            upstream
                .send_to(&build_answer(fwd, 60, [10, 0, 0, i as u8]), *from)
                .await
                .unwrap();
        }

        // every client gets an answer for exactly its own question
        let replies = futures::future::join_all(clients.iter().map(|client| async move {
            let mut buf = [0u8; 512];
            let (len, _) = timeout(WAIT, client.recv_from(&mut buf))
                .await
                .expect("reply")
                .unwrap();
            buf[..len].to_vec()
        }))
        .await;
        for (i, (reply, name)) in replies.iter().zip(names).enumerate() {
            let rinfo = codec::parse_minimal(reply).unwrap();
            assert_eq!(rinfo.id, 0x4000 + i as u16);
            let mut encoded = Vec::new();
            for label in name.split('.') {
                encoded.push(label.len() as u8);
                encoded.extend_from_slice(label.as_bytes());
            }
            encoded.push(0);
            assert_eq!(rinfo.qname_bytes(reply).unwrap(), encoded.as_slice());
        }
    }

    #[tokio::test]
    async fn tcp_connection_is_relayed_verbatim() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = upstream.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            conn.read_exact(&mut len_buf).await.unwrap();
            let mut frame = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            conn.read_exact(&mut frame).await.unwrap();
            let resp = build_answer(&frame, 60, [9, 9, 9, 9]);
            conn.write_all(&(resp.len() as u16).to_be_bytes())
                .await
                .unwrap();
            conn.write_all(&resp).await.unwrap();
        });

        let (listeners, _, tcp_addr) = bind_listeners().await;
        let (engine, events) = Engine::new(listeners, upstream_addr, test_settings());
        tokio::spawn(engine.run(events));

        let mut client = TcpStream::connect(tcp_addr).await.unwrap();
        let query = build_query(0x3333, "example.net", 1);
        client
            .write_all(&(query.len() as u16).to_be_bytes())
            .await
            .unwrap();
        client.write_all(&query).await.unwrap();

        let mut len_buf = [0u8; 2];
        timeout(WAIT, client.read_exact(&mut len_buf))
            .await
            .expect("response length")
            .unwrap();
        let mut resp = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        timeout(WAIT, client.read_exact(&mut resp))
            .await
            .expect("response body")
            .unwrap();
        // relayed byte for byte, id and casing untouched
        let rinfo = codec::parse_minimal(&resp).unwrap();
        assert_eq!(rinfo.id, 0x3333);
        assert_eq!(&resp[resp.len() - 4..], &[9, 9, 9, 9]);
    }

    fn fake_request(engine: &mut Engine, deadline: Instant) -> u64 {
        let id = engine.next_req_id;
        engine.next_req_id += 1;
        engine.requests.insert(
            id,
            Request {
                client: "127.0.0.1:9".parse().unwrap(),
                v6: false,
                is_tcp: false,
                client_id: 0,
                client_qname: None,
                outbound_id: 0,
                outbound_qname: None,
                pending_key: None,
                deadline,
                task: tokio::spawn(async {}),
            },
        );
        engine.fifo.push_back(id);
        id
    }

    #[tokio::test]
    async fn deadline_sweep_destroys_only_expired_requests() {
        let (listeners, _, _) = bind_listeners().await;
        let (mut engine, _events) = Engine::new(listeners, "127.0.0.1:53".parse().unwrap(), test_settings());
        let now = Instant::now();
        let expired = fake_request(&mut engine, now - Duration::from_secs(1));
        let live = fake_request(&mut engine, now + Duration::from_secs(10));

        engine.sweep_deadlines(now);
        assert!(!engine.requests.contains_key(&expired));
        assert!(engine.requests.contains_key(&live));
    }

    #[tokio::test]
    async fn backpressure_sheds_the_single_oldest() {
        let (listeners, _, _) = bind_listeners().await;
        let (mut engine, _events) = Engine::new(listeners, "127.0.0.1:53".parse().unwrap(), test_settings());
        let now = Instant::now();
        let oldest = fake_request(&mut engine, now + Duration::from_secs(10));
        let newer = fake_request(&mut engine, now + Duration::from_secs(10));

        engine.shed_oldest();
        assert!(!engine.requests.contains_key(&oldest));
        assert!(engine.requests.contains_key(&newer));
        assert_eq!(engine.requests.len(), 1);
    }

    #[tokio::test]
    async fn accept_pause_expires_after_backoff_window() {
        let (listeners, _, _) = bind_listeners().await;
        let (mut engine, _events) = Engine::new(listeners, "127.0.0.1:53".parse().unwrap(), test_settings());
        let now = Instant::now();
        engine.on_accept_error(io::Error::from_raw_os_error(libc::EMFILE), now);
        assert!(engine.accepting_paused(now));
        assert!(engine.accepting_paused(now + Duration::from_millis(99)));
        assert!(!engine.accepting_paused(now + Duration::from_millis(101)));
    }
}
