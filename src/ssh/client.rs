//! SSH client factory
//!
//! Builds per-target dial functions closed over the auth bundle and the
//! connection timeout. With a bastion configured, the target connection is
//! tunneled through a `direct-tcpip` channel relayed over a loopback
//! listener, so the target handshake runs over a plain socket the way
//! libssh2 expects.

use crate::auth::{AuthBundle, AuthMethod};
use crate::error::{IoResultExt, Result, RunnerError};
use crate::ssh::session::HostSession;
use crate::ssh::LIBSSH2_ERROR_TIMEOUT;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ssh2::Session;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Session timeout (ms) used by tunnel relay threads so blocking channel
/// reads return quickly instead of hanging.
const TUNNEL_POLL_TIMEOUT_MS: u32 = 50;

/// libssh2 does not export this through the ssh2 crate
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;

/// Upper bound for one relayed write before the tunnel gives up.
const TUNNEL_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bastion endpoint with its own resolved credentials
#[derive(Clone)]
pub struct Bastion {
    /// Bastion host name or address
    pub host: String,
    /// Bastion SSH port
    pub port: u16,
    /// Credentials used on the bastion itself
    pub auth: AuthBundle,
}

/// Host key verification policy.
///
/// The default is `AcceptAny`, which trusts whatever key the server
/// presents. That is the traditional fleet-runner trade-off and it is
/// vulnerable to man-in-the-middle interception; use `Tofu` or `Strict`
/// with a fingerprint store when the network is not trusted.
#[derive(Debug, Clone, Default)]
pub enum HostKeyPolicy {
    /// Trust any presented key
    #[default]
    AcceptAny,
    /// Trust on first use: learn unknown keys, reject changed ones
    Tofu { store: PathBuf },
    /// Only known fingerprints pass; unknown hosts are rejected
    Strict { store: PathBuf },
}

#[derive(Default, Serialize, Deserialize)]
struct FingerprintStore {
    fingerprints: HashMap<String, String>,
}

impl HostKeyPolicy {
    fn verify(&self, session: &Session, host: &str, port: u16) -> Result<()> {
        let store_path = match self {
            HostKeyPolicy::AcceptAny => return Ok(()),
            HostKeyPolicy::Tofu { store } | HostKeyPolicy::Strict { store } => store,
        };

        let (key, _key_type) = session
            .host_key()
            .ok_or_else(|| RunnerError::handshake(host, "server presented no host key"))?;
        let fingerprint = format!("SHA256:{}", hex::encode(Sha256::digest(key)));
        let host_id = format!("{host}:{port}");

        let mut store = load_fingerprints(store_path)?;
        match store.fingerprints.get(&host_id) {
            Some(known) if *known == fingerprint => Ok(()),
            Some(known) => Err(RunnerError::handshake(
                host,
                format!("host key mismatch: expected {known}, got {fingerprint}"),
            )),
            None if matches!(self, HostKeyPolicy::Tofu { .. }) => {
                store.fingerprints.insert(host_id, fingerprint);
                save_fingerprints(store_path, &store)?;
                debug!("learned host key for {host}:{port}");
                Ok(())
            }
            None => Err(RunnerError::handshake(
                host,
                "host key not in the fingerprint store",
            )),
        }
    }
}

fn load_fingerprints(path: &Path) -> Result<FingerprintStore> {
    if !path.exists() {
        return Ok(FingerprintStore::default());
    }
    let contents = std::fs::read_to_string(path).with_path(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| RunnerError::config(format!("bad fingerprint store: {e}")))
}

fn save_fingerprints(path: &Path, store: &FingerprintStore) -> Result<()> {
    let serialized = serde_json::to_string_pretty(store)
        .map_err(|e| RunnerError::config(format!("cannot serialize fingerprint store: {e}")))?;
    std::fs::write(path, serialized).with_path(path)
}

/// Builds authenticated per-host sessions. Immutable once constructed and
/// shared read-only across all workers.
pub struct SshClient {
    auth: AuthBundle,
    bastion: Option<Bastion>,
    connect_timeout: Duration,
    op_timeout: Option<Duration>,
    host_key_policy: HostKeyPolicy,
    sudo_prompt_patterns: Arc<Vec<regex::Regex>>,
}

impl SshClient {
    /// Create a client from the resolved target credentials and the
    /// connect timeout applied to TCP establishment.
    pub fn new(auth: AuthBundle, connect_timeout: Duration) -> Self {
        Self {
            auth,
            bastion: None,
            connect_timeout,
            op_timeout: None,
            host_key_policy: HostKeyPolicy::default(),
            sudo_prompt_patterns: Arc::new(crate::ssh::session::default_sudo_prompt_patterns()),
        }
    }

    /// Tunnel every target connection through this bastion
    pub fn with_bastion(mut self, bastion: Bastion) -> Self {
        self.bastion = Some(bastion);
        self
    }

    /// Bound each session operation (command, single SFTP transfer)
    pub fn with_op_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Select how presented host keys are verified
    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    /// Replace the localized sudo prompt patterns stripped from output
    pub fn with_sudo_prompt_patterns(mut self, patterns: Vec<regex::Regex>) -> Self {
        self.sudo_prompt_patterns = Arc::new(patterns);
        self
    }

    /// Open an authenticated session to one target.
    pub fn dial(&self, host: &str, port: u16) -> Result<HostSession> {
        let (session, tunnel) = match &self.bastion {
            None => {
                let tcp = tcp_connect(host, port, self.connect_timeout)?;
                (self.establish(tcp, host, port, &self.auth)?, None)
            }
            Some(bastion) => self.dial_via_bastion(host, port, bastion)?,
        };

        Ok(HostSession::new(
            host.to_string(),
            session,
            self.auth.user.clone(),
            self.auth.password.clone(),
            self.op_timeout,
            Arc::clone(&self.sudo_prompt_patterns),
            tunnel,
        ))
    }

    fn dial_via_bastion(
        &self,
        host: &str,
        port: u16,
        bastion: &Bastion,
    ) -> Result<(Session, Option<TunnelGuard>)> {
        debug!("dialing {host}:{port} via bastion {}:{}", bastion.host, bastion.port);

        let tcp = tcp_connect(&bastion.host, bastion.port, self.connect_timeout)?;
        let bastion_session = self.establish(tcp, &bastion.host, bastion.port, &bastion.auth)?;

        let channel = bastion_session
            .channel_direct_tcpip(host, port, None)
            .map_err(|e| {
                RunnerError::unreachable(
                    host,
                    format!("direct-tcpip via {} failed: {e}", bastion.host),
                )
            })?;

        let tunnel = TunnelGuard::start(bastion_session, channel)?;
        let tcp = TcpStream::connect_timeout(&tunnel.local_addr(), self.connect_timeout)
            .map_err(|e| RunnerError::unreachable(host, format!("tunnel connect: {e}")))?;
        let session = self.establish(tcp, host, port, &self.auth)?;

        Ok((session, Some(tunnel)))
    }

    fn establish(
        &self,
        tcp: TcpStream,
        host: &str,
        port: u16,
        auth: &AuthBundle,
    ) -> Result<Session> {
        let mut session =
            Session::new().map_err(|e| RunnerError::handshake(host, e.to_string()))?;
        session.set_tcp_stream(tcp);

        // The connect timeout covers the protocol handshake as well; the
        // per-operation timeout takes over once the session is up.
        session.set_timeout(self.connect_timeout.as_millis() as u32);
        session.handshake().map_err(|e| {
            if matches!(e.code(), ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT)) {
                RunnerError::Timeout(self.connect_timeout.as_secs())
            } else {
                RunnerError::handshake(host, e.to_string())
            }
        })?;
        session.set_timeout(
            self.op_timeout
                .map(|t| t.as_millis() as u32)
                .unwrap_or(0),
        );

        self.host_key_policy.verify(&session, host, port)?;
        authenticate(&session, auth, host)?;
        Ok(session)
    }
}

/// Resolve and connect with the connect timeout applied to every candidate
/// address. TCP-level timeouts classify as `Timeout`, everything else as
/// `Unreachable`.
fn tcp_connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| RunnerError::unreachable(host, format!("resolve: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(RunnerError::unreachable(host, "no addresses resolved"));
    }

    let mut last_err: Option<std::io::Error> = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    let err = last_err.expect("at least one address attempted");
    if err.kind() == std::io::ErrorKind::TimedOut {
        Err(RunnerError::Timeout(timeout.as_secs()))
    } else {
        Err(RunnerError::unreachable(host, err.to_string()))
    }
}

/// Attempt the bundle's methods in order; the first accepted method wins.
fn authenticate(session: &Session, auth: &AuthBundle, host: &str) -> Result<()> {
    for method in &auth.methods {
        let attempt = match method {
            AuthMethod::Password(password) => session.userauth_password(&auth.user, password),
            AuthMethod::PublicKey {
                keyfile,
                passphrase,
            } => session.userauth_pubkey_file(&auth.user, None, keyfile, passphrase.as_deref()),
            AuthMethod::Agent => agent_auth(session, &auth.user),
        };

        match attempt {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => {}
            Err(e) => debug!("auth method rejected for {}@{host}: {e}", auth.user),
        }
    }

    Err(RunnerError::auth(
        &auth.user,
        host,
        "no authentication method accepted by server",
    ))
}

/// Try every identity the agent offers. The agent library serializes
/// signing requests internally, so sharing the socket across workers is
/// safe but can become a bottleneck at high concurrency.
fn agent_auth(session: &Session, user: &str) -> std::result::Result<(), ssh2::Error> {
    let mut agent = session.agent()?;
    agent.connect()?;
    agent.list_identities()?;

    let identities = agent.identities()?;
    let mut last_err = None;
    for identity in &identities {
        match agent.userauth(user, identity) {
            Ok(()) => return Ok(()),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        ssh2::Error::from_errno(ssh2::ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED))
    }))
}

/// Keeps a bastion tunnel alive for the lifetime of the target session:
/// the loopback listener, the relay thread, and (inside the thread) the
/// bastion session and its direct-tcpip channel.
pub(crate) struct TunnelGuard {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TunnelGuard {
    fn start(session: Session, channel: ssh2::Channel) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .map_err(|e| RunnerError::Unknown(format!("tunnel listener: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RunnerError::Unknown(format!("tunnel listener: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| RunnerError::Unknown(format!("tunnel listener: {e}")))?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("parssh-tunnel".to_string())
            .spawn(move || run_tunnel(listener, session, channel, stop_flag))
            .map_err(|e| RunnerError::Unknown(format!("tunnel thread: {e}")))?;

        Ok(Self {
            local_addr,
            stop,
            handle: Some(handle),
        })
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Accept exactly one loopback connection and relay it over the channel.
/// The session stays blocking with a short timeout so channel reads return
/// quickly and the stop flag is honored.
fn run_tunnel(
    listener: TcpListener,
    session: Session,
    mut channel: ssh2::Channel,
    stop: Arc<AtomicBool>,
) {
    session.set_timeout(TUNNEL_POLL_TIMEOUT_MS);

    let local = loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept() {
            Ok((stream, _)) => break stream,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => {
                warn!("tunnel accept failed: {e}");
                return;
            }
        }
    };

    if local.set_nonblocking(true).is_err() {
        return;
    }
    let mut local = local;
    let mut to_remote = [0u8; 16384];
    let mut to_local = [0u8; 16384];

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let mut progressed = false;

        match local.read(&mut to_remote) {
            Ok(0) => {
                let _ = channel.send_eof();
                break;
            }
            Ok(n) => {
                if write_channel(&mut channel, &to_remote[..n]).is_err() {
                    break;
                }
                progressed = true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => break,
        }

        match channel.read(&mut to_local) {
            Ok(0) => {
                if channel.eof() {
                    break;
                }
            }
            Ok(n) => {
                if write_local(&mut local, &to_local[..n]).is_err() {
                    break;
                }
                progressed = true;
            }
            Err(e) if is_would_block_or_timeout(&e) => {}
            Err(_) => break,
        }

        if !progressed {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

fn is_would_block_or_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Write through the blocking channel; the short session timeout surfaces
/// as WouldBlock and the deadline bounds the retry loop.
fn write_channel(channel: &mut ssh2::Channel, data: &[u8]) -> std::io::Result<()> {
    let deadline = Instant::now() + TUNNEL_WRITE_TIMEOUT;
    let mut written = 0;
    while written < data.len() {
        if Instant::now() > deadline {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "tunnel write timed out",
            ));
        }
        match channel.write(&data[written..]) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "channel closed",
                ))
            }
            Ok(n) => written += n,
            Err(e) if is_would_block_or_timeout(&e) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn write_local(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<()> {
    let deadline = Instant::now() + TUNNEL_WRITE_TIMEOUT;
    let mut written = 0;
    while written < data.len() {
        if Instant::now() > deadline {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "tunnel write timed out",
            ));
        }
        match stream.write(&data[written..]) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "stream closed",
                ))
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(2));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn bundle() -> AuthBundle {
        AuthBundle {
            user: "deploy".to_string(),
            password: Some("pw".to_string()),
            methods: vec![AuthMethod::Password("pw".to_string())],
        }
    }

    #[test]
    fn test_tcp_connect_refused_is_unreachable() {
        // Bind a listener, grab its port, then drop it so the port is closed.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = tcp_connect("127.0.0.1", port, Duration::from_secs(2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
    }

    #[test]
    fn test_dial_closed_port_yields_host_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = SshClient::new(bundle(), Duration::from_secs(2));
        let err = client.dial("127.0.0.1", port).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
    }

    #[test]
    fn test_strict_policy_rejects_unknown_host() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("fingerprints.json");
        std::fs::write(&store, r#"{"fingerprints":{}}"#).unwrap();

        let policy = HostKeyPolicy::Strict { store };
        // A session without a handshake has no host key.
        let session = Session::new().unwrap();
        let err = policy.verify(&session, "db01", 22).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Handshake);
    }

    // Requires an SSH server; exercised in integration environments only.
    #[test]
    #[ignore]
    fn test_dial_localhost() {
        let client = SshClient::new(bundle(), Duration::from_secs(5));
        let session = client.dial("localhost", 22);
        assert!(session.is_ok());
    }
}
