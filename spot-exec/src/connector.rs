use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use spot_log::HostLog;
use ssh2::Session;

use crate::{ExecError, ExecResult, Remote};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Factory for authenticated SSH sessions. Authentication uses the
/// configured private key, or the SSH agent (`SSH_AUTH_SOCK`) when no
/// key is given. Host keys are accepted as presented; verification is a
/// documented non-goal.
#[derive(Debug, Clone)]
pub struct Connector {
    key_path: Option<PathBuf>,
    timeout: Duration,
    log: HostLog,
}

impl Connector {
    /// A configured-but-missing key file fails construction, before any
    /// host is dialed.
    pub fn new(key_path: Option<PathBuf>, timeout: Duration, log: &HostLog) -> ExecResult<Connector> {
        if let Some(ref p) = key_path {
            if !p.exists() {
                return Err(ExecError::KeyFile(p.clone()));
            }
        }
        Ok(Connector {
            key_path,
            timeout,
            log: log.clone(),
        })
    }

    /// Same connector with another key, for per-task key overrides.
    pub fn with_key_path(&self, key_path: Option<PathBuf>) -> ExecResult<Connector> {
        Connector::new(key_path, self.timeout, &self.log)
    }

    /// Dials `host_addr` (`host:port`) with the connect timeout and
    /// returns a remote executor bound to it.
    pub fn connect(&self, host_addr: &str, host_name: &str, user: &str) -> ExecResult<Remote> {
        let addr = resolve(host_addr)?;
        let tcp = TcpStream::connect_timeout(&addr, self.timeout).map_err(|e| {
            ExecError::Connect {
                addr: host_addr.to_string(),
                detail: e.to_string(),
            }
        })?;
        let session = self.start_session(tcp, host_addr, user)?;
        Ok(Remote::new(
            session,
            host_addr,
            host_name,
            self.log.with_host(host_addr, host_name),
            None,
        ))
    }

    /// Connects through an external proxy process whose stdin/stdout
    /// become the transport. `%h`, `%p` and `%r` in the argv are
    /// replaced by host, port and user.
    pub fn connect_with_proxy(
        &self,
        host_addr: &str,
        host_name: &str,
        user: &str,
        proxy_argv: &[String],
    ) -> ExecResult<Remote> {
        if proxy_argv.is_empty() {
            return Err(ExecError::Proxy {
                detail: "empty proxy command".to_string(),
            });
        }
        let (host, port) = match host_addr.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.to_string()),
            None => (host_addr.to_string(), "22".to_string()),
        };
        let argv: Vec<String> = proxy_argv
            .iter()
            .map(|a| a.replace("%h", &host).replace("%p", &port).replace("%r", user))
            .collect();

        let (ours, theirs) = UnixStream::pair()?;
        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(stdio_of(&theirs)?)
            .stdout(stdio_of(&theirs)?)
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ExecError::Proxy {
                detail: format!("cannot spawn {:?}: {}", argv[0], e),
            })?;
        drop(theirs);

        let session = self.start_session(ours, host_addr, user)?;
        Ok(Remote::new(
            session,
            host_addr,
            host_name,
            self.log.with_host(host_addr, host_name),
            Some(child),
        ))
    }

    fn start_session<S: AsRawFd + Send + 'static>(
        &self,
        stream: S,
        host_addr: &str,
        user: &str,
    ) -> ExecResult<Session> {
        let mut sess = Session::new().map_err(|e| ExecError::Connect {
            addr: host_addr.to_string(),
            detail: e.to_string(),
        })?;
        sess.set_timeout(self.timeout.as_millis() as u32);
        sess.set_tcp_stream(stream);
        sess.handshake().map_err(|e| ExecError::Connect {
            addr: host_addr.to_string(),
            detail: format!("handshake: {}", e),
        })?;
        self.authenticate(&sess, user, host_addr)?;
        Ok(sess)
    }

    fn authenticate(&self, sess: &Session, user: &str, addr: &str) -> ExecResult<()> {
        let auth_err = |detail: String| ExecError::Auth {
            user: user.to_string(),
            addr: addr.to_string(),
            detail,
        };

        if let Some(ref key) = self.key_path {
            sess.userauth_pubkey_file(user, None, key, None)
                .map_err(|e| auth_err(format!("key {}: {}", key.display(), e)))?;
        } else {
            let mut agent = sess.agent().map_err(|e| auth_err(e.to_string()))?;
            agent
                .connect()
                .map_err(|e| auth_err(format!("cannot reach ssh agent: {}", e)))?;
            agent
                .list_identities()
                .map_err(|e| auth_err(e.to_string()))?;
            let identities = agent.identities().map_err(|e| auth_err(e.to_string()))?;
            let accepted = identities
                .iter()
                .any(|id| agent.userauth(user, id).is_ok());
            if !accepted {
                return Err(auth_err("no agent identity accepted".to_string()));
            }
        }

        if !sess.authenticated() {
            return Err(auth_err("authentication incomplete".to_string()));
        }
        Ok(())
    }
}

fn resolve(host_addr: &str) -> ExecResult<SocketAddr> {
    host_addr
        .to_socket_addrs()
        .map_err(|e| ExecError::Connect {
            addr: host_addr.to_string(),
            detail: e.to_string(),
        })?
        .next()
        .ok_or_else(|| ExecError::Connect {
            addr: host_addr.to_string(),
            detail: "cannot resolve".to_string(),
        })
}

/// Duplicates the socket into a child stdio handle; both stdin and
/// stdout of the proxy end up on the same socketpair end.
fn stdio_of(sock: &UnixStream) -> ExecResult<Stdio> {
    let fd = unsafe { libc::dup(sock.as_raw_fd()) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(unsafe { Stdio::from_raw_fd(fd) })
}
