// Jetpack
// Copyright (C) 2023 - Michael DeHaan <michael@michaeldehaan.net> + contributors
// Copyright (C) 2025 - Riff.CC <https://riff.cc>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// long with this program.  If not, see <http://www.gnu.org/licenses/>.

//! SSH transport: a pure-Rust russh client bridged into this crate's sync
//! `Host` trait with a current-thread tokio runtime, plus the interactive
//! PTY relay (§4.2) and SFTP file transfer with the sudo temp-file dance
//! (§4.3) that a plain exec-and-poll connection doesn't need.

use std::io::BufReader;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use russh::client::{self, AuthResult};
use russh::ChannelMsg;
use russh_sftp::client::SftpSession;
use ssh2_config::{ParseRule, SshConfig};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Runtime;

use crate::context::{esc1, HostContext};
use crate::error::{FrameworkError, Result};
use crate::host::cache::{ConnectionCache, Liveness};
use crate::host::{
    buffer_contains_magic_prompt, build_shaped_command, command_failed, sudo_interactive_shape,
    FileMode, Host, HostClassId, RemoteFile, RemoteStat, RunOptions,
};
use crate::logger::{FileLogEntry, Logger};
use crate::pty::{take_resize_event, Pty, RawModeGuard};

/// Largest single SFTP write, matching a blocking behavior observed around
/// ~1180-byte writes against some SFTP servers (§4.3).
const SFTP_WRITE_CHUNK: usize = 1024;

/// Accepts every host key, matching `reject_unknown_hosts = false` (the
/// teacher's posture). When `reject_unknown_hosts` is set we have no
/// persistent known_hosts store to check a key against, so strict mode
/// rejects every server outright rather than silently trusting one — see
/// the Design Note for this tradeoff.
struct SshHandler {
    reject_unknown_hosts: bool,
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(!self.reject_unknown_hosts)
    }
}

/// Everything needed to (re)connect this host's class, cloned into the
/// cache's connect closure.
#[derive(Clone)]
pub struct SshConnectParams {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub forward_agent: bool,
    pub login_password: Option<String>,
    pub private_key_file: Option<String>,
    pub key_passphrase: Option<String>,
    pub key_comment: Option<String>,
    pub connect_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub reject_unknown_hosts: bool,
    pub honor_ssh_config_file: bool,
}

pub struct SshTransport {
    runtime: Mutex<Runtime>,
    handle: client::Handle<SshHandler>,
    alive: AtomicBool,
    forward_agent: bool,
}

impl Liveness for SshTransport {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Load `~/.ssh/config`, if present and `honor_ssh_config_file` is set, and
/// fill in any connection field still sitting at the crate's documented
/// default with the value that file carries for this host: identityfile,
/// user, port, and connecttimeout are loaded first and then overridden by
/// the host's explicit fields. Fields the caller already set away from the
/// default are left untouched.
fn apply_ssh_config_defaults(params: &mut SshConnectParams) {
    if !params.honor_ssh_config_file {
        return;
    }
    let Some(home) = std::env::var_os("HOME") else { return };
    let config_path = std::path::Path::new(&home).join(".ssh").join("config");
    let Ok(file) = std::fs::File::open(&config_path) else { return };
    let mut reader = BufReader::new(file);
    let Ok(config) = SshConfig::default().parse(&mut reader, ParseRule::STRICT) else { return };
    let host_params = config.query(&params.hostname);

    if params.username == "root" {
        if let Some(user) = host_params.user {
            params.username = user;
        }
    }
    if params.port == 22 {
        if let Some(port) = host_params.port {
            params.port = port;
        }
    }
    if params.connect_timeout_secs == 30 {
        if let Some(timeout) = host_params.connect_timeout {
            params.connect_timeout_secs = timeout.as_secs();
        }
    }
    if params.private_key_file.is_none() {
        if let Some(identity) = host_params.identity_file.and_then(|files| files.into_iter().next()) {
            params.private_key_file = Some(identity.to_string_lossy().into_owned());
        }
    }
}

fn connect_transport(params: &SshConnectParams) -> Result<SshTransport> {
    let mut params = params.clone();
    apply_ssh_config_defaults(&mut params);
    let params = &params;

    let runtime = Runtime::new().map_err(FrameworkError::from)?;
    let connect_str = format!("{}:{}", params.hostname, params.port);
    let mut addrs = connect_str
        .to_socket_addrs()
        .map_err(|e| FrameworkError::ConnectionFailed(format!("unable to resolve {connect_str}: {e}")))?;
    let addr = addrs
        .next()
        .ok_or_else(|| FrameworkError::ConnectionFailed(format!("unable to resolve {connect_str}")))?;

    let p = params.clone();
    let handle = runtime.block_on(async move {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(p.keepalive_interval_secs)),
            ..Default::default()
        });
        let handler = SshHandler { reject_unknown_hosts: p.reject_unknown_hosts };

        let mut handle = tokio::time::timeout(
            Duration::from_secs(p.connect_timeout_secs),
            client::connect(config, addr, handler),
        )
        .await
        .map_err(|_| format!("SSH connection attempt failed for {}: timeout", p.hostname))?
        .map_err(|e| format!("SSH connection attempt failed for {}: {}", p.hostname, e))?;

        if let Some(ref password) = p.login_password {
            let result = handle
                .authenticate_password(&p.username, password)
                .await
                .map_err(|e| format!("SSH password authentication failed for {}: {}", p.username, e))?;
            if !matches!(result, AuthResult::Success) {
                return Err(format!("SSH password authentication failed for {}", p.username));
            }
        } else if let Some(ref key_file) = p.private_key_file {
            let expanded = expanduser::expanduser(key_file).map_err(|e| format!("cannot expand keyfile path {key_file}: {e}"))?;
            if !expanded.exists() {
                return Err(format!("cannot find designated keyfile {}", expanded.display()));
            }
            let secret_key = russh::keys::load_secret_key(&expanded, p.key_passphrase.as_deref())
                .map_err(|e| format!("SSH key load failed for {}: {e}", expanded.display()))?;
            let key_with_alg = russh::keys::PrivateKeyWithHashAlg::new(Arc::new(secret_key), None);
            let result = handle
                .authenticate_publickey(&p.username, key_with_alg)
                .await
                .map_err(|e| format!("SSH key authentication failed for {}: {}", p.username, e))?;
            if !matches!(result, AuthResult::Success) {
                return Err(format!("SSH key authentication failed for {}", p.username));
            }
        } else if let Some(ref comment) = p.key_comment {
            let ssh_auth_sock = std::env::var("SSH_AUTH_SOCK")
                .map_err(|_| "SSH cannot connect to agent: SSH_AUTH_SOCK not set".to_string())?;
            let stream = tokio::net::UnixStream::connect(&ssh_auth_sock)
                .await
                .map_err(|e| format!("SSH cannot connect to agent: {e}"))?;
            let mut agent = russh::keys::agent::client::AgentClient::connect(stream);
            let identities = agent
                .request_identities()
                .await
                .map_err(|e| format!("SSH list_identities failed: {e}"))?;

            let mut found = false;
            for identity in &identities {
                if identity.comment() == comment {
                    let result = handle
                        .authenticate_publickey_with(&p.username, identity.clone(), None, &mut agent)
                        .await
                        .map_err(|e| format!("SSH key authentication failed for {}: {}", comment, e))?;
                    if matches!(result, AuthResult::Success) {
                        found = true;
                        break;
                    }
                }
            }
            if !found {
                return Err(format!("specified SSH key not found with comment {comment}"));
            }
        } else {
            let ssh_auth_sock = std::env::var("SSH_AUTH_SOCK")
                .map_err(|_| "SSH cannot connect to agent: SSH_AUTH_SOCK not set".to_string())?;
            let stream = tokio::net::UnixStream::connect(&ssh_auth_sock)
                .await
                .map_err(|e| format!("SSH cannot connect to agent: {e}"))?;
            let mut agent = russh::keys::agent::client::AgentClient::connect(stream);
            let identities = agent
                .request_identities()
                .await
                .map_err(|e| format!("SSH agent failed to list identities: {e}"))?;

            let mut authenticated = false;
            for identity in &identities {
                if let Ok(AuthResult::Success) =
                    handle.authenticate_publickey_with(&p.username, identity.clone(), None, &mut agent).await
                {
                    authenticated = true;
                    break;
                }
            }
            if !authenticated {
                return Err(format!("SSH agent authentication failed for {}", p.username));
            }
        }

        Ok::<_, String>(handle)
    })
    .map_err(FrameworkError::ConnectionFailed)?;

    Ok(SshTransport {
        runtime: Mutex::new(runtime),
        handle,
        alive: AtomicBool::new(true),
        forward_agent: params.forward_agent,
    })
}

/// Exec `shaped_command`, polling the channel until it closes. If
/// `sudo_password` is set, sends it (once) the moment `magic_sudo_prompt`
/// appears in the trailing window of accumulated output (§4.2, §8).
fn exec_over_transport(
    transport: &SshTransport,
    shaped_command: &str,
    magic_sudo_prompt: &str,
    sudo_password: Option<&str>,
) -> Result<(i32, String)> {
    let command = shaped_command.to_string();
    let magic = magic_sudo_prompt.to_string();
    let password = sudo_password.map(|s| s.to_string());

    let result = transport.runtime.lock().unwrap().block_on(async {
        let mut channel = transport.handle.channel_open_session().await?;
        if transport.forward_agent {
            channel.agent_forward(true).await?;
        }
        channel.exec(true, command.as_bytes()).await?;

        let mut output = Vec::new();
        let mut exit_code: Option<u32> = None;
        let mut sent_password = false;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { ref data }) => {
                    output.extend_from_slice(data);
                    if !sent_password {
                        if let Some(pw) = &password {
                            if buffer_contains_magic_prompt(&output, &magic) {
                                let mut payload = pw.clone().into_bytes();
                                payload.push(b'\n');
                                let _ = channel.data(&payload[..]).await;
                                sent_password = true;
                            }
                        }
                    }
                }
                Some(ChannelMsg::ExtendedData { ref data, .. }) => output.extend_from_slice(data),
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                Some(ChannelMsg::Eof) => {}
                None => break,
                _ => {}
            }
        }

        Ok::<_, russh::Error>((exit_code.unwrap_or(0) as i32, String::from_utf8_lossy(&output).into_owned()))
    });

    match result {
        Ok(pair) => Ok(pair),
        Err(e) => {
            transport.alive.store(false, Ordering::SeqCst);
            Err(FrameworkError::from(e))
        }
    }
}

async fn open_sftp(transport: &SshTransport) -> std::result::Result<SftpSession, russh::Error> {
    let channel = transport.handle.channel_open_session().await?;
    channel.request_subsystem(true, "sftp").await?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| russh::Error::IO(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
}

fn sftp_write(transport: &SshTransport, remote_path: &str, data: &[u8]) -> Result<()> {
    let path = remote_path.to_string();
    let bytes = data.to_vec();
    transport
        .runtime
        .lock()
        .unwrap()
        .block_on(async move {
            let sftp = open_sftp(transport).await?;
            let mut file = sftp
                .create(&path)
                .await
                .map_err(|e| russh::Error::IO(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
            for chunk in bytes.chunks(SFTP_WRITE_CHUNK) {
                file.write_all(chunk).await?;
            }
            file.shutdown().await?;
            Ok::<_, russh::Error>(())
        })
        .map_err(FrameworkError::from)
}

async fn sftp_stat_async(transport: &SshTransport, remote_path: &str) -> std::result::Result<RemoteStat, russh::Error> {
    let sftp = open_sftp(transport).await?;
    let meta = sftp
        .metadata(remote_path)
        .await
        .map_err(|e| russh::Error::IO(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
    Ok(RemoteStat {
        st_mode: meta.permissions.unwrap_or(0),
        st_size: meta.size.unwrap_or(0),
        st_uid: meta.uid.unwrap_or(0),
        st_gid: meta.gid.unwrap_or(0),
    })
}

fn sftp_stat(transport: &SshTransport, remote_path: &str) -> Result<RemoteStat> {
    let path = remote_path.to_string();
    transport
        .runtime
        .lock()
        .unwrap()
        .block_on(sftp_stat_async(transport, &path))
        .map_err(FrameworkError::from)
}

async fn sftp_listdir_async(transport: &SshTransport, remote_path: &str) -> std::result::Result<Vec<String>, russh::Error> {
    let sftp = open_sftp(transport).await?;
    let entries = sftp
        .read_dir(remote_path)
        .await
        .map_err(|e| russh::Error::IO(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
    Ok(entries
        .filter_map(|entry| {
            let name = entry.file_name();
            if name == "." || name == ".." {
                None
            } else {
                Some(name)
            }
        })
        .collect())
}

fn sftp_listdir(transport: &SshTransport, remote_path: &str) -> Result<Vec<String>> {
    let path = remote_path.to_string();
    transport
        .runtime
        .lock()
        .unwrap()
        .block_on(sftp_listdir_async(transport, &path))
        .map_err(FrameworkError::from)
}

fn sftp_read(transport: &SshTransport, remote_path: &str) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let path = remote_path.to_string();
    transport
        .runtime
        .lock()
        .unwrap()
        .block_on(async move {
            let sftp = open_sftp(transport).await?;
            let mut file = sftp
                .open(&path)
                .await
                .map_err(|e| russh::Error::IO(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).await?;
            Ok::<_, russh::Error>(buf)
        })
        .map_err(FrameworkError::from)
}

pub struct SSHHost {
    slug: String,
    host_class: HostClassId,
    username: String,
    term: String,
    start_path: String,
    context: HostContext,
    magic_sudo_prompt: String,
    connect_params: SshConnectParams,
    cache: Arc<ConnectionCache<SshTransport>>,
}

impl SSHHost {
    pub fn new(
        slug: impl Into<String>,
        host_class: HostClassId,
        start_path: impl Into<String>,
        connect_params: SshConnectParams,
        cache: Arc<ConnectionCache<SshTransport>>,
    ) -> Self {
        let username = connect_params.username.clone();
        Self {
            slug: slug.into(),
            host_class,
            username,
            term: crate::host::DEFAULT_TERM.to_string(),
            start_path: start_path.into(),
            context: HostContext::new(),
            magic_sudo_prompt: format!("[ssh-sudo-{}]", guid_create::GUID::rand()),
            connect_params,
            cache,
        }
    }

    fn transport(&self) -> Result<Arc<SshTransport>> {
        self.cache.get_or_connect(&self.host_class, || connect_transport(&self.connect_params))
    }

    /// A per-call temp path under the login user's home directory, matching
    /// the original's `~/deployer-tempfile-<epoch>-<rand>` naming (§4.3).
    fn tempfile_path(&self) -> String {
        let epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let nonce: u32 = rand::rng().random_range(0..1_000_000);
        format!("{}/deployer-tempfile-{}-{}", self.start_path.trim_end_matches('/'), epoch, nonce)
    }

    /// `test -e` without any sudo elevation: existence of `path` as seen by
    /// the login user, used to decide whether `open()`'s sudo dance should
    /// copy-then-elevate an existing file or `touch` a brand new one (§4.3).
    fn remote_exists(&self, transport: &SshTransport, path: &str) -> Result<bool> {
        let cmd = format!("test -e '{}'", esc1(path));
        let (status, _) = exec_over_transport(transport, &cmd, "", None)?;
        Ok(status == 0)
    }

    /// Run `command` through the interactive sudo shape, answering the magic
    /// prompt with the login password if one is configured (§4.2, §4.3).
    fn run_sudo(&self, transport: &SshTransport, command: &str) -> Result<(i32, String)> {
        let shaped = sudo_interactive_shape(&self.magic_sudo_prompt, None, command);
        exec_over_transport(transport, &shaped, &self.magic_sudo_prompt, self.connect_params.login_password.as_deref())
    }

    /// Attach the local controlling terminal to a remote interactive shell:
    /// raw mode, SIGWINCH-driven resize, and in-band sudo password injection
    /// if the shell happens to prompt for one (§4.2 steps 1-5).
    pub fn start_interactive_shell(&self, pty: &dyn Pty) -> Result<()> {
        let transport = self.transport()?;
        let (cols, rows) = pty.size();
        let term = pty.term().to_string();
        let magic = self.magic_sudo_prompt.clone();
        let password = self.connect_params.login_password.clone().unwrap_or_default();

        let _raw_guard = RawModeGuard::enable(0).ok();
        crate::pty::install_winch_handler();

        let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(16);
        std::thread::spawn(move || {
            use std::io::Read;
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 1024];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut chunk = buf[..n].to_vec();
                        for b in chunk.iter_mut() {
                            if *b == b'\n' {
                                *b = b'\r';
                            }
                        }
                        if tx.blocking_send(chunk).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let result = transport.runtime.lock().unwrap().block_on(async {
            let mut channel = transport.handle.channel_open_session().await?;
            if transport.forward_agent {
                channel.agent_forward(true).await?;
            }
            channel
                .request_pty(false, &term, cols as u32, rows as u32, 0, 0, &[])
                .await?;
            channel.request_shell(true).await?;

            let mut accumulated: Vec<u8> = Vec::new();
            let mut sent_password = false;

            loop {
                if take_resize_event() {
                    let (c, r) = pty.size();
                    let _ = channel.window_change(c as u32, r as u32, 0, 0).await;
                }
                tokio::select! {
                    msg = channel.wait() => {
                        match msg {
                            Some(ChannelMsg::Data { ref data }) => {
                                use std::io::Write;
                                let _ = std::io::stdout().write_all(data);
                                let _ = std::io::stdout().flush();
                                accumulated.extend_from_slice(data);
                                if !sent_password && buffer_contains_magic_prompt(&accumulated, &magic) {
                                    let mut payload = password.clone().into_bytes();
                                    payload.push(b'\n');
                                    let _ = channel.data(&payload[..]).await;
                                    sent_password = true;
                                }
                            }
                            Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                                use std::io::Write;
                                let _ = std::io::stdout().write_all(data);
                                let _ = std::io::stdout().flush();
                            }
                            Some(ChannelMsg::ExitStatus { .. }) | None => break,
                            _ => {}
                        }
                    }
                    chunk = rx.recv() => {
                        match chunk {
                            Some(bytes) => { let _ = channel.data(&bytes[..]).await; }
                            None => break,
                        }
                    }
                }
            }
            Ok::<(), russh::Error>(())
        });

        result.map_err(FrameworkError::from)
    }
}

impl Host for SSHHost {
    fn slug(&self) -> &str {
        &self.slug
    }
    fn host_class(&self) -> &HostClassId {
        &self.host_class
    }
    fn username(&self) -> &str {
        &self.username
    }
    fn term(&self) -> &str {
        &self.term
    }
    fn magic_sudo_prompt(&self) -> &str {
        &self.magic_sudo_prompt
    }
    fn start_path(&self) -> Result<String> {
        Ok(self.start_path.clone())
    }
    fn context(&self) -> &HostContext {
        &self.context
    }

    fn run(&self, _pty: &dyn Pty, logger: &dyn Logger, command: &str, options: &RunOptions) -> Result<String> {
        let password = self.connect_params.login_password.clone().unwrap_or_default();
        let shaped = build_shaped_command(&self.context, &self.start_path, command, options, &self.magic_sudo_prompt, &password);

        let transport = self.transport()?;
        let mut entry = logger.log_run(&self.slug, command, options.use_sudo, options.sandbox, options.interactive);

        let sudo_password = if options.use_sudo && options.interactive {
            self.connect_params.login_password.as_deref()
        } else {
            None
        };

        let (status, output) = exec_over_transport(&transport, &shaped, &self.magic_sudo_prompt, sudo_password)?;
        entry.log_io(output.as_bytes());
        entry.set_status_code(status);

        if status != 0 && !options.ignore_exit_status {
            return Err(command_failed(command, &self.slug, status, &output));
        }
        Ok(output)
    }

    fn open(&self, logger: &dyn Logger, remote_path: &str, mode: FileMode, use_sudo: bool, sandbox: bool) -> Result<Box<dyn RemoteFile>> {
        let transport = self.transport()?;
        let mode_label = if mode == FileMode::Write { "write" } else { "read" };
        let mut entry = logger.log_file(&self.slug, mode_label, remote_path, use_sudo, sandbox);

        if sandbox && mode == FileMode::Write {
            entry.complete(true);
            return Ok(Box::new(SshRemoteFile {
                transport,
                remote_path: remote_path.to_string(),
                temp_path: None,
                target_existed: false,
                use_sudo,
                sandbox: true,
                magic_sudo_prompt: self.magic_sudo_prompt.clone(),
                sudo_password: self.connect_params.login_password.clone(),
                mode,
                write_buf: Vec::new(),
                read_cursor: 0,
                read_data: None,
                entry,
            }));
        }

        if !use_sudo {
            if mode == FileMode::Read {
                let data = sftp_read(&transport, remote_path);
                let data = match data {
                    Ok(d) => d,
                    Err(e) => {
                        entry.complete(false);
                        return Err(e);
                    }
                };
                entry.complete(true);
                return Ok(Box::new(SshRemoteFile {
                    transport,
                    remote_path: remote_path.to_string(),
                    temp_path: None,
                    target_existed: true,
                    use_sudo,
                    sandbox: false,
                    magic_sudo_prompt: self.magic_sudo_prompt.clone(),
                    sudo_password: self.connect_params.login_password.clone(),
                    mode,
                    write_buf: Vec::new(),
                    read_cursor: 0,
                    read_data: Some(data),
                    entry,
                }));
            }
            return Ok(Box::new(SshRemoteFile {
                transport,
                remote_path: remote_path.to_string(),
                temp_path: None,
                target_existed: false,
                use_sudo,
                sandbox: false,
                magic_sudo_prompt: self.magic_sudo_prompt.clone(),
                sudo_password: self.connect_params.login_password.clone(),
                mode,
                write_buf: Vec::new(),
                read_cursor: 0,
                read_data: None,
                entry,
            }));
        }

        // Sudo elevation dance (§4.3): gain a copy we can edit as the login
        // user before handing control back to SFTP, which never writes as
        // root directly.
        let target_existed = self.remote_exists(&transport, remote_path)?;
        let temp_path = self.tempfile_path();

        if mode == FileMode::Read && !target_existed {
            entry.complete(false);
            return Err(FrameworkError::Other(format!("no such file: {remote_path}")));
        }

        if target_existed {
            let dance_cmd = format!(
                "cp '{}' '{}' && chown '{}' '{}' && chmod u+rw '{}'",
                esc1(remote_path),
                esc1(&temp_path),
                esc1(&self.username),
                esc1(&temp_path),
                esc1(&temp_path)
            );
            let (status, out) = self.run_sudo(&transport, &dance_cmd)?;
            if status != 0 {
                entry.complete(false);
                return Err(command_failed(&dance_cmd, &self.slug, status, &out));
            }
        } else {
            let touch_cmd = format!("touch '{}'", esc1(&temp_path));
            let (status, out) = exec_over_transport(&transport, &touch_cmd, "", None)?;
            if status != 0 {
                entry.complete(false);
                return Err(command_failed(&touch_cmd, &self.slug, status, &out));
            }
        }

        if mode == FileMode::Read {
            let data = sftp_read(&transport, &temp_path);
            let rm_cmd = format!("rm -f '{}'", esc1(&temp_path));
            let _ = self.run_sudo(&transport, &rm_cmd);
            let data = match data {
                Ok(d) => d,
                Err(e) => {
                    entry.complete(false);
                    return Err(e);
                }
            };
            entry.complete(true);
            return Ok(Box::new(SshRemoteFile {
                transport,
                remote_path: remote_path.to_string(),
                temp_path: None,
                target_existed,
                use_sudo,
                sandbox: false,
                magic_sudo_prompt: self.magic_sudo_prompt.clone(),
                sudo_password: self.connect_params.login_password.clone(),
                mode,
                write_buf: Vec::new(),
                read_cursor: 0,
                read_data: Some(data),
                entry,
            }));
        }

        Ok(Box::new(SshRemoteFile {
            transport,
            remote_path: remote_path.to_string(),
            temp_path: Some(temp_path),
            target_existed,
            use_sudo,
            sandbox: false,
            magic_sudo_prompt: self.magic_sudo_prompt.clone(),
            sudo_password: self.connect_params.login_password.clone(),
            mode,
            write_buf: Vec::new(),
            read_cursor: 0,
            read_data: None,
            entry,
        }))
    }

    fn start_interactive_shell(&self, pty: &dyn Pty) -> Result<()> {
        SSHHost::start_interactive_shell(self, pty)
    }

    fn stat(&self, path: &str) -> Result<RemoteStat> {
        let resolved = self.expand_path(path)?;
        let transport = self.transport()?;
        sftp_stat(&transport, &resolved)
    }

    fn listdir(&self, path: &str) -> Result<Vec<String>> {
        let resolved = self.expand_path(path)?;
        let transport = self.transport()?;
        sftp_listdir(&transport, &resolved)
    }
}

/// Pop one `\n`-terminated line from `data` starting at `*cursor`, advancing
/// it past the line (and its newline, if any). `None` once exhausted.
fn split_next_line(data: &[u8], cursor: &mut usize) -> Option<String> {
    if *cursor >= data.len() {
        return None;
    }
    let rest = &data[*cursor..];
    let newline_at = rest.iter().position(|&b| b == b'\n');
    let line_end = newline_at.unwrap_or(rest.len());
    let line = String::from_utf8_lossy(&rest[..line_end]).into_owned();
    *cursor += line_end + if newline_at.is_some() { 1 } else { 0 };
    Some(line)
}

struct SshRemoteFile {
    transport: Arc<SshTransport>,
    remote_path: String,
    temp_path: Option<String>,
    /// Whether `remote_path` already existed when this handle was opened;
    /// gates the chown/chmod restoration step in `close` (§4.3) the same way
    /// the original only restores ownership for a file it didn't create.
    target_existed: bool,
    use_sudo: bool,
    /// In sandbox mode all writes land in `/dev/null` instead of touching the
    /// real target or temp file (§4.3).
    sandbox: bool,
    magic_sudo_prompt: String,
    sudo_password: Option<String>,
    mode: FileMode,
    write_buf: Vec<u8>,
    read_cursor: usize,
    read_data: Option<Vec<u8>>,
    entry: Box<dyn FileLogEntry>,
}

impl RemoteFile for SshRemoteFile {
    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        let data = self.read_data.get_or_insert_with(Vec::new);
        let end = (self.read_cursor + max_bytes).min(data.len());
        let chunk = data[self.read_cursor..end].to_vec();
        self.read_cursor = end;
        Ok(chunk)
    }

    fn readline(&mut self) -> Result<Option<String>> {
        let data = self.read_data.get_or_insert_with(Vec::new);
        Ok(split_next_line(data, &mut self.read_cursor))
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.write_buf.extend_from_slice(data);
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        if self.mode != FileMode::Write {
            return Ok(());
        }

        if self.sandbox {
            self.entry.complete(true);
            return Ok(());
        }

        let target = self.temp_path.clone().unwrap_or_else(|| self.remote_path.clone());
        if let Err(e) = sftp_write(&self.transport, &target, &self.write_buf) {
            self.entry.complete(false);
            return Err(e);
        }

        if let Some(tmp) = &self.temp_path {
            let restore_cmd = if self.target_existed {
                format!(
                    "chown --reference='{0}' '{1}' && chmod --reference='{0}' '{1}' && mv '{1}' '{0}'",
                    esc1(&self.remote_path),
                    esc1(tmp)
                )
            } else {
                format!("mv '{}' '{}'", esc1(tmp), esc1(&self.remote_path))
            };
            let shaped = sudo_interactive_shape(&self.magic_sudo_prompt, None, &restore_cmd);
            let (status, out) = match exec_over_transport(&self.transport, &shaped, &self.magic_sudo_prompt, self.sudo_password.as_deref()) {
                Ok(pair) => pair,
                Err(e) => {
                    self.entry.complete(false);
                    return Err(e);
                }
            };
            if status != 0 {
                self.entry.complete(false);
                return Err(command_failed(&restore_cmd, &self.remote_path, status, &out));
            }
        }
        self.entry.complete(true);
        let _ = self.use_sudo;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sshhost_magic_sudo_prompt_is_unique_per_instance() {
        let params = SshConnectParams {
            hostname: "example".into(),
            port: 22,
            username: "deploy".into(),
            forward_agent: false,
            login_password: None,
            private_key_file: None,
            key_passphrase: None,
            key_comment: None,
            connect_timeout_secs: 10,
            keepalive_interval_secs: 30,
            reject_unknown_hosts: false,
            honor_ssh_config_file: false,
        };
        let cache = Arc::new(ConnectionCache::new());
        let a = SSHHost::new("web1", HostClassId::new("web"), "/home/deploy", params.clone(), Arc::clone(&cache));
        let b = SSHHost::new("web2", HostClassId::new("web"), "/home/deploy", params, cache);
        assert_ne!(a.magic_sudo_prompt(), b.magic_sudo_prompt());
    }

    #[test]
    fn test_split_next_line_advances_past_newline() {
        let data = b"first\nsecond\nthird".to_vec();
        let mut cursor = 0;
        assert_eq!(split_next_line(&data, &mut cursor), Some("first".to_string()));
        assert_eq!(split_next_line(&data, &mut cursor), Some("second".to_string()));
        assert_eq!(split_next_line(&data, &mut cursor), Some("third".to_string()));
        assert_eq!(split_next_line(&data, &mut cursor), None);
    }

    #[test]
    fn test_split_next_line_empty_input() {
        let data: Vec<u8> = Vec::new();
        let mut cursor = 0;
        assert_eq!(split_next_line(&data, &mut cursor), None);
    }

    fn params(hostname: &str) -> SshConnectParams {
        SshConnectParams {
            hostname: hostname.into(),
            port: 22,
            username: "root".into(),
            forward_agent: false,
            login_password: None,
            private_key_file: None,
            key_passphrase: None,
            key_comment: None,
            connect_timeout_secs: 30,
            keepalive_interval_secs: 30,
            reject_unknown_hosts: false,
            honor_ssh_config_file: true,
        }
    }

    #[test]
    fn test_apply_ssh_config_defaults_noop_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let old_home = std::env::var_os("HOME");
        std::env::set_var("HOME", dir.path());

        let mut p = params("no-such-config-host.example");
        let before = (p.username.clone(), p.port);
        apply_ssh_config_defaults(&mut p);
        assert_eq!((p.username, p.port), before);

        match old_home {
            Some(h) => std::env::set_var("HOME", h),
            None => std::env::remove_var("HOME"),
        }
    }

    #[test]
    fn test_apply_ssh_config_defaults_skipped_when_disabled() {
        let mut p = params("example");
        p.honor_ssh_config_file = false;
        p.username = "explicit-user".into();
        apply_ssh_config_defaults(&mut p);
        assert_eq!(p.username, "explicit-user");
    }

    #[test]
    fn test_tempfile_path_is_home_relative_not_slash_tmp() {
        let cache = Arc::new(ConnectionCache::new());
        let host = SSHHost::new("web1", HostClassId::new("web"), "/home/deploy", params("example"), cache);
        let tmp = host.tempfile_path();
        assert!(tmp.starts_with("/home/deploy/deployer-tempfile-"));
        assert!(!tmp.starts_with("/tmp"));
    }

    #[test]
    fn test_tempfile_path_is_unique_across_calls() {
        let cache = Arc::new(ConnectionCache::new());
        let host = SSHHost::new("web1", HostClassId::new("web"), "/home/deploy", params("example"), cache);
        assert_ne!(host.tempfile_path(), host.tempfile_path());
    }
}
