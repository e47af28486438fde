//! Per-host session executor
//!
//! Owns one authenticated SSH session for the lifetime of a task on one
//! host and implements the four task operations on top of it: remote
//! command, upload-and-execute script, recursive push, and recursive fetch
//! (with sudo staging). Execution steps within a host are strictly
//! sequential.

use crate::error::{IoResultExt, Result, RunnerError};
use crate::ssh::client::TunnelGuard;
use crate::ssh::LIBSSH2_ERROR_TIMEOUT;
use crate::task::{TaskKind, TaskSpec};
use regex::Regex;
use ssh2::{OpenFlags, OpenType, Session, Sftp};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Transfer buffer size for SFTP uploads and downloads
const TRANSFER_BUF_LEN: usize = 1024 * 1024;

/// Sudo prompts recognized and stripped from captured output. English and
/// Simplified Chinese only; prompts from other locales leak into the
/// captured output unchanged.
const SUDO_PROMPT_PATTERNS: &[&str] = &[
    r"(?m)^\[sudo\] password for [^\n:]+: ?",
    r"(?m)^\[sudo\] [^\n]+ 的密码：?",
];

pub(crate) fn default_sudo_prompt_patterns() -> Vec<Regex> {
    SUDO_PROMPT_PATTERNS
        .iter()
        .map(|p| Regex::new(p).expect("static sudo prompt pattern"))
        .collect()
}

/// One host's connection for the duration of a task. Dropping the session
/// closes the connection; nothing is pooled across tasks.
pub struct HostSession {
    host: String,
    session: Session,
    login_user: String,
    password: Option<String>,
    op_timeout: Option<Duration>,
    sudo_prompt_patterns: Arc<Vec<Regex>>,
    /// Keeps the bastion relay alive while this session is open
    _tunnel: Option<TunnelGuard>,
}

impl std::fmt::Debug for HostSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSession")
            .field("host", &self.host)
            .field("login_user", &self.login_user)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl HostSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        host: String,
        session: Session,
        login_user: String,
        password: Option<String>,
        op_timeout: Option<Duration>,
        sudo_prompt_patterns: Arc<Vec<Regex>>,
        tunnel: Option<TunnelGuard>,
    ) -> Self {
        Self {
            host,
            session,
            login_user,
            password,
            op_timeout,
            sudo_prompt_patterns,
            _tunnel: tunnel,
        }
    }

    /// Display name of the target host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Run one task on this host, returning the captured output or the
    /// per-operation summary line.
    pub fn run(&self, spec: &TaskSpec) -> Result<String> {
        match &spec.kind {
            TaskKind::Command { command } => self.run_command(spec, command),
            TaskKind::Script {
                local_path,
                dest_dir,
                remove_after,
                overwrite,
            } => self.run_script(spec, local_path, dest_dir, *remove_after, *overwrite),
            TaskKind::Push {
                files,
                dest_dir,
                overwrite,
            } => self.run_push(spec, files, dest_dir, *overwrite),
            TaskKind::Fetch {
                files,
                dest_dir,
                tmp_dir,
            } => self.run_fetch(spec, files, dest_dir, tmp_dir),
        }
    }

    /// Execute a command, feeding the sudo password and merging stdout and
    /// stderr into one stream. Success iff the remote exit status is 0.
    fn run_command(&self, spec: &TaskSpec, command: &str) -> Result<String> {
        let rendered = render_command(spec, command, &self.login_user);
        debug!("exec on {}: {rendered}", self.host);

        let mut channel = self.session.channel_session().map_err(|e| self.op_err(e))?;
        channel
            .handle_extended_data(ssh2::ExtendedData::Merge)
            .map_err(|e| self.op_err(e))?;
        channel.exec(&rendered).map_err(|e| self.op_err(e))?;

        // The remote may be NOPASSWD; an unread password line is harmless.
        if spec.sudo {
            if let Some(password) = &self.password {
                channel
                    .write_all(format!("{password}\n").as_bytes())
                    .map_err(|e| self.stream_err(e))?;
            }
            let _ = channel.send_eof();
        }

        let mut output = String::new();
        channel
            .read_to_string(&mut output)
            .map_err(|e| self.stream_err(e))?;
        channel.wait_close().map_err(|e| self.op_err(e))?;
        let status = channel.exit_status().map_err(|e| self.op_err(e))?;

        let output = if spec.sudo {
            strip_sudo_prompts(&output, &self.sudo_prompt_patterns)
        } else {
            output
        };

        if status != 0 {
            return Err(RunnerError::RemoteExec {
                status,
                output: output.trim_end().to_string(),
            });
        }
        Ok(output)
    }

    /// Upload a script, mark it executable, run it, optionally remove it.
    /// Upload failures are reported without executing anything.
    fn run_script(
        &self,
        spec: &TaskSpec,
        local_path: &Path,
        dest_dir: &Path,
        remove_after: bool,
        overwrite: bool,
    ) -> Result<String> {
        let sftp = self.sftp()?;
        let name = file_name(local_path)?;
        let remote = dest_dir.join(name);

        if !overwrite && sftp.stat(&remote).is_ok() {
            return Err(RunnerError::TargetExists(remote));
        }
        self.upload_file(&sftp, local_path, &remote, 0o755)?;

        let result = self.run_command(spec, &shell_quote(&remote.to_string_lossy()));

        if remove_after {
            // Best effort; the execution result is what the caller cares about.
            if let Err(e) = sftp.unlink(&remote) {
                debug!("cleanup of {} on {} failed: {e}", remote.display(), self.host);
            }
        }

        result
    }

    /// Push files and directory trees under `dest_dir`, preserving mode
    /// bits and relative paths. Zip bundles are transferred and unpacked
    /// remotely. Symbolic links are followed, so link targets arrive as
    /// regular entries.
    fn run_push(
        &self,
        spec: &TaskSpec,
        files: &[PathBuf],
        dest_dir: &Path,
        overwrite: bool,
    ) -> Result<String> {
        let sftp = self.sftp()?;
        self.mkdir_remote_all(&sftp, dest_dir)?;

        let mut count = 0u64;
        let mut bytes = 0u64;
        for src in files {
            if src.is_dir() {
                let (c, b) = self.push_tree(&sftp, src, dest_dir, overwrite)?;
                count += c;
                bytes += b;
            } else if src.extension().is_some_and(|e| e == "zip") {
                bytes += self.push_zip(&sftp, spec, src, dest_dir, overwrite)?;
                count += 1;
            } else {
                bytes += self.push_file(&sftp, src, dest_dir, overwrite)?;
                count += 1;
            }
        }

        Ok(format!(
            "pushed {count} file(s), {bytes} bytes to {}",
            dest_dir.display()
        ))
    }

    fn push_file(
        &self,
        sftp: &Sftp,
        src: &Path,
        dest_dir: &Path,
        overwrite: bool,
    ) -> Result<u64> {
        let remote = dest_dir.join(file_name(src)?);
        if !overwrite && sftp.stat(&remote).is_ok() {
            return Err(RunnerError::TargetExists(remote));
        }
        self.upload_file(sftp, src, &remote, local_mode(src))
    }

    fn push_tree(
        &self,
        sftp: &Sftp,
        src: &Path,
        dest_dir: &Path,
        overwrite: bool,
    ) -> Result<(u64, u64)> {
        let root = dest_dir.join(file_name(src)?);
        let mut count = 0u64;
        let mut bytes = 0u64;

        for entry in walkdir::WalkDir::new(src).follow_links(true) {
            let entry =
                entry.map_err(|e| RunnerError::Transfer(format!("walk {}: {e}", src.display())))?;
            let rel = entry
                .path()
                .strip_prefix(src)
                .map_err(|e| RunnerError::Transfer(e.to_string()))?;
            let remote = root.join(rel);

            if entry.file_type().is_dir() {
                self.mkdir_remote_all(sftp, &remote)?;
            } else {
                if !overwrite && sftp.stat(&remote).is_ok() {
                    return Err(RunnerError::TargetExists(remote));
                }
                bytes += self.upload_file(sftp, entry.path(), &remote, local_mode(entry.path()))?;
                count += 1;
            }
        }

        Ok((count, bytes))
    }

    /// Transfer a caller-produced zip bundle and unpack it remotely.
    fn push_zip(
        &self,
        sftp: &Sftp,
        spec: &TaskSpec,
        src: &Path,
        dest_dir: &Path,
        overwrite: bool,
    ) -> Result<u64> {
        let name = file_name(src)?;
        let remote = dest_dir.join(name);
        if !overwrite && sftp.stat(&remote).is_ok() {
            return Err(RunnerError::TargetExists(remote));
        }
        let bytes = self.upload_file(sftp, src, &remote, 0o644)?;

        let clobber = if overwrite { "-o" } else { "-n" };
        let unpack = format!(
            "cd {dir} && unzip -q {clobber} {zip} && rm -f {zip}",
            dir = shell_quote(&dest_dir.to_string_lossy()),
            zip = shell_quote(&name.to_string_lossy()),
        );
        self.run_command(spec, &unpack)?;
        Ok(bytes)
    }

    /// Fetch remote paths into `dest_dir/<host>/…`. With sudo, the source
    /// is first staged into `tmp_dir` with widened permissions so SFTP,
    /// which runs as the login user, can read it; the staging copy is
    /// removed afterwards.
    fn run_fetch(
        &self,
        spec: &TaskSpec,
        files: &[String],
        dest_dir: &Path,
        tmp_dir: &Path,
    ) -> Result<String> {
        let sftp = self.sftp()?;
        let local_root = dest_dir.join(&self.host);
        std::fs::create_dir_all(&local_root).with_path(&local_root)?;

        let mut count = 0u64;
        for src in files {
            let name = file_name(Path::new(src))?;
            let local = local_root.join(name);

            if spec.sudo {
                let staged = tmp_dir.join(name);
                let staged_str = staged.to_string_lossy();
                let stage_cmd = format!(
                    "mkdir -p {tmp} && cp -r {src} {staged} && chmod -R a+rX {staged}",
                    tmp = shell_quote(&tmp_dir.to_string_lossy()),
                    src = shell_quote(src),
                    staged = shell_quote(&staged_str),
                );
                self.run_command(spec, &stage_cmd)?;

                let download = self.download_recursive(&sftp, &staged, &local, &mut count);
                let cleanup =
                    self.run_command(spec, &format!("rm -rf {}", shell_quote(&staged_str)));
                download?;
                cleanup?;
            } else {
                self.download_recursive(&sftp, Path::new(src), &local, &mut count)?;
            }
        }

        Ok(format!("fetched {count} file(s) into {}", local_root.display()))
    }

    fn sftp(&self) -> Result<Sftp> {
        self.session.sftp().map_err(|e| self.op_err(e))
    }

    fn upload_file(&self, sftp: &Sftp, local: &Path, remote: &Path, mode: i32) -> Result<u64> {
        let local_file = std::fs::File::open(local).with_path(local)?;
        let mut remote_file = sftp
            .open_mode(
                remote,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                mode,
                OpenType::File,
            )
            .map_err(|e| self.transfer_err(e))?;

        let mut reader = std::io::BufReader::with_capacity(TRANSFER_BUF_LEN, local_file);
        let mut buffer = vec![0u8; TRANSFER_BUF_LEN];
        let mut copied = 0u64;
        loop {
            let n = reader.read(&mut buffer).with_path(local)?;
            if n == 0 {
                break;
            }
            remote_file
                .write_all(&buffer[..n])
                .map_err(|e| self.stream_err(e))?;
            copied += n as u64;
        }

        Ok(copied)
    }

    fn download_file(&self, sftp: &Sftp, remote: &Path, local: &Path) -> Result<u64> {
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }
        let mut remote_file = sftp.open(remote).map_err(|e| self.transfer_err(e))?;
        let local_file = std::fs::File::create(local).with_path(local)?;

        let mut writer = std::io::BufWriter::with_capacity(TRANSFER_BUF_LEN, local_file);
        let mut buffer = vec![0u8; TRANSFER_BUF_LEN];
        let mut copied = 0u64;
        loop {
            let n = remote_file
                .read(&mut buffer)
                .map_err(|e| self.stream_err(e))?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n]).with_path(local)?;
            copied += n as u64;
        }
        writer.flush().with_path(local)?;

        Ok(copied)
    }

    fn download_recursive(
        &self,
        sftp: &Sftp,
        remote: &Path,
        local: &Path,
        count: &mut u64,
    ) -> Result<()> {
        let stat = sftp.stat(remote).map_err(|e| self.transfer_err(e))?;

        if stat.is_dir() {
            std::fs::create_dir_all(local).with_path(local)?;
            for (child, _stat) in sftp.readdir(remote).map_err(|e| self.transfer_err(e))? {
                let name = file_name(&child)?;
                self.download_recursive(sftp, &child, &local.join(name), count)?;
            }
        } else {
            self.download_file(sftp, remote, local)?;
            *count += 1;
        }
        Ok(())
    }

    /// Create a remote directory chain, tolerating components that exist.
    fn mkdir_remote_all(&self, sftp: &Sftp, path: &Path) -> Result<()> {
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            if current.as_os_str().is_empty() || current == Path::new("/") {
                continue;
            }
            match sftp.stat(&current) {
                Ok(stat) if stat.is_dir() => {}
                Ok(_) => {
                    return Err(RunnerError::Transfer(format!(
                        "path exists but is not a directory: {}",
                        current.display()
                    )))
                }
                Err(_) => {
                    sftp.mkdir(&current, 0o755)
                        .map_err(|e| self.transfer_err(e))?;
                }
            }
        }
        Ok(())
    }

    fn op_timeout_secs(&self) -> u64 {
        self.op_timeout.map(|t| t.as_secs()).unwrap_or(0)
    }

    fn op_err(&self, e: ssh2::Error) -> RunnerError {
        if matches!(e.code(), ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT)) {
            RunnerError::Timeout(self.op_timeout_secs())
        } else {
            RunnerError::Unknown(e.to_string())
        }
    }

    fn transfer_err(&self, e: ssh2::Error) -> RunnerError {
        if matches!(e.code(), ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT)) {
            RunnerError::Timeout(self.op_timeout_secs())
        } else {
            RunnerError::Transfer(e.to_string())
        }
    }

    fn stream_err(&self, e: std::io::Error) -> RunnerError {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                RunnerError::Timeout(self.op_timeout_secs())
            }
            _ => RunnerError::Unknown(e.to_string()),
        }
    }
}

/// Render the final remote command line: locale export prefix, then the
/// sudo wrap when requested.
fn render_command(spec: &TaskSpec, command: &str, login_user: &str) -> String {
    let mut cmd = String::new();
    if let Some(lang) = &spec.lang {
        cmd.push_str(&format!("export LANG={lang} LC_ALL={lang} LANGUAGE={lang}; "));
    }
    cmd.push_str(command);

    if spec.sudo {
        format!(
            "sudo -H -u {} -p \"{}\" -S sh -c {}",
            spec.sudo_as_user,
            sudo_prompt(login_user),
            shell_quote(&cmd)
        )
    } else {
        cmd
    }
}

fn sudo_prompt(login_user: &str) -> String {
    format!("[sudo] password for {login_user}: ")
}

/// Single-quote a string for safe embedding in `sh -c '…'`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Remove recognized sudo password prompts from captured output.
fn strip_sudo_prompts(output: &str, patterns: &[Regex]) -> String {
    let mut cleaned = output.to_string();
    for pattern in patterns {
        cleaned = pattern.replace_all(&cleaned, "").into_owned();
    }
    cleaned
}

fn file_name(path: &Path) -> Result<&std::ffi::OsStr> {
    path.file_name()
        .ok_or_else(|| RunnerError::Transfer(format!("path has no file name: {}", path.display())))
}

#[cfg(unix)]
fn local_mode(path: &Path) -> i32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| (m.permissions().mode() & 0o777) as i32)
        .unwrap_or(0o644)
}

#[cfg(not(unix))]
fn local_mode(_path: &Path) -> i32 {
    0o644
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;

    fn command_spec(command: &str) -> TaskSpec {
        TaskSpec::new(TaskKind::Command {
            command: command.to_string(),
        })
    }

    #[test]
    fn test_render_plain_command() {
        let spec = command_spec("uptime");
        assert_eq!(render_command(&spec, "uptime", "deploy"), "uptime");
    }

    #[test]
    fn test_render_lang_prefix() {
        let mut spec = command_spec("uptime");
        spec.lang = Some("en_US.UTF-8".to_string());
        assert_eq!(
            render_command(&spec, "uptime", "deploy"),
            "export LANG=en_US.UTF-8 LC_ALL=en_US.UTF-8 LANGUAGE=en_US.UTF-8; uptime"
        );
    }

    #[test]
    fn test_render_sudo_wrap() {
        let mut spec = command_spec("systemctl restart nginx");
        spec.sudo = true;
        spec.sudo_as_user = "www".to_string();

        let rendered = render_command(&spec, "systemctl restart nginx", "deploy");
        assert_eq!(
            rendered,
            "sudo -H -u www -p \"[sudo] password for deploy: \" -S sh -c \
             'systemctl restart nginx'"
        );
    }

    #[test]
    fn test_shell_quote_embedded_quote() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("plain"), "'plain'");
    }

    #[test]
    fn test_strip_sudo_prompts_english() {
        let patterns = default_sudo_prompt_patterns();
        let output = "[sudo] password for deploy: total 0\ndrwxr-xr-x 2 root\n";
        assert_eq!(
            strip_sudo_prompts(output, &patterns),
            "total 0\ndrwxr-xr-x 2 root\n"
        );
    }

    #[test]
    fn test_strip_sudo_prompts_chinese() {
        let patterns = default_sudo_prompt_patterns();
        let output = "[sudo] deploy 的密码：ok\n";
        assert_eq!(strip_sudo_prompts(output, &patterns), "ok\n");
    }

    #[test]
    fn test_unrecognized_locale_prompt_leaks() {
        let patterns = default_sudo_prompt_patterns();
        let output = "[sudo] Passwort für deploy: ok\n";
        assert_eq!(strip_sudo_prompts(output, &patterns), output);
    }

    #[test]
    fn test_file_name_rejects_root() {
        assert!(file_name(Path::new("/")).is_err());
        assert!(file_name(Path::new("/etc/hosts")).is_ok());
    }
}
