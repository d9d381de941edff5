//! SFTP control surface over an existing SSH session.
//!
//! Each SFTP client is bound to one session and inherits its strict-path
//! flag; session teardown cascades here. Every path-taking operation runs
//! through [`path::validate_path`] before touching the remote.

pub mod path;
pub mod transfer;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use serde::Serialize;

use crate::api::Wssh;
use crate::error::{Error, Result};
use crate::util::mint_id;

use path::{basename, join_child, validate_path};

/// Directory entry or stat result as reported to the host.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub name: String,
    /// Absolute, normalised path of the entry.
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub is_symlink: bool,
    /// Rendered mode bits, e.g. `rwxr-xr-x`.
    pub permissions: String,
    /// Modification time in unix milliseconds.
    pub mod_time: i64,
}

/// An open SFTP subsystem bound to a session.
pub struct SftpHandle {
    pub id: String,
    pub session_id: String,
    /// Inherited from the owning session's connect config.
    pub strict_paths: bool,
    pub(crate) sftp: SftpSession,
}

impl std::fmt::Debug for SftpHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpHandle")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("strict_paths", &self.strict_paths)
            .finish_non_exhaustive()
    }
}

impl SftpHandle {
    pub(crate) fn validate(&self, path: &str) -> Result<String> {
        validate_path(path, self.strict_paths)
    }
}

impl Wssh {
    /// Open an SFTP subsystem on an existing session.
    pub async fn sftp_open(&self, session_id: &str) -> Result<String> {
        let core = self.core();
        let session = core.sessions.get(session_id).ok_or_else(|| Error::Validation {
            message: format!("sftpOpen: session {session_id:?} not found"),
        })?;

        let channel = session
            .handle()
            .channel_open_session()
            .await
            .map_err(|e| Error::Remote {
                message: format!("sftpOpen: {e}"),
            })?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| Error::Remote {
                message: format!("sftpOpen: subsystem: {e}"),
            })?;

        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| Error::Remote {
                message: format!("sftpOpen: {e}"),
            })?;

        let sftp_id = mint_id();
        core.sftp.insert(
            sftp_id.clone(),
            Arc::new(SftpHandle {
                id: sftp_id.clone(),
                session_id: session.id.clone(),
                strict_paths: session.strict_sftp_paths,
                sftp,
            }),
        );
        Ok(sftp_id)
    }

    /// Close an SFTP client. Unknown ids are ignored.
    pub async fn sftp_close(&self, sftp_id: &str) {
        // Dropping the handle closes the subsystem channel.
        self.core().sftp.take(sftp_id);
    }

    pub(crate) fn sftp_handle(&self, sftp_id: &str) -> Result<Arc<SftpHandle>> {
        self.core().sftp.get(sftp_id).ok_or_else(|| Error::Validation {
            message: format!("sftp session {sftp_id:?} not found"),
        })
    }

    /// List a remote directory.
    pub async fn sftp_list_dir(&self, sftp_id: &str, dir: &str) -> Result<Vec<FileInfo>> {
        let handle = self.sftp_handle(sftp_id)?;
        let dir = handle.validate(dir)?;

        let entries = handle.sftp.read_dir(&dir).await.map_err(|e| Error::Remote {
            message: format!("sftpListDir: {e}"),
        })?;

        Ok(entries
            .into_iter()
            .filter(|e| e.file_name() != "." && e.file_name() != "..")
            .map(|e| {
                let name = e.file_name();
                render_file_info(&dir, &name, &e.metadata())
            })
            .collect())
    }

    /// Stat a single path. Uses lstat so symlinks are reported as symlinks.
    pub async fn sftp_stat(&self, sftp_id: &str, file: &str) -> Result<FileInfo> {
        let handle = self.sftp_handle(sftp_id)?;
        let file = handle.validate(file)?;

        let attrs = handle
            .sftp
            .symlink_metadata(&file)
            .await
            .map_err(|e| Error::Remote {
                message: format!("sftpStat: {e}"),
            })?;

        let name = basename(&file).to_string();
        let parent = match file.rfind('/') {
            Some(0) => "/",
            Some(idx) => &file[..idx],
            None => "/",
        };
        Ok(render_file_info(parent, &name, &attrs))
    }

    /// Create a directory, including missing parents.
    pub async fn sftp_mkdir(&self, sftp_id: &str, dir: &str) -> Result<()> {
        let handle = self.sftp_handle(sftp_id)?;
        let dir = handle.validate(dir)?;

        let absolute = dir.starts_with('/');
        let mut current = String::new();
        for seg in dir.split('/').filter(|s| !s.is_empty()) {
            if absolute || !current.is_empty() {
                current.push('/');
            }
            current.push_str(seg);

            match handle.sftp.metadata(&current).await {
                Ok(attrs) if is_dir_attrs(&attrs) => continue,
                Ok(_) => {
                    return Err(Error::Remote {
                        message: format!("sftpMkdir: {current:?} exists and is not a directory"),
                    })
                }
                Err(_) => {
                    handle
                        .sftp
                        .create_dir(&current)
                        .await
                        .map_err(|e| Error::Remote {
                            message: format!("sftpMkdir: {e}"),
                        })?;
                }
            }
        }
        Ok(())
    }

    /// Remove a file or directory, optionally recursively. The recursive
    /// walk never follows symlinks: links are removed as links.
    pub async fn sftp_remove(&self, sftp_id: &str, target: &str, recursive: bool) -> Result<()> {
        let handle = self.sftp_handle(sftp_id)?;
        let target = handle.validate(target)?;

        if recursive {
            return remove_recursive(&handle.sftp, target).await;
        }

        handle
            .sftp
            .remove_file(&target)
            .await
            .map_err(|e| Error::Remote {
                message: format!("sftpRemove: {e}"),
            })
    }

    /// Rename/move a remote file or directory.
    pub async fn sftp_rename(&self, sftp_id: &str, from: &str, to: &str) -> Result<()> {
        let handle = self.sftp_handle(sftp_id)?;
        let from = handle.validate(from)?;
        let to = handle.validate(to)?;

        handle
            .sftp
            .rename(&from, &to)
            .await
            .map_err(|e| Error::Remote {
                message: format!("sftpRename: {e}"),
            })
    }

    /// Change file permissions. `mode` is bounded to `0..=0o7777`.
    pub async fn sftp_chmod(&self, sftp_id: &str, file: &str, mode: u32) -> Result<()> {
        if mode > 0o7777 {
            return Err(Error::Validation {
                message: "sftpChmod: mode must be between 0 and 07777".into(),
            });
        }
        let handle = self.sftp_handle(sftp_id)?;
        let file = handle.validate(file)?;

        let attrs = FileAttributes {
            permissions: Some(mode),
            ..Default::default()
        };
        handle
            .sftp
            .set_metadata(&file, attrs)
            .await
            .map_err(|e| Error::Remote {
                message: format!("sftpChmod: {e}"),
            })
    }

    /// The remote working directory.
    pub async fn sftp_getwd(&self, sftp_id: &str) -> Result<String> {
        let handle = self.sftp_handle(sftp_id)?;
        handle
            .sftp
            .canonicalize(".")
            .await
            .map_err(|e| Error::Remote {
                message: format!("sftpGetwd: {e}"),
            })
    }

    /// Resolve a path on the server (symlinks and relative segments).
    pub async fn sftp_real_path(&self, sftp_id: &str, target: &str) -> Result<String> {
        let handle = self.sftp_handle(sftp_id)?;
        let target = handle.validate(target)?;
        handle
            .sftp
            .canonicalize(&target)
            .await
            .map_err(|e| Error::Remote {
                message: format!("sftpRealPath: {e}"),
            })
    }
}

// =============================================================================
// File info rendering
// =============================================================================

pub(crate) fn render_file_info(parent: &str, name: &str, attrs: &FileAttributes) -> FileInfo {
    FileInfo {
        name: name.to_string(),
        path: join_child(parent, name),
        size: attrs.size.unwrap_or(0),
        is_dir: is_dir_attrs(attrs),
        is_symlink: is_symlink_attrs(attrs),
        permissions: permission_string(attrs.permissions.unwrap_or(0)),
        mod_time: i64::from(attrs.mtime.unwrap_or(0)) * 1000,
    }
}

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

fn is_dir_attrs(attrs: &FileAttributes) -> bool {
    attrs
        .permissions
        .map(|p| p & S_IFMT == S_IFDIR)
        .unwrap_or(false)
}

fn is_symlink_attrs(attrs: &FileAttributes) -> bool {
    attrs
        .permissions
        .map(|p| p & S_IFMT == S_IFLNK)
        .unwrap_or(false)
}

/// Render the low nine mode bits as `rwxr-xr-x`.
fn permission_string(mode: u32) -> String {
    let mut out = String::with_capacity(9);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

// =============================================================================
// Recursive remove
// =============================================================================

/// Entry classification from lstat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// The narrow remote surface the recursive walk needs. Abstracted so the
/// traversal can be exercised against an in-memory tree.
pub(crate) trait RemoteEntryOps: Sync {
    fn lstat(&self, path: &str) -> BoxFuture<'_, Result<EntryKind>>;
    fn child_names(&self, path: &str) -> BoxFuture<'_, Result<Vec<String>>>;
    fn remove_file(&self, path: &str) -> BoxFuture<'_, Result<()>>;
    fn remove_dir(&self, path: &str) -> BoxFuture<'_, Result<()>>;
}

impl RemoteEntryOps for SftpSession {
    fn lstat(&self, path: &str) -> BoxFuture<'_, Result<EntryKind>> {
        let path = path.to_string();
        async move {
            let attrs = self
                .symlink_metadata(&path)
                .await
                .map_err(|e| Error::Remote {
                    message: format!("sftpRemove: lstat: {e}"),
                })?;
            Ok(if is_symlink_attrs(&attrs) {
                EntryKind::Symlink
            } else if is_dir_attrs(&attrs) {
                EntryKind::Dir
            } else {
                EntryKind::File
            })
        }
        .boxed()
    }

    fn child_names(&self, path: &str) -> BoxFuture<'_, Result<Vec<String>>> {
        let path = path.to_string();
        async move {
            let entries = self.read_dir(&path).await.map_err(|e| Error::Remote {
                message: format!("sftpRemove: readdir: {e}"),
            })?;
            Ok(entries
                .into_iter()
                .map(|e| e.file_name())
                .filter(|n| n != "." && n != "..")
                .collect())
        }
        .boxed()
    }

    fn remove_file(&self, path: &str) -> BoxFuture<'_, Result<()>> {
        let path = path.to_string();
        async move {
            SftpSession::remove_file(self, &path)
                .await
                .map_err(|e| Error::Remote {
                    message: format!("sftpRemove: {e}"),
                })
        }
        .boxed()
    }

    fn remove_dir(&self, path: &str) -> BoxFuture<'_, Result<()>> {
        let path = path.to_string();
        async move {
            SftpSession::remove_dir(self, &path)
                .await
                .map_err(|e| Error::Remote {
                    message: format!("sftpRemove: rmdir: {e}"),
                })
        }
        .boxed()
    }
}

/// Delete `target` and, for directories, everything beneath it.
///
/// Classification is by lstat: symlinks are deleted as links and never
/// descended, so a link into `/etc` cannot turn a recursive delete into a
/// system wipe.
pub(crate) fn remove_recursive<'a, F>(fs: &'a F, target: String) -> BoxFuture<'a, Result<()>>
where
    F: RemoteEntryOps,
{
    Box::pin(async move {
        match fs.lstat(&target).await? {
            EntryKind::Symlink | EntryKind::File => fs.remove_file(&target).await,
            EntryKind::Dir => {
                for name in fs.child_names(&target).await? {
                    let child = if target.ends_with('/') {
                        format!("{target}{name}")
                    } else {
                        format!("{target}/{name}")
                    };
                    remove_recursive(fs, child).await?;
                }
                fs.remove_dir(&target).await
            }
        }
    })
}
