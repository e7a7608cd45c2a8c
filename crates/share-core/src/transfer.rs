//! Data streams: one unidirectional stream per offered file.
//!
//! ```text
//! u16 name_len (1..=4096) | name (UTF-8) | u64 size | size bytes
//! ```
//!
//! Integers are big-endian. Data I/O has no per-operation deadline; only the
//! session's cancellation token interrupts it.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ShareError};
use crate::offer::{validate_name, FileMeta, MAX_NAME_LEN};

const COPY_BUF: usize = 64 * 1024;

pub async fn write_header<W: AsyncWrite + Unpin>(w: &mut W, name: &str, size: u64) -> Result<()> {
    validate_name(name)?;
    let name_len = name.len() as u16;
    let mut header = Vec::with_capacity(2 + name.len() + 8);
    header.extend_from_slice(&name_len.to_be_bytes());
    header.extend_from_slice(name.as_bytes());
    header.extend_from_slice(&size.to_be_bytes());
    w.write_all(&header)
        .await
        .map_err(|e| ShareError::io("writing stream header", e))
}

/// Read and validate a stream header. Bad lengths and unsafe names are
/// protocol errors; nothing has touched the filesystem yet.
pub async fn read_header<R: AsyncRead + Unpin>(r: &mut R) -> Result<(String, u64)> {
    let name_len = r.read_u16().await.map_err(header_io)? as usize;
    if name_len == 0 || name_len > MAX_NAME_LEN {
        return Err(ShareError::Protocol(format!(
            "name length {} outside 1..={}",
            name_len, MAX_NAME_LEN
        )));
    }
    let mut name = vec![0u8; name_len];
    r.read_exact(&mut name).await.map_err(header_io)?;
    let name = String::from_utf8(name)
        .map_err(|_| ShareError::Protocol("file name is not UTF-8".into()))?;
    validate_name(&name)?;
    let size = r.read_u64().await.map_err(header_io)?;
    Ok((name, size))
}

fn header_io(e: std::io::Error) -> ShareError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ShareError::Protocol("data stream ended inside its header".into())
    } else {
        ShareError::io("reading stream header", e)
    }
}

/// Stream `source` as `meta`. The file must still have the offered size.
pub async fn send_file<W: AsyncWrite + Unpin>(
    w: &mut W,
    meta: &FileMeta,
    source: &Path,
    cancel: &CancellationToken,
) -> Result<u64> {
    let ctx = format!("reading {}", source.display());
    tokio::select! {
        _ = cancel.cancelled() => Err(ShareError::Cancelled),
        res = async {
            let file = tokio::fs::File::open(source)
                .await
                .map_err(|e| ShareError::io(&ctx, e))?;
            let on_disk = file
                .metadata()
                .await
                .map_err(|e| ShareError::io(&ctx, e))?
                .len();
            if on_disk != meta.size {
                return Err(ShareError::Transfer(format!(
                    "{} changed size since the offer ({} -> {})",
                    source.display(),
                    meta.size,
                    on_disk
                )));
            }

            write_header(w, &meta.name, meta.size).await?;
            let mut body = file.take(meta.size);
            let sent = tokio::io::copy(&mut body, w)
                .await
                .map_err(|e| ShareError::io(&format!("sending {}", meta.name), e))?;
            if sent != meta.size {
                return Err(ShareError::Transfer(format!(
                    "{} shrank while sending ({} of {} bytes)",
                    source.display(),
                    sent,
                    meta.size
                )));
            }
            w.flush()
                .await
                .map_err(|e| ShareError::io(&format!("sending {}", meta.name), e))?;
            Ok(sent)
        } => res,
    }
}

/// Create `dir` (mode 0755 on unix) if it does not exist yet.
pub async fn prepare_dest_dir(dir: &Path) -> Result<()> {
    if tokio::fs::metadata(dir).await.is_ok() {
        return Ok(());
    }
    let ctx = format!("creating {}", dir.display());
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| ShareError::io(&ctx, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|e| ShareError::io(&ctx, e))?;
    }
    Ok(())
}

fn part_path(dest_dir: &Path, name: &str) -> PathBuf {
    dest_dir.join(format!(".{name}.part"))
}

/// Receive one file announced as `expected` into `dest_dir`.
///
/// Content goes to a fresh `.<name>.part` sibling that is renamed over
/// `<name>` only after the size (and digest, if offered) check out. Any
/// failure removes the partial file.
pub async fn receive_file<R: AsyncRead + Unpin>(
    r: &mut R,
    expected: &FileMeta,
    dest_dir: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let (name, size) = tokio::select! {
        _ = cancel.cancelled() => return Err(ShareError::Cancelled),
        res = read_header(r) => res?,
    };
    if name != expected.name {
        return Err(ShareError::Protocol(format!(
            "data stream carries {:?}, offer expected {:?}",
            name, expected.name
        )));
    }
    if size != expected.size {
        return Err(ShareError::Protocol(format!(
            "{:?} declared {} bytes, offer said {}",
            name, size, expected.size
        )));
    }

    let part = part_path(dest_dir, &name);
    let target = dest_dir.join(&name);

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(ShareError::Cancelled),
        res = write_body(r, &part, expected) => res,
    };
    if let Err(e) = outcome {
        if let Err(rm) = tokio::fs::remove_file(&part).await {
            if rm.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(file = %part.display(), "removing partial file failed: {}", rm);
            }
        }
        return Err(e);
    }

    if let Err(e) = tokio::fs::rename(&part, &target).await {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(ShareError::io(&format!("renaming into {}", target.display()), e));
    }
    Ok(target)
}

async fn write_body<R: AsyncRead + Unpin>(r: &mut R, part: &Path, expected: &FileMeta) -> Result<()> {
    let ctx = format!("writing {}", part.display());

    // A stale part file from an interrupted run is ours to discard.
    match tokio::fs::remove_file(part).await {
        Ok(()) => tracing::debug!(file = %part.display(), "removed stale partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(ShareError::io(&ctx, e)),
    }
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(part)
        .await
        .map_err(|e| ShareError::io(&ctx, e))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUF];
    let mut remaining = expected.size;
    while remaining > 0 {
        let want = remaining.min(COPY_BUF as u64) as usize;
        let n = r
            .read(&mut buf[..want])
            .await
            .map_err(|e| ShareError::io(&format!("reading {}", expected.name), e))?;
        if n == 0 {
            return Err(ShareError::Protocol(format!(
                "{:?} ended after {} of {} bytes",
                expected.name,
                expected.size - remaining,
                expected.size
            )));
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])
            .await
            .map_err(|e| ShareError::io(&ctx, e))?;
        remaining -= n as u64;
    }

    // Declared size reached; the sender must finish the stream here.
    let extra = r
        .read(&mut buf[..1])
        .await
        .map_err(|e| ShareError::io(&format!("reading {}", expected.name), e))?;
    if extra != 0 {
        return Err(ShareError::Protocol(format!(
            "{:?} carries more than the declared {} bytes",
            expected.name, expected.size
        )));
    }

    file.sync_all().await.map_err(|e| ShareError::io(&ctx, e))?;
    drop(file);

    if let Some(want) = &expected.sha256 {
        let got = hex::encode(hasher.finalize());
        if !got.eq_ignore_ascii_case(want) {
            return Err(ShareError::Transfer(format!(
                "sha256 mismatch for {:?}",
                expected.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::duplex;

    fn meta(name: &str, body: &[u8]) -> FileMeta {
        FileMeta {
            name: name.into(),
            size: body.len() as u64,
            sha256: Some(hex::encode(Sha256::digest(body))),
        }
    }

    fn raw_stream(name: &[u8], size: u64, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn file_crosses_the_pipe() {
        let src_dir = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let body = [0u8, 1, 2, 3, 4];
        let src = src_dir.path().join("b.bin");
        std::fs::write(&src, body).unwrap();
        let m = meta("b.bin", &body);
        let cancel = CancellationToken::new();

        let (mut tx, mut rx) = duplex(1024);
        let (sent, got) = tokio::join!(
            async {
                let n = send_file(&mut tx, &m, &src, &cancel).await;
                drop(tx);
                n
            },
            receive_file(&mut rx, &m, dest.path(), &cancel)
        );
        assert_eq!(sent.unwrap(), 5);
        let path = got.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), body);
        assert_eq!(entries(dest.path()), vec!["b.bin"]);
    }

    #[tokio::test]
    async fn escaping_name_writes_nothing() {
        let dest = TempDir::new().unwrap();
        let wire = raw_stream(b"../../etc/passwd", 4, b"root");
        let m = FileMeta {
            name: "../../etc/passwd".into(),
            size: 4,
            sha256: None,
        };
        let err = receive_file(&mut wire.as_slice(), &m, dest.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::Protocol(_)));
        assert!(entries(dest.path()).is_empty());
    }

    #[tokio::test]
    async fn zero_and_oversize_name_lengths_are_refused() {
        let mut zero: &[u8] = &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(read_header(&mut zero).await, Err(ShareError::Protocol(_))));

        let long = 4097u16.to_be_bytes();
        let mut oversize: &[u8] = &long;
        assert!(matches!(read_header(&mut oversize).await, Err(ShareError::Protocol(_))));
    }

    #[tokio::test]
    async fn short_stream_removes_partial_file() {
        let dest = TempDir::new().unwrap();
        let wire = raw_stream(b"a.toml", 12, b"hello");
        let m = FileMeta {
            name: "a.toml".into(),
            size: 12,
            sha256: None,
        };
        let err = receive_file(&mut wire.as_slice(), &m, dest.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::Protocol(ref msg) if msg.contains("5 of 12")));
        assert!(entries(dest.path()).is_empty());
    }

    #[tokio::test]
    async fn trailing_bytes_are_refused() {
        let dest = TempDir::new().unwrap();
        let wire = raw_stream(b"a.toml", 2, b"abc");
        let m = FileMeta {
            name: "a.toml".into(),
            size: 2,
            sha256: None,
        };
        let err = receive_file(&mut wire.as_slice(), &m, dest.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::Protocol(_)));
        assert!(entries(dest.path()).is_empty());
    }

    #[tokio::test]
    async fn digest_mismatch_keeps_old_artifact() {
        let dest = TempDir::new().unwrap();
        std::fs::write(dest.path().join("a.toml"), b"old").unwrap();
        let wire = raw_stream(b"a.toml", 3, b"new");
        let m = FileMeta {
            name: "a.toml".into(),
            size: 3,
            sha256: Some(hex::encode(Sha256::digest(b"not it"))),
        };
        let err = receive_file(&mut wire.as_slice(), &m, dest.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::Transfer(_)));
        assert_eq!(std::fs::read(dest.path().join("a.toml")).unwrap(), b"old");
        assert_eq!(entries(dest.path()), vec!["a.toml"]);
    }

    #[tokio::test]
    async fn stream_must_match_offer_entry() {
        let dest = TempDir::new().unwrap();
        let wire = raw_stream(b"other.db", 1, b"x");
        let m = meta("config.toml", b"x");
        let err = receive_file(&mut wire.as_slice(), &m, dest.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::Protocol(_)));
    }

    #[tokio::test]
    async fn dest_dir_is_created() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("nested").join(".gns3");
        prepare_dest_dir(&dir).await.unwrap();
        assert!(dir.is_dir());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }
}
