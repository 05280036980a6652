use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Writes `data` beside `path` and renames it into place, so the destination
/// is either absent, the previous file, or the complete new payload.
pub async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        // create_dir_all tolerates a concurrent create of the same directory.
        fs::create_dir_all(dir).await?;
    }

    let tmp = temp_path(path);
    let written = write_and_rename(&tmp, path, data).await;
    if written.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    written
}

async fn write_and_rename(tmp: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(tmp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(tmp, path).await
}

/// Removes the destination and any leftover temp file. Missing files are fine.
pub async fn discard(path: &Path) -> io::Result<()> {
    for p in [path.to_path_buf(), temp_path(path)] {
        match fs::remove_file(&p).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("graph"));
    name.push(".part");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_host_dir_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host-a").join("1_cpu.png");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn failed_write_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the host directory should be.
        let blocker = dir.path().join("host-b");
        std::fs::write(&blocker, b"not a dir").unwrap();
        let path = blocker.join("1_cpu.png");

        assert!(write_atomic(&path, b"data").await.is_err());
        assert!(!path.exists());
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn concurrent_writers_share_host_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut tasks = Vec::new();
        for i in 0..16 {
            let path = dir.path().join("same-host").join(format!("{i}.png"));
            tasks.push(tokio::spawn(async move { write_atomic(&path, b"png").await }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path().join("same-host")).unwrap().count(), 16);
    }

    #[tokio::test]
    async fn discard_ignores_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.png");
        discard(&path).await.unwrap();

        std::fs::write(&path, b"old").unwrap();
        std::fs::write(temp_path(&path), b"partial").unwrap();
        discard(&path).await.unwrap();
        assert!(!path.exists());
        assert!(!temp_path(&path).exists());
    }
}
