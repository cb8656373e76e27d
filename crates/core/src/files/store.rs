use crate::error::{GatewayError, GatewayResult};
use crate::upstream::ByteStream;
use futures::StreamExt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

const PART_SUFFIX: &str = ".part";
const MAX_SEGMENT_LEN: usize = 255;

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Replace everything outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_id(value: &str) -> String {
    let cleaned = unhide(clean_chars(value));
    if cleaned.is_empty() {
        "id".to_string()
    } else {
        cleaned
    }
}

fn clean_chars(value: &str) -> String {
    value
        .chars()
        .map(|c| if is_safe_char(c) { c } else { '_' })
        .collect()
}

/// Leading dots are reserved for in-progress downloads.
fn unhide(mut value: String) -> String {
    if value.starts_with('.') {
        value.replace_range(..1, "_");
    }
    value
}

/// Keep only the basename, then sanitize like an id.
pub fn sanitize_filename(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let base = normalized.rsplit('/').next().unwrap_or_default();
    let cleaned = clean_chars(base);
    match cleaned.as_str() {
        "" | "." | ".." => "file.bin".to_string(),
        _ => unhide(cleaned),
    }
}

/// A single path component that is already in sanitized form.
pub fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment.len() <= MAX_SEGMENT_LEN
        && segment != "."
        && segment != ".."
        && !segment.starts_with('.')
        && segment.chars().all(is_safe_char)
}

/// True for identifiers that try to climb out of, or escape, a directory.
pub fn has_traversal(value: &str) -> bool {
    value.contains("..")
        || value.starts_with('/')
        || value.starts_with('\\')
        || value.contains('\0')
        || value.chars().nth(1) == Some(':')
}

/// A file found under the storage root at startup.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub day: String,
    pub file_id: String,
    pub filename: String,
    pub relative_path: PathBuf,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

/// Removes a partially written file unless disarmed.
struct PartGuard {
    path: Option<PathBuf>,
}

impl PartGuard {
    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for PartGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial download");
                }
            }
        }
    }
}

/// Filesystem layout for cached downloads: `{root}/{YYYYMMDD}/{file_id}/{generation}/{filename}`.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create (if needed) and canonicalize the root, and check it is writable.
    pub fn new(root: impl AsRef<Path>) -> GatewayResult<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|e| {
            GatewayError::Config(format!("cannot create FILE_STORAGE_DIR {}: {}", root.display(), e))
        })?;
        let root = root.canonicalize().map_err(|e| {
            GatewayError::Config(format!("cannot resolve FILE_STORAGE_DIR {}: {}", root.display(), e))
        })?;

        let probe = root.join(format!(".write-probe-{}", uuid::Uuid::new_v4().simple()));
        std::fs::write(&probe, b"")
            .and_then(|_| std::fs::remove_file(&probe))
            .map_err(|e| {
                GatewayError::Config(format!("FILE_STORAGE_DIR {} is not writable: {}", root.display(), e))
            })?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `{day}/{file_id}/{generation}/{filename}`. Each download gets its own
    /// generation, so evicting an old entry never touches a newer file.
    pub fn relative_path(day: &str, file_id: &str, generation: &str, filename: &str) -> PathBuf {
        PathBuf::from(day).join(file_id).join(generation).join(filename)
    }

    pub fn new_generation() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    fn absolute(&self, relative: &Path) -> GatewayResult<PathBuf> {
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(GatewayError::NotFound("file".to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// Stream a body to `relative`, via a hidden `.part` file renamed into
    /// place once complete. Returns the number of bytes written.
    pub async fn write_stream(&self, relative: &Path, mut body: ByteStream) -> GatewayResult<u64> {
        let target = self.absolute(relative)?;
        let parent = target
            .parent()
            .ok_or_else(|| GatewayError::Internal("cache path has no parent".to_string()))?;
        tokio::fs::create_dir_all(parent).await?;

        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file");
        let part = parent.join(format!(
            ".{}.{}{}",
            name,
            uuid::Uuid::new_v4().simple(),
            PART_SUFFIX
        ));
        let mut guard = PartGuard {
            path: Some(part.clone()),
        };

        let mut file = tokio::fs::File::create(&part).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&part, &target).await?;
        guard.disarm();

        tracing::debug!(path = %relative.display(), bytes = written, "Stored download");
        Ok(written)
    }

    /// Delete a stored file and prune its now-empty directories.
    pub async fn remove(&self, relative: &Path) -> GatewayResult<()> {
        let target = self.absolute(relative)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // Fails harmlessly while other files remain.
        let mut dir = target.parent();
        while let Some(d) = dir {
            if d == self.root || tokio::fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(())
    }

    /// Resolve a stored file to its canonical path, refusing anything that
    /// lands outside the root (symlinks included).
    pub async fn resolve_existing(&self, relative: &Path) -> GatewayResult<PathBuf> {
        let target = self.absolute(relative)?;
        let canonical = tokio::fs::canonicalize(&target)
            .await
            .map_err(|_| GatewayError::NotFound("file".to_string()))?;
        if !canonical.starts_with(&self.root) || !canonical.is_file() {
            return Err(GatewayError::NotFound("file".to_string()));
        }
        Ok(canonical)
    }

    /// Walk the root for files laid out as `day/id/generation/name`. Leftover `.part`
    /// files and anything outside that shape are removed or skipped.
    pub fn scan(&self) -> GatewayResult<Vec<StoredFile>> {
        let mut found = Vec::new();

        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(4)
            .follow_links(false)
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable cache entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy();
            if name.ends_with(PART_SUFFIX) {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Failed to remove stale partial file");
                }
                continue;
            }
            if entry.depth() != 4 {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            let [day, file_id, generation, filename] = parts.as_slice() else {
                continue;
            };
            if !is_day(day)
                || !is_safe_segment(file_id)
                || !is_safe_segment(generation)
                || !is_safe_segment(filename)
            {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Skipping cache file without metadata");
                    continue;
                }
            };
            found.push(StoredFile {
                day: day.clone(),
                file_id: file_id.clone(),
                filename: filename.clone(),
                relative_path: relative.to_path_buf(),
                size_bytes: metadata.len(),
                modified: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
            });
        }
        Ok(found)
    }
}

/// `YYYYMMDD`.
pub fn is_day(value: &str) -> bool {
    value.len() == 8 && value.chars().all(|c| c.is_ascii_digit())
}
