//! Local directory tree as a source.
//!
//! Media ids are paths relative to the configured root, with `/` separators.
//! Directories are containers, files are audio, video, image or generic
//! media depending on their extension. Everything is answered inline.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use trove_core::config::FilesystemSourceConfig;
use trove_core::{
    system, Caps, Error, KeyId, Media, MediaKind, OperationKind, OperationOptions, Result,
    SupportedOps, TypeFilter,
};
use trove_source::{
    BrowseRequest, MediaFromUriRequest, ReplySink, ResolveRequest, ResultSink, SearchRequest,
    Source, SourceInfo,
};
use walkdir::{DirEntry, WalkDir};

const KEYS: &[KeyId] = &[
    system::ID,
    system::TITLE,
    system::URL,
    system::MIME,
    system::CHILDCOUNT,
    system::MODIFICATION_DATE,
];

/// Keys that cost a `stat` or a directory listing per item.
const SLOW_KEYS: &[KeyId] = &[system::CHILDCOUNT, system::MODIFICATION_DATE];

const AUDIO: &[&str] = &["mp3", "ogg", "oga", "opus", "flac", "wav", "m4a", "aac"];
const VIDEO: &[&str] = &["mp4", "m4v", "mkv", "webm", "avi", "mov", "ogv"];
const IMAGE: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];

pub struct FilesystemSource {
    info: SourceInfo,
    root: PathBuf,
    show_hidden: bool,
}

impl FilesystemSource {
    /// Fails with [`Error::Config`] if the root is not a readable directory.
    pub fn new(config: &FilesystemSourceConfig) -> Result<Self> {
        let root = config.root.canonicalize().map_err(|e| {
            Error::config(format!(
                "filesystem source '{}': root {:?}: {e}",
                config.id, config.root
            ))
        })?;
        if !root.is_dir() {
            return Err(Error::config(format!(
                "filesystem source '{}': root {:?} is not a directory",
                config.id, root
            )));
        }

        let name = config.name.clone().unwrap_or_else(|| "Filesystem".to_string());
        let info = SourceInfo::new(config.id.clone(), name)
            .with_description(format!("Files under {}", root.display()))
            .with_rank(config.rank);

        Ok(Self {
            info,
            root,
            show_hidden: config.show_hidden,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a media id. Ids that climb out of the root are
    /// rejected.
    fn path_for(&self, id: &str) -> Option<PathBuf> {
        let relative = Path::new(id);
        let clean = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        clean.then(|| self.root.join(relative))
    }

    fn id_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect();
        (!parts.is_empty()).then(|| parts.join("/"))
    }

    fn path_for_uri(&self, uri: &str) -> Option<PathBuf> {
        let path = PathBuf::from(uri.strip_prefix("file://")?);
        path.starts_with(&self.root).then_some(path)
    }

    fn visible(&self, entry: &DirEntry) -> bool {
        entry.depth() == 0 || self.show_hidden || !is_hidden(entry.file_name())
    }

    fn walk(&self, dir: &Path, max_depth: usize) -> impl Iterator<Item = DirEntry> + '_ {
        WalkDir::new(dir)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| self.visible(e))
            .filter_map(|e| match e {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::warn!(source = %self.info.id, error = %err, "skipping unreadable entry");
                    None
                }
            })
    }

    /// Build the media for `path`, filling only `keys`.
    fn media_for(&self, path: &Path, keys: &[KeyId]) -> Result<Media> {
        let id = self
            .id_for(path)
            .ok_or_else(|| Error::not_found("media", path.display()))?;
        let metadata = std::fs::metadata(path)?;
        let wants = |key: KeyId| keys.contains(&key);

        let mut media = if metadata.is_dir() {
            let mut media = Media::container();
            if wants(system::CHILDCOUNT) {
                let count = self.walk(path, 1).count();
                media.set_child_count(Some(u32::try_from(count).unwrap_or(u32::MAX)));
            }
            media
        } else {
            Media::new(kind_for(path))
        };
        media.set_id(id);
        media.set_source(self.info.id.clone());

        if wants(system::TITLE) {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            media.set_title(name);
        }
        if wants(system::URL) {
            media.set_url(format!("file://{}", path.display()));
        }
        if wants(system::MIME) {
            if let Some(mime) = mime_for(path, metadata.is_dir()) {
                media.set(system::MIME, mime);
            }
        }
        if wants(system::MODIFICATION_DATE) {
            if let Ok(modified) = metadata.modified() {
                media.set(system::MODIFICATION_DATE, DateTime::<Utc>::from(modified));
            }
        }
        Ok(media)
    }

    fn page(&self, paths: impl Iterator<Item = PathBuf>, keys: &[KeyId], options: &OperationOptions) -> Vec<Media> {
        let limit = options.count().as_limit().map_or(usize::MAX, |n| n as usize);
        paths
            .filter_map(|path| match self.media_for(&path, keys) {
                Ok(media) => Some(media),
                Err(err) => {
                    tracing::warn!(source = %self.info.id, path = %path.display(), error = %err, "skipping entry");
                    None
                }
            })
            .filter(|media| options.matches(media))
            .skip(options.skip() as usize)
            .take(limit)
            .collect()
    }

    fn send_all(items: Vec<Media>, sink: ResultSink) {
        let total = items.len();
        for (i, media) in items.into_iter().enumerate() {
            if sink.is_cancelled() {
                break;
            }
            sink.send(media, (total - i - 1) as u32);
        }
        sink.finish();
    }

    fn lookup(&self, media: &Media) -> Result<PathBuf> {
        let from_id = (media.source() == Some(self.id()) || media.source().is_none())
            .then(|| media.id().and_then(|id| self.path_for(id)))
            .flatten();
        from_id
            .or_else(|| media.url().and_then(|url| self.path_for_uri(url)))
            .filter(|path| path.exists())
            .ok_or_else(|| Error::not_found("media", media.id().or(media.url()).unwrap_or("-")))
    }
}

impl std::fmt::Debug for FilesystemSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesystemSource")
            .field("id", &self.info.id)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl Source for FilesystemSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn supported_operations(&self) -> SupportedOps {
        SupportedOps::BROWSE
            | SupportedOps::SEARCH
            | SupportedOps::RESOLVE
            | SupportedOps::MEDIA_FROM_URI
    }

    fn supported_keys(&self) -> &[KeyId] {
        KEYS
    }

    fn slow_keys(&self) -> &[KeyId] {
        SLOW_KEYS
    }

    fn caps(&self, operation: OperationKind) -> Caps {
        match operation {
            OperationKind::Browse | OperationKind::Search => Caps::new()
                .with_pagination(true)
                .with_type_filter(TypeFilter::ALL),
            _ => Caps::new(),
        }
    }

    fn browse(&self, request: BrowseRequest, sink: ResultSink) {
        let dir = match request.container.as_ref().and_then(|c| c.id()) {
            None => self.root.clone(),
            Some(id) => match self.path_for(id).filter(|p| p.is_dir()) {
                Some(dir) => dir,
                None => {
                    sink.fail(Error::not_found("container", id));
                    return;
                }
            },
        };

        let children = self.walk(&dir, 1).map(DirEntry::into_path);
        let page = self.page(children, &request.keys, &request.options);
        Self::send_all(page, sink);
    }

    /// Case-insensitive match of `text` against file names; directories are
    /// not returned.
    fn search(&self, request: SearchRequest, sink: ResultSink) {
        let needle = request
            .text
            .as_deref()
            .map(str::to_lowercase)
            .filter(|t| !t.is_empty());
        let files = self
            .walk(&self.root, usize::MAX)
            .filter(|e| e.file_type().is_file())
            .filter(|e| match &needle {
                None => true,
                Some(needle) => e.file_name().to_string_lossy().to_lowercase().contains(needle),
            })
            .map(DirEntry::into_path);
        let page = self.page(files, &request.keys, &request.options);
        Self::send_all(page, sink);
    }

    fn resolve(&self, request: ResolveRequest, sink: ReplySink) {
        let result = self.lookup(&request.media).and_then(|path| {
            let mut media = self.media_for(&path, &request.keys)?;
            media.merge_missing(&request.media);
            Ok(Some(media))
        });
        sink.complete(result);
    }

    fn test_media_from_uri(&self, uri: &str) -> bool {
        self.path_for_uri(uri).is_some_and(|path| path.exists())
    }

    fn media_from_uri(&self, request: MediaFromUriRequest, sink: ReplySink) {
        let result = self
            .path_for_uri(&request.uri)
            .filter(|path| path.exists())
            .ok_or_else(|| Error::not_found("uri", &request.uri))
            .and_then(|path| self.media_for(&path, &request.keys).map(Some));
        sink.complete(result);
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

fn extension(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

fn kind_for(path: &Path) -> MediaKind {
    match extension(path).as_deref() {
        Some(ext) if AUDIO.contains(&ext) => MediaKind::Audio,
        Some(ext) if VIDEO.contains(&ext) => MediaKind::Video,
        Some(ext) if IMAGE.contains(&ext) => MediaKind::Image,
        _ => MediaKind::Generic,
    }
}

fn mime_for(path: &Path, is_dir: bool) -> Option<&'static str> {
    if is_dir {
        return Some("inode/directory");
    }
    let mime = match extension(path)?.as_str() {
        "mp3" => "audio/mpeg",
        "ogg" | "oga" => "audio/ogg",
        "opus" => "audio/opus",
        "flac" => "audio/flac",
        "wav" => "audio/x-wav",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "ogv" => "video/ogg",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => return None,
    };
    Some(mime)
}
