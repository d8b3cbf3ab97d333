//! Find recorded session directories and restrict them to a date window.

use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, Weekday};
use log::{debug, warn};

use crate::config::{DateRange, Layout, UnparsedNamePolicy};

/// Naming scheme of session directories, e.g. `Tue_Mar_18_10:00:00_2025`.
pub const SESSION_TIME_FORMAT: &str = "%a_%b_%d_%H:%M:%S_%Y";

/// [`SESSION_TIME_FORMAT`] without the leading weekday, which must name a
/// weekday but is not checked against the date.
const SESSION_DATE_FORMAT: &str = "%b_%d_%H:%M:%S_%Y";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("data root '{0}' does not exist")]
    MissingRoot(PathBuf),
    #[error("failed to walk {root}")]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("session directory '{path}' is not named like %a_%b_%d_%H:%M:%S_%Y: {reason}")]
    UnparsedName { path: PathBuf, reason: String },
}

/// One session directory scheduled for conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodePath {
    /// Position in the sorted discovery output; stable across reruns.
    pub episode_id: u32,
    pub dir: PathBuf,
    pub log_path: PathBuf,
    pub recordings_path: PathBuf,
}

impl EpisodePath {
    fn new(episode_id: u32, dir: PathBuf, layout: &Layout) -> Self {
        let log_path = dir.join(&layout.log_file);
        let recordings_path = dir.join(&layout.recordings_dir);
        Self {
            episode_id,
            dir,
            log_path,
            recordings_path,
        }
    }

    /// Identifier handed to the sink alongside the episode.
    pub fn key(&self) -> String {
        self.dir.display().to_string()
    }
}

/// Discover, filter and number every convertible session under `root`.
pub fn discover_episodes(
    root: &Path,
    layout: &Layout,
    dates: &DateRange,
    policy: UnparsedNamePolicy,
) -> Result<Vec<EpisodePath>, DiscoveryError> {
    let dirs = crawl_session_dirs(root, layout)?;
    let dirs = filter_by_date(dirs, dates, policy)?;
    Ok(dirs
        .into_iter()
        .enumerate()
        .map(|(idx, dir)| EpisodePath::new(idx as u32, dir, layout))
        .collect())
}

/// Every directory below `root` holding the log file and the recordings
/// folder, sorted by path.
pub fn crawl_session_dirs(root: &Path, layout: &Layout) -> Result<Vec<PathBuf>, DiscoveryError> {
    if !root.is_dir() {
        return Err(DiscoveryError::MissingRoot(root.to_path_buf()));
    }
    let mut dirs = Vec::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(source) if source.depth() == 0 => {
                return Err(DiscoveryError::Walk {
                    root: root.to_path_buf(),
                    source,
                });
            }
            Err(err) => {
                warn!("Ignoring unreadable entry under {}: {err}", root.display());
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let dir = entry.path();
        if dir.join(&layout.log_file).is_file() && dir.join(&layout.recordings_dir).is_dir() {
            dirs.push(dir.to_path_buf());
        } else {
            debug!("{} is not a session directory", dir.display());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Parse the timestamp encoded in the last component of `dir`.
pub fn parse_session_timestamp(dir: &Path) -> Result<NaiveDateTime, DiscoveryError> {
    let name = dir
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| DiscoveryError::UnparsedName {
            path: dir.to_path_buf(),
            reason: "name is not valid UTF-8".to_string(),
        })?;
    let unparsed = |reason: String| DiscoveryError::UnparsedName {
        path: dir.to_path_buf(),
        reason,
    };
    let (weekday, rest) = name
        .split_once('_')
        .ok_or_else(|| unparsed("missing weekday".to_string()))?;
    weekday
        .parse::<Weekday>()
        .map_err(|_| unparsed(format!("'{weekday}' is not a weekday")))?;
    NaiveDateTime::parse_from_str(rest, SESSION_DATE_FORMAT).map_err(|err| unparsed(err.to_string()))
}

/// Keep the directories whose timestamp lies inside `dates`. Names are only
/// parsed when at least one bound is set.
pub fn filter_by_date(
    dirs: Vec<PathBuf>,
    dates: &DateRange,
    policy: UnparsedNamePolicy,
) -> Result<Vec<PathBuf>, DiscoveryError> {
    if !dates.is_bounded() {
        return Ok(dirs);
    }
    let mut kept = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let ts = match parse_session_timestamp(&dir) {
            Ok(ts) => ts,
            Err(err) => match policy {
                UnparsedNamePolicy::Fail => return Err(err),
                UnparsedNamePolicy::Skip => {
                    warn!("Skipping {err}");
                    continue;
                }
            },
        };
        if dates.contains(ts) {
            kept.push(dir);
        } else {
            debug!("{} ({ts}) is outside the date window", dir.display());
        }
    }
    Ok(kept)
}
