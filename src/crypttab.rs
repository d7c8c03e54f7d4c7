//! `/etc/crypttab` reading and the `keyscript=` patch.
//!
//! Lines are `name source keyfile options`, whitespace separated; `#` starts a
//! comment line. Only the first entry is ever modified and every other byte of
//! the file is preserved.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrypttabError {
    #[error("no entries in crypttab")]
    NoEntries,
    #[error("crypttab line {line} has no source device: `{text}`")]
    Malformed { line: usize, text: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = CrypttabError> = core::result::Result<T, E>;

/// One line of `crypttab`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrypttabEntry {
    pub name: String,
    pub source: String,
    pub key: Option<String>,
    pub options: Vec<String>,
}

impl CrypttabEntry {
    pub fn parse(line: &str) -> Option<Self> {
        if is_comment_or_blank(line) {
            return None;
        }
        let mut fields = line.split_whitespace();
        let name = fields.next()?.to_string();
        let source = fields.next()?.to_string();
        let key = fields.next().map(str::to_string);
        let options = fields
            .next()
            .map(|opts| opts.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        Some(Self {
            name,
            source,
            key,
            options,
        })
    }

    pub fn keyscript(&self) -> Option<&str> {
        self.options
            .iter()
            .find_map(|opt| opt.strip_prefix("keyscript="))
    }
}

fn is_comment_or_blank(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.is_empty() || trimmed.starts_with('#')
}

/// The first entry in a crypttab document.
pub fn first_entry(contents: &str) -> Option<CrypttabEntry> {
    contents.lines().find_map(CrypttabEntry::parse)
}

pub fn read_first_entry(path: &Path) -> Result<CrypttabEntry> {
    first_entry(&fs::read_to_string(path)?).ok_or(CrypttabError::NoEntries)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyscriptPatch {
    Appended,
    /// A different `keyscript=` was already configured and got swapped out.
    Replaced { previous: String },
    AlreadyPresent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patched {
    pub contents: String,
    pub outcome: KeyscriptPatch,
    /// 1-based line number of the patched entry.
    pub line: usize,
    /// Entries after the patched one, which are left for manual editing.
    pub remaining_entries: usize,
}

/// Byte ranges of the whitespace separated fields of `line`.
fn field_spans(line: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, c) in line.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                spans.push((s, i));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push((s, line.len()));
    }
    spans
}

fn patch_line(line: &str, number: usize, option: &str) -> Result<(String, KeyscriptPatch)> {
    let spans = field_spans(line);
    let end = spans.last().map(|&(_, e)| e).unwrap_or(0);
    match spans.len() {
        0 | 1 => Err(CrypttabError::Malformed {
            line: number,
            text: line.to_string(),
        }),
        2 => Ok((
            format!("{} none {option}", &line[..end]),
            KeyscriptPatch::Appended,
        )),
        3 => Ok((format!("{} {option}", &line[..end]), KeyscriptPatch::Appended)),
        _ => {
            let (start, stop) = spans[3];
            let options: Vec<&str> = line[start..stop].split(',').collect();
            if options.contains(&option) {
                return Ok((line.to_string(), KeyscriptPatch::AlreadyPresent));
            }
            let previous = options
                .iter()
                .find_map(|opt| opt.strip_prefix("keyscript="));
            let (patched, outcome) = match previous {
                Some(previous) => (
                    options
                        .iter()
                        .map(|opt| {
                            if opt.starts_with("keyscript=") {
                                option
                            } else {
                                *opt
                            }
                        })
                        .collect::<Vec<_>>()
                        .join(","),
                    KeyscriptPatch::Replaced {
                        previous: previous.to_string(),
                    },
                ),
                None => (
                    format!("{},{option}", &line[start..stop]),
                    KeyscriptPatch::Appended,
                ),
            };
            Ok((
                format!("{}{}{}", &line[..start], patched, &line[stop..]),
                outcome,
            ))
        }
    }
}

/// Add `keyscript=<keyscript>` to the options of the first entry.
pub fn patch_keyscript(contents: &str, keyscript: &Path) -> Result<Patched> {
    let option = format!("keyscript={}", keyscript.display());
    let mut output = String::with_capacity(contents.len() + option.len() + 1);
    let mut patched = None;
    let mut remaining_entries = 0;

    for (i, raw) in contents.split_inclusive('\n').enumerate() {
        let (line, ending) = match raw.strip_suffix('\n') {
            Some(line) => (line, "\n"),
            None => (raw, ""),
        };
        if patched.is_some() || is_comment_or_blank(line) {
            if patched.is_some() && !is_comment_or_blank(line) {
                remaining_entries += 1;
            }
            output.push_str(raw);
            continue;
        }
        let (new_line, outcome) = patch_line(line, i + 1, &option)?;
        output.push_str(&new_line);
        output.push_str(ending);
        patched = Some((i + 1, outcome));
    }

    let (line, outcome) = patched.ok_or(CrypttabError::NoEntries)?;
    Ok(Patched {
        contents: output,
        outcome,
        line,
        remaining_entries,
    })
}

/// `<path>.bak`
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

/// Patch the crypttab at `path` in place. A backup is taken first unless one
/// already exists from an earlier run, so the backup always holds the
/// pre-provisioning file.
pub fn patch_file(path: &Path, keyscript: &Path) -> Result<Patched> {
    let contents = fs::read_to_string(path)?;
    let patched = patch_keyscript(&contents, keyscript)?;
    if patched.outcome == KeyscriptPatch::AlreadyPresent {
        return Ok(patched);
    }

    let backup = backup_path(path);
    if backup.exists() {
        log::info!("Keeping existing crypttab backup {}", backup.display());
    } else {
        log::info!("Backing up {} to {}", path.display(), backup.display());
        fs::copy(path, &backup)?;
    }

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mode = fs::metadata(path)?.permissions().mode();
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(patched.contents.as_bytes())?;
    temp.as_file().sync_all()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(mode))?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(patched)
}
