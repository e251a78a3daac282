//! LIST / MLSD response parser.
//!
//! Supports three formats:
//! 1. **MLSD facts** (RFC 3659): `type=file;size=1234;modify=20260101120000; file.txt`
//! 2. **Unix-style** (`ls -l`): `-rwxr-xr-x 1 owner group 1234 Jan  1 12:00 file.txt`
//! 3. **Windows/IIS-style**: `01-01-26  12:00AM       1234 file.txt`
//!
//! MLSD times are always UTC. Legacy LIST times are local to the server
//! and are converted with the configured [`ServerLocation`].

use crate::ftp::config::ServerLocation;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{base_name, join_remote, EntryKind, FileMetadata};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

lazy_static! {
    static ref UNIX_RE: Regex = Regex::new(
        r"(?x)
        ^([bcdlps-][rwxsStT-]{9})[+@.]?\s+   # permissions (+ ACL marker)
        (\d+)\s+                             # link count
        (\S+)\s+                             # owner
        (?:(\S+)\s+)?                        # group (some servers omit it)
        (\d+)\s+                             # size
        ([A-Za-z]{3})\s+                     # month
        (\d{1,2})\s+                         # day
        (\d{1,2}:\d{2}|\d{4})\s+             # time or year
        (.+)$                                # name (possibly with -> target)
        "
    )
    .unwrap();
    static ref WINDOWS_RE: Regex = Regex::new(
        r"(?x)
        ^(\d{2})-(\d{2})-(\d{2}|\d{4})\s+    # date
        (\d{1,2}):(\d{2})\s*([AaPp][Mm])?\s+ # time
        (<DIR>|\d+)\s+                       # size or <DIR>
        (.+)$                                # name
        "
    )
    .unwrap();
    static ref TOTAL_RE: Regex = Regex::new(r"^total\s+\d+").unwrap();
}

/// Decodes directory listings into [`FileMetadata`].
#[derive(Debug, Clone, Copy)]
pub struct ListingParser {
    location: ServerLocation,
    now: DateTime<Utc>,
}

impl ListingParser {
    pub fn new(location: ServerLocation) -> Self {
        Self::with_now(location, Utc::now())
    }

    /// Parser with a fixed notion of "now" (year inference is relative to it).
    pub fn with_now(location: ServerLocation, now: DateTime<Utc>) -> Self {
        Self { location, now }
    }

    // ─── MLSD ────────────────────────────────────────────────────

    /// Parse an MLSD body. `.`/`..`/cdir/pdir entries are dropped.
    pub fn parse_mlsd(&self, raw: &str, dir: &str) -> FtpResult<Vec<FileMetadata>> {
        self.parse_body(raw, dir, parse_mlsd_line)
    }

    // ─── LIST ────────────────────────────────────────────────────

    /// Parse a Unix or Windows `LIST` body.
    pub fn parse_list(&self, raw: &str, dir: &str) -> FtpResult<Vec<FileMetadata>> {
        self.parse_body(raw, dir, |line| self.parse_list_line(line))
    }

    /// Parse a single legacy LIST line.
    pub fn parse_list_line(&self, line: &str) -> Option<FileMetadata> {
        self.parse_unix(line).or_else(|| self.parse_windows(line))
    }

    fn parse_body<F>(&self, raw: &str, dir: &str, parse: F) -> FtpResult<Vec<FileMetadata>>
    where
        F: Fn(&str) -> Option<FileMetadata>,
    {
        let mut candidates = 0usize;
        let mut parsed = 0usize;
        let mut entries = Vec::new();

        for line in raw.lines() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() || TOTAL_RE.is_match(line.trim_start()) {
                continue;
            }
            candidates += 1;
            match parse(line) {
                Some(mut entry) => {
                    parsed += 1;
                    if is_self_or_parent(&entry) {
                        continue;
                    }
                    entry.path = join_remote(dir, &entry.name);
                    entries.push(entry);
                }
                None => log::debug!("Skipping unparseable listing line: {}", line),
            }
        }

        if candidates > 0 && parsed == 0 {
            return Err(FtpError::parse_error(format!(
                "No entries could be parsed from {} listing lines",
                candidates
            ))
            .with_path(dir));
        }
        Ok(entries)
    }

    /// Parse a Unix `ls -l` line:
    /// ```text
    /// drwxr-xr-x   2 user group  4096 Jan  1 12:00 dirname
    /// -rw-r--r--   1 user group  1234 Jan  1  2025 file.txt
    /// lrwxrwxrwx   1 user group    42 Jan  1 12:00 link -> target
    /// ```
    fn parse_unix(&self, line: &str) -> Option<FileMetadata> {
        let caps = UNIX_RE.captures(line)?;

        let perms = caps.get(1)?.as_str();
        let kind = match perms.as_bytes().first() {
            Some(b'd') => EntryKind::Directory,
            Some(b'l') => EntryKind::Symlink,
            Some(b'-') => EntryKind::File,
            _ => EntryKind::Unknown,
        };

        let name_raw = caps.get(9)?.as_str();
        let (name, link_target) = match (kind, name_raw.find(" -> ")) {
            (EntryKind::Symlink, Some(pos)) => (
                name_raw[..pos].to_string(),
                Some(name_raw[pos + 4..].to_string()),
            ),
            _ => (name_raw.to_string(), None),
        };

        let mut entry = FileMetadata::new(name, kind);
        entry.size = caps.get(5)?.as_str().parse().unwrap_or(0);
        entry.permissions = Some(perms.to_string());
        entry.owner = caps.get(3).map(|m| m.as_str().to_string());
        entry.group = caps.get(4).map(|m| m.as_str().to_string());
        entry.link_target = link_target;
        entry.modified = self.unix_time(
            caps.get(6)?.as_str(),
            caps.get(7)?.as_str(),
            caps.get(8)?.as_str(),
        );
        Some(entry)
    }

    /// `Mon DD HH:MM` (year inferred) or `Mon DD YYYY` (midnight), both in
    /// server time.
    fn unix_time(&self, month: &str, day: &str, time_or_year: &str) -> Option<DateTime<Utc>> {
        let month = month_number(month)?;
        let day: u32 = day.parse().ok()?;

        if let Some((h, m)) = time_or_year.split_once(':') {
            let (hour, minute): (u32, u32) = (h.parse().ok()?, m.parse().ok()?);
            let current_year = self.location.local_time(self.now).year();
            let in_year = |year: i32| {
                NaiveDate::from_ymd_opt(year, month, day)
                    .and_then(|d| d.and_hms_opt(hour, minute, 0))
                    .and_then(|dt| self.location.to_utc(dt))
            };
            match in_year(current_year) {
                Some(t) if t <= self.now => Some(t),
                _ => in_year(current_year - 1),
            }
        } else {
            let year: i32 = time_or_year.parse().ok()?;
            let dt = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)?;
            self.location.to_utc(dt)
        }
    }

    /// Parse Windows / IIS style line:
    /// ```text
    /// 01-01-26  12:00AM       1234 file.txt
    /// 01-01-26  12:00PM      <DIR> Directory Name
    /// ```
    fn parse_windows(&self, line: &str) -> Option<FileMetadata> {
        let caps = WINDOWS_RE.captures(line)?;

        let month: u32 = caps.get(1)?.as_str().parse().ok()?;
        let day: u32 = caps.get(2)?.as_str().parse().ok()?;
        let year_raw = caps.get(3)?.as_str();
        let mut year: i32 = year_raw.parse().ok()?;
        if year_raw.len() == 2 {
            year += if year < 70 { 2000 } else { 1900 };
        }

        let mut hour: u32 = caps.get(4)?.as_str().parse().ok()?;
        let minute: u32 = caps.get(5)?.as_str().parse().ok()?;
        if let Some(ampm) = caps.get(6) {
            let pm = ampm.as_str().eq_ignore_ascii_case("PM");
            if hour == 12 {
                hour = 0;
            }
            if pm {
                hour += 12;
            }
        }

        let size_or_dir = caps.get(7)?.as_str();
        let (kind, size) = if size_or_dir == "<DIR>" {
            (EntryKind::Directory, 0)
        } else {
            (EntryKind::File, size_or_dir.parse().unwrap_or(0))
        };

        let mut entry = FileMetadata::new(caps.get(8)?.as_str(), kind);
        entry.size = size;
        entry.modified = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .and_then(|dt| self.location.to_utc(dt));
        Some(entry)
    }

    // ─── STAT / MLST replies ─────────────────────────────────────

    /// Entries listed in the body of a multi-line `STAT path` reply.
    pub fn parse_stat_reply(&self, lines: &[String]) -> Vec<FileMetadata> {
        reply_body(lines)
            .filter_map(|line| self.parse_list_line(line.trim_start()))
            .collect()
    }
}

/// Parse the facts line of an `MLST` reply for `path`.
///
/// ```text
/// 250-Listing /pub/file.txt
///  type=file;size=42;modify=20240105103000; /pub/file.txt
/// 250 End
/// ```
pub fn parse_mlst_reply(lines: &[String], path: &str) -> FtpResult<FileMetadata> {
    let line = reply_body(lines)
        .find(|l| l.contains('='))
        .ok_or_else(|| FtpError::parse_error("MLST reply carries no facts").with_path(path))?;

    let mut entry = parse_mlsd_line(line.trim_start())
        .ok_or_else(|| FtpError::parse_error(format!("Cannot parse MLST facts: {}", line)).with_path(path))?;
    entry.name = base_name(&entry.name).to_string();
    if entry.name.is_empty() {
        entry.name = base_name(path).to_string();
    }
    entry.path = path.to_string();
    Ok(entry)
}

/// Lines between the first and the terminating line of a reply.
fn reply_body(lines: &[String]) -> impl Iterator<Item = &str> {
    let end = lines.len().saturating_sub(1);
    lines
        .iter()
        .take(end)
        .skip(1)
        .map(String::as_str)
}

/// Parse MLSD fact-line: `fact1=val1;fact2=val2; filename`
pub fn parse_mlsd_line(line: &str) -> Option<FileMetadata> {
    let (facts_str, name) = line.split_once(' ')?;
    if name.is_empty() {
        return None;
    }

    let mut facts: HashMap<String, String> = HashMap::new();
    for segment in facts_str.split(';') {
        if let Some((k, v)) = segment.trim().split_once('=') {
            facts.insert(k.to_ascii_lowercase(), v.to_string());
        }
    }
    if facts.is_empty() {
        return None;
    }

    let mut link_target = None;
    let kind = match facts.get("type").map(|s| s.to_ascii_lowercase()) {
        Some(t) if t == "file" => EntryKind::File,
        Some(t) if t == "dir" || t == "cdir" || t == "pdir" => EntryKind::Directory,
        Some(t) if t.starts_with("os.unix=slink") || t.starts_with("os.unix=symlink") => {
            link_target = facts
                .get("type")
                .and_then(|raw| raw.split_once(':'))
                .map(|(_, target)| target.to_string())
                .filter(|target| !target.is_empty());
            EntryKind::Symlink
        }
        _ => EntryKind::Unknown,
    };

    let mut entry = FileMetadata::new(name, kind);
    entry.size = facts
        .get("size")
        .or_else(|| facts.get("sizd"))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    entry.modified = facts.get("modify").and_then(|v| parse_timestamp(v));
    entry.permissions = facts.get("unix.mode").cloned();
    entry.owner = facts
        .get("unix.ownername")
        .or_else(|| facts.get("unix.owner"))
        .cloned();
    entry.group = facts
        .get("unix.groupname")
        .or_else(|| facts.get("unix.group"))
        .cloned();
    entry.link_target = link_target;
    entry.facts = facts;
    Some(entry)
}

/// Parse an RFC 3659 timestamp: `YYYYMMDDHHMMSS[.sss]`, UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    let (base, fraction) = match s.split_once('.') {
        Some((b, f)) => (b, Some(f)),
        None => (s, None),
    };
    if base.len() != 14 {
        return None;
    }
    let mut dt = NaiveDateTime::parse_from_str(base, "%Y%m%d%H%M%S").ok()?;
    if let Some(frac) = fraction {
        let digits: String = frac.chars().take(3).collect();
        let millis: i64 = format!("{:0<3}", digits).parse().ok()?;
        dt += chrono::Duration::milliseconds(millis);
    }
    Some(Utc.from_utc_datetime(&dt))
}

fn is_self_or_parent(entry: &FileMetadata) -> bool {
    if entry.name == "." || entry.name == ".." {
        return true;
    }
    matches!(
        entry.facts.get("type").map(|t| t.to_ascii_lowercase()).as_deref(),
        Some("cdir") | Some("pdir")
    )
}

fn month_number(name: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let lower = name.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == lower)
        .map(|i| i as u32 + 1)
}
