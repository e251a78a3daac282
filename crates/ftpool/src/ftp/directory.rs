//! Directory operations — list, mkdir, rmdir, rename, stat, pwd.

use crate::ftp::channel::ControlChannel;
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::parser::{parse_mlst_reply, ListingParser};
use crate::ftp::types::{base_name, EntryKind, FileMetadata, FtpResponse};

impl ControlChannel {
    // ─── LIST / MLSD ─────────────────────────────────────────────

    /// List a directory: MLSD when the server advertises it, LIST otherwise.
    pub async fn list(
        &mut self,
        path: &str,
        parser: &ListingParser,
    ) -> FtpResult<Vec<FileMetadata>> {
        let mlsd = self.features().mlsd;
        let verb = if mlsd { "MLSD" } else { "LIST" };
        let cmd = if path.is_empty() {
            verb.to_string()
        } else {
            format!("{} {}", verb, path)
        };

        let body = self
            .read_data_command(&cmd)
            .await
            .map_err(|e| e.with_path(path))?;
        let text = String::from_utf8_lossy(&body);

        if mlsd {
            parser.parse_mlsd(&text, path)
        } else {
            parser.parse_list(&text, path)
        }
    }

    // ─── MKD ─────────────────────────────────────────────────────

    /// Create a directory; returns the path reported by the server.
    pub async fn make_dir(&mut self, path: &str) -> FtpResult<String> {
        let resp = self.execute(&format!("MKD {}", path)).await?;
        match resp.code {
            257 => Ok(parse_quoted_path(&resp).unwrap_or_else(|| path.to_string())),
            521 => Err(already_exists(path, &resp)),
            550 | 553 if resp.text().to_ascii_lowercase().contains("exist") => {
                Err(already_exists(path, &resp))
            }
            code => Err(FtpError::from_reply("MKD", code, resp.message()).with_path(path)),
        }
    }

    // ─── RMD / DELE ──────────────────────────────────────────────

    /// Remove an empty directory.
    pub async fn remove_dir(&mut self, path: &str) -> FtpResult<()> {
        self.expect(&format!("RMD {}", path), is_completion)
            .await
            .map_err(|e| e.with_path(path))?;
        Ok(())
    }

    /// Delete a remote file.
    pub async fn delete_file(&mut self, path: &str) -> FtpResult<()> {
        self.expect(&format!("DELE {}", path), is_completion)
            .await
            .map_err(|e| e.with_path(path))?;
        Ok(())
    }

    // ─── RNFR / RNTO ────────────────────────────────────────────

    /// Rename (or move) a file or directory.
    pub async fn rename(&mut self, from: &str, to: &str) -> FtpResult<()> {
        self.expect(&format!("RNFR {}", from), |c| c == 350)
            .await
            .map_err(|e| e.with_path(from))?;
        self.expect(&format!("RNTO {}", to), is_completion)
            .await
            .map_err(|e| e.with_path(to))?;
        Ok(())
    }

    // ─── PWD / CWD ───────────────────────────────────────────────

    /// Current working directory from `257 "<path>"`.
    pub async fn working_directory(&mut self) -> FtpResult<String> {
        let resp = self.expect("PWD", |c| c == 257).await?;
        parse_quoted_path(&resp)
            .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse PWD: {}", resp.text())))
    }

    /// Change the working directory.
    pub async fn change_dir(&mut self, path: &str) -> FtpResult<()> {
        self.expect(&format!("CWD {}", path), is_completion)
            .await
            .map_err(|e| e.with_path(path))?;
        Ok(())
    }

    // ─── Stat ────────────────────────────────────────────────────

    /// Metadata for a single path.
    ///
    /// Tries MLST (when advertised), then `STAT path`, then SIZE/MDTM, then
    /// a CWD into the path for directories.
    pub async fn stat(&mut self, path: &str, parser: &ListingParser) -> FtpResult<FileMetadata> {
        if self.features().mlst {
            let resp = self.execute(&format!("MLST {}", path)).await?;
            if resp.code != 250 {
                return Err(FtpError::from_reply("MLST", resp.code, resp.message()).with_path(path));
            }
            return parse_mlst_reply(&resp.lines, path);
        }

        // STAT <path> on a file usually lists just that file. A directory
        // holding a single file of the same name looks identical, so the
        // CWD check still decides.
        let resp = self.execute(&format!("STAT {}", path)).await?;
        if matches!(resp.code, 211 | 212 | 213) {
            let mut entries = parser.parse_stat_reply(&resp.lines);
            if entries.len() == 1
                && !entries[0].is_dir()
                && (entries[0].name == base_name(path) || entries[0].name == path)
            {
                if self.try_cwd(path).await?.is_completion() {
                    return Ok(directory_entry(path));
                }
                let mut entry = entries.remove(0);
                entry.name = base_name(path).to_string();
                entry.path = path.to_string();
                return Ok(entry);
            }
        }

        if let Some(size) = self.size(path).await? {
            let mut entry = FileMetadata::new(base_name(path), EntryKind::File);
            entry.path = path.to_string();
            entry.size = size;
            if self.features().mdtm {
                entry.modified = self.modified_time(path).await?;
            }
            return Ok(entry);
        }

        let cwd = self.try_cwd(path).await?;
        if cwd.is_completion() {
            return Ok(directory_entry(path));
        }
        Err(FtpError::from_reply("STAT", cwd.code, cwd.message()).with_path(path))
    }

    /// CWD into `path` and, when that succeeds, back to where we were.
    /// Returns the server's reply to the first CWD.
    async fn try_cwd(&mut self, path: &str) -> FtpResult<FtpResponse> {
        let previous = self.working_directory().await?;
        let resp = self.execute(&format!("CWD {}", path)).await?;
        if resp.is_completion() {
            self.change_dir(&previous).await?;
        }
        Ok(resp)
    }
}

fn directory_entry(path: &str) -> FileMetadata {
    let mut entry = FileMetadata::new(base_name(path), EntryKind::Directory);
    entry.path = path.to_string();
    entry
}

fn is_completion(code: u16) -> bool {
    (200..300).contains(&code)
}

fn already_exists(path: &str, resp: &FtpResponse) -> FtpError {
    FtpError::already_exists(format!("Directory already exists: {}", resp.message()))
        .with_code(resp.code)
        .with_path(path)
}

/// Extract the quoted path from `257 "/some/path" ...`, where `""` inside
/// the quotes stands for a literal `"`.
pub fn parse_quoted_path(resp: &FtpResponse) -> Option<String> {
    let text = resp.message();
    let start = text.find('"')? + 1;
    let mut out = String::new();
    let mut chars = text[start..].chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                out.push('"');
            } else {
                return Some(out);
            }
        } else {
            out.push(c);
        }
    }
    None
}
