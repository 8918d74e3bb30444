//! Prepares a dump taken from one database for import into another.
//!
//! Only statements that name a database are rewritten. Table data, including
//! rows that happen to contain the origin name, passes through untouched.

use flate2::read::GzDecoder;
use regex::bytes::{Captures, Regex};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::errors::{AppError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// True when the file starts with the gzip magic bytes.
pub fn is_gzip(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = File::open(path)?;
    let mut read = 0;
    while read < magic.len() {
        let n = file.read(&mut magic[read..])?;
        if n == 0 {
            return Ok(false);
        }
        read += n;
    }
    Ok(magic == GZIP_MAGIC)
}

/// Renames database-level references from `origin` to `dest`.
pub struct DatabaseRename {
    dest: String,
    patterns: Vec<Regex>,
    copy_start: Regex,
}

impl DatabaseRename {
    pub fn new(origin: &str, dest: &str) -> Result<Self> {
        if origin.trim().is_empty() || dest.trim().is_empty() {
            return Err(AppError::Config(
                "database rename needs both an origin and a destination name".to_string(),
            ));
        }
        let name = regex::escape(origin);
        let sources = [
            // psql meta-commands
            format!(r#"^(?P<pre>\\(?:connect|c)\s+(?:-reuse-previous=\S+\s+)?"?){name}(?P<post>"?(?:\s|$))"#),
            format!(
                r#"(?i)^(?P<pre>\s*(?:CREATE|ALTER|DROP)\s+DATABASE\s+(?:IF\s+(?:NOT\s+)?EXISTS\s+)?"?){name}(?P<post>"?(?:[\s;]|$))"#
            ),
            format!(r#"(?i)^(?P<pre>\s*COMMENT\s+ON\s+DATABASE\s+"?){name}(?P<post>"?(?:[\s;]|$))"#),
            format!(r#"(?i)^(?P<pre>\s*USE\s+[`"]?){name}(?P<post>[`"]?(?:[\s;]|$))"#),
            format!(r#"^(?P<pre>--\s*Database:\s*"?){name}(?P<post>"?(?:\s|$))"#),
            format!(r#"^(?P<pre>--\s*Name:\s*"?){name}(?P<post>"?;\s*Type:\s*DATABASE)"#),
        ];
        let patterns = sources
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Config(format!("invalid database rename pattern: {}", e)))?;
        let copy_start = Regex::new(r"(?i)^COPY\s.*\bFROM\s+stdin\b")
            .map_err(|e| AppError::Config(format!("invalid COPY pattern: {}", e)))?;

        Ok(Self {
            dest: dest.to_string(),
            patterns,
            copy_start,
        })
    }

    /// Rewrites one statement line; `None` when it does not name the origin database.
    pub fn rewrite_line(&self, line: &[u8]) -> Option<Vec<u8>> {
        self.patterns.iter().find(|re| re.is_match(line)).map(|re| {
            re.replace(line, |caps: &Captures| {
                let mut out = caps["pre"].to_vec();
                out.extend_from_slice(self.dest.as_bytes());
                out.extend_from_slice(&caps["post"]);
                out
            })
            .into_owned()
        })
    }

    /// Streams `input` to `output`, skipping the data sections of COPY blocks.
    /// Returns the number of rewritten lines.
    pub fn rewrite_stream<R: BufRead, W: Write>(&self, mut input: R, mut output: W) -> Result<usize> {
        let mut line = Vec::new();
        let mut in_copy_data = false;
        let mut rewritten = 0;

        loop {
            line.clear();
            if input.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            if in_copy_data {
                if trim_line_end(&line) == b"\\." {
                    in_copy_data = false;
                }
                output.write_all(&line)?;
                continue;
            }
            if self.copy_start.is_match(&line) {
                in_copy_data = true;
                output.write_all(&line)?;
                continue;
            }
            match self.rewrite_line(&line) {
                Some(new_line) => {
                    rewritten += 1;
                    output.write_all(&new_line)?;
                }
                None => output.write_all(&line)?,
            }
        }
        output.flush()?;
        Ok(rewritten)
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Path of the plain, renamed copy written next to `dump_path`.
pub fn reconciled_path(dump_path: &Path) -> PathBuf {
    dump_path.with_extension("reconciled.sql")
}

/// Returns the file that should be fed to the importer.
///
/// Plain dumps for the same database are used as-is. Compressed dumps are
/// decompressed, and dumps for a different database get their database-level
/// references renamed, into [`reconciled_path`].
pub fn prepare_dump_for_import(dump_path: &Path, origin_db: &str, dest_db: &str) -> Result<PathBuf> {
    let compressed = is_gzip(dump_path)?;
    let renaming = origin_db != dest_db;
    if !compressed && !renaming {
        debug!(dump = %dump_path.display(), "Dump needs no preparation");
        return Ok(dump_path.to_path_buf());
    }

    let output_path = reconciled_path(dump_path);
    let file = File::open(dump_path)?;
    let input: Box<dyn BufRead> = if compressed {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    let mut output = BufWriter::new(File::create(&output_path)?);

    if renaming {
        let rename = DatabaseRename::new(origin_db, dest_db)?;
        let rewritten = rename.rewrite_stream(input, &mut output)?;
        info!(
            origin = origin_db,
            dest = dest_db,
            rewritten,
            "Reconciled database references in dump"
        );
    } else {
        let mut input = input;
        std::io::copy(&mut input, &mut output)?;
        output.flush()?;
        info!(dump = %dump_path.display(), "Decompressed gzip dump");
    }
    Ok(output_path)
}
