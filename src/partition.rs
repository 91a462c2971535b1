//! Partition table discovery from `fdisk -l` style reports.
//!
//! No partition table is decoded here. An external inspector prints the
//! table as text and [`Candidates`] walks that report line by line,
//! yielding the byte offset of every partition that might hold a Linux
//! root filesystem.
//!
//! Two table formats are understood, in both busybox and util-linux
//! dialects:
//!
//! - MBR: only rows whose type column ends in `Linux` are kept. The start
//!   column is located from the table header; a row without a boot marker
//!   (`*`) has one field fewer, so its start sits one column to the left.
//! - GPT: every row starting after sector 2048 is kept. The entry at 2048
//!   is conventionally a BIOS boot or EFI stub and is always skipped.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::Lines;

use anyhow::{bail, Context, Result};

use crate::system_check::find_program;
use crate::ImportError;

pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// GPT rows must start strictly after this sector to be considered.
pub const GPT_MIN_START_SECTOR: u64 = 2048;

const LINUX_TYPE: &str = "Linux";
const GPT_SIGNATURES: &[&str] = &[
    "Found valid GPT with protective MBR; using GPT",
    "Disklabel type: gpt",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Mbr,
    Gpt,
}

/// A partition that may hold the root filesystem. Provisional until
/// mount-tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionCandidate {
    pub start_sector: u64,
    pub sector_size: u64,
    pub format: TableFormat,
}

impl PartitionCandidate {
    pub fn offset(&self) -> u64 {
        self.start_sector * self.sector_size
    }
}

/// Produces a textual partition table report for a raw image.
pub trait ReadPartitionTable {
    fn read_table(&self, image: &Path) -> Result<String>;
}

/// `fdisk -l` from util-linux or busybox.
pub struct Fdisk {
    program: String,
}

impl Fdisk {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for Fdisk {
    fn default() -> Self {
        Self::new("fdisk")
    }
}

impl ReadPartitionTable for Fdisk {
    fn read_table(&self, image: &Path) -> Result<String> {
        if find_program(&self.program).is_err() {
            bail!(ImportError::MissingExternalTool {
                tool: self.program.clone(),
                hint: "apt install fdisk".to_string(),
            });
        }
        let output = Command::new(&self.program)
            .arg("-l")
            .arg(image)
            .env("LC_ALL", "C")
            .output()
            .with_context(|| format!("failed to run {}", self.program))?;
        if !output.status.success() {
            // An unreadable table shows up as an empty candidate list.
            log::debug!(
                "{} -l exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Lazily parses an inspector report into [`PartitionCandidate`]s, in
/// on-disk order.
pub struct Candidates<'a> {
    lines: Lines<'a>,
    format: TableFormat,
    sector_size: u64,
    start_column: Option<usize>,
}

impl<'a> Candidates<'a> {
    pub fn new(report: &'a str) -> Self {
        Self {
            lines: report.lines(),
            format: TableFormat::Mbr,
            sector_size: DEFAULT_SECTOR_SIZE,
            start_column: None,
        }
    }

    /// Consume a line preceding the partition rows. Returns the start
    /// column once the table header is reached.
    fn scan_preamble(&mut self, line: &str) -> Option<usize> {
        if GPT_SIGNATURES.contains(&line) {
            self.format = TableFormat::Gpt;
            return None;
        }
        if let Some(size) = parse_sector_size(line) {
            self.sector_size = size;
            return None;
        }
        let header: Vec<&str> = line.split_whitespace().collect();
        match (self.format, header.first().copied()) {
            (TableFormat::Mbr, Some("Device")) if header.contains(&"Boot") => header
                .iter()
                .position(|&c| c == "StartLBA" || c == "Start"),
            (TableFormat::Gpt, Some("Number" | "Device")) => {
                header.iter().position(|&c| c == "Start")
            }
            _ => None,
        }
    }

    fn parse_row(&self, line: &str, start_column: usize) -> Option<PartitionCandidate> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let start_sector = match self.format {
            TableFormat::Mbr => {
                if fields.last() != Some(&LINUX_TYPE) {
                    return None;
                }
                let column = if fields.get(1) == Some(&"*") {
                    start_column
                } else {
                    start_column.checked_sub(1)?
                };
                fields.get(column)?.parse::<u64>().ok()?
            }
            TableFormat::Gpt => {
                let start = fields.get(start_column)?.parse::<u64>().ok()?;
                if start <= GPT_MIN_START_SECTOR {
                    return None;
                }
                start
            }
        };
        if start_sector.checked_mul(self.sector_size).is_none() {
            log::debug!("skipping row with out-of-range start sector: {line}");
            return None;
        }
        Some(PartitionCandidate {
            start_sector,
            sector_size: self.sector_size,
            format: self.format,
        })
    }
}

impl Iterator for Candidates<'_> {
    type Item = PartitionCandidate;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?.trim();
            if line.is_empty() {
                continue;
            }
            match self.start_column {
                None => self.start_column = self.scan_preamble(line),
                Some(column) => {
                    if let Some(candidate) = self.parse_row(line, column) {
                        return Some(candidate);
                    }
                }
            }
        }
    }
}

/// Recognise the header lines that declare the (logical) sector size.
fn parse_sector_size(line: &str) -> Option<u64> {
    if let Some(rest) = line.strip_prefix("Logical sector size:") {
        return rest.trim().parse().ok();
    }
    if let Some(rest) = line.strip_prefix("Sector size (logical/physical):") {
        return rest.split_whitespace().next()?.parse().ok();
    }
    // "Units: sectors of 1 * 512 = 512 bytes"
    if let Some(rest) = line.strip_prefix("Units:") {
        let (_, bytes) = rest.rsplit_once('=')?;
        return bytes.split_whitespace().next()?.parse().ok();
    }
    None
}

/// Run the inspector on `image` and collect its candidates.
///
/// Fails with [`ImportError::NoPartitionsFound`] if none survive parsing.
pub fn read_partitions(
    inspector: &dyn ReadPartitionTable,
    image: &Path,
) -> Result<Vec<PartitionCandidate>> {
    let report = inspector.read_table(image)?;
    let candidates: Vec<PartitionCandidate> = Candidates::new(&report).collect();
    if candidates.is_empty() {
        bail!(ImportError::NoPartitionsFound(PathBuf::from(image)));
    }
    for c in &candidates {
        log::debug!(
            "candidate partition: {:?} sector {} x {} bytes (offset {})",
            c.format,
            c.start_sector,
            c.sector_size,
            c.offset()
        );
    }
    Ok(candidates)
}
