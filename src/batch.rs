//! Patch batch files
//!
//! A batch is a text file of blocks, each introduced by a `=== PATCH <n> ===`
//! line. A trailing line of `=` characters closes a block.

use anyhow::{Context, Result};
use regex::Regex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

const SEPARATOR_WIDTH: usize = 50;

fn header_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^=== PATCH (?P<index>\d+) ===[ \t]*\r?$").ok())
        .as_ref()
}

/// One candidate patch read from a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchBlock {
    pub index: usize,
    pub text: String,
}

impl PatchBlock {
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
        }
    }
}

/// Split batch text into blocks in file order. Text before the first header
/// is ignored; an empty body yields a block with empty text.
pub fn parse_batch(content: &str) -> Vec<PatchBlock> {
    let Some(re) = header_re() else {
        return Vec::new();
    };

    let headers: Vec<(usize, usize, usize)> = re
        .captures_iter(content)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let index = caps.name("index")?.as_str().parse::<usize>().ok()?;
            Some((whole.start(), whole.end(), index))
        })
        .collect();

    headers
        .iter()
        .enumerate()
        .map(|(i, &(_, body_start, index))| {
            let body_end = headers
                .get(i + 1)
                .map(|&(next_start, _, _)| next_start)
                .unwrap_or(content.len());
            PatchBlock::new(index, clean_body(&content[body_start..body_end]))
        })
        .collect()
}

fn clean_body(raw: &str) -> String {
    let mut lines: Vec<&str> = raw.lines().collect();
    // Whitespace-only lines are kept: " " is an empty context line.
    while let Some(last) = lines.last() {
        if last.is_empty() || is_separator(last.trim()) {
            lines.pop();
        } else {
            break;
        }
    }
    while lines.first().map(|l| l.is_empty()).unwrap_or(false) {
        lines.remove(0);
    }
    if lines.is_empty() {
        return String::new();
    }
    let mut body = lines.join("\n");
    body.push('\n');
    body
}

fn is_separator(line: &str) -> bool {
    line.len() >= 3 && line.chars().all(|c| c == '=')
}

/// Render one block the way [`parse_batch`] reads it back.
pub fn render_block(block: &PatchBlock) -> String {
    format!(
        "\n\n=== PATCH {} ===\n{}\n{}\n",
        block.index,
        block.text.trim_matches('\n'),
        "=".repeat(SEPARATOR_WIDTH)
    )
}

pub fn render_batch(blocks: &[PatchBlock]) -> String {
    blocks.iter().map(render_block).collect()
}

pub fn load_batch(path: &Path) -> Result<Vec<PatchBlock>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read patch batch '{}'", path.display()))?;
    Ok(parse_batch(&content))
}

/// Append `text` as a new block numbered after the highest existing index.
/// Creates the file (and its directory) if needed. Returns the new index.
pub fn append_patch(path: &Path, text: &str) -> Result<usize> {
    let next = if path.exists() {
        load_batch(path)?
            .iter()
            .map(|b| b.index)
            .max()
            .unwrap_or(0)
            + 1
    } else {
        1
    };

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create batch directory '{}'", dir.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open patch batch '{}'", path.display()))?;
    file.write_all(render_block(&PatchBlock::new(next, text)).as_bytes())
        .with_context(|| format!("Failed to write patch batch '{}'", path.display()))?;

    Ok(next)
}
