//! BCET/WCET timing tables
//!
//! The timing engine needs a best-case and worst-case execution time per
//! computation block. Times come from an external measurement or WCET tool
//! as a JSON map from block name to `{function, bcet, wcet}`; the function
//! name doubles as a consistency check against the control-flow graph. A
//! template with zeroed times can be generated for hand-filling.

use crate::cfg::{AbbKind, Cfg};
use crate::error::ExplorationError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Timing attributes of a single block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTiming {
    /// The function the block belongs to; checked against the CFG.
    pub function: String,
    pub bcet: u64,
    pub wcet: u64,
}

/// A block-name keyed timing table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimingTable {
    entries: BTreeMap<String, BlockTiming>,
}

impl TimingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, block: &str, timing: BlockTiming) {
        self.entries.insert(block.to_string(), timing);
    }

    pub fn get(&self, block: &str) -> Option<&BlockTiming> {
        self.entries.get(block)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("cannot open timing table {}", path.display()))?;
        let table = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("cannot parse timing table {}", path.display()))?;
        Ok(table)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("cannot create timing table {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .with_context(|| format!("cannot write timing table {}", path.display()))?;
        writer.flush()?;
        Ok(())
    }

    /// Build a zeroed template covering every computation block of `cfg`.
    pub fn template(cfg: &Cfg) -> Self {
        let mut table = TimingTable::new();
        for abb in cfg.blocks() {
            let block = cfg.block(abb);
            if block.kind != AbbKind::Computation {
                continue;
            }
            table.insert(
                &block.name,
                BlockTiming {
                    function: cfg.function_name(block.function).to_string(),
                    bcet: 0,
                    wcet: 0,
                },
            );
        }
        table
    }

    /// Apply the table onto the CFG's blocks.
    ///
    /// Entries for unknown blocks are skipped; an entry naming the wrong
    /// function, or with inverted bounds, is an error that identifies the
    /// offending block.
    pub fn apply(&self, cfg: &mut Cfg) -> std::result::Result<(), ExplorationError> {
        let mut updates = Vec::new();
        for abb in cfg.blocks() {
            let block = cfg.block(abb);
            let Some(entry) = self.entries.get(&block.name) else {
                continue;
            };
            let function = cfg.function_name(block.function);
            if entry.function != function {
                return Err(ExplorationError::BadTiming {
                    block: block.name.clone(),
                    reason: format!(
                        "function '{}' does not match '{}'",
                        function, entry.function
                    ),
                });
            }
            if entry.bcet > entry.wcet {
                return Err(ExplorationError::BadTiming {
                    block: block.name.clone(),
                    reason: format!("bcet {} exceeds wcet {}", entry.bcet, entry.wcet),
                });
            }
            updates.push((abb, entry.bcet, entry.wcet));
        }
        for (abb, bcet, wcet) in updates {
            cfg.set_timing(abb, bcet, wcet);
        }
        Ok(())
    }
}
