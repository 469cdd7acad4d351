//! Sequences: ordered block collections with change capture
//!
//! A sequence is an ordered set of blocks partitioned by binary split
//! points: block `i` owns keys in `[splits[i-1], splits[i])` (with open
//! ends at the edges). Derived sequences also own the operator that maps
//! source changes onto destination operations, and `capture_change`
//! translates one `(prev, next)` source pair into the pruned op batch
//! dispatched to the owning blocks.

use crate::block::Block;
use crate::operator::{accumulator_from_json, accumulator_to_json, Operator};
use std::collections::BTreeMap;
use std::sync::Arc;
use torus_core::{Error, Result};
use torus_store::{ScanIter, ScanOpts};
use tracing::{debug, error};

/// One destination operation produced by an operator
#[derive(Debug, Clone, PartialEq)]
pub enum DerivedOp {
    /// Write a destination record
    Put(Vec<u8>, String),
    /// Remove a destination record
    Del(Vec<u8>),
    /// Merge an accumulator delta in
    Inc(Vec<u8>, String),
    /// Merge an accumulator delta out
    Dec(Vec<u8>, String),
}

impl DerivedOp {
    /// Destination key of this operation
    pub fn key(&self) -> &[u8] {
        match self {
            DerivedOp::Put(k, _) | DerivedOp::Del(k) | DerivedOp::Inc(k, _) | DerivedOp::Dec(k, _) => k,
        }
    }
}

/// Translate one source change into destination operations.
///
/// Both sides are mapped through the operator, then common destination
/// keys are pruned: equal values drop both entries; unequal values drop
/// the removal for indexes (the put overwrites) and keep both for
/// aggregations (the dec/inc pair changes the accumulator). Removals are
/// emitted before insertions.
pub fn derive_ops(
    operator: &Operator,
    src_key: &[u8],
    prev: Option<&str>,
    next: Option<&str>,
) -> Result<Vec<DerivedOp>> {
    let mut rmv = operator.map(src_key, prev)?;
    let mut ins = operator.map(src_key, next)?;

    let common: Vec<Vec<u8>> = rmv.keys().filter(|k| ins.contains_key(*k)).cloned().collect();
    for key in common {
        let equal = if operator.is_aggregation() {
            accumulators_equal(&rmv[&key], &ins[&key])
        } else {
            rmv[&key] == ins[&key]
        };
        if equal {
            rmv.remove(&key);
            ins.remove(&key);
        } else if !operator.is_aggregation() {
            // Implicit override: the subsequent put replaces the record
            rmv.remove(&key);
        }
    }

    let mut ops = Vec::with_capacity(rmv.len() + ins.len());
    emit(&mut ops, rmv, ins, operator.is_aggregation());
    Ok(ops)
}

fn emit(
    ops: &mut Vec<DerivedOp>,
    rmv: BTreeMap<Vec<u8>, String>,
    ins: BTreeMap<Vec<u8>, String>,
    aggregation: bool,
) {
    for (key, value) in rmv {
        ops.push(if aggregation {
            DerivedOp::Dec(key, value)
        } else {
            DerivedOp::Del(key)
        });
    }
    for (key, value) in ins {
        ops.push(if aggregation {
            DerivedOp::Inc(key, value)
        } else {
            DerivedOp::Put(key, value)
        });
    }
}

fn accumulators_equal(a: &str, b: &str) -> bool {
    match (accumulator_from_json(a), accumulator_from_json(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Ordered collection of blocks covering a binary key range
pub struct Sequence {
    name: String,
    operator: Operator,
    blocks: Vec<Arc<Block>>,
    splits: Vec<Vec<u8>>,
}

impl Sequence {
    /// Single-block sequence
    pub fn new(name: impl Into<String>, operator: Operator, block: Arc<Block>) -> Self {
        Sequence {
            name: name.into(),
            operator,
            blocks: vec![block],
            splits: Vec::new(),
        }
    }

    /// Multi-block sequence partitioned at `splits`.
    ///
    /// `splits` must be sorted ascending and one shorter than `blocks`.
    pub fn with_splits(
        name: impl Into<String>,
        operator: Operator,
        blocks: Vec<Arc<Block>>,
        splits: Vec<Vec<u8>>,
    ) -> Result<Self> {
        if blocks.is_empty() {
            return Err(Error::Store("sequence needs at least one block".into()));
        }
        if splits.len() + 1 != blocks.len() {
            return Err(Error::Store(format!(
                "{} blocks need {} splits, got {}",
                blocks.len(),
                blocks.len() - 1,
                splits.len()
            )));
        }
        if splits.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::Store("sequence splits are not sorted".into()));
        }
        Ok(Sequence {
            name: name.into(),
            operator,
            blocks,
            splits,
        })
    }

    /// Sequence name (scan surface and config identity)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The operator governing this sequence
    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    /// All blocks, in key order
    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    /// The unique block whose range contains `key`
    pub fn find_block(&self, key: &[u8]) -> &Arc<Block> {
        let idx = self.splits.partition_point(|s| s.as_slice() <= key);
        &self.blocks[idx]
    }

    /// Block receiving fresh inserts (the highest key range)
    pub fn insert_block(&self) -> &Arc<Block> {
        self.blocks.last().expect("sequence has at least one block")
    }

    /// Open all blocks (loads stores, seeds autoincrement counters)
    pub fn open(&self) -> Result<()> {
        for block in &self.blocks {
            block.open()?;
        }
        Ok(())
    }

    /// Ordered scan across all blocks.
    ///
    /// Blocks partition the key space in order, so per-block streams are
    /// concatenated (reversed for descending scans); the limit applies to
    /// the combined stream.
    pub fn scan(&self, opts: &ScanOpts) -> Result<ScanIter> {
        let mut streams = Vec::with_capacity(self.blocks.len());
        let per_block = ScanOpts {
            limit: None,
            ..opts.clone()
        };
        if opts.reverse {
            for block in self.blocks.iter().rev() {
                streams.push(block.scan(&per_block)?);
            }
        } else {
            for block in &self.blocks {
                streams.push(block.scan(&per_block)?);
            }
        }
        let chained: ScanIter = Box::new(streams.into_iter().flatten());
        Ok(match opts.limit {
            Some(limit) => Box::new(chained.take(limit)),
            None => chained,
        })
    }

    /// Translate a source `(prev, next)` change into destination ops and
    /// dispatch each to the block owning its key.
    ///
    /// Propagation failures are logged and never roll back the source
    /// write; a rebuild repairs the sequence.
    pub fn capture_change(&self, src_key: &[u8], prev: Option<&str>, next: Option<&str>) {
        let ops = match derive_ops(&self.operator, src_key, prev, next) {
            Ok(ops) => ops,
            Err(e) => {
                error!(sequence = %self.name, error = %e, "change derivation failed");
                return;
            }
        };
        for op in ops {
            if let Err(e) = self.apply(&op) {
                error!(
                    sequence = %self.name,
                    key = ?op.key(),
                    error = %e,
                    "derived op failed; sequence left inconsistent until rebuild"
                );
            }
        }
    }

    fn apply(&self, op: &DerivedOp) -> Result<()> {
        let block = self.find_block(op.key());
        match op {
            DerivedOp::Put(key, value) => block.put_raw(key, value),
            DerivedOp::Del(key) => {
                block.del_raw(key)?;
                Ok(())
            }
            DerivedOp::Inc(key, delta) => {
                let merged = match block.get_raw(key)? {
                    Some(cur) => {
                        let cur = accumulator_from_json(&cur)?;
                        let delta = accumulator_from_json(delta)?;
                        accumulator_to_json(&merge(&cur, &delta, 1.0))
                    }
                    None => delta.clone(),
                };
                block.put_raw(key, &merged)
            }
            DerivedOp::Dec(key, delta) => {
                let Some(cur) = block.get_raw(key)? else {
                    // Non-idempotent op against a missing accumulator: never
                    // retried, only reported
                    return Err(Error::DataConsistency(format!(
                        "dec against missing accumulator in {}",
                        self.name
                    )));
                };
                let cur = accumulator_from_json(&cur)?;
                let delta = accumulator_from_json(delta)?;
                let merged = merge(&cur, &delta, -1.0);
                if merged.first().copied().unwrap_or(0.0) <= 0.0 {
                    debug!(sequence = %self.name, "accumulator emptied, removing record");
                    block.del_raw(key)?;
                    Ok(())
                } else {
                    block.put_raw(key, &accumulator_to_json(&merged))
                }
            }
        }
    }

    /// Direct record lookup
    pub fn get(&self, key: &[u8]) -> Result<Option<String>> {
        self.find_block(key).get_raw(key)
    }

    /// Direct record write (revision snapshots, rebuilds)
    pub fn put(&self, key: &[u8], value: &str) -> Result<()> {
        self.find_block(key).put_raw(key, value)
    }

    /// Direct record removal
    pub fn del(&self, key: &[u8]) -> Result<bool> {
        self.find_block(key).del_raw(key)
    }

    /// Wipe every block
    pub fn erase(&self) -> Result<()> {
        for block in &self.blocks {
            block.erase()?;
        }
        Ok(())
    }

    /// Flush every block
    pub fn flush(&self, with_delay: bool) -> Result<()> {
        for block in &self.blocks {
            block.flush(with_delay)?;
        }
        Ok(())
    }
}

fn merge(cur: &[f64], delta: &[f64], sign: f64) -> Vec<f64> {
    let len = cur.len().max(delta.len());
    (0..len)
        .map(|i| {
            cur.get(i).copied().unwrap_or(0.0) + sign * delta.get(i).copied().unwrap_or(0.0)
        })
        .collect()
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("name", &self.name)
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockRole;
    use crate::operator::{AggregationOperator, DataOperator, IndexOperator, KeyField};
    use std::time::Duration;
    use torus_core::{encode_id, FieldKind, KeyCodec, Value};
    use torus_store::MemoryStore;

    fn derived_block(name: &str) -> Arc<Block> {
        Arc::new(Block::new(
            name,
            BlockRole::Derived,
            Arc::new(MemoryStore::new()),
            None,
            Duration::ZERO,
        ))
    }

    fn index_sequence() -> Sequence {
        let operator = Operator::Index(IndexOperator::new(
            vec![KeyField::int("category"), KeyField::int("id")],
            vec!["name".to_string()],
        ));
        Sequence::new("by_category", operator, derived_block("by_category.0"))
    }

    fn agg_sequence() -> Sequence {
        let operator = Operator::Aggregation(AggregationOperator::new(
            vec![KeyField::int("category")],
            vec!["views".to_string()],
        ));
        Sequence::new("view_totals", operator, derived_block("view_totals.0"))
    }

    fn dest_key(values: &[Value]) -> Vec<u8> {
        let kinds = values.iter().map(|_| FieldKind::Int).collect();
        KeyCodec::new(kinds).encode(values).unwrap()
    }

    #[test]
    fn test_find_block_across_splits() {
        let blocks = vec![derived_block("a"), derived_block("b"), derived_block("c")];
        let seq = Sequence::with_splits(
            "s",
            Operator::Data(DataOperator::new()),
            blocks,
            vec![encode_id(100), encode_id(200)],
        )
        .unwrap();
        assert_eq!(seq.find_block(&encode_id(1)).name(), "a");
        assert_eq!(seq.find_block(&encode_id(99)).name(), "a");
        // A split key belongs to the upper block
        assert_eq!(seq.find_block(&encode_id(100)).name(), "b");
        assert_eq!(seq.find_block(&encode_id(199)).name(), "b");
        assert_eq!(seq.find_block(&encode_id(200)).name(), "c");
        assert_eq!(seq.find_block(&encode_id(10_000)).name(), "c");
    }

    #[test]
    fn test_split_validation() {
        let blocks = vec![derived_block("a"), derived_block("b")];
        assert!(Sequence::with_splits(
            "s",
            Operator::Data(DataOperator::new()),
            blocks,
            vec![],
        )
        .is_err());
    }

    #[test]
    fn test_insert_captures_index_record() {
        let seq = index_sequence();
        let record = serde_json::json!({"category": 7, "name": "x"}).to_string();
        seq.capture_change(&encode_id(40), None, Some(&record));

        let key = dest_key(&[Value::Int(7), Value::Int(40)]);
        let block = seq.find_block(&key);
        assert_eq!(block.get_raw(&key).unwrap().as_deref(), Some("{\"name\":\"x\"}"));
    }

    #[test]
    fn test_delete_removes_index_record() {
        let seq = index_sequence();
        let record = serde_json::json!({"category": 7, "name": "x"}).to_string();
        seq.capture_change(&encode_id(40), None, Some(&record));
        seq.capture_change(&encode_id(40), Some(&record), None);

        let key = dest_key(&[Value::Int(7), Value::Int(40)]);
        assert_eq!(seq.find_block(&key).get_raw(&key).unwrap(), None);
    }

    #[test]
    fn test_update_moves_index_record() {
        let seq = index_sequence();
        let before = serde_json::json!({"category": 7, "name": "x"}).to_string();
        let after = serde_json::json!({"category": 8, "name": "x"}).to_string();
        seq.capture_change(&encode_id(40), None, Some(&before));
        seq.capture_change(&encode_id(40), Some(&before), Some(&after));

        let old_key = dest_key(&[Value::Int(7), Value::Int(40)]);
        let new_key = dest_key(&[Value::Int(8), Value::Int(40)]);
        assert_eq!(seq.find_block(&old_key).get_raw(&old_key).unwrap(), None);
        assert!(seq.find_block(&new_key).get_raw(&new_key).unwrap().is_some());
    }

    #[test]
    fn test_prune_drops_identical_destinations() {
        let operator = Operator::Index(IndexOperator::new(
            vec![KeyField::int("category"), KeyField::int("id")],
            vec!["name".to_string()],
        ));
        let record = serde_json::json!({"category": 7, "name": "x", "other": 1}).to_string();
        let touched = serde_json::json!({"category": 7, "name": "x", "other": 2}).to_string();
        // Same destination key, same payload: nothing to do
        let ops = derive_ops(&operator, &encode_id(40), Some(&record), Some(&touched)).unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn test_prune_keeps_put_on_changed_payload() {
        let operator = Operator::Index(IndexOperator::new(
            vec![KeyField::int("category"), KeyField::int("id")],
            vec!["name".to_string()],
        ));
        let before = serde_json::json!({"category": 7, "name": "x"}).to_string();
        let after = serde_json::json!({"category": 7, "name": "y"}).to_string();
        let ops = derive_ops(&operator, &encode_id(40), Some(&before), Some(&after)).unwrap();
        // Implicit override: a single put, no delete
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], DerivedOp::Put(_, v) if v == "{\"name\":\"y\"}"));
    }

    #[test]
    fn test_prune_keeps_dec_inc_pair_for_aggregations() {
        let operator = Operator::Aggregation(AggregationOperator::new(
            vec![KeyField::int("category")],
            vec!["views".to_string()],
        ));
        let before = serde_json::json!({"category": 7, "views": 10}).to_string();
        let after = serde_json::json!({"category": 7, "views": 25}).to_string();
        let ops = derive_ops(&operator, &encode_id(9), Some(&before), Some(&after)).unwrap();
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], DerivedOp::Dec(_, _)));
        assert!(matches!(&ops[1], DerivedOp::Inc(_, _)));
    }

    #[test]
    fn test_aggregation_accumulates() {
        let seq = agg_sequence();
        for (id, views) in [(1u64, 10), (2, 20), (3, 30)] {
            let record = serde_json::json!({"category": 7, "views": views}).to_string();
            seq.capture_change(&encode_id(id), None, Some(&record));
        }
        let key = dest_key(&[Value::Int(7)]);
        assert_eq!(
            seq.find_block(&key).get_raw(&key).unwrap().as_deref(),
            Some("[3,60]")
        );

        // Deleting the first contribution
        let first = serde_json::json!({"category": 7, "views": 10}).to_string();
        seq.capture_change(&encode_id(1), Some(&first), None);
        assert_eq!(
            seq.find_block(&key).get_raw(&key).unwrap().as_deref(),
            Some("[2,50]")
        );
    }

    #[test]
    fn test_aggregation_empties_to_removal() {
        let seq = agg_sequence();
        let record = serde_json::json!({"category": 7, "views": 10}).to_string();
        seq.capture_change(&encode_id(1), None, Some(&record));
        seq.capture_change(&encode_id(1), Some(&record), None);

        let key = dest_key(&[Value::Int(7)]);
        assert_eq!(seq.find_block(&key).get_raw(&key).unwrap(), None);
    }

    #[test]
    fn test_scan_across_split_point_is_ordered() {
        let blocks = vec![derived_block("low"), derived_block("high")];
        let seq = Sequence::with_splits(
            "s",
            Operator::Data(DataOperator::new()),
            blocks,
            vec![encode_id(100)],
        )
        .unwrap();
        for id in [5u64, 50, 150, 250] {
            seq.put(&encode_id(id), "{}").unwrap();
        }
        let keys: Vec<u64> = seq
            .scan(&ScanOpts::all())
            .unwrap()
            .map(|r| torus_core::decode_id(&r.unwrap().0).unwrap())
            .collect();
        assert_eq!(keys, vec![5, 50, 150, 250]);

        let keys: Vec<u64> = seq
            .scan(&ScanOpts {
                reverse: true,
                limit: Some(3),
                ..ScanOpts::all()
            })
            .unwrap()
            .map(|r| torus_core::decode_id(&r.unwrap().0).unwrap())
            .collect();
        assert_eq!(keys, vec![250, 150, 50]);
    }
}
