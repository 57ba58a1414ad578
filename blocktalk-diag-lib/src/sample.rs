//! Sample slots: one column per measured quantity across all open blocks.
//!
//! Several blocks usually repeat engine speed in their first position. Those
//! copies share one slot so a log has a single engine speed column.

use std::collections::BTreeMap;

use log::warn;

use crate::decode::{decode_block_data, Value};
use crate::labels::{BlockLabels, ModuleLabels};

/// Position of a value: block number and index 0..4 inside the block.
pub type ValueRef = (u8, usize);

/// Decides whether two position-0 labels name the same quantity.
pub type QuantityMatcher = Box<dyn Fn(&str, &str) -> bool + Send>;

/// Default matcher: both labels read "engine speed" (any case).
pub fn same_engine_speed(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case("engine speed") && b.trim().eq_ignore_ascii_case("engine speed")
}

/// One decoded value slot inside a measuring block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockValue {
    pub value: Option<Value>,
    pub units: &'static str,
    /// Index of the sample slot this value feeds.
    pub slot: Option<usize>,
}

/// An open measuring block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasurementBlock {
    pub values: [BlockValue; 4],
}

impl MeasurementBlock {
    /// Decode a record of 3-byte cells into the values, keeping their slot
    /// links. Positions the record does not cover are cleared.
    ///
    /// Returns whether any units changed.
    pub fn store_record(&mut self, block: u8, data: &[u8]) -> bool {
        if data.len() != 12 {
            warn!("Block {block} record is {} bytes, expected 12", data.len());
        }

        let mut cells = data.chunks_exact(3);
        let mut units_changed = false;
        for entry in &mut self.values {
            let (value, units) = match cells.next() {
                Some(cell) => {
                    let (value, units) = decode_block_data(cell[0], cell[1], cell[2]);
                    (Some(value), units)
                }
                None => (None, ""),
            };
            units_changed |= entry.units != units;
            entry.value = value;
            entry.units = units;
        }
        units_changed
    }
}

/// One sample column.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSlot {
    pub refs: Vec<ValueRef>,
    pub value: Option<Value>,
    pub desc: String,
    pub sub_desc: String,
}

impl SampleSlot {
    /// Column heading for logs: `desc subDesc [units]`.
    pub fn heading(&self, units: &str) -> String {
        let mut heading = self.desc.clone();
        if !self.sub_desc.is_empty() {
            heading.push(' ');
            heading.push_str(&self.sub_desc);
        }
        format!("{} [{units}]", heading.trim())
    }
}

fn label_text(labels: Option<&BlockLabels>, position: usize) -> (String, String) {
    labels.map_or_else(
        || (String::new(), String::new()),
        |l| (l.desc[position].clone(), l.sub_desc[position].clone()),
    )
}

/// Rebuild the slots for the given open blocks (visited in ascending order)
/// and point every block value at its slot.
///
/// Position 0 of a block merges into the first existing slot whose first
/// reference is also a position 0 and whose label `matcher` accepts together
/// with this one; every other position gets a slot of its own.
pub fn rebuild_slots(
    blocks: &mut BTreeMap<u8, MeasurementBlock>,
    labels: &ModuleLabels,
    matcher: &dyn Fn(&str, &str) -> bool,
) -> Vec<SampleSlot> {
    let mut slots: Vec<SampleSlot> = Vec::new();

    for (&block, values) in blocks.iter_mut() {
        let block_labels = labels.get(&block);
        for (position, entry) in values.values.iter_mut().enumerate() {
            let (desc, sub_desc) = label_text(block_labels, position);

            if position == 0 {
                if let Some(index) = slots
                    .iter()
                    .position(|s| s.refs[0].1 == 0 && matcher(&s.desc, &desc))
                {
                    slots[index].refs.push((block, 0));
                    entry.slot = Some(index);
                    continue;
                }
            }

            entry.slot = Some(slots.len());
            slots.push(SampleSlot {
                refs: vec![(block, position)],
                value: None,
                desc,
                sub_desc,
            });
        }
    }
    slots
}

/// Copy the latest values of a block into the slots they feed.
pub fn update_slots(slots: &mut [SampleSlot], values: &MeasurementBlock) {
    for entry in &values.values {
        if let Some(slot) = entry.slot.and_then(|i| slots.get_mut(i)) {
            slot.value.clone_from(&entry.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels_with_speed(blocks: &[u8]) -> ModuleLabels {
        blocks
            .iter()
            .map(|&b| {
                let mut l = BlockLabels::default();
                l.desc[0] = "Engine Speed".to_string();
                l.desc[1] = format!("Value {b}.1");
                (b, l)
            })
            .collect()
    }

    fn open(blocks: &[u8]) -> BTreeMap<u8, MeasurementBlock> {
        blocks.iter().map(|&b| (b, MeasurementBlock::default())).collect()
    }

    #[test]
    fn test_engine_speed_shared() {
        let labels = labels_with_speed(&[5, 9]);
        let mut blocks = open(&[5, 9]);
        let slots = rebuild_slots(&mut blocks, &labels, &same_engine_speed);
        assert_eq!(slots.len(), 7);
        assert_eq!(slots[0].refs, vec![(5, 0), (9, 0)]);
        assert!(slots[1..].iter().all(|s| s.refs.len() == 1));

        let links: Vec<Option<usize>> = blocks[&9].values.iter().map(|v| v.slot).collect();
        assert_eq!(links, vec![Some(0), Some(4), Some(5), Some(6)]);
        assert_eq!(blocks[&5].values[0].slot, Some(0));
    }

    #[test]
    fn test_closing_blocks_rebuilds() {
        let labels = labels_with_speed(&[5, 9]);
        let mut blocks = open(&[9]);
        let slots = rebuild_slots(&mut blocks, &labels, &same_engine_speed);
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[0].refs, vec![(9, 0)]);
        assert_eq!(blocks[&9].values[3].slot, Some(3));

        let slots = rebuild_slots(&mut open(&[]), &labels, &same_engine_speed);
        assert!(slots.is_empty());
    }

    #[test]
    fn test_without_labels_nothing_merges() {
        let slots = rebuild_slots(&mut open(&[1, 2]), &ModuleLabels::new(), &same_engine_speed);
        assert_eq!(slots.len(), 8);
    }

    #[test]
    fn test_custom_matcher() {
        let mut labels = labels_with_speed(&[1]);
        labels.entry(2).or_default().desc[0] = "Vehicle Speed".to_string();
        let any: &dyn Fn(&str, &str) -> bool = &|_, _| true;
        let slots = rebuild_slots(&mut open(&[1, 2]), &labels, any);
        assert_eq!(slots.len(), 7);
        assert_eq!(slots[0].refs, vec![(1, 0), (2, 0)]);
    }

    #[test]
    fn test_update_and_heading() {
        let labels = labels_with_speed(&[5, 9]);
        let mut blocks = open(&[5, 9]);
        let mut slots = rebuild_slots(&mut blocks, &labels, &same_engine_speed);

        let block = blocks.get_mut(&9).unwrap();
        block.values[0].value = Some(Value::Float(800.0));
        block.values[0].units = "rpm";
        block.values[1].value = Some(Value::Float(1.5));
        update_slots(&mut slots, block);

        assert_eq!(slots[0].value, Some(Value::Float(800.0)));
        assert_eq!(slots[0].heading("rpm"), "Engine Speed [rpm]");
        assert_eq!(slots[1].value, None);
        assert_eq!(slots[4].value, Some(Value::Float(1.5)));
    }

    #[test]
    fn test_store_record_keeps_slot_links() {
        let mut blocks = open(&[3]);
        rebuild_slots(&mut blocks, &ModuleLabels::new(), &same_engine_speed);
        let block = blocks.get_mut(&3).unwrap();

        // Formula 0x01 is engine speed, 0x15 a voltage
        let record = [0x01, 0xC8, 0x14, 0x15, 0x0A, 0x96, 0x01, 0x00, 0x00, 0x15, 0x0A, 0x8C];
        assert!(block.store_record(3, &record));
        assert!(block.values.iter().all(|v| v.value.is_some()));
        assert_eq!(block.values[2].slot, Some(2));
        assert!(!block.store_record(3, &record));
    }

    #[test]
    fn test_short_record_clears_missing_cells() {
        let mut block = MeasurementBlock::default();
        block.values[3].value = Some(Value::Float(1.0));
        block.values[3].slot = Some(7);

        block.store_record(3, &[0x01, 0xC8, 0x14, 0x15, 0x0A, 0x96, 0x01]);
        assert!(block.values[0].value.is_some());
        assert!(block.values[1].value.is_some());
        assert_eq!(block.values[2].value, None);
        assert_eq!(block.values[3].value, None);
        assert_eq!(block.values[3].units, "");
        assert_eq!(block.values[3].slot, Some(7));
    }
}
