//! Fixed-capacity slot table with stable indices

/// A fixed number of slots addressed by index
///
/// Freed indices are reused lowest first, so handles stay small and
/// predictable. Slots never move once allocated.
#[derive(Debug)]
pub struct SlotTable<T> {
    slots: Vec<Option<T>>,
    /// Free indices, lowest at the end
    free: Vec<usize>,
}

impl<T> SlotTable<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            free: (0..capacity).rev().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store `value` in the lowest free slot
    ///
    /// The value is handed back when every slot is taken.
    pub fn insert(&mut self, value: T) -> Result<usize, T> {
        let Some(index) = self.free.pop() else {
            return Err(value);
        };
        self.slots[index] = Some(value);
        Ok(index)
    }

    pub fn remove(&mut self, index: usize) -> Option<T> {
        let value = self.slots.get_mut(index)?.take()?;
        // Keep the free list ordered so the lowest index is reused first
        let position = self.free.partition_point(|&free| free > index);
        self.free.insert(position, index);
        Some(value)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)?.as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|value| (index, value)))
    }

    /// Indices of the occupied slots
    pub fn indices(&self) -> Vec<usize> {
        self.iter().map(|(index, _)| index).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_index_reused_first() {
        let mut table = SlotTable::with_capacity(3);
        assert_eq!(table.insert("a"), Ok(0));
        assert_eq!(table.insert("b"), Ok(1));
        assert_eq!(table.insert("c"), Ok(2));
        assert_eq!(table.insert("d"), Err("d"));

        assert_eq!(table.remove(2), Some("c"));
        assert_eq!(table.remove(0), Some("a"));
        assert_eq!(table.remove(0), None);
        assert_eq!(table.len(), 1);

        assert_eq!(table.insert("e"), Ok(0));
        assert_eq!(table.insert("f"), Ok(2));
        assert_eq!(table.indices(), vec![0, 1, 2]);
    }

    #[test]
    fn test_out_of_range() {
        let mut table: SlotTable<u8> = SlotTable::with_capacity(1);
        assert!(table.get(5).is_none());
        assert!(table.remove(5).is_none());
        assert!(table.is_empty());
    }
}
