//! The layout of a heap page on disk.
//!
//! A page starts with an occupancy bitmap of `ceil(slots / 8)` bytes (slot `i`
//! is bit `i % 8` of byte `i / 8`, least significant bit first) followed by
//! `slots` fixed-width tuple slots. Whatever is left at the end of the page is
//! zero.
use std::sync::Arc;

use crate::error::{DbError, DbResult};
use crate::transaction::TransactionId;
use crate::tuple::{Tuple, TupleDesc};
use crate::{PageId, RecordId, PAGE_SIZE};

/// Number of tuples of `tuple_width` bytes that fit on one page together with
/// their occupancy bits.
pub fn slots_per_page(tuple_width: usize) -> usize {
    (PAGE_SIZE * 8) / (tuple_width * 8 + 1)
}

/// Size of the occupancy bitmap for a page with `slots` slots.
pub fn header_size(slots: usize) -> usize {
    slots.div_ceil(8)
}

/// A heap page held in memory.
#[derive(Debug, Clone)]
pub struct HeapPage {
    id: PageId,
    desc: Arc<TupleDesc>,
    data: Box<[u8]>,
    slots: usize,
    /// Transaction that last modified the page since it was read or flushed.
    dirtier: Option<TransactionId>,
    /// Content as of the first modification since the last flush.
    before_image: Option<Box<[u8]>>,
}

impl HeapPage {
    /// Wraps `PAGE_SIZE` bytes read from disk.
    pub fn new(id: PageId, desc: Arc<TupleDesc>, data: Vec<u8>) -> DbResult<Self> {
        if data.len() != PAGE_SIZE {
            return Err(DbError::Corrupt {
                detail: format!("{id} has {} bytes, expected {PAGE_SIZE}", data.len()),
            });
        }
        let slots = slots_per_page(desc.size());
        if slots == 0 {
            return Err(DbError::SchemaMismatch {
                detail: format!("a {} byte tuple does not fit on a page", desc.size()),
            });
        }
        Ok(Self {
            id,
            desc,
            data: data.into_boxed_slice(),
            slots,
            dirtier: None,
            before_image: None,
        })
    }

    /// A page with every slot free.
    pub fn empty(id: PageId, desc: Arc<TupleDesc>) -> DbResult<Self> {
        Self::new(id, desc, Self::empty_page_data())
    }

    pub fn empty_page_data() -> Vec<u8> {
        vec![0; PAGE_SIZE]
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn desc(&self) -> &Arc<TupleDesc> {
        &self.desc
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn num_slots(&self) -> usize {
        self.slots
    }

    pub fn is_slot_used(&self, slot: usize) -> bool {
        slot < self.slots && self.data[slot / 8] & (1 << (slot % 8)) != 0
    }

    fn set_slot_used(&mut self, slot: usize, used: bool) {
        let mask = 1u8 << (slot % 8);
        if used {
            self.data[slot / 8] |= mask;
        } else {
            self.data[slot / 8] &= !mask;
        }
    }

    pub fn num_empty_slots(&self) -> usize {
        (0..self.slots).filter(|s| !self.is_slot_used(*s)).count()
    }

    fn slot_range(&self, slot: usize) -> std::ops::Range<usize> {
        let width = self.desc.size();
        let start = header_size(self.slots) + slot * width;
        start..start + width
    }

    /// Decodes the tuple in `slot`, if the slot is occupied.
    pub fn tuple_at(&self, slot: usize) -> DbResult<Option<Tuple>> {
        if !self.is_slot_used(slot) {
            return Ok(None);
        }
        let mut tuple = Tuple::decode(self.desc.clone(), &self.data[self.slot_range(slot)])?;
        tuple.set_record_id(Some(RecordId::new(self.id, slot as u16)));
        Ok(Some(tuple))
    }

    /// All tuples on the page in slot order.
    pub fn tuples(&self) -> DbResult<Vec<Tuple>> {
        let mut out = Vec::new();
        for slot in 0..self.slots {
            if let Some(tuple) = self.tuple_at(slot)? {
                out.push(tuple);
            }
        }
        Ok(out)
    }

    /// Stores `tuple` in the first free slot and points its record id at it.
    pub fn insert_tuple(&mut self, tuple: &mut Tuple) -> DbResult<u16> {
        if **tuple.desc() != *self.desc {
            return Err(DbError::SchemaMismatch {
                detail: format!("tuple schema {} does not match {}", tuple.desc(), self.desc),
            });
        }
        let slot = (0..self.slots)
            .find(|s| !self.is_slot_used(*s))
            .ok_or(DbError::PageFull { page: self.id })?;

        self.capture_before_image();
        let range = self.slot_range(slot);
        tuple.encode(&mut self.data[range]);
        self.set_slot_used(slot, true);

        let rid = RecordId::new(self.id, slot as u16);
        tuple.set_record_id(Some(rid));
        Ok(slot as u16)
    }

    /// Frees the slot `tuple` lives in. The slot bytes are left as they are.
    pub fn delete_tuple(&mut self, tuple: &Tuple) -> DbResult<()> {
        let rid = tuple.record_id().ok_or(DbError::MissingRecordId)?;
        if rid.page_id != self.id {
            return Err(DbError::NoSuchSlot {
                page: rid.page_id,
                slot: rid.slot,
            });
        }
        let slot = rid.slot as usize;
        if !self.is_slot_used(slot) {
            return Err(DbError::NoSuchSlot {
                page: self.id,
                slot: rid.slot,
            });
        }
        self.capture_before_image();
        self.set_slot_used(slot, false);
        Ok(())
    }

    fn capture_before_image(&mut self) {
        if self.before_image.is_none() {
            self.before_image = Some(self.data.clone());
        }
    }

    pub fn mark_dirty(&mut self, tid: TransactionId) {
        self.dirtier = Some(tid);
    }

    /// The transaction that dirtied the page, or `None` when it is clean.
    pub fn dirtier(&self) -> Option<TransactionId> {
        self.dirtier
    }

    pub fn is_dirty(&self) -> bool {
        self.dirtier.is_some()
    }

    /// Called once the content is on disk: clears the dirty flag and retires
    /// the before-image.
    pub fn mark_clean(&mut self) {
        self.dirtier = None;
        self.before_image = None;
    }

    /// The page as it was before the current dirtying window, if any.
    pub fn before_image(&self) -> Option<HeapPage> {
        self.before_image.as_ref().map(|data| HeapPage {
            id: self.id,
            desc: self.desc.clone(),
            data: data.clone(),
            slots: self.slots,
            dirtier: None,
            before_image: None,
        })
    }

    pub fn before_image_data(&self) -> Option<&[u8]> {
        self.before_image.as_deref()
    }

    /// Restores the before-image and marks the page clean. Returns false when
    /// there was nothing to restore.
    pub fn rollback(&mut self) -> bool {
        let restored = match self.before_image.take() {
            Some(data) => {
                self.data = data;
                true
            }
            None => false,
        };
        self.dirtier = None;
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{Field, FieldType};

    fn int_desc(n: usize) -> Arc<TupleDesc> {
        Arc::new(TupleDesc::unnamed(&vec![FieldType::Int; n]))
    }

    fn tuple(desc: &Arc<TupleDesc>, v: i32) -> Tuple {
        let fields = (0..desc.num_fields()).map(|_| Field::Int(v)).collect();
        Tuple::new(desc.clone(), fields).unwrap()
    }

    #[test]
    fn test_slot_math() {
        // 2 ints: 8 bytes per tuple -> 4096*8 / 65 = 504 slots, 63 header bytes
        assert_eq!(slots_per_page(8), 504);
        assert_eq!(header_size(504), 63);
        assert!(header_size(504) + 504 * 8 <= PAGE_SIZE);
        // one string + one int
        assert_eq!(slots_per_page(136), 30);
        assert_eq!(header_size(30), 4);
        assert_eq!(header_size(1), 1);
        assert_eq!(header_size(8), 1);
        assert_eq!(header_size(9), 2);
    }

    #[test]
    fn test_insert_sets_bitmap_and_record_id() {
        let desc = int_desc(2);
        let pid = PageId::new(1, 0);
        let mut page = HeapPage::empty(pid, desc.clone()).unwrap();
        assert_eq!(page.num_empty_slots(), 504);

        let mut t0 = tuple(&desc, 10);
        let mut t1 = tuple(&desc, 11);
        assert_eq!(page.insert_tuple(&mut t0).unwrap(), 0);
        assert_eq!(page.insert_tuple(&mut t1).unwrap(), 1);
        assert_eq!(t1.record_id(), Some(RecordId::new(pid, 1)));

        assert_eq!(page.data()[0], 0b0000_0011);
        let header = header_size(504);
        assert_eq!(&page.data()[header..header + 4], &10i32.to_be_bytes());
        assert_eq!(page.num_empty_slots(), 502);
    }

    #[test]
    fn test_delete_frees_slot_for_reuse() {
        let desc = int_desc(1);
        let mut page = HeapPage::empty(PageId::new(1, 0), desc.clone()).unwrap();
        let mut a = tuple(&desc, 1);
        let mut b = tuple(&desc, 2);
        page.insert_tuple(&mut a).unwrap();
        page.insert_tuple(&mut b).unwrap();

        page.delete_tuple(&a).unwrap();
        assert!(!page.is_slot_used(0));
        assert!(matches!(
            page.delete_tuple(&a),
            Err(DbError::NoSuchSlot { slot: 0, .. })
        ));

        let mut c = tuple(&desc, 3);
        assert_eq!(page.insert_tuple(&mut c).unwrap(), 0);
        let values: Vec<_> = page.tuples().unwrap().into_iter().map(|t| t.fields()[0].clone()).collect();
        assert_eq!(values, vec![Field::Int(3), Field::Int(2)]);
    }

    #[test]
    fn test_full_page() {
        let desc = Arc::new(TupleDesc::unnamed(&[FieldType::Str; 10]));
        let slots = slots_per_page(desc.size());
        assert_eq!(slots, 3);
        let mut page = HeapPage::empty(PageId::new(2, 5), desc.clone()).unwrap();
        for _ in 0..slots {
            let fields = (0..10).map(|_| Field::Str("x".into())).collect();
            let mut t = Tuple::new(desc.clone(), fields).unwrap();
            page.insert_tuple(&mut t).unwrap();
        }
        let fields = (0..10).map(|_| Field::Str("y".into())).collect();
        let mut extra = Tuple::new(desc, fields).unwrap();
        assert!(matches!(
            page.insert_tuple(&mut extra),
            Err(DbError::PageFull { .. })
        ));
    }

    #[test]
    fn test_before_image_captured_once_per_window() {
        let desc = int_desc(1);
        let tid = TransactionId::from_raw(1);
        let mut page = HeapPage::empty(PageId::new(1, 0), desc.clone()).unwrap();
        let mut a = tuple(&desc, 1);
        page.insert_tuple(&mut a).unwrap();
        page.mark_clean();
        let committed = page.data().to_vec();

        let mut b = tuple(&desc, 2);
        page.insert_tuple(&mut b).unwrap();
        page.mark_dirty(tid);
        page.delete_tuple(&a).unwrap();

        assert_eq!(page.dirtier(), Some(tid));
        assert_eq!(page.before_image_data(), Some(committed.as_slice()));
        assert_eq!(page.before_image().unwrap().tuples().unwrap().len(), 1);

        assert!(page.rollback());
        assert!(!page.is_dirty());
        assert_eq!(page.data(), committed.as_slice());
        assert!(!page.rollback());
    }

    #[test]
    fn test_rejects_wrong_size_and_schema() {
        let desc = int_desc(1);
        assert!(matches!(
            HeapPage::new(PageId::new(1, 0), desc.clone(), vec![0; 10]),
            Err(DbError::Corrupt { .. })
        ));
        let mut page = HeapPage::empty(PageId::new(1, 0), desc).unwrap();
        let mut other = tuple(&int_desc(2), 1);
        assert!(matches!(
            page.insert_tuple(&mut other),
            Err(DbError::SchemaMismatch { .. })
        ));
    }
}
