//! The transaction table: every open exchange on one session.
//!
//! A transaction is a run of segments sharing one 8-bit id. The table is
//! the session's one shared mutable resource: it hands out free ids,
//! remembers what each open transaction is waiting for, and routes
//! incoming segments to whoever awaits them.
//!
//! # Concurrency note
//!
//! `TransactionTable` is not thread-safe by itself. The session keeps it
//! behind a `std::sync::Mutex` and never holds the lock across an await,
//! so allocate/lookup/release are each atomic.

use std::sync::Arc;

use speedwire_protocol::{ConfirmationSpec, MethodSpec, ProtocolError, Segment, SegmentBody};
use tokio::sync::mpsc;

use crate::SessionError;

/// Never allocated, so a full table still leaves one id unused.
const RESERVED_ID: u8 = 255;

/// What a transaction's awaiter receives: the next segment, or the reason
/// no more will come.
pub(crate) type Inbound = Result<Segment, SessionError>;
pub(crate) type InboundSender = mpsc::UnboundedSender<Inbound>;

/// Who opened a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Local,
    Remote,
}

/// State of one open transaction.
#[derive(Debug)]
struct Slot {
    origin: Origin,
    /// Where to deliver segments. `None` when nobody is waiting.
    awaiter: Option<InboundSender>,
    /// Segment kinds in order of appearance, both directions.
    history: Vec<&'static str>,
    /// Method of the InvokeMethod that opened the transaction.
    method: Option<Arc<MethodSpec>>,
    /// Latest ConfRequest seen on the transaction.
    confirmation: Option<Arc<ConfirmationSpec>>,
}

impl Slot {
    fn new(origin: Origin, awaiter: Option<InboundSender>) -> Self {
        Self {
            origin,
            awaiter,
            history: Vec::new(),
            method: None,
            confirmation: None,
        }
    }

    fn note(&mut self, body: &SegmentBody) {
        self.history.push(body.kind_name());
        match body {
            SegmentBody::InvokeMethod(m) => self.method = Some(Arc::clone(&m.spec)),
            SegmentBody::ConfRequest(c) => self.confirmation = Some(Arc::clone(&c.spec)),
            _ => {}
        }
    }
}

/// Bounded table of open transactions, indexed by id.
///
/// Ids `0..=254` are always valid on the wire; the limit only caps how
/// many transactions this side may open at once.
///
/// ```text
/// allocate() / open_remote() ──→ [open] ──→ release()
///                                   │
///                     note() / deliver() / attach()
/// ```
pub(crate) struct TransactionTable {
    /// One entry per usable id; id 255 is never handed out.
    slots: Vec<Option<Slot>>,
    open: usize,
    /// Open transactions with [`Origin::Local`].
    local: usize,
    limit: usize,
    /// Where the next allocation scan starts, so ids rotate.
    cursor: usize,
}

impl TransactionTable {
    /// Creates a table allowing at most `limit` locally opened
    /// transactions at a time.
    pub fn new(limit: usize) -> Self {
        Self {
            slots: (0..usize::from(RESERVED_ID)).map(|_| None).collect(),
            open: 0,
            local: 0,
            limit: limit.clamp(1, usize::from(RESERVED_ID)),
            cursor: 0,
        }
    }

    /// Claims a free id for a locally started transaction.
    ///
    /// # Errors
    /// Returns [`SessionError::NoFreeTransaction`] when the local limit is
    /// reached or every id is taken.
    pub fn allocate(&mut self, awaiter: Option<InboundSender>) -> Result<u8, SessionError> {
        if self.local >= self.limit {
            return Err(SessionError::NoFreeTransaction(self.open));
        }
        let capacity = self.slots.len();
        let free = (0..capacity)
            .map(|offset| (self.cursor + offset) % capacity)
            .find(|&idx| self.slots[idx].is_none())
            .ok_or(SessionError::NoFreeTransaction(self.open))?;

        self.slots[free] = Some(Slot::new(Origin::Local, awaiter));
        self.open += 1;
        self.local += 1;
        self.cursor = (free + 1) % capacity;

        // `free < capacity <= 255`
        Ok(free as u8)
    }

    /// Records a transaction the peer started.
    ///
    /// # Errors
    /// Fails if the id is already open or is the reserved id 255: the
    /// stream can no longer be trusted.
    pub fn open_remote(&mut self, id: u8, body: &SegmentBody) -> Result<(), ProtocolError> {
        let slot = self
            .slots
            .get_mut(usize::from(id))
            .ok_or(ProtocolError::UnexpectedSegment {
                kind: body.kind_name(),
                transaction: id,
            })?;
        if slot.is_some() {
            return Err(ProtocolError::UnexpectedSegment {
                kind: body.kind_name(),
                transaction: id,
            });
        }

        let mut new = Slot::new(Origin::Remote, None);
        new.note(body);
        *slot = Some(new);
        self.open += 1;
        Ok(())
    }

    fn slot_mut(&mut self, id: u8) -> Option<&mut Slot> {
        self.slots.get_mut(usize::from(id)).and_then(Option::as_mut)
    }

    fn slot(&self, id: u8) -> Option<&Slot> {
        self.slots.get(usize::from(id)).and_then(Option::as_ref)
    }

    /// Appends a segment to the transaction's history. Returns `false` if
    /// the transaction is not open.
    pub fn note(&mut self, id: u8, body: &SegmentBody) -> bool {
        match self.slot_mut(id) {
            Some(slot) => {
                slot.note(body);
                true
            }
            None => false,
        }
    }

    /// Installs (or replaces) the awaiter of an open transaction.
    pub fn attach(&mut self, id: u8, awaiter: InboundSender) -> bool {
        match self.slot_mut(id) {
            Some(slot) => {
                slot.awaiter = Some(awaiter);
                true
            }
            None => false,
        }
    }

    pub fn awaiter(&self, id: u8) -> Option<InboundSender> {
        self.slot(id).and_then(|s| s.awaiter.clone())
    }

    pub fn origin(&self, id: u8) -> Option<Origin> {
        self.slot(id).map(|s| s.origin)
    }

    pub fn method(&self, id: u8) -> Option<Arc<MethodSpec>> {
        self.slot(id).and_then(|s| s.method.clone())
    }

    pub fn confirmation(&self, id: u8) -> Option<Arc<ConfirmationSpec>> {
        self.slot(id).and_then(|s| s.confirmation.clone())
    }

    pub fn history(&self, id: u8) -> Option<&[&'static str]> {
        self.slot(id).map(|s| s.history.as_slice())
    }

    pub fn is_open(&self, id: u8) -> bool {
        self.slot(id).is_some()
    }

    /// Frees the id. Returns `false` if it was not open.
    pub fn release(&mut self, id: u8) -> bool {
        match self.slots.get_mut(usize::from(id)).and_then(Option::take) {
            Some(slot) => {
                self.open -= 1;
                if slot.origin == Origin::Local {
                    self.local -= 1;
                }
                true
            }
            None => false,
        }
    }

    /// Closes every transaction and returns the awaiters that were still
    /// listening, so the caller can fail them outside the lock.
    pub fn drain(&mut self) -> Vec<InboundSender> {
        self.open = 0;
        self.local = 0;
        self.slots
            .iter_mut()
            .filter_map(Option::take)
            .filter_map(|slot| slot.awaiter)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.open
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use speedwire_protocol::{Confirmation, FieldSpec, SpecSpace};

    fn space() -> SpecSpace {
        SpecSpace::builder("t", 1)
            .method(MethodSpec::new("echo", 0))
            .confirmation(ConfirmationSpec::new("Captcha", 0).response(FieldSpec::new()))
            .build()
            .unwrap()
    }

    fn invoke(space: &SpecSpace) -> SegmentBody {
        SegmentBody::InvokeMethod(space.method("echo").unwrap())
    }

    // =====================================================================
    // allocate()
    // =====================================================================

    #[test]
    fn test_allocate_until_full_returns_error() {
        let mut table = TransactionTable::new(255);
        let mut ids: Vec<u8> = (0..255).map(|_| table.allocate(None).unwrap()).collect();

        assert!(matches!(
            table.allocate(None),
            Err(SessionError::NoFreeTransaction(255))
        ));

        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 255, "ids must be unique");
        assert!(!ids.contains(&255), "id 255 is reserved");
    }

    #[test]
    fn test_allocate_after_release_reuses_slot() {
        let mut table = TransactionTable::new(2);
        let a = table.allocate(None).unwrap();
        let _b = table.allocate(None).unwrap();
        assert!(table.allocate(None).is_err());

        assert!(table.release(a));
        assert!(table.allocate(None).is_ok());
    }

    #[test]
    fn test_limit_counts_local_transactions_only() {
        let space = space();
        let mut table = TransactionTable::new(1);
        table.open_remote(3, &invoke(&space)).unwrap();
        table.open_remote(200, &invoke(&space)).unwrap();

        let local = table.allocate(None).unwrap();
        assert!(matches!(
            table.allocate(None),
            Err(SessionError::NoFreeTransaction(3))
        ));

        table.release(200);
        assert!(table.allocate(None).is_err(), "remote releases do not free local room");
        table.release(local);
        assert!(table.allocate(None).is_ok());
    }

    #[test]
    fn test_open_remote_accepts_ids_beyond_limit() {
        let space = space();
        let mut table = TransactionTable::new(4);
        for id in [4, 100, 254] {
            table.open_remote(id, &invoke(&space)).unwrap();
        }
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_allocate_skips_ids_opened_remotely() {
        let space = space();
        let mut table = TransactionTable::new(255);
        table.open_remote(0, &invoke(&space)).unwrap();
        assert_eq!(table.allocate(None).unwrap(), 1);
    }

    #[test]
    fn test_allocate_rotates_ids() {
        let mut table = TransactionTable::new(8);
        let a = table.allocate(None).unwrap();
        table.release(a);
        let b = table.allocate(None).unwrap();
        assert_ne!(a, b);
    }

    // =====================================================================
    // open_remote()
    // =====================================================================

    #[test]
    fn test_open_remote_records_method() {
        let space = space();
        let mut table = TransactionTable::new(255);
        table.open_remote(7, &invoke(&space)).unwrap();

        assert_eq!(table.origin(7), Some(Origin::Remote));
        assert_eq!(table.method(7).unwrap().name, "echo");
        assert_eq!(table.history(7).unwrap(), &["InvokeMethod"]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_open_remote_duplicate_id_fails() {
        let space = space();
        let mut table = TransactionTable::new(255);
        table.open_remote(7, &invoke(&space)).unwrap();
        assert!(table.open_remote(7, &invoke(&space)).is_err());
    }

    #[test]
    fn test_open_remote_reserved_id_fails() {
        let space = space();
        let mut table = TransactionTable::new(255);
        assert!(table.open_remote(255, &invoke(&space)).is_err());
    }

    // =====================================================================
    // note() / confirmation()
    // =====================================================================

    #[test]
    fn test_note_tracks_latest_confirmation() {
        let space = space();
        let mut table = TransactionTable::new(4);
        let id = table.allocate(None).unwrap();
        let conf = Confirmation::new(space.confirmation(0).unwrap().clone());

        assert!(table.note(id, &SegmentBody::ConfRequest(conf)));
        assert_eq!(table.confirmation(id).unwrap().name, "Captcha");
        assert!(!table.note(3, &invoke(&space)), "closed ids are not noted");
    }

    // =====================================================================
    // drain()
    // =====================================================================

    #[test]
    fn test_drain_returns_live_awaiters_and_empties_table() {
        let mut table = TransactionTable::new(4);
        let (tx, _rx) = mpsc::unbounded_channel();
        table.allocate(Some(tx)).unwrap();
        table.allocate(None).unwrap();

        let awaiters = table.drain();
        assert_eq!(awaiters.len(), 1);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_release_unknown_id_returns_false() {
        let mut table = TransactionTable::new(4);
        assert!(!table.release(2));
    }
}
