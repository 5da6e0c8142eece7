//! List codec with incremental (partial) updates.
//!
//! A full list is `count` followed by the items. A partial update starts
//! with a mode byte `0xF0 | mode`, which the reader tells apart from a
//! count by its top nibble. Full-list counts therefore must not start
//! with `0xF`.

use std::ops::RangeInclusive;

use bytes::{BufMut, BytesMut};
use speedwire_transport::Readable;

use crate::codec::{read_u8, read_uint, write_uint};
use crate::{ListUpdate, ListValue, PartialOp, ProtocolError, Repr, SpecSpace};

const PARTIAL_MARKER: u8 = 0xF0;

#[derive(Debug, Clone)]
pub struct ListRepr {
    item: Repr,
    count_size: u8,
    len: Option<RangeInclusive<usize>>,
}

impl ListRepr {
    pub fn new(item: Repr, count_size: u8) -> Result<Self, ProtocolError> {
        if !(1..=4).contains(&count_size) {
            return Err(ProtocolError::InvalidDescriptor(format!(
                "List count size must be 1..=4 bytes, got {count_size}"
            )));
        }
        Ok(Self {
            item,
            count_size,
            len: None,
        })
    }

    /// Length validator for full lists.
    pub fn with_len(mut self, len: RangeInclusive<usize>) -> Self {
        self.len = Some(len);
        self
    }

    pub fn item(&self) -> &Repr {
        &self.item
    }

    fn count_size(&self) -> usize {
        usize::from(self.count_size)
    }

    fn write_count(&self, buf: &mut BytesMut, count: usize) -> Result<(), ProtocolError> {
        let count = u32::try_from(count)
            .map_err(|_| ProtocolError::Encode(format!("list count {count} too large")))?;
        write_uint(buf, count, self.count_size())
    }

    fn write_items(
        &self,
        buf: &mut BytesMut,
        items: &[crate::Value],
    ) -> Result<(), ProtocolError> {
        for item in items {
            self.item.write(buf, item)?;
        }
        Ok(())
    }

    pub(crate) fn write(&self, buf: &mut BytesMut, value: &ListValue) -> Result<(), ProtocolError> {
        match value {
            ListValue::Full(items) => {
                let start = buf.len();
                self.write_count(buf, items.len())?;
                if buf[start] >> 4 == 0xF {
                    return Err(ProtocolError::Encode(format!(
                        "list of {} items collides with the partial-update marker",
                        items.len()
                    )));
                }
                self.write_items(buf, items)
            }
            ListValue::Partial(update) => {
                buf.put_u8(PARTIAL_MARKER | update.op.mode_id());
                self.write_count(buf, update.count())?;
                match update.op {
                    PartialOp::Append | PartialOp::Prepend => self.write_items(buf, &update.items),
                    PartialOp::Insert { index } => {
                        write_uint(buf, index, self.count_size())?;
                        self.write_items(buf, &update.items)
                    }
                    PartialOp::Remove { index, .. } => write_uint(buf, index, self.count_size()),
                }
            }
        }
    }

    async fn read_items<R: Readable>(
        &self,
        r: &mut R,
        count: u32,
        space: Option<&SpecSpace>,
    ) -> Result<Vec<crate::Value>, ProtocolError> {
        // The count comes off the wire; don't trust it for preallocation.
        let mut items = Vec::with_capacity((count as usize).min(1024));
        for _ in 0..count {
            items.push(self.item.read(r, space).await?);
        }
        Ok(items)
    }

    pub(crate) async fn read<R: Readable>(
        &self,
        r: &mut R,
        space: Option<&SpecSpace>,
    ) -> Result<ListValue, ProtocolError> {
        let first = read_u8(r).await?;

        if first >> 4 == 0xF {
            let mode = first & 0x0F;
            let count = read_uint(r, self.count_size()).await?;
            let update = match mode {
                0 => ListUpdate::append(self.read_items(r, count, space).await?),
                1 => ListUpdate::prepend(self.read_items(r, count, space).await?),
                2 => {
                    let index = read_uint(r, self.count_size()).await?;
                    ListUpdate::insert(index, self.read_items(r, count, space).await?)
                }
                3 => {
                    let index = read_uint(r, self.count_size()).await?;
                    ListUpdate::remove(index, count)
                }
                other => return Err(ProtocolError::UnknownPartialMode(other)),
            };
            return Ok(ListValue::Partial(update));
        }

        let rest = self.count_size() - 1;
        let low = read_uint(r, rest).await?;
        let count = (u32::from(first) << (8 * rest)) | low;
        Ok(ListValue::Full(self.read_items(r, count, space).await?))
    }

    pub(crate) fn find_error(&self, value: &ListValue) -> Option<String> {
        if let (Some(len), ListValue::Full(items)) = (&self.len, value) {
            if !len.contains(&items.len()) {
                return Some(format!(
                    "List[len]: \"{}\" is out of range {}..{}",
                    items.len(),
                    len.start(),
                    len.end()
                ));
            }
        }

        value
            .items()
            .iter()
            .enumerate()
            .find_map(|(i, item)| {
                self.item
                    .find_error(item)
                    .map(|err| format!("List item[{i}]: {err}"))
            })
    }
}

impl From<ListRepr> for Repr {
    fn from(r: ListRepr) -> Self {
        Self::List(Box::new(r))
    }
}
