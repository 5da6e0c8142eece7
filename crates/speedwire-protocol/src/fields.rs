//! Field-array codec: records with required and optional fields.
//!
//! Required fields are written in declaration order with no tags.
//! Optional fields follow in one of two packings:
//!
//! - **normal**: a count byte, then `(id, value)` pairs;
//! - **high-packing**: a bitfield naming the present ids, then the values.
//!
//! The writer picks whichever is smaller per message. The choice is not
//! part of the field array itself; it travels in flag bits of the
//! enclosing segment prefix or entity id byte ([`PackingMode`]).

use bytes::{BufMut, BytesMut};
use speedwire_transport::Readable;

use crate::codec::{read_u8, write_uint};
use crate::{FieldValue, ProtocolError, Repr, SpecSpace};

/// How the optional part of a field array is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackingMode {
    pub has_optional: bool,
    pub high_packing: bool,
}

impl PackingMode {
    /// No optional fields follow the required ones.
    pub const NONE: Self = Self {
        has_optional: false,
        high_packing: false,
    };

    /// Flag bits as they appear in a segment prefix (bit 5, bit 4).
    pub fn segment_bits(self) -> u8 {
        (u8::from(self.high_packing) << 5) | (u8::from(self.has_optional) << 4)
    }

    pub fn from_segment_prefix(prefix: u8) -> Self {
        Self {
            high_packing: prefix & 0x20 != 0,
            has_optional: prefix & 0x10 != 0,
        }
    }

    /// Flag bits as they appear in an entity id byte (bit 7, bit 6).
    pub fn entity_bits(self) -> u8 {
        (u8::from(self.high_packing) << 7) | (u8::from(self.has_optional) << 6)
    }

    pub fn from_entity_byte(byte: u8) -> Self {
        Self {
            high_packing: byte & 0x80 != 0,
            has_optional: byte & 0x40 != 0,
        }
    }

    fn name(self) -> &'static str {
        if self.high_packing {
            "high-packing"
        } else {
            "normal"
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptionalField {
    pub name: String,
    pub id: u8,
    pub repr: Repr,
}

/// Layout of a record.
#[derive(Debug, Clone, Default)]
pub struct FieldSpec {
    required: Vec<(String, Repr)>,
    optional: Vec<OptionalField>,
}

impl FieldSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a required field. Order of calls is wire order.
    pub fn required(mut self, name: impl Into<String>, repr: impl Into<Repr>) -> Self {
        self.required.push((name.into(), repr.into()));
        self
    }

    /// Declares an optional field with bit id `id`.
    pub fn optional(mut self, name: impl Into<String>, id: u8, repr: impl Into<Repr>) -> Self {
        self.optional.push(OptionalField {
            name: name.into(),
            id,
            repr: repr.into(),
        });
        self.optional.sort_by_key(|f| f.id);
        self
    }

    /// Rejects duplicate names and duplicate optional ids.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let mut names: Vec<&str> = self
            .required
            .iter()
            .map(|(n, _)| n.as_str())
            .chain(self.optional.iter().map(|f| f.name.as_str()))
            .collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(ProtocolError::InvalidDescriptor(format!(
                "duplicate field name `{}`",
                dup[0]
            )));
        }

        // `optional` is kept sorted by id.
        if let Some(dup) = self.optional.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(ProtocolError::InvalidDescriptor(format!(
                "fields `{}` and `{}` share optional id {}",
                dup[0].name, dup[1].name, dup[0].id
            )));
        }
        Ok(())
    }

    /// Length of the high-packing selector bitfield.
    pub fn selector_len(&self) -> usize {
        let max_id = self.optional.iter().map(|f| usize::from(f.id)).max().unwrap_or(0);
        (max_id + 3).div_ceil(8)
    }

    /// Required fields in wire order.
    pub fn required_fields(&self) -> impl Iterator<Item = (&str, &Repr)> {
        self.required.iter().map(|(n, r)| (n.as_str(), r))
    }

    /// Optional fields ascending by id.
    pub fn optional_fields(&self) -> &[OptionalField] {
        &self.optional
    }

    pub(crate) fn required_repr(&self, name: &str) -> Option<&Repr> {
        self.required.iter().find(|(n, _)| n == name).map(|(_, r)| r)
    }

    fn lookup(&self, name: &str) -> Option<&Repr> {
        self.required
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r)
            .or_else(|| self.optional.iter().find(|f| f.name == name).map(|f| &f.repr))
    }

    fn optional_by_id(&self, id: u8) -> Option<&OptionalField> {
        self.optional.iter().find(|f| f.id == id)
    }

    /// Optional fields present in `value`, ascending by id.
    fn present<'a>(&'a self, value: &FieldValue) -> Vec<&'a OptionalField> {
        self.optional
            .iter()
            .filter(|f| value.contains(&f.name))
            .collect()
    }

    /// Picks the smaller packing for `value`.
    pub fn choose_mode(&self, value: &FieldValue) -> PackingMode {
        let present = self.present(value).len();
        if present == 0 {
            return PackingMode::NONE;
        }
        PackingMode {
            has_optional: true,
            high_packing: 1 + present > self.selector_len(),
        }
    }

    /// Chooses a mode, writes `value` with it, and returns the mode so the
    /// caller can record it in its flag bits.
    pub fn encode(&self, buf: &mut BytesMut, value: &FieldValue) -> Result<PackingMode, ProtocolError> {
        let mode = self.choose_mode(value);
        self.encode_with_mode(buf, value, mode)?;
        Ok(mode)
    }

    pub fn encode_with_mode(
        &self,
        buf: &mut BytesMut,
        value: &FieldValue,
        mode: PackingMode,
    ) -> Result<(), ProtocolError> {
        for (name, repr) in &self.required {
            let field = value.get(name).ok_or_else(|| {
                ProtocolError::Encode(format!("missing required field `{name}`"))
            })?;
            repr.write(buf, field)?;
        }

        let present = self.present(value);
        if !mode.has_optional {
            if let Some(field) = present.first() {
                return Err(ProtocolError::Encode(format!(
                    "optional field `{}` set but packing mode carries none",
                    field.name
                )));
            }
            return Ok(());
        }

        if mode.high_packing {
            let mut selector = vec![0u8; self.selector_len()];
            for field in &present {
                let id = usize::from(field.id);
                selector[id / 8] |= 1 << (7 - id % 8);
            }
            buf.put_slice(&selector);
            for field in &present {
                field.repr.write(buf, get_present(value, field)?)?;
            }
        } else {
            write_uint(buf, present.len() as u32, 1)?;
            for field in &present {
                buf.put_u8(field.id);
                field.repr.write(buf, get_present(value, field)?)?;
            }
        }
        Ok(())
    }

    pub async fn read<R: Readable>(
        &self,
        r: &mut R,
        mode: PackingMode,
        space: Option<&SpecSpace>,
    ) -> Result<FieldValue, ProtocolError> {
        let mut value = FieldValue::new();

        for (name, repr) in &self.required {
            value.insert(name.clone(), repr.read(r, space).await?);
        }

        if !mode.has_optional {
            return Ok(value);
        }

        if mode.high_packing {
            let selector = r.read(self.selector_len()).await?;
            for (byte_idx, byte) in selector.iter().enumerate() {
                for bit in 0..8 {
                    if byte & (1 << (7 - bit)) == 0 {
                        continue;
                    }
                    let id = u8::try_from(byte_idx * 8 + bit).map_err(|_| {
                        ProtocolError::Decode("high-packing selector too long".into())
                    })?;
                    let field = self.optional_by_id(id).ok_or(ProtocolError::UnknownField {
                        id,
                        mode: mode.name(),
                    })?;
                    value.insert(field.name.clone(), field.repr.read(r, space).await?);
                }
            }
        } else {
            let count = read_u8(r).await?;
            for _ in 0..count {
                let id = read_u8(r).await?;
                let field = self.optional_by_id(id).ok_or(ProtocolError::UnknownField {
                    id,
                    mode: mode.name(),
                })?;
                value.insert(field.name.clone(), field.repr.read(r, space).await?);
            }
        }

        Ok(value)
    }

    /// Validates every field present in `value`.
    pub fn find_error(&self, value: &FieldValue) -> Option<String> {
        value.iter().find_map(|(name, field)| match self.lookup(name) {
            Some(repr) => repr
                .find_error(field)
                .map(|err| format!("FieldArray.{name}: {err}")),
            None => Some(format!("FieldArray.{name}: field is not declared")),
        })
    }
}

fn get_present<'v>(value: &'v FieldValue, field: &OptionalField) -> Result<&'v crate::Value, ProtocolError> {
    value
        .get(&field.name)
        .ok_or_else(|| ProtocolError::Encode(format!("optional field `{}` vanished", field.name)))
}
