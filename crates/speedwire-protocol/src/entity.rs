//! Entity types and the dynamic entity codec.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use speedwire_transport::Readable;

use crate::codec::read_u8;
use crate::{FieldSpec, FieldValue, MethodSpec, PackingMode, ProtocolError, SpecSpace};

/// Largest entity type id. Bits 7 and 6 of the entity id byte carry the
/// field-array packing flags.
pub const MAX_ENTITY_ID: u8 = 0x3F;

/// Template for an entity type.
#[derive(Debug, Clone)]
pub struct EntitySpec {
    pub name: String,
    pub numeric_id: u8,
    pub fields: FieldSpec,
    /// Methods keyed by wire id. Static methods carry the 0x80 flag.
    pub methods: BTreeMap<u8, Arc<MethodSpec>>,
}

impl EntitySpec {
    pub fn new(name: impl Into<String>, numeric_id: u8, fields: FieldSpec) -> Self {
        Self {
            name: name.into(),
            numeric_id,
            fields,
            methods: BTreeMap::new(),
        }
    }

    /// Attaches a method to this entity type.
    ///
    /// The method is renamed to `Entity.method` and bound to this type.
    /// A dynamic method without an explicit entity id repr uses the
    /// repr of the entity's required `id` field.
    pub fn method(mut self, mut spec: MethodSpec) -> Self {
        spec.name = format!("{}.{}", self.name, spec.name);
        spec.entity_type = Some(self.numeric_id);
        if !spec.is_static() && spec.entity_id_repr.is_none() {
            spec.entity_id_repr = self.fields.required_repr("id").cloned();
        }
        self.methods.insert(spec.numeric_id, Arc::new(spec));
        self
    }

    /// Builds a fresh value of this type.
    pub fn instantiate(self: &Arc<Self>, value: FieldValue) -> Entity {
        Entity::new(Arc::clone(self), value)
    }
}

/// A valued entity: a template plus a field record.
#[derive(Debug, Clone)]
pub struct Entity {
    spec: Arc<EntitySpec>,
    value: FieldValue,
}

impl Entity {
    pub fn new(spec: Arc<EntitySpec>, value: FieldValue) -> Self {
        Self { spec, value }
    }

    pub fn spec(&self) -> &Arc<EntitySpec> {
        &self.spec
    }

    pub fn numeric_id(&self) -> u8 {
        self.spec.numeric_id
    }

    pub fn value(&self) -> &FieldValue {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut FieldValue {
        &mut self.value
    }

    pub fn into_value(self) -> FieldValue {
        self.value
    }

    /// The instance id, if the entity declares an `id` field.
    pub fn id(&self) -> Option<&crate::Value> {
        self.value.get("id")
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.spec.numeric_id == other.spec.numeric_id
            && self.spec.name == other.spec.name
            && self.value == other.value
    }
}

pub(crate) fn write_entity(buf: &mut BytesMut, entity: &Entity) -> Result<(), ProtocolError> {
    if entity.numeric_id() > MAX_ENTITY_ID {
        return Err(ProtocolError::Encode(format!(
            "entity type id {} does not fit the id byte",
            entity.numeric_id()
        )));
    }
    let fields = &entity.spec.fields;
    let mode = fields.choose_mode(&entity.value);
    buf.put_u8(entity.numeric_id() | mode.entity_bits());
    fields.encode_with_mode(buf, &entity.value, mode)
}

pub(crate) async fn read_entity<R: Readable>(
    r: &mut R,
    space: Option<&SpecSpace>,
) -> Result<Entity, ProtocolError> {
    let byte = read_u8(r).await?;
    let mode = PackingMode::from_entity_byte(byte);
    let id = byte & MAX_ENTITY_ID;

    let space = space.ok_or(ProtocolError::NoSpecSpace)?;
    let spec = space.entity(id).ok_or(ProtocolError::UnknownEntity(id))?;
    let value = spec.fields.read(r, mode, Some(space)).await?;
    Ok(Entity::new(Arc::clone(spec), value))
}
