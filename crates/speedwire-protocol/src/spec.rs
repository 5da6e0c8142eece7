//! Descriptor registry: methods, confirmations and the [`SpecSpace`] that
//! ties them together with entity types.
//!
//! Descriptors are immutable templates shared by `Arc`. Each invocation or
//! confirmation is a fresh value built from its template, never the
//! template itself.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entity::MAX_ENTITY_ID;
use crate::{EntitySpec, FieldSpec, FieldValue, ProtocolError, Repr, Value};

/// Largest confirmation id; it travels in the low nibble of a prefix.
pub const MAX_CONFIRMATION_ID: u8 = 0x0F;

/// Flag on entity method ids marking a static (instance-less) method.
pub const STATIC_METHOD_FLAG: u8 = 0x80;

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

/// Sliding-window invocation limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_invocations: u32,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub name: String,
    pub numeric_id: u8,
    /// Entity type this method belongs to; `None` for global methods.
    pub entity_type: Option<u8>,
    pub params: FieldSpec,
    pub returns: FieldSpec,
    /// Confirmation ids the server may request mid-invocation.
    pub confirmations: Vec<u8>,
    pub rate_limit: Option<RateLimit>,
    /// How the instance id is encoded for dynamic entity methods.
    pub entity_id_repr: Option<Repr>,
}

impl MethodSpec {
    pub fn new(name: impl Into<String>, numeric_id: u8) -> Self {
        Self {
            name: name.into(),
            numeric_id,
            entity_type: None,
            params: FieldSpec::new(),
            returns: FieldSpec::new(),
            confirmations: Vec::new(),
            rate_limit: None,
            entity_id_repr: None,
        }
    }

    pub fn params(mut self, params: FieldSpec) -> Self {
        self.params = params;
        self
    }

    pub fn returns(mut self, returns: FieldSpec) -> Self {
        self.returns = returns;
        self
    }

    pub fn confirmation(mut self, id: u8) -> Self {
        self.confirmations.push(id);
        self
    }

    pub fn rate_limit(mut self, max_invocations: u32, window: Duration) -> Self {
        self.rate_limit = Some(RateLimit {
            max_invocations,
            window,
        });
        self
    }

    pub fn entity_id(mut self, repr: impl Into<Repr>) -> Self {
        self.entity_id_repr = Some(repr.into());
        self
    }

    /// Entity method that is called on the type rather than an instance.
    pub fn is_static(&self) -> bool {
        self.entity_type.is_some() && self.numeric_id & STATIC_METHOD_FLAG != 0
    }

    pub fn allows_confirmation(&self, id: u8) -> bool {
        self.confirmations.contains(&id)
    }
}

/// One invocation of a method.
#[derive(Debug, Clone)]
pub struct Method {
    pub spec: Arc<MethodSpec>,
    /// Instance id for dynamic entity methods.
    pub entity_id: Option<Value>,
    pub params: Option<FieldValue>,
    pub return_value: Option<FieldValue>,
}

impl Method {
    pub fn new(spec: Arc<MethodSpec>) -> Self {
        Self {
            spec,
            entity_id: None,
            params: None,
            return_value: None,
        }
    }

    pub fn with_params(mut self, params: FieldValue) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_entity_id(mut self, id: impl Into<Value>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Runs the params validators.
    pub fn find_error(&self) -> Option<String> {
        self.params
            .as_ref()
            .and_then(|params| self.spec.params.find_error(params))
    }
}

// ---------------------------------------------------------------------------
// Confirmations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConfirmationSpec {
    pub name: String,
    pub numeric_id: u8,
    pub request: FieldSpec,
    pub response: FieldSpec,
}

impl ConfirmationSpec {
    pub fn new(name: impl Into<String>, numeric_id: u8) -> Self {
        Self {
            name: name.into(),
            numeric_id,
            request: FieldSpec::new(),
            response: FieldSpec::new(),
        }
    }

    pub fn request(mut self, request: FieldSpec) -> Self {
        self.request = request;
        self
    }

    pub fn response(mut self, response: FieldSpec) -> Self {
        self.response = response;
        self
    }
}

/// An interactive challenge: the server's request and the client's answer.
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub spec: Arc<ConfirmationSpec>,
    pub request: Option<FieldValue>,
    pub response: Option<FieldValue>,
}

impl Confirmation {
    pub fn new(spec: Arc<ConfirmationSpec>) -> Self {
        Self {
            spec,
            request: None,
            response: None,
        }
    }

    pub fn with_request(mut self, request: FieldValue) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_response(mut self, response: FieldValue) -> Self {
        self.response = Some(response);
        self
    }

    pub fn numeric_id(&self) -> u8 {
        self.spec.numeric_id
    }
}

// ---------------------------------------------------------------------------
// SpecSpace
// ---------------------------------------------------------------------------

/// The full descriptor table of one protocol version.
#[derive(Debug, Clone)]
pub struct SpecSpace {
    pub project: String,
    pub spec_version: u32,
    global_methods: BTreeMap<u8, Arc<MethodSpec>>,
    entities: BTreeMap<u8, Arc<EntitySpec>>,
    confirmations: BTreeMap<u8, Arc<ConfirmationSpec>>,
    by_name: BTreeMap<String, Arc<MethodSpec>>,
}

impl SpecSpace {
    pub fn builder(project: impl Into<String>, spec_version: u32) -> SpecSpaceBuilder {
        SpecSpaceBuilder {
            project: project.into(),
            spec_version,
            global_methods: Vec::new(),
            entities: Vec::new(),
            confirmations: Vec::new(),
        }
    }

    pub fn global_method(&self, id: u8) -> Option<&Arc<MethodSpec>> {
        self.global_methods.get(&id)
    }

    pub fn entity(&self, id: u8) -> Option<&Arc<EntitySpec>> {
        self.entities.get(&id)
    }

    pub fn entity_by_name(&self, name: &str) -> Option<&Arc<EntitySpec>> {
        self.entities.values().find(|e| e.name == name)
    }

    pub fn entity_method(&self, entity: u8, method: u8) -> Option<&Arc<MethodSpec>> {
        self.entities.get(&entity)?.methods.get(&method)
    }

    pub fn confirmation(&self, id: u8) -> Option<&Arc<ConfirmationSpec>> {
        self.confirmations.get(&id)
    }

    pub fn confirmation_by_name(&self, name: &str) -> Option<&Arc<ConfirmationSpec>> {
        self.confirmations.values().find(|c| c.name == name)
    }

    /// Method template by full name (`echo`, `Test.static_echo`).
    pub fn method_spec(&self, name: &str) -> Option<&Arc<MethodSpec>> {
        self.by_name.get(name)
    }

    /// A fresh invocation of the named method.
    pub fn method(&self, name: &str) -> Option<Method> {
        self.method_spec(name).map(|spec| Method::new(Arc::clone(spec)))
    }

    /// A fresh confirmation of the named type.
    pub fn new_confirmation(&self, name: &str) -> Option<Confirmation> {
        self.confirmation_by_name(name)
            .map(|spec| Confirmation::new(Arc::clone(spec)))
    }

    /// Names of every method, global and entity-bound.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }
}

/// Collects descriptors and checks them as a whole in [`build`](Self::build).
#[derive(Debug)]
pub struct SpecSpaceBuilder {
    project: String,
    spec_version: u32,
    global_methods: Vec<MethodSpec>,
    entities: Vec<EntitySpec>,
    confirmations: Vec<ConfirmationSpec>,
}

fn invalid(msg: String) -> ProtocolError {
    ProtocolError::InvalidDescriptor(msg)
}

impl SpecSpaceBuilder {
    pub fn method(mut self, spec: MethodSpec) -> Self {
        self.global_methods.push(spec);
        self
    }

    pub fn entity(mut self, spec: EntitySpec) -> Self {
        self.entities.push(spec);
        self
    }

    pub fn confirmation(mut self, spec: ConfirmationSpec) -> Self {
        self.confirmations.push(spec);
        self
    }

    pub fn build(self) -> Result<SpecSpace, ProtocolError> {
        let mut confirmations = BTreeMap::new();
        for conf in self.confirmations {
            if conf.numeric_id > MAX_CONFIRMATION_ID {
                return Err(invalid(format!(
                    "confirmation `{}` id {} exceeds {MAX_CONFIRMATION_ID}",
                    conf.name, conf.numeric_id
                )));
            }
            conf.request.validate()?;
            conf.response.validate()?;
            let id = conf.numeric_id;
            if let Some(prev) = confirmations.insert(id, Arc::new(conf)) {
                return Err(invalid(format!(
                    "confirmation id {id} declared twice (`{}`)",
                    prev.name
                )));
            }
        }

        let mut by_name: BTreeMap<String, Arc<MethodSpec>> = BTreeMap::new();
        let mut register = |spec: &Arc<MethodSpec>| -> Result<(), ProtocolError> {
            spec.params.validate()?;
            spec.returns.validate()?;
            if let Some(id) = spec.confirmations.iter().find(|id| !confirmations.contains_key(*id)) {
                return Err(invalid(format!(
                    "method `{}` allows unknown confirmation {id}",
                    spec.name
                )));
            }
            if by_name.insert(spec.name.clone(), Arc::clone(spec)).is_some() {
                return Err(invalid(format!("method name `{}` declared twice", spec.name)));
            }
            Ok(())
        };

        let mut global_methods = BTreeMap::new();
        for spec in self.global_methods {
            if spec.numeric_id & STATIC_METHOD_FLAG != 0 {
                return Err(invalid(format!(
                    "global method `{}` id {} does not fit 7 bits",
                    spec.name, spec.numeric_id
                )));
            }
            let spec = Arc::new(spec);
            register(&spec)?;
            if global_methods.insert(spec.numeric_id, spec).is_some() {
                return Err(invalid("global method id declared twice".into()));
            }
        }

        let mut entities = BTreeMap::new();
        for entity in self.entities {
            if entity.numeric_id > MAX_ENTITY_ID {
                return Err(invalid(format!(
                    "entity `{}` id {} exceeds {MAX_ENTITY_ID}",
                    entity.name, entity.numeric_id
                )));
            }
            entity.fields.validate()?;
            for spec in entity.methods.values() {
                if !spec.is_static() && spec.entity_id_repr.is_none() {
                    return Err(invalid(format!(
                        "dynamic method `{}` has no entity id repr",
                        spec.name
                    )));
                }
                register(spec)?;
            }
            let id = entity.numeric_id;
            if entities.insert(id, Arc::new(entity)).is_some() {
                return Err(invalid(format!("entity id {id} declared twice")));
            }
        }

        Ok(SpecSpace {
            project: self.project,
            spec_version: self.spec_version,
            global_methods,
            entities,
            confirmations,
            by_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn str_field(name: &str) -> FieldSpec {
        FieldSpec::new().required(name, Repr::str())
    }

    fn sample() -> SpecSpace {
        SpecSpace::builder("sample", 1)
            .method(
                MethodSpec::new("echo", 0)
                    .params(str_field("str"))
                    .returns(str_field("str")),
            )
            .method(MethodSpec::new("captcha", 1).confirmation(0))
            .confirmation(
                ConfirmationSpec::new("Captcha", 0)
                    .request(str_field("url"))
                    .response(str_field("code")),
            )
            .entity(
                EntitySpec::new("Test", 0, FieldSpec::new().required("id", Repr::int(4).unwrap()))
                    .method(MethodSpec::new("static_echo", 0x80))
                    .method(MethodSpec::new("dynamic_echo", 0)),
            )
            .build()
            .expect("sample table should be valid")
    }

    #[test]
    fn test_lookup_by_id_and_name() {
        let space = sample();
        assert_eq!(space.global_method(0).unwrap().name, "echo");
        assert_eq!(space.entity_method(0, 0x80).unwrap().name, "Test.static_echo");
        assert_eq!(space.confirmation(0).unwrap().name, "Captcha");
        assert!(space.method_spec("Test.dynamic_echo").is_some());
        assert_eq!(space.method_names().count(), 4);
    }

    #[test]
    fn test_method_is_fresh_per_call() {
        let space = sample();
        let mut a = space.method("echo").unwrap();
        a.params = Some(FieldValue::new().with("str", "x"));
        let b = space.method("echo").unwrap();
        assert!(b.params.is_none());
        assert!(Arc::ptr_eq(&a.spec, &b.spec));
    }

    #[test]
    fn test_static_flag() {
        let space = sample();
        assert!(space.method_spec("Test.static_echo").unwrap().is_static());
        assert!(!space.method_spec("Test.dynamic_echo").unwrap().is_static());
        assert!(!space.method_spec("echo").unwrap().is_static());
    }

    #[test]
    fn test_builder_rejects_wide_ids() {
        let wide_global = SpecSpace::builder("x", 1).method(MethodSpec::new("m", 0x80)).build();
        assert!(matches!(wide_global, Err(ProtocolError::InvalidDescriptor(_))));

        let wide_conf = SpecSpace::builder("x", 1)
            .confirmation(ConfirmationSpec::new("c", 16))
            .build();
        assert!(wide_conf.is_err());

        let wide_entity = SpecSpace::builder("x", 1)
            .entity(EntitySpec::new("e", 0x40, FieldSpec::new()))
            .build();
        assert!(wide_entity.is_err());
    }

    #[test]
    fn test_builder_rejects_duplicates() {
        let dup_id = SpecSpace::builder("x", 1)
            .method(MethodSpec::new("a", 1))
            .method(MethodSpec::new("b", 1))
            .build();
        assert!(dup_id.is_err());

        let dup_name = SpecSpace::builder("x", 1)
            .method(MethodSpec::new("a", 1))
            .method(MethodSpec::new("a", 2))
            .build();
        assert!(dup_name.is_err());
    }

    #[test]
    fn test_builder_rejects_unknown_confirmation_reference() {
        let result = SpecSpace::builder("x", 1)
            .method(MethodSpec::new("m", 0).confirmation(3))
            .build();
        assert!(result.unwrap_err().to_string().contains("unknown confirmation 3"));
    }

    #[test]
    fn test_builder_rejects_dynamic_method_without_id_repr() {
        let result = SpecSpace::builder("x", 1)
            .entity(EntitySpec::new("NoId", 1, FieldSpec::new()).method(MethodSpec::new("m", 0)))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_method_find_error_uses_params_spec() {
        let space = SpecSpace::builder("x", 1)
            .method(MethodSpec::new("m", 0).params(
                FieldSpec::new().required("s", crate::StrRepr::default().with_len(1..=3)),
            ))
            .build()
            .unwrap();
        let ok = space.method("m").unwrap().with_params(FieldValue::new().with("s", "ab"));
        assert_eq!(ok.find_error(), None);
        let bad = space.method("m").unwrap().with_params(FieldValue::new().with("s", "abcd"));
        assert!(bad.find_error().unwrap().starts_with("FieldArray.s: Str[len]"));
    }
}
