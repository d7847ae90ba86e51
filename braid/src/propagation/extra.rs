//! Extra-field ("baggage") propagation: predefined request-scoped fields
//! carried next to trace identity, independent of the tracing backend.
//!
//! Field storage is copy-on-write across the parent/child relationship: a
//! derived context shares its parent's value array until it writes, and the
//! first (trace ID, span ID) pair to touch a storage object claims it. A
//! claim by a different span forks the storage instead, so writes in a child
//! never leak backward into the parent's view.

use crate::context::{ExtraItem, TraceContext};
use crate::current::CurrentTraceContext as _;
use crate::error::ConfigError;
use crate::propagation::{Extractor, Injector, Propagation, PropagationFactory};
use crate::tracer::Tracing;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Claimable, copy-on-write storage for one configured set of field names.
///
/// Reads snapshot the current value array; writes clone it before mutating
/// and publish the clone, so concurrent readers never observe a torn update.
pub struct PropagationFields {
    field_names: Arc<[String]>,
    inner: Mutex<FieldsInner>,
}

struct FieldsInner {
    claim: Option<(u64, u64)>,
    values: Option<Arc<[Option<String>]>>,
}

impl PropagationFields {
    fn new(field_names: Arc<[String]>) -> Self {
        PropagationFields {
            field_names,
            inner: Mutex::new(FieldsInner {
                claim: None,
                values: None,
            }),
        }
    }

    /// The configured in-process field names, in declaration order.
    pub fn field_names(&self) -> &[String] {
        &self.field_names
    }

    /// Returns the value of `name`, if the field is configured and set.
    pub fn get(&self, name: &str) -> Option<String> {
        self.index_of(name).and_then(|index| self.get_index(index))
    }

    /// Sets `name` if it is a configured field; silently drops it otherwise.
    pub fn put(&self, name: &str, value: impl Into<String>) {
        if let Some(index) = self.index_of(name) {
            self.put_index(index, value.into());
        }
    }

    /// The set fields as ordered (name, value) pairs.
    pub fn entries(&self) -> Vec<(String, String)> {
        let Some(values) = self.snapshot() else {
            return Vec::new();
        };
        self.field_names
            .iter()
            .zip(values.iter())
            .filter_map(|(name, value)| value.clone().map(|value| (name.clone(), value)))
            .collect()
    }

    pub(crate) fn get_index(&self, index: usize) -> Option<String> {
        self.snapshot()?.get(index).cloned().flatten()
    }

    pub(crate) fn put_index(&self, index: usize, value: String) {
        if index >= self.field_names.len() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let mut values: Vec<Option<String>> = match &inner.values {
            None => vec![None; self.field_names.len()],
            Some(existing) => {
                if existing[index].as_deref() == Some(value.as_str()) {
                    return;
                }
                existing.to_vec()
            }
        };
        values[index] = Some(value);
        inner.values = Some(Arc::from(values));
    }

    fn snapshot(&self) -> Option<Arc<[Option<String>]>> {
        self.inner.lock().unwrap().values.clone()
    }

    /// First caller wins; later claims succeed only for the same span.
    fn try_claim(&self, trace_id: u64, span_id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.claim {
            None => {
                inner.claim = Some((trace_id, span_id));
                true
            }
            Some(claim) => claim == (trace_id, span_id),
        }
    }

    /// New storage claimed by `span_id`, sharing this object's value array
    /// until either side writes.
    fn fork_claimed(&self, trace_id: u64, span_id: u64) -> PropagationFields {
        PropagationFields {
            field_names: self.field_names.clone(),
            inner: Mutex::new(FieldsInner {
                claim: Some((trace_id, span_id)),
                values: self.snapshot(),
            }),
        }
    }

    /// Folds `other`'s set fields into this storage, overwriting per field.
    fn merge_from(&self, other: &PropagationFields) {
        if self.field_names[..] != other.field_names[..] {
            return;
        }
        let Some(values) = other.snapshot() else {
            return;
        };
        for (index, value) in values.iter().enumerate() {
            if let Some(value) = value {
                self.put_index(index, value.clone());
            }
        }
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        let name = name.to_ascii_lowercase();
        self.field_names.iter().position(|field| *field == name)
    }
}

impl fmt::Debug for PropagationFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropagationFields")
            .field("entries", &self.entries())
            .finish()
    }
}

/// Builds and consolidates [`PropagationFields`] during context decoration.
#[derive(Clone, Debug)]
pub(crate) struct FieldsFactory {
    field_names: Arc<[String]>,
}

impl FieldsFactory {
    fn new(field_names: Arc<[String]>) -> Self {
        FieldsFactory { field_names }
    }

    fn create(&self) -> PropagationFields {
        PropagationFields::new(self.field_names.clone())
    }

    fn create_and_claim(&self, trace_id: u64, span_id: u64) -> Arc<PropagationFields> {
        let fields = self.create();
        fields.try_claim(trace_id, span_id);
        Arc::new(fields)
    }

    /// Runs on every context creation. Afterwards the context's extra list
    /// ends with exactly one fields object of this factory's shape, claimed
    /// by this context: an unclaimed object is claimed in place, an object
    /// claimed by a different span is forked, and any further same-shape
    /// objects merge into the first (later values win per field).
    ///
    /// Idempotent by reference: a context that already satisfies the
    /// invariant is returned as-is, without reallocation.
    pub(crate) fn decorate(&self, context: TraceContext) -> TraceContext {
        let trace_id = context.trace_id();
        let span_id = context.span_id();
        let extra = context.extra();
        if extra.is_empty() {
            return context.with_extra(vec![self.create_and_claim(trace_id, span_id)]);
        }

        let mut changed = false;
        let mut consolidated: Option<Arc<PropagationFields>> = None;
        let mut rebuilt: Vec<ExtraItem> = Vec::with_capacity(extra.len());
        for item in extra {
            let fields = match item.clone().downcast::<PropagationFields>() {
                Ok(fields) if fields.field_names[..] == self.field_names[..] => fields,
                _ => {
                    rebuilt.push(item.clone());
                    continue;
                }
            };
            match &consolidated {
                None => {
                    if fields.try_claim(trace_id, span_id) {
                        consolidated = Some(fields.clone());
                        rebuilt.push(item.clone());
                    } else {
                        let forked = Arc::new(fields.fork_claimed(trace_id, span_id));
                        consolidated = Some(forked.clone());
                        rebuilt.push(forked);
                        changed = true;
                    }
                }
                Some(first) => {
                    first.merge_from(&fields);
                    changed = true; // merged object drops out of the list
                }
            }
        }
        if consolidated.is_none() {
            rebuilt.push(self.create_and_claim(trace_id, span_id));
            changed = true;
        }
        if changed {
            context.with_extra(rebuilt)
        } else {
            context
        }
    }
}

/// Wraps another propagation, carrying configured extra fields as additional
/// wire keys.
///
/// In-process names may differ from wire keys via prefixes: with prefix
/// `baggage-`, the field `country-code` travels as `baggage-country-code`
/// but is read and written locally as `country-code`.
pub struct ExtraFieldPropagationFactory {
    delegate: Arc<dyn PropagationFactory>,
    fields_factory: FieldsFactory,
    key_names: Arc<[String]>,
    key_to_field: Arc<[usize]>,
}

impl ExtraFieldPropagationFactory {
    /// Propagates `field_names` as-is on the wire, next to `delegate`'s keys.
    pub fn new<I, S>(delegate: Arc<dyn PropagationFactory>, field_names: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut builder = Self::builder(delegate);
        for name in field_names {
            builder = builder.add_field(name);
        }
        builder.build()
    }

    pub fn builder(delegate: Arc<dyn PropagationFactory>) -> ExtraFieldPropagationBuilder {
        ExtraFieldPropagationBuilder {
            delegate,
            field_names: Vec::new(),
            prefixed: Vec::new(),
        }
    }
}

impl PropagationFactory for ExtraFieldPropagationFactory {
    fn create(&self) -> Arc<dyn Propagation> {
        Arc::new(ExtraFieldPropagation {
            delegate: self.delegate.create(),
            fields_factory: self.fields_factory.clone(),
            key_names: self.key_names.clone(),
            key_to_field: self.key_to_field.clone(),
        })
    }

    fn supports_join(&self) -> bool {
        self.delegate.supports_join()
    }

    fn requires_128bit_trace_id(&self) -> bool {
        self.delegate.requires_128bit_trace_id()
    }

    fn decorate(&self, context: TraceContext) -> TraceContext {
        self.fields_factory.decorate(self.delegate.decorate(context))
    }
}

impl fmt::Debug for ExtraFieldPropagationFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtraFieldPropagationFactory")
            .field("delegate", &self.delegate)
            .field("keys", &self.key_names)
            .finish()
    }
}

/// Configures an [`ExtraFieldPropagationFactory`] with plain and prefixed
/// fields. Names are trimmed and lower-cased; duplicates collapse onto one
/// in-process field.
pub struct ExtraFieldPropagationBuilder {
    delegate: Arc<dyn PropagationFactory>,
    field_names: Vec<String>,
    prefixed: Vec<(String, Vec<String>)>,
}

impl ExtraFieldPropagationBuilder {
    /// Adds a field referenced the same in-process as on the wire.
    pub fn add_field(mut self, name: impl Into<String>) -> Self {
        self.field_names.push(name.into());
        self
    }

    /// Adds fields whose wire keys gain `prefix`.
    pub fn add_prefixed_fields<I, S>(mut self, prefix: impl Into<String>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefixed
            .push((prefix.into(), names.into_iter().map(Into::into).collect()));
        self
    }

    pub fn build(self) -> Result<ExtraFieldPropagationFactory, ConfigError> {
        let mut fields: Vec<String> = Vec::new();
        let mut keys: Vec<String> = Vec::new();
        let mut key_to_field: Vec<usize> = Vec::new();

        for name in &self.field_names {
            let name = normalize(name)?;
            let index = match fields.iter().position(|field| *field == name) {
                Some(index) => index,
                None => {
                    fields.push(name.clone());
                    fields.len() - 1
                }
            };
            if !keys.contains(&name) {
                keys.push(name);
                key_to_field.push(index);
            }
        }
        for (prefix, names) in &self.prefixed {
            let prefix = prefix.trim();
            if prefix.is_empty() {
                return Err(ConfigError::EmptyExtraFieldPrefix);
            }
            for name in names {
                let name = normalize(name)?;
                let index = match fields.iter().position(|field| *field == name) {
                    Some(index) => index,
                    None => {
                        fields.push(name.clone());
                        fields.len() - 1
                    }
                };
                let key = format!("{prefix}{name}");
                if !keys.contains(&key) {
                    keys.push(key);
                    key_to_field.push(index);
                }
            }
        }
        if fields.is_empty() {
            return Err(ConfigError::NoExtraFields);
        }

        Ok(ExtraFieldPropagationFactory {
            delegate: self.delegate,
            fields_factory: FieldsFactory::new(fields.into()),
            key_names: keys.into(),
            key_to_field: key_to_field.into(),
        })
    }
}

fn normalize(name: &str) -> Result<String, ConfigError> {
    let name = name.trim().to_ascii_lowercase();
    if name.is_empty() {
        return Err(ConfigError::EmptyExtraFieldName);
    }
    Ok(name)
}

struct ExtraFieldPropagation {
    delegate: Arc<dyn Propagation>,
    fields_factory: FieldsFactory,
    key_names: Arc<[String]>,
    key_to_field: Arc<[usize]>,
}

impl Propagation for ExtraFieldPropagation {
    // Only the delegate's keys: tools that clear propagation keys before
    // reuse must not delete user-accessible extra fields.
    fn keys(&self) -> &[String] {
        self.delegate.keys()
    }

    fn inject(&self, context: &TraceContext, carrier: &mut dyn Injector) {
        self.delegate.inject(context, carrier);
        let Some(fields) = context.find_extra::<PropagationFields>() else {
            return;
        };
        for (position, key) in self.key_names.iter().enumerate() {
            if let Some(value) = fields.get_index(self.key_to_field[position]) {
                carrier.set(key, value);
            }
        }
    }

    fn extract(&self, carrier: &dyn Extractor) -> crate::context::Extracted {
        let extracted = self.delegate.extract(carrier);
        // always allocate, so fields set after extraction have storage
        let fields = self.fields_factory.create();
        for (position, key) in self.key_names.iter().enumerate() {
            if let Some(value) = carrier.get(key) {
                fields.put_index(self.key_to_field[position], value.to_string());
            }
        }
        extracted.with_extra(Arc::new(fields))
    }
}

impl fmt::Debug for ExtraFieldPropagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtraFieldPropagation")
            .field("delegate", &self.delegate)
            .field("keys", &self.key_names)
            .finish()
    }
}

/// Returns the value of `name` in `context`, if configured and set.
pub fn get(context: &TraceContext, name: &str) -> Option<String> {
    context.find_extra::<PropagationFields>()?.get(name)
}

/// Sets `name` in `context`; dropped unless extra-field propagation is
/// configured with that field.
pub fn set(context: &TraceContext, name: &str, value: impl Into<String>) {
    if let Some(fields) = context.find_extra::<PropagationFields>() {
        fields.put(name, value);
    }
}

/// All set fields in `context`, in declaration order.
pub fn get_all(context: &TraceContext) -> Vec<(String, String)> {
    context
        .find_extra::<PropagationFields>()
        .map(|fields| fields.entries())
        .unwrap_or_default()
}

/// [`get`] against the current trace context, if one is in scope.
pub fn current_get(name: &str) -> Option<String> {
    let tracing = Tracing::current()?;
    let context = tracing.current_trace_context().get()?;
    get(&context, name)
}

/// [`set`] against the current trace context, if one is in scope.
pub fn current_set(name: &str, value: impl Into<String>) {
    if let Some(tracing) = Tracing::current() {
        if let Some(context) = tracing.current_trace_context().get() {
            set(&context, name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::b3::{B3Propagation, SAMPLED_HEADER, SPAN_ID_HEADER, TRACE_ID_HEADER};
    use std::collections::HashMap;

    fn factory(names: &[&str]) -> ExtraFieldPropagationFactory {
        ExtraFieldPropagationFactory::new(B3Propagation::factory(), names.iter().copied()).unwrap()
    }

    fn context() -> TraceContext {
        TraceContext::builder().trace_id(1).span_id(2).sampled(true).build()
    }

    #[test]
    fn decorate_attaches_claimed_storage() {
        let factory = factory(&["user-name"]);
        let decorated = factory.decorate(context());
        assert_eq!(decorated.extra().len(), 1);

        set(&decorated, "user-name", "romeo");
        assert_eq!(get(&decorated, "user-name").as_deref(), Some("romeo"));
        assert_eq!(get(&decorated, "unconfigured"), None);
    }

    #[test]
    fn decorate_is_idempotent_by_reference() {
        let factory = factory(&["user-name"]);
        let decorated = factory.decorate(context());
        let redecorated = factory.decorate(decorated.clone());
        assert!(TraceContext::ptr_eq(&decorated, &redecorated));
    }

    #[test]
    fn child_fork_is_copy_on_write() {
        let factory = factory(&["user-name"]);
        let parent = factory.decorate(context());
        set(&parent, "user-name", "romeo");

        // a child derived from the parent shares the extra list, then claims
        let child = TraceContext::builder()
            .trace_id(1)
            .parent_id(2_u64)
            .span_id(3)
            .extra(parent.extra().to_vec())
            .build();
        let child = factory.decorate(child);

        assert_eq!(get(&child, "user-name").as_deref(), Some("romeo"));

        set(&child, "user-name", "juliet");
        assert_eq!(get(&child, "user-name").as_deref(), Some("juliet"));
        assert_eq!(get(&parent, "user-name").as_deref(), Some("romeo"));
    }

    #[test]
    fn decorate_consolidates_many_storages_last_write_wins() {
        let factory = factory(&["user-name", "country-code"]);
        let first = factory.create_fields_for_test();
        first.put("user-name", "one");
        let second = factory.create_fields_for_test();
        second.put("user-name", "two");
        second.put("country-code", "fo");
        let third = factory.create_fields_for_test();
        third.put("user-name", "three");

        let context = TraceContext::builder()
            .trace_id(1)
            .span_id(2)
            .extra(vec![Arc::new(first), Arc::new(second), Arc::new(third)])
            .build();
        let decorated = factory.decorate(context);

        // one consolidated storage survives, merged in list order
        let fields: Vec<_> = decorated
            .extra()
            .iter()
            .filter(|item| item.as_ref().is::<PropagationFields>())
            .collect();
        assert_eq!(fields.len(), 1);
        assert_eq!(get(&decorated, "user-name").as_deref(), Some("three"));
        assert_eq!(get(&decorated, "country-code").as_deref(), Some("fo"));

        // and consolidation settles: decorating again changes nothing
        let redecorated = factory.decorate(decorated.clone());
        assert!(TraceContext::ptr_eq(&decorated, &redecorated));
    }

    #[test]
    fn decorate_leaves_foreign_extras_alone() {
        let factory = factory(&["user-name"]);
        let context = TraceContext::builder()
            .trace_id(1)
            .span_id(2)
            .add_extra(Arc::new("unrelated".to_owned()))
            .build();
        let decorated = factory.decorate(context);
        assert_eq!(decorated.extra().len(), 2);
        assert_eq!(
            *decorated.find_extra::<String>().unwrap(),
            "unrelated".to_owned()
        );
    }

    #[test]
    fn injects_only_present_fields() {
        let factory = factory(&["user-name", "country-code"]);
        let propagation = factory.create();
        let context = factory.decorate(context());
        set(&context, "country-code", "fo");

        let mut carrier = HashMap::new();
        propagation.inject(&context, &mut carrier);
        assert_eq!(carrier.get("country-code").map(String::as_str), Some("fo"));
        assert!(!carrier.contains_key("user-name"));
        assert!(carrier.contains_key(TRACE_ID_HEADER));
    }

    #[test]
    fn extraction_always_allocates_storage() {
        let factory = factory(&["user-name"]);
        let propagation = factory.create();

        let mut carrier = HashMap::new();
        carrier.insert(TRACE_ID_HEADER.to_string(), "0000000000000001".to_string());
        carrier.insert(SPAN_ID_HEADER.to_string(), "0000000000000002".to_string());
        carrier.insert(SAMPLED_HEADER.to_string(), "1".to_string());

        let extracted = propagation.extract(&carrier);
        let context = extracted.context().unwrap();
        assert_eq!(get(context, "user-name"), None);

        // late writes have storage even though the carrier had no field
        set(context, "user-name", "romeo");
        assert_eq!(get(context, "user-name").as_deref(), Some("romeo"));
    }

    #[test]
    fn round_trips_fields_with_prefixes() {
        let factory = ExtraFieldPropagationFactory::builder(B3Propagation::factory())
            .add_field("x-vcap-request-id")
            .add_prefixed_fields("baggage-", ["country-code", "user-id"])
            .build()
            .unwrap();
        let propagation = factory.create();

        let context = factory.decorate(context());
        set(&context, "x-vcap-request-id", "abc123");
        set(&context, "country-code", "fo");

        let mut carrier = HashMap::new();
        propagation.inject(&context, &mut carrier);
        assert_eq!(carrier.get("x-vcap-request-id").map(String::as_str), Some("abc123"));
        assert_eq!(carrier.get("baggage-country-code").map(String::as_str), Some("fo"));
        assert!(!carrier.contains_key("baggage-user-id"));
        assert!(!carrier.contains_key("country-code"));

        let extracted = propagation.extract(&carrier);
        let decoded = extracted.context().unwrap();
        assert_eq!(get(decoded, "country-code").as_deref(), Some("fo"));
        assert_eq!(get(decoded, "x-vcap-request-id").as_deref(), Some("abc123"));
    }

    #[test]
    fn builder_rejects_bad_configuration() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            ExtraFieldPropagationFactory::new(B3Propagation::factory(), empty),
            Err(ConfigError::NoExtraFields)
        ));
        assert!(matches!(
            ExtraFieldPropagationFactory::new(B3Propagation::factory(), ["  "]),
            Err(ConfigError::EmptyExtraFieldName)
        ));
        assert!(matches!(
            ExtraFieldPropagationFactory::builder(B3Propagation::factory())
                .add_prefixed_fields("", ["x"])
                .build(),
            Err(ConfigError::EmptyExtraFieldPrefix)
        ));
    }

    #[test]
    fn field_names_are_case_insensitive_in_process() {
        let factory = factory(&["User-Name"]);
        let context = factory.decorate(context());
        set(&context, "USER-NAME", "romeo");
        assert_eq!(get(&context, "user-name").as_deref(), Some("romeo"));
    }

    impl ExtraFieldPropagationFactory {
        fn create_fields_for_test(&self) -> PropagationFields {
            self.fields_factory.create()
        }
    }
}
