use crate::gc::{GcRef, Marker, Trace};
use crate::newt_value::newt_userdata::ReleaseHook;
use crate::newt_value::{NewtTable, NewtValue};
use crate::newt_vm::{MetaMethod, MM_COUNT};

// Member handles live in the member table as tagged integers: a kind bit
// plus an index into the method or field vector.
const MEMBER_KIND_METHOD: i64 = 0x0100_0000;
const MEMBER_KIND_FIELD: i64 = 0x0200_0000;
const MEMBER_INDEX_MASK: i64 = 0x00FF_FFFF;

#[inline]
fn method_handle(index: usize) -> NewtValue {
    NewtValue::Integer(MEMBER_KIND_METHOD | index as i64)
}

#[inline]
fn field_handle(index: usize) -> NewtValue {
    NewtValue::Integer(MEMBER_KIND_FIELD | index as i64)
}

#[inline]
fn is_field_handle(handle: i64) -> bool {
    handle & MEMBER_KIND_FIELD != 0
}

#[inline]
fn handle_index(handle: i64) -> usize {
    (handle & MEMBER_INDEX_MASK) as usize
}

/// A method or default-field entry with its attributes value.
#[derive(Clone)]
pub struct ClassSlot {
    pub value: NewtValue,
    pub attrs: NewtValue,
}

impl ClassSlot {
    fn new(value: NewtValue) -> Self {
        Self {
            value,
            attrs: NewtValue::Null,
        }
    }
}

/// Outcome of a class slot insertion; locking only restricts fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassNewSlot {
    Created,
    Updated,
    /// Field change rejected because the class is locked.
    Locked,
}

/// Single-inheritance class: a member table mapping names to tagged
/// handles, parallel method and default-field vectors, and a metamethod
/// slot array. Deriving snapshots the base's tables verbatim, so later
/// base mutations never show through.
pub struct NewtClass {
    pub base: Option<GcRef<NewtClass>>,
    members: NewtTable,
    pub methods: Vec<ClassSlot>,
    pub field_defaults: Vec<ClassSlot>,
    pub metamethods: [NewtValue; MM_COUNT],
    pub attributes: NewtValue,
    /// Set on first instantiation; field layout is frozen from then on.
    pub locked: bool,
    /// Rejects instantiation outright.
    pub is_abstract: bool,
    /// User bytes allocated per instance.
    pub ud_size: usize,
    pub type_tag: usize,
    pub release_hook: Option<ReleaseHook>,
    pub constructor_idx: Option<usize>,
}

impl NewtClass {
    pub fn new(base: Option<GcRef<NewtClass>>, is_abstract: bool) -> Self {
        match base {
            Some(base_ref) => {
                let snapshot = {
                    let b = base_ref.borrow();
                    (
                        b.members.snapshot(),
                        b.methods.clone(),
                        b.field_defaults.clone(),
                        b.metamethods.clone(),
                        b.ud_size,
                        b.constructor_idx,
                    )
                };
                Self {
                    base: Some(base_ref),
                    members: snapshot.0,
                    methods: snapshot.1,
                    field_defaults: snapshot.2,
                    metamethods: snapshot.3,
                    attributes: NewtValue::Null,
                    locked: false,
                    is_abstract,
                    ud_size: snapshot.4,
                    type_tag: 0,
                    release_hook: None,
                    constructor_idx: snapshot.5,
                }
            }
            None => Self {
                base: None,
                members: NewtTable::new(),
                methods: Vec::new(),
                field_defaults: Vec::new(),
                metamethods: std::array::from_fn(|_| NewtValue::Null),
                attributes: NewtValue::Null,
                locked: false,
                is_abstract,
                ud_size: 0,
                type_tag: 0,
                release_hook: None,
                constructor_idx: None,
            },
        }
    }

    #[inline]
    pub fn field_count(&self) -> usize {
        self.field_defaults.len()
    }

    pub fn member_handle(&self, key: &NewtValue) -> Option<i64> {
        match self.members.get(key) {
            Some(NewtValue::Integer(handle)) => Some(handle),
            _ => None,
        }
    }

    /// Resolve a member to its class-side value: a method, or a field's
    /// default.
    pub fn get(&self, key: &NewtValue) -> Option<NewtValue> {
        let handle = self.member_handle(key)?;
        let slot = self.slot(handle);
        Some(slot.value.clone())
    }

    fn slot(&self, handle: i64) -> &ClassSlot {
        let idx = handle_index(handle);
        if is_field_handle(handle) {
            &self.field_defaults[idx]
        } else {
            &self.methods[idx]
        }
    }

    fn slot_mut(&mut self, handle: i64) -> &mut ClassSlot {
        let idx = handle_index(handle);
        if is_field_handle(handle) {
            &mut self.field_defaults[idx]
        } else {
            &mut self.methods[idx]
        }
    }

    /// Insert or update a member. Callables and statics become method
    /// entries; when their name is a metamethod name they land in the
    /// metamethod array instead of the member table. Everything else
    /// becomes a field whose default is copied per instance. Locking
    /// freezes the field layout: new fields are rejected, updates and
    /// new methods go through.
    pub fn new_slot(
        &mut self,
        key: NewtValue,
        value: NewtValue,
        is_static: bool,
    ) -> ClassNewSlot {
        let as_method = value.is_callable() || is_static;

        if as_method {
            if let NewtValue::String(name) = &key {
                if let Some(mm) = MetaMethod::from_name(name.as_str()) {
                    self.metamethods[mm as usize] = value;
                    return ClassNewSlot::Created;
                }
            }
        }

        if let Some(handle) = self.member_handle(&key) {
            // Updates keep the member's kind; the layout never moves.
            if is_field_handle(handle) {
                self.field_defaults[handle_index(handle)].value = value;
            } else {
                self.methods[handle_index(handle)].value = value;
            }
            return ClassNewSlot::Updated;
        }

        if as_method {
            let idx = self.methods.len();
            if matches!(&key, NewtValue::String(s) if s.as_str() == "constructor") {
                self.constructor_idx = Some(idx);
            }
            self.members.new_slot(key, method_handle(idx));
            self.methods.push(ClassSlot::new(value));
            ClassNewSlot::Created
        } else if self.locked {
            ClassNewSlot::Locked
        } else {
            let idx = self.field_defaults.len();
            self.members.new_slot(key, field_handle(idx));
            self.field_defaults.push(ClassSlot::new(value));
            ClassNewSlot::Created
        }
    }

    /// The constructor method, when one was declared.
    pub fn constructor(&self) -> Option<NewtValue> {
        self.constructor_idx
            .and_then(|idx| self.methods.get(idx))
            .map(|slot| slot.value.clone())
    }

    pub fn metamethod(&self, mm: MetaMethod) -> Option<NewtValue> {
        let value = &self.metamethods[mm as usize];
        if value.is_null() {
            None
        } else {
            Some(value.clone())
        }
    }

    pub fn get_attributes(&self, key: Option<&NewtValue>) -> Option<NewtValue> {
        match key {
            None => Some(self.attributes.clone()),
            Some(key) => {
                let handle = self.member_handle(key)?;
                Some(self.slot(handle).attrs.clone())
            }
        }
    }

    pub fn set_attributes(&mut self, key: Option<&NewtValue>, attrs: NewtValue) -> bool {
        match key {
            None => {
                self.attributes = attrs;
                true
            }
            Some(key) => match self.member_handle(key) {
                Some(handle) => {
                    self.slot_mut(handle).attrs = attrs;
                    true
                }
                None => false,
            },
        }
    }

    /// Lock this class and its bases; instances from here on share a
    /// frozen field layout.
    pub fn lock(&mut self) {
        self.locked = true;
        let mut base = self.base.clone();
        while let Some(class) = base {
            let mut b = class.borrow_mut();
            b.locked = true;
            base = b.base.clone();
        }
    }

    /// Whether `ancestor` is this class or one of its bases.
    pub fn is_derived_from(&self, ancestor: &GcRef<NewtClass>) -> bool {
        let mut base = self.base.clone();
        while let Some(class) = base {
            if class.ptr_eq(ancestor) {
                return true;
            }
            base = class.borrow().base.clone();
        }
        false
    }

    /// Iterate members; yields (name, class-side value, next cursor).
    pub fn next_member(&self, cursor: i64) -> Option<(NewtValue, NewtValue, i64)> {
        let (key, handle, next) = self.members.next(cursor)?;
        let value = match handle {
            NewtValue::Integer(h) => self.slot(h).value.clone(),
            other => other,
        };
        Some((key, value, next))
    }
}

impl Trace for NewtClass {
    fn trace(&self, marker: &mut Marker) {
        if let Some(base) = &self.base {
            marker.mark_object(base.as_dyn());
        }
        self.members.trace(marker);
        for slot in self.methods.iter().chain(self.field_defaults.iter()) {
            marker.mark_value(&slot.value);
            marker.mark_value(&slot.attrs);
        }
        marker.mark_values(&self.metamethods);
        marker.mark_value(&self.attributes);
    }

    fn finalize(&mut self) {
        self.base = None;
        self.members.clear();
        self.methods.clear();
        self.field_defaults.clear();
        for slot in &mut self.metamethods {
            *slot = NewtValue::Null;
        }
        self.attributes = NewtValue::Null;
    }
}

impl Drop for NewtClass {
    fn drop(&mut self) {
        if let Some(hook) = self.release_hook.take() {
            let mut empty: [u8; 0] = [];
            hook(&mut empty);
        }
    }
}

// ============ instances ============

/// Object of a class: a positional field vector seeded from the class
/// defaults, plus per-instance user bytes for the host.
pub struct NewtInstance {
    pub class: GcRef<NewtClass>,
    pub fields: Vec<NewtValue>,
    pub user_data: Vec<u8>,
    pub release_hook: Option<ReleaseHook>,
}

impl NewtInstance {
    /// Build from a class that the caller has already locked.
    pub fn new(class: GcRef<NewtClass>) -> Self {
        let (fields, ud_size) = {
            let c = class.borrow();
            (
                c.field_defaults.iter().map(|s| s.value.clone()).collect(),
                c.ud_size,
            )
        };
        Self {
            class,
            fields,
            user_data: vec![0; ud_size],
            release_hook: None,
        }
    }

    pub fn get(&self, key: &NewtValue) -> Option<NewtValue> {
        let class = self.class.borrow();
        let handle = class.member_handle(key)?;
        if is_field_handle(handle) {
            Some(self.fields[handle_index(handle)].clone())
        } else {
            Some(class.methods[handle_index(handle)].value.clone())
        }
    }

    /// Only field members are writable through an instance.
    pub fn set(&mut self, key: &NewtValue, value: NewtValue) -> bool {
        let handle = match self.class.borrow().member_handle(key) {
            Some(h) if is_field_handle(h) => h,
            _ => return false,
        };
        self.fields[handle_index(handle)] = value;
        true
    }

    pub fn is_instance_of(&self, class: &GcRef<NewtClass>) -> bool {
        self.class.ptr_eq(class) || self.class.borrow().is_derived_from(class)
    }

    /// Shallow copy for the clone operator: same class, current field
    /// values and user bytes. The release hook does not carry over.
    pub fn snapshot(&self) -> NewtInstance {
        NewtInstance {
            class: self.class.clone(),
            fields: self.fields.clone(),
            user_data: self.user_data.clone(),
            release_hook: None,
        }
    }

    pub fn type_tag(&self) -> usize {
        self.class.borrow().type_tag
    }

    /// Iterate field members in member-table order.
    pub fn next_member(&self, cursor: i64) -> Option<(NewtValue, NewtValue, i64)> {
        let class = self.class.borrow();
        let (key, handle, next) = class.members.next(cursor)?;
        let value = match handle {
            NewtValue::Integer(h) if is_field_handle(h) => {
                self.fields[handle_index(h)].clone()
            }
            NewtValue::Integer(h) => class.methods[handle_index(h)].value.clone(),
            other => other,
        };
        Some((key, value, next))
    }
}

impl Trace for NewtInstance {
    fn trace(&self, marker: &mut Marker) {
        marker.mark_object(self.class.as_dyn());
        marker.mark_values(&self.fields);
    }

    fn finalize(&mut self) {
        for field in &mut self.fields {
            *field = NewtValue::Null;
        }
        // class and user bytes stay for the release hook and for
        // host-side tag queries on the husk
    }
}

impl Drop for NewtInstance {
    fn drop(&mut self) {
        if let Some(hook) = self.release_hook.take() {
            hook(&mut self.user_data);
        }
    }
}

// ============ tests ============

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::StringInterner;

    fn name(si: &mut StringInterner, s: &str) -> NewtValue {
        NewtValue::String(si.intern(s))
    }

    fn bare_class() -> NewtClass {
        NewtClass::new(None, false)
    }

    #[test]
    fn fields_and_methods_get_distinct_handles() {
        let mut si = StringInterner::new();
        let mut c = bare_class();
        assert_eq!(
            c.new_slot(name(&mut si, "hp"), NewtValue::Integer(100), false),
            ClassNewSlot::Created
        );
        assert_eq!(
            c.new_slot(name(&mut si, "max"), NewtValue::Integer(5), true),
            ClassNewSlot::Created
        );
        let hp = c.member_handle(&name(&mut si, "hp")).unwrap();
        let max = c.member_handle(&name(&mut si, "max")).unwrap();
        assert!(is_field_handle(hp));
        assert!(!is_field_handle(max));
        assert_eq!(c.get(&name(&mut si, "hp")), Some(NewtValue::Integer(100)));
        assert_eq!(c.get(&name(&mut si, "max")), Some(NewtValue::Integer(5)));
    }

    #[test]
    fn locking_freezes_field_layout_not_values() {
        let mut si = StringInterner::new();
        let mut c = bare_class();
        c.new_slot(name(&mut si, "hp"), NewtValue::Integer(1), false);
        c.lock();
        // new field rejected, update and new method accepted
        assert_eq!(
            c.new_slot(name(&mut si, "mp"), NewtValue::Integer(2), false),
            ClassNewSlot::Locked
        );
        assert_eq!(
            c.new_slot(name(&mut si, "hp"), NewtValue::Integer(9), false),
            ClassNewSlot::Updated
        );
        assert_eq!(
            c.new_slot(name(&mut si, "helper"), NewtValue::Integer(3), true),
            ClassNewSlot::Created
        );
    }

    #[test]
    fn metamethod_names_bypass_the_member_table() {
        let mut si = StringInterner::new();
        let mut c = bare_class();
        assert_eq!(
            c.new_slot(name(&mut si, "_add"), NewtValue::Integer(1), true),
            ClassNewSlot::Created
        );
        assert!(c.member_handle(&name(&mut si, "_add")).is_none());
        assert_eq!(c.metamethod(MetaMethod::Add), Some(NewtValue::Integer(1)));
        assert!(c.metamethod(MetaMethod::Sub).is_none());
    }

    #[test]
    fn attributes_per_member_and_per_class() {
        let mut si = StringInterner::new();
        let mut c = bare_class();
        c.new_slot(name(&mut si, "hp"), NewtValue::Integer(1), false);
        assert!(c.set_attributes(Some(&name(&mut si, "hp")), NewtValue::Integer(42)));
        assert!(!c.set_attributes(Some(&name(&mut si, "missing")), NewtValue::Null));
        assert!(c.set_attributes(None, NewtValue::Integer(7)));
        assert_eq!(
            c.get_attributes(Some(&name(&mut si, "hp"))),
            Some(NewtValue::Integer(42))
        );
        assert_eq!(c.get_attributes(None), Some(NewtValue::Integer(7)));
    }
}
