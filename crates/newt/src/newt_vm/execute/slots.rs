//! Indexed access: raw container lookups plus the delegation /
//! metamethod fallback chains behind `Get`, `Set`, `NewSlot`,
//! `DeleteSlot`, `Clone` and `TypeOf`.

use crate::gc::GcRef;
use crate::newt_value::{ClassNewSlot, NewtClass, NewtString, NewtValue};
use crate::newt_vm::opcode::{GET_FLAG_RAW, GET_FLAG_THIS};
use crate::newt_vm::{MetaMethod, NewtError, NewtResult, VmContext};

/// Container index for numeric keys; floats truncate the way the engine
/// truncates everywhere else.
fn slot_index(key: &NewtValue) -> Option<i64> {
    match key {
        NewtValue::Integer(i) => Some(*i),
        NewtValue::Float(f) => Some(*f as i64),
        _ => None,
    }
}

impl VmContext<'_> {
    /// Direct lookup on the container itself, no delegation and no
    /// metamethods. Strings index to the byte value, negatives counting
    /// from the end.
    pub(crate) fn raw_get(&self, container: &NewtValue, key: &NewtValue) -> Option<NewtValue> {
        match container {
            NewtValue::Table(t) => t.borrow().get(key),
            NewtValue::Array(a) => {
                let i = slot_index(key)?;
                if i < 0 {
                    return None;
                }
                a.borrow().get(i as usize)
            }
            NewtValue::String(s) => {
                let i = slot_index(key)?;
                let bytes = s.as_str().as_bytes();
                let len = bytes.len() as i64;
                let i = if i < 0 { i + len } else { i };
                if i >= 0 && i < len {
                    Some(NewtValue::Integer(bytes[i as usize] as i64))
                } else {
                    None
                }
            }
            NewtValue::Instance(inst) => inst.borrow().get(key),
            NewtValue::Class(class) => class.borrow().get(key),
            _ => None,
        }
    }

    /// Indexed read. Raw hit first; unless `GET_FLAG_RAW`, misses walk
    /// the table delegate chain, the `_get` metamethod and the built-in
    /// delegate for the type; `GET_FLAG_THIS` finally tries the root
    /// table the way unqualified names do.
    pub fn get_slot(
        &mut self,
        container: &NewtValue,
        key: &NewtValue,
        flags: u8,
    ) -> NewtResult<NewtValue> {
        if let Some(value) = self.raw_get(container, key) {
            return Ok(value);
        }
        if flags & GET_FLAG_RAW == 0 {
            if let Some(value) = self.get_fallback(container, key)? {
                return Ok(value);
            }
            if flags & GET_FLAG_THIS != 0 {
                let root = self.shared.borrow().root_table.clone();
                if let Some(value) = self.raw_get(&root, key) {
                    return Ok(value);
                }
            }
        }
        let msg = format!("the index '{}' does not exist", key);
        Err(self.raise(&msg))
    }

    fn get_fallback(
        &mut self,
        container: &NewtValue,
        key: &NewtValue,
    ) -> NewtResult<Option<NewtValue>> {
        if let NewtValue::Table(t) = container {
            let delegate = t.borrow().delegate().cloned();
            if let Some(delegate) = delegate {
                let parent = NewtValue::Table(delegate);
                if let Some(value) = self.raw_get(&parent, key) {
                    return Ok(Some(value));
                }
                if let Some(value) = self.get_fallback(&parent, key)? {
                    return Ok(Some(value));
                }
            }
        }
        if let Some(mm) = self.metamethod_of(container, MetaMethod::Get) {
            match self.call_metamethod(&mm, container.clone(), &[key.clone()]) {
                Ok(value) => return Ok(Some(value)),
                Err(err) => self.filter_clean_miss(err)?,
            }
        }
        let ddel = self
            .shared
            .borrow()
            .default_delegates
            .for_value(container)
            .cloned();
        if let Some(ddel) = ddel {
            if let Some(value) = self.raw_get(&ddel, key) {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// A `_get`/`_set` handler signals "no such slot, keep looking" by
    /// raising with a Null error value; anything else is a real error.
    fn filter_clean_miss(&mut self, err: NewtError) -> NewtResult<()> {
        match err {
            NewtError::RuntimeError => {
                if self.shared.borrow().error_value.is_null() {
                    Ok(())
                } else {
                    Err(NewtError::RuntimeError)
                }
            }
            other => Err(other),
        }
    }

    /// Indexed write into an existing slot. Arrays are eager and have no
    /// fallback; tables fall back through their delegate chain and the
    /// `_set` metamethod. `this_set` marks a write through the implicit
    /// receiver, which may land on an existing root-table slot.
    pub fn set_slot(
        &mut self,
        container: &NewtValue,
        key: &NewtValue,
        value: NewtValue,
        this_set: bool,
    ) -> NewtResult<()> {
        match container {
            NewtValue::Table(t) => {
                if t.borrow_mut().set(key, value.clone()) {
                    return Ok(());
                }
            }
            NewtValue::Instance(inst) => {
                if inst.borrow_mut().set(key, value.clone()) {
                    return Ok(());
                }
            }
            NewtValue::Array(a) => {
                let Some(i) = slot_index(key) else {
                    let msg = format!("indexing an array with a {}", key.type_name());
                    return Err(self.raise(&msg));
                };
                if i < 0 || !a.borrow_mut().set(i as usize, value) {
                    return Err(self.raise("index out of range"));
                }
                return Ok(());
            }
            NewtValue::UserData(_) => {}
            other => {
                let msg = format!("trying to set a {}", other.type_name());
                return Err(self.raise(&msg));
            }
        }
        if self.set_fallback(container, key, &value)? {
            return Ok(());
        }
        if this_set {
            let root = self.shared.borrow().root_table.clone();
            if let NewtValue::Table(rt) = &root {
                if rt.borrow_mut().set(key, value) {
                    return Ok(());
                }
            }
        }
        let msg = format!("the index '{}' does not exist", key);
        Err(self.raise(&msg))
    }

    fn set_fallback(
        &mut self,
        container: &NewtValue,
        key: &NewtValue,
        value: &NewtValue,
    ) -> NewtResult<bool> {
        if let NewtValue::Table(t) = container {
            let delegate = t.borrow().delegate().cloned();
            if let Some(delegate) = delegate {
                if delegate.borrow_mut().set(key, value.clone()) {
                    return Ok(true);
                }
                if self.set_fallback(&NewtValue::Table(delegate), key, value)? {
                    return Ok(true);
                }
            }
        }
        if let Some(mm) = self.metamethod_of(container, MetaMethod::Set) {
            match self.call_metamethod(&mm, container.clone(), &[key.clone(), value.clone()]) {
                Ok(_) => return Ok(true),
                Err(err) => self.filter_clean_miss(err)?,
            }
        }
        Ok(false)
    }

    /// The `<-` operator: create or overwrite. A table with a delegate
    /// hands rawly-absent keys to `_newslot` instead of creating; class
    /// members route through the class layout rules.
    pub fn new_slot_value(
        &mut self,
        container: &NewtValue,
        key: NewtValue,
        value: NewtValue,
        is_static: bool,
    ) -> NewtResult<()> {
        if key.is_null() {
            return Err(self.raise("null cannot be used as index"));
        }
        match container {
            NewtValue::Table(t) => {
                let intercept = {
                    let body = t.borrow();
                    body.delegate().is_some() && !body.contains_key(&key)
                };
                if intercept {
                    if let Some(mm) = self.metamethod_of(container, MetaMethod::NewSlot) {
                        self.call_metamethod(&mm, container.clone(), &[key, value])?;
                        return Ok(());
                    }
                }
                t.borrow_mut().new_slot(key, value);
                Ok(())
            }
            NewtValue::Class(class) => self.class_new_slot(&class.clone(), key, value, is_static),
            NewtValue::Instance(_) => {
                Err(self.raise("class instances do not support the new slot operator"))
            }
            other => {
                let msg = format!("trying to create a slot on a {}", other.type_name());
                Err(self.raise(&msg))
            }
        }
    }

    /// Methods inserted into a derived class re-parent so their `base`
    /// expression resolves against the class they now live on.
    pub(crate) fn class_new_slot(
        &mut self,
        class: &GcRef<NewtClass>,
        key: NewtValue,
        value: NewtValue,
        is_static: bool,
    ) -> NewtResult<()> {
        let value = match &value {
            NewtValue::Closure(c) => match class.borrow().base.clone() {
                Some(base) => {
                    let reparented = c.borrow().with_base(base);
                    NewtValue::Closure(self.shared.borrow_mut().create_closure(reparented))
                }
                None => value,
            },
            _ => value,
        };
        match class.borrow_mut().new_slot(key, value, is_static) {
            ClassNewSlot::Created | ClassNewSlot::Updated => Ok(()),
            ClassNewSlot::Locked => {
                Err(self.raise("trying to modify a class that has already been instantiated"))
            }
        }
    }

    /// Class member creation with attributes. A `_newmember` handler
    /// takes over the whole insertion, attributes included.
    pub(crate) fn op_new_slot_a(
        &mut self,
        container: &NewtValue,
        key: NewtValue,
        value: NewtValue,
        attrs: NewtValue,
        is_static: bool,
    ) -> NewtResult<()> {
        let NewtValue::Class(class) = container else {
            let msg = format!("trying to create a member on a {}", container.type_name());
            return Err(self.raise(&msg));
        };
        let class = class.clone();
        let new_member = class.borrow().metamethod(MetaMethod::NewMember);
        if let Some(mm) = new_member {
            self.call_metamethod(
                &mm,
                container.clone(),
                &[key, value, attrs, NewtValue::Bool(is_static)],
            )?;
            return Ok(());
        }
        self.class_new_slot(&class, key.clone(), value, is_static)?;
        if !attrs.is_null() {
            class.borrow_mut().set_attributes(Some(&key), attrs);
        }
        Ok(())
    }

    /// The `delete` operator; yields the removed value. A `_delslot`
    /// handler takes over entirely and its result becomes the result of
    /// the expression.
    pub fn delete_slot_value(
        &mut self,
        container: &NewtValue,
        key: &NewtValue,
    ) -> NewtResult<NewtValue> {
        match container {
            NewtValue::Table(_) | NewtValue::Instance(_) | NewtValue::UserData(_) => {
                if let Some(mm) = self.metamethod_of(container, MetaMethod::DelSlot) {
                    return self.call_metamethod(&mm, container.clone(), &[key.clone()]);
                }
                if let NewtValue::Table(t) = container {
                    match t.borrow_mut().remove(key) {
                        Some(value) => Ok(value),
                        None => {
                            let msg = format!("the index '{}' does not exist", key);
                            Err(self.raise(&msg))
                        }
                    }
                } else {
                    let msg = format!("cannot delete a slot from a {}", container.type_name());
                    Err(self.raise(&msg))
                }
            }
            other => {
                let msg = format!("attempt to delete a slot from a {}", other.type_name());
                Err(self.raise(&msg))
            }
        }
    }

    /// Engine to-string. `_tostring` runs for tables, user data and
    /// instances; a handler returning a non-string falls back to the
    /// default rendering.
    pub fn to_display_string(&mut self, value: &NewtValue) -> NewtResult<NewtValue> {
        let s = self.to_string_inner(value)?;
        Ok(NewtValue::String(s))
    }

    pub(crate) fn to_string_inner(&mut self, value: &NewtValue) -> NewtResult<NewtString> {
        if let NewtValue::String(s) = value {
            return Ok(s.clone());
        }
        if matches!(
            value,
            NewtValue::Table(_) | NewtValue::UserData(_) | NewtValue::Instance(_)
        ) {
            if let Some(mm) = self.metamethod_of(value, MetaMethod::ToString) {
                if let NewtValue::String(s) = self.call_metamethod(&mm, value.clone(), &[])? {
                    return Ok(s);
                }
            }
        }
        let rendered = value.to_string();
        Ok(self.shared.borrow_mut().intern(&rendered))
    }

    /// `typeof`: whatever `_typeof` returns, else the type name.
    pub(crate) fn type_of_value(&mut self, value: &NewtValue) -> NewtResult<NewtValue> {
        if let Some(mm) = self.metamethod_of(value, MetaMethod::TypeOf) {
            return self.call_metamethod(&mm, value.clone(), &[]);
        }
        Ok(self.shared.borrow_mut().intern_value(value.type_name()))
    }

    /// The `clone` operator: shallow copies for tables, arrays and
    /// instances, then `_cloned` on the copy with the original as its
    /// argument.
    pub fn clone_value(&mut self, value: &NewtValue) -> NewtResult<NewtValue> {
        let cloned = match value {
            NewtValue::Table(t) => {
                let copy = t.borrow().snapshot();
                NewtValue::Table(self.shared.borrow_mut().create_table_from(copy))
            }
            NewtValue::Instance(inst) => {
                let copy = inst.borrow().snapshot();
                NewtValue::Instance(self.shared.borrow_mut().create_instance_from(copy))
            }
            NewtValue::Array(a) => {
                let values = a.borrow().to_vec();
                NewtValue::Array(self.shared.borrow_mut().create_array_from(values))
            }
            other => {
                let msg = format!("cloning a {}", other.type_name());
                return Err(self.raise(&msg));
            }
        };
        if matches!(value, NewtValue::Table(_) | NewtValue::Instance(_)) {
            if let Some(mm) = self.metamethod_of(&cloned, MetaMethod::Cloned) {
                self.call_metamethod(&mm, cloned.clone(), &[value.clone()])?;
            }
        }
        Ok(cloned)
    }
}
