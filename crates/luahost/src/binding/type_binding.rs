// Native type registration and per-VM metatables
//
// A type is bound once per (type, kind) per VM. Binding builds a methods
// table of native functions, wraps them in a single `__index` closure, and
// registers the result as the metatable for the userdata wrapper of that kind.

use std::any::TypeId;
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use mlua::{AnyUserData, Function, Lua, Table, UserDataFields, UserDataRegistry, Value};

use crate::call::{create_native, FunctionInterface};
use crate::data_node::DataNode;
use crate::marshal::{EnumDescriptor, MarshalOptions};
use crate::vm::VmShared;

pub(crate) const TYPE_KEY: &str = "__typekey";
pub(crate) const KIND_KEY: &str = "__kind";
pub(crate) const CLASS_NAME_KEY: &str = "m_sClassName";
pub(crate) const WEAK_CACHE_KEY: &str = "luahost.weak";

// Methods first, then getter-only statics, then the type's own __index.
const INDEX_SOURCE: &str = r#"
local methods, statics, fallback = ...
return function(self, key)
  local m = methods[key]
  if m ~= nil then return m end
  local s = statics[key]
  if s ~= nil then return s() end
  if fallback ~= nil then return fallback(self, key) end
  return nil
end
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// The VM owns the instance; it is dropped when the userdata is collected.
    Strong,
    /// The host owns the instance; the VM holds a clearable view.
    Weak,
}

impl BindingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BindingKind::Strong => "strong",
            BindingKind::Weak => "weak",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "strong" => Some(BindingKind::Strong),
            "weak" => Some(BindingKind::Weak),
            _ => None,
        }
    }
}

/// A native type exposed to scripts.
pub trait ScriptType: Send + Sync + 'static {
    const NAME: &'static str;

    fn register(reg: &mut TypeRegistrar<Self>)
    where
        Self: Sized;
}

type Method<T> = Arc<dyn Fn(&T, &mut FunctionInterface<'_>) + Send + Sync>;
type IndexFn<T> = Arc<dyn Fn(&T, &str, &mut FunctionInterface<'_>) + Send + Sync>;
type StaticGetter = Arc<dyn Fn() -> DataNode + Send + Sync>;
type Factory<T> = Arc<dyn Fn() -> T + Send + Sync>;

pub struct TypeRegistrar<T> {
    methods: Vec<(&'static str, Method<T>)>,
    statics: Vec<(&'static str, StaticGetter)>,
    index: Option<IndexFn<T>>,
    factory: Option<Factory<T>>,
}

impl<T: 'static> TypeRegistrar<T> {
    fn new() -> Self {
        Self {
            methods: Vec::new(),
            statics: Vec::new(),
            index: None,
            factory: None,
        }
    }

    /// Adds or replaces a method. Arguments exclude the receiver.
    pub fn method(
        &mut self,
        name: &'static str,
        f: impl Fn(&T, &mut FunctionInterface<'_>) + Send + Sync + 'static,
    ) -> &mut Self {
        self.put_method(name, Arc::new(f));
        self
    }

    fn put_method(&mut self, name: &'static str, m: Method<T>) {
        match self.methods.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = m,
            None => self.methods.push((name, m)),
        }
    }

    /// A read-only value exposed on every instance.
    pub fn static_value(
        &mut self,
        name: &'static str,
        getter: impl Fn() -> DataNode + Send + Sync + 'static,
    ) -> &mut Self {
        self.statics.retain(|(n, _)| *n != name);
        self.statics.push((name, Arc::new(getter)));
        self
    }

    /// Fallback for keys that are neither methods nor statics.
    pub fn index(
        &mut self,
        f: impl Fn(&T, &str, &mut FunctionInterface<'_>) + Send + Sync + 'static,
    ) -> &mut Self {
        self.index = Some(Arc::new(f));
        self
    }

    /// Lets scripts create instances with `NewNativeUserData(NAME)`.
    pub fn constructor(&mut self, f: impl Fn() -> T + Send + Sync + 'static) -> &mut Self {
        self.factory = Some(Arc::new(f));
        self
    }

    /// Pulls in `P`'s methods, statics and index. Call before adding this
    /// type's own methods so they override the parent's.
    pub fn inherit<P: ScriptType>(&mut self, project: fn(&T) -> &P) -> &mut Self {
        let mut parent = TypeRegistrar::<P>::new();
        P::register(&mut parent);

        for (name, m) in parent.methods {
            self.put_method(name, Arc::new(move |t: &T, fi: &mut FunctionInterface<'_>| m(project(t), fi)));
        }
        for (name, getter) in parent.statics {
            if !self.statics.iter().any(|(n, _)| *n == name) {
                self.statics.push((name, getter));
            }
        }
        if self.index.is_none() {
            if let Some(index) = parent.index {
                self.index = Some(Arc::new(move |t: &T, key: &str, fi: &mut FunctionInterface<'_>| {
                    index(project(t), key, fi)
                }));
            }
        }
        self
    }
}

/// VM-owned storage for a strong binding.
pub struct Strong<T>(pub(crate) T);

/// Clearable view of a host-owned instance.
pub struct WeakRef<T>(pub(crate) Option<Weak<T>>);

impl<T> WeakRef<T> {
    pub(crate) fn upgrade(&self) -> Option<Arc<T>> {
        self.0.as_ref()?.upgrade()
    }

    fn points_to(&self, target: &Arc<T>) -> bool {
        self.0
            .as_ref()
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(target)))
    }
}

trait Holder<T>: Send + 'static {
    fn with_target<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R>;
}

impl<T: ScriptType> Holder<T> for Strong<T> {
    fn with_target<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        Some(f(&self.0))
    }
}

impl<T: ScriptType> Holder<T> for WeakRef<T> {
    fn with_target<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let target = self.upgrade()?;
        Some(f(&target))
    }
}

type UserDataFactory = Arc<dyn Fn(&Lua) -> mlua::Result<AnyUserData> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct TypeBindingRecord {
    pub name: &'static str,
    pub kind: BindingKind,
    pub type_id: TypeId,
    pub is_alive: fn(&AnyUserData) -> bool,
    pub clear: fn(&AnyUserData) -> bool,
    pub factory: Option<UserDataFactory>,
}

#[derive(Default)]
pub(crate) struct BindingRegistry {
    records: AHashMap<(TypeId, BindingKind), TypeBindingRecord>,
    enums: AHashMap<&'static str, EnumDescriptor>,
}

impl BindingRegistry {
    pub fn contains(&self, type_id: TypeId, kind: BindingKind) -> bool {
        self.records.contains_key(&(type_id, kind))
    }

    pub fn insert(&mut self, record: TypeBindingRecord) {
        self.records.insert((record.type_id, record.kind), record);
    }

    pub fn find(&self, name: &str, kind: BindingKind) -> Option<TypeBindingRecord> {
        self.records
            .values()
            .find(|r| r.name == name && r.kind == kind)
            .cloned()
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.records.values().any(|r| r.name == name)
    }

    pub fn register_enum(&mut self, descriptor: EnumDescriptor) {
        self.enums.insert(descriptor.name, descriptor);
    }

    pub fn enum_descriptor(&self, name: &str) -> Option<EnumDescriptor> {
        self.enums.get(name).copied()
    }
}

fn strong_is_alive<T: ScriptType>(ud: &AnyUserData) -> bool {
    ud.is::<Strong<T>>()
}

fn weak_is_alive<T: ScriptType>(ud: &AnyUserData) -> bool {
    ud.borrow::<WeakRef<T>>()
        .map(|w| w.upgrade().is_some())
        .unwrap_or(false)
}

fn weak_clear<T: ScriptType>(ud: &AnyUserData) -> bool {
    match ud.borrow_mut::<WeakRef<T>>() {
        Ok(mut w) => {
            w.0 = None;
            true
        }
        Err(_) => false,
    }
}

/// Binds `T` for `kind` in this VM. Later calls are no-ops.
pub(crate) fn bind_type_in<T: ScriptType>(
    lua: &Lua,
    shared: &Arc<VmShared>,
    kind: BindingKind,
) -> mlua::Result<()> {
    let type_id = TypeId::of::<T>();
    if shared.bindings.lock().contains(type_id, kind) {
        return Ok(());
    }

    let mut reg = TypeRegistrar::<T>::new();
    T::register(&mut reg);

    let index = match kind {
        BindingKind::Strong => build_index::<T, Strong<T>>(lua, shared, &reg)?,
        BindingKind::Weak => build_index::<T, WeakRef<T>>(lua, shared, &reg)?,
    };
    let record = match kind {
        BindingKind::Strong => {
            lua.register_userdata_type::<Strong<T>>(|r| install_meta::<T, _>(r, &index, kind))?;
            TypeBindingRecord {
                name: T::NAME,
                kind,
                type_id,
                is_alive: strong_is_alive::<T>,
                clear: |_| false,
                factory: reg.factory.clone().map(|f| {
                    Arc::new(move |lua: &Lua| lua.create_any_userdata(Strong(f()))) as UserDataFactory
                }),
            }
        }
        BindingKind::Weak => {
            lua.register_userdata_type::<WeakRef<T>>(|r| install_meta::<T, _>(r, &index, kind))?;
            TypeBindingRecord {
                name: T::NAME,
                kind,
                type_id,
                is_alive: weak_is_alive::<T>,
                clear: weak_clear::<T>,
                factory: None,
            }
        }
    };
    log::debug!("bound native type {} ({})", T::NAME, kind.as_str());
    shared.bindings.lock().insert(record);
    Ok(())
}

fn install_meta<T: ScriptType, W: 'static>(
    r: &mut UserDataRegistry<W>,
    index: &Function,
    kind: BindingKind,
) {
    r.add_meta_field("__index", index.clone());
    r.add_meta_field(TYPE_KEY, T::NAME);
    r.add_meta_field(KIND_KEY, kind.as_str());
    r.add_meta_field(CLASS_NAME_KEY, T::NAME);
}

fn build_index<T: ScriptType, H: Holder<T>>(
    lua: &Lua,
    shared: &Arc<VmShared>,
    reg: &TypeRegistrar<T>,
) -> mlua::Result<Function> {
    let methods = lua.create_table()?;
    for (name, m) in &reg.methods {
        let m = Arc::clone(m);
        let f = create_native(lua, shared, *name, move |fi| {
            let this = fi.take_self();
            let Value::UserData(ud) = this else {
                fi.raise_error(-1, format!("calling '{}' on a non-{} value", fi.name(), T::NAME));
                return;
            };
            let Ok(holder) = ud.borrow::<H>() else {
                fi.raise_error(-1, format!("calling '{}' on a non-{} value", fi.name(), T::NAME));
                return;
            };
            // A cleared weak view yields no results.
            holder.with_target(|target| m(target, fi));
        })?;
        methods.raw_set(*name, f)?;
    }

    let statics = lua.create_table()?;
    for (name, getter) in &reg.statics {
        let getter = Arc::clone(getter);
        let f = create_native(lua, shared, *name, move |fi| {
            fi.push_return_data_node(&getter(), MarshalOptions::default());
        })?;
        statics.raw_set(*name, f)?;
    }

    let fallback = match &reg.index {
        Some(index) => {
            let index = Arc::clone(index);
            let f = create_native(lua, shared, "__index", move |fi| {
                let this = fi.take_self();
                let key = fi.get_string(0).unwrap_or_default();
                let Value::UserData(ud) = this else {
                    return;
                };
                if let Ok(holder) = ud.borrow::<H>() {
                    holder.with_target(|target| index(target, &key, fi));
                }
            })?;
            Value::Function(f)
        }
        None => Value::Nil,
    };

    lua.load(INDEX_SOURCE)
        .set_name("=[index]")
        .call::<Function>((methods, statics, fallback))
}

/// Creates a VM-owned instance of `value`.
pub(crate) fn strong_userdata<T: ScriptType>(
    lua: &Lua,
    shared: &Arc<VmShared>,
    value: T,
) -> mlua::Result<AnyUserData> {
    bind_type_in::<T>(lua, shared, BindingKind::Strong)?;
    lua.create_any_userdata(Strong(value))
}

/// Returns the view of `value`, reusing the existing userdata for the same
/// instance when it is still live.
pub(crate) fn weak_userdata<T: ScriptType>(
    lua: &Lua,
    shared: &Arc<VmShared>,
    value: &Arc<T>,
) -> mlua::Result<AnyUserData> {
    bind_type_in::<T>(lua, shared, BindingKind::Weak)?;
    let cache: Table = lua.named_registry_value(WEAK_CACHE_KEY)?;
    let key = Arc::as_ptr(value) as *const () as usize as i64;
    if let Value::UserData(ud) = cache.raw_get::<Value>(key)? {
        let reusable = ud
            .borrow::<WeakRef<T>>()
            .map(|w| w.points_to(value) && w.upgrade().is_some())
            .unwrap_or(false);
        if reusable {
            return Ok(ud);
        }
    }
    let ud = lua.create_any_userdata(WeakRef(Some(Arc::downgrade(value))))?;
    cache.raw_set(key, ud.clone())?;
    Ok(ud)
}

/// Reads the type key and kind tagged on a userdata's metatable.
pub(crate) fn userdata_tag(ud: &AnyUserData) -> Option<(String, BindingKind)> {
    let mt = ud.metatable().ok()?;
    let name: String = mt.get(TYPE_KEY).ok()?;
    let kind: String = mt.get(KIND_KEY).ok()?;
    Some((name, BindingKind::parse(&kind)?))
}

/// Runs `f` against the native instance behind `value`, if it is a live `T`.
pub fn with_native<T: ScriptType, R>(value: &Value, f: impl FnOnce(&T) -> R) -> Option<R> {
    let Value::UserData(ud) = value else {
        return None;
    };
    if let Ok(strong) = ud.borrow::<Strong<T>>() {
        return Some(f(&strong.0));
    }
    let target = ud.borrow::<WeakRef<T>>().ok()?.upgrade()?;
    Some(f(&target))
}
