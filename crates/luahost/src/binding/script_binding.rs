// Host-side references to VM values
//
// A binding pins one value in its VM's registry. It never keeps the VM alive:
// every operation resolves the owner through its weak handle first and
// quietly yields nothing once the VM is gone.

use std::fmt;
use std::sync::Arc;

use mlua::{Lua, ObjectLike, RegistryKey, Value};

use crate::binding::{with_native, ScriptType};
use crate::data_node::DataNode;
use crate::marshal::{self, MarshalOptions};
use crate::vm::{Vm, WeakVm};

#[derive(Clone, Default)]
pub struct ScriptBinding {
    owner: Option<WeakVm>,
    key: Option<Arc<RegistryKey>>,
}

impl ScriptBinding {
    /// Pins `value`. Nil produces an empty binding.
    pub(crate) fn from_value(lua: &Lua, owner: WeakVm, value: Value) -> mlua::Result<Self> {
        if value.is_nil() {
            return Ok(Self::default());
        }
        let key = lua.create_registry_value(value)?;
        Ok(Self {
            owner: Some(owner),
            key: Some(Arc::new(key)),
        })
    }

    pub(crate) fn value(&self, lua: &Lua) -> Option<Value> {
        lua.registry_value::<Value>(self.key.as_deref()?).ok()
    }

    /// True while the binding holds a value and its VM is alive.
    pub fn is_valid(&self) -> bool {
        self.key.is_some() && self.owner().is_some()
    }

    pub fn owner(&self) -> Option<Vm> {
        self.owner.as_ref()?.upgrade()
    }

    /// Drops this clone's reference. The value is released once every clone has let go.
    pub fn release(&mut self) {
        self.key = None;
    }

    fn with_value<R>(&self, f: impl FnOnce(&Lua, Value) -> Option<R>) -> Option<R> {
        self.key.as_ref()?;
        let vm = self.owner()?;
        vm.with_lua(|lua| {
            let value = self.value(lua)?;
            f(lua, value)
        })
        .ok()
        .flatten()
    }

    pub fn is_function(&self) -> bool {
        self.with_value(|_, v| Some(matches!(v, Value::Function(_))))
            .unwrap_or(false)
    }

    pub fn is_table(&self) -> bool {
        self.with_value(|_, v| Some(matches!(v, Value::Table(_))))
            .unwrap_or(false)
    }

    pub fn is_user_data(&self) -> bool {
        self.with_value(|_, v| Some(matches!(v, Value::UserData(_))))
            .unwrap_or(false)
    }

    /// Converts the bound table to a record.
    pub fn get_data(&self) -> Option<DataNode> {
        self.with_value(|_, v| marshal::value_to_data_node(&v).ok())
    }

    pub fn get_field(&self, name: &str) -> Option<DataNode> {
        self.with_value(|_, v| {
            let field: Value = match &v {
                Value::Table(t) => t.get(name).ok()?,
                Value::UserData(ud) => ud.get(name).ok()?,
                _ => return None,
            };
            marshal::value_to_data_node(&field).ok()
        })
    }

    pub fn set_field(&self, name: &str, node: &DataNode) -> bool {
        self.with_value(|lua, v| {
            let Value::Table(t) = v else {
                return Some(false);
            };
            let value = marshal::data_node_to_value(lua, node, MarshalOptions::default()).ok()?;
            Some(t.set(name, value).is_ok())
        })
        .unwrap_or(false)
    }

    /// Runs `f` against the native object behind this binding.
    pub fn with_native<T: ScriptType, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.with_value(|_, v| with_native(&v, f))
    }
}

impl fmt::Debug for ScriptBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptBinding")
            .field("owner", &self.owner.as_ref().map(WeakVm::handle))
            .field("pinned", &self.key.is_some())
            .finish()
    }
}
