//! Native object binding: type registration, userdata wrappers and
//! host-side references to VM values.

mod script_binding;
mod type_binding;

pub use script_binding::ScriptBinding;
pub use type_binding::{with_native, BindingKind, ScriptType, Strong, TypeRegistrar, WeakRef};

pub(crate) use type_binding::{
    bind_type_in, strong_userdata, userdata_tag, weak_userdata, BindingRegistry, WEAK_CACHE_KEY,
};
